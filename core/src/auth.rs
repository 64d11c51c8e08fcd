/// Authentication context shared by the REST client and the bus
use crate::error::{ChatError, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// An authenticated identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user_id: String,
}

/// Single source of truth for the current session.
///
/// Cloning is cheap; all clones observe the same session. Identity changes
/// (login, logout) are published on a watch channel so the connection
/// manager can tear down a bus session bound to the old user.
#[derive(Clone)]
pub struct AuthContext {
    tx: Arc<watch::Sender<Option<Session>>>,
}

impl AuthContext {
    /// Create an empty (logged out) context
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Create a context that is already logged in
    pub fn with_session(token: impl Into<String>, user_id: impl Into<String>) -> Result<Self> {
        let ctx = Self::new();
        ctx.login(token, user_id)?;
        Ok(ctx)
    }

    /// Install a new session, replacing any previous one
    pub fn login(&self, token: impl Into<String>, user_id: impl Into<String>) -> Result<()> {
        let token = token.into();
        let user_id = user_id.into();
        if token.trim().is_empty() || user_id.trim().is_empty() {
            return Err(ChatError::Validation(
                "token and user id must not be empty".to_string(),
            ));
        }
        info!("Session installed for user {}", user_id);
        self.tx.send_replace(Some(Session { token, user_id }));
        Ok(())
    }

    /// Invalidate the session
    pub fn logout(&self) {
        if self.tx.send_replace(None).is_some() {
            info!("Session invalidated");
        }
    }

    pub fn session(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    /// Current session or `NotAuthenticated`
    pub fn require(&self) -> Result<Session> {
        self.session().ok_or(ChatError::NotAuthenticated)
    }

    pub fn user_id(&self) -> Option<String> {
        self.tx.borrow().as_ref().map(|s| s.user_id.clone())
    }

    pub fn token(&self) -> Option<String> {
        self.tx.borrow().as_ref().map(|s| s.token.clone())
    }

    /// Observe identity changes
    pub fn watch(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }
}

impl Default for AuthContext {
    fn default() -> Self {
        Self::new()
    }
}
