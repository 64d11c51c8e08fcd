/// Chat client: wires auth, REST backend, store, bus and composer together
use crate::api::{ChatBackend, HttpChatBackend};
use crate::auth::{AuthContext, Session};
use crate::bus::{ConnectionManager, Connector, TcpConnector};
use crate::composer::Composer;
use crate::config::Config;
use crate::conversation_store::{ConversationStore, PageLoad};
use crate::error::{ChatError, Result};
use crate::messenger_types::{ChatEvent, Conversation};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ChatClient {
    config: Config,
    auth: AuthContext,
    backend: Arc<dyn ChatBackend>,
    store: ConversationStore,
    connection: ConnectionManager,
    composer: Composer,
    pump: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ChatClient {
    /// Client over HTTP and STOMP-over-TCP
    pub fn new(config: Config, auth: AuthContext) -> Result<Self> {
        let backend = HttpChatBackend::new(
            config.api_origin.clone(),
            auth.clone(),
            config.connection_timeout,
        )?;
        let connector = TcpConnector::new(config.bus_addr.clone(), config.connection_timeout);
        Ok(Self::with_parts(
            config,
            auth,
            Arc::new(backend),
            Arc::new(connector),
        ))
    }

    /// Client over caller-supplied backend and bus transport
    pub fn with_parts(
        config: Config,
        auth: AuthContext,
        backend: Arc<dyn ChatBackend>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let store = ConversationStore::new(backend.clone(), auth.clone(), config.page_size);
        let connection = ConnectionManager::new(connector, auth.clone(), &config);
        let composer = Composer::new(auth.clone(), store.clone(), connection.clone());
        Self {
            config,
            auth,
            backend,
            store,
            connection,
            composer,
            pump: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the event pump and connect the bus for the signed-in user.
    ///
    /// The bus always runs as the session user. A configured user id that
    /// names someone else is rejected.
    pub async fn start(&self) -> Result<()> {
        let user_id = self.auth.user_id().ok_or(ChatError::NotAuthenticated)?;
        if let Some(expected) = self.config.user_id.as_deref() {
            if expected != user_id {
                return Err(ChatError::Config(format!(
                    "configured user {} does not match session user {}",
                    expected, user_id
                )));
            }
        }

        {
            let mut pump = self.pump.lock().await;
            if pump.as_ref().map(|h| h.is_finished()).unwrap_or(true) {
                let events = self.connection.subscribe();
                let identity = self.auth.watch();
                let client = self.clone();
                *pump = Some(tokio::spawn(async move {
                    client.run_event_pump(events, identity).await;
                }));
            }
        }

        info!("Starting chat client for {}", user_id);
        self.connection.connect(&user_id).await
    }

    /// Stop the pump and close the bus
    pub async fn stop(&self) {
        if let Some(handle) = self.pump.lock().await.take() {
            handle.abort();
        }
        self.connection.disconnect().await;
    }

    /// Invalidate the session and drop all local state
    pub async fn logout(&self) {
        self.auth.logout();
        self.connection.disconnect().await;
        self.store.clear().await;
    }

    /// Open a conversation by id: first history page, unread reset
    pub async fn open(&self, conversation_id: &str) -> Result<PageLoad> {
        self.store.open_conversation(conversation_id).await;
        let load = self.store.load_messages(conversation_id, 0).await?;
        self.store.mark_conversation_read(conversation_id).await;
        Ok(load)
    }

    /// Create-or-get the conversation with `other_user_id` and open it
    pub async fn open_with(
        &self,
        other_user_id: &str,
        item_id: Option<&str>,
    ) -> Result<Conversation> {
        let conversation = match self
            .backend
            .find_conversation_with(other_user_id, item_id)
            .await?
        {
            Some(existing) => existing,
            None => {
                self.backend
                    .create_conversation(other_user_id, item_id)
                    .await?
            }
        };
        self.store.upsert_conversation(conversation.clone()).await;
        self.open(&conversation.id).await?;
        Ok(conversation)
    }

    /// Send text to the counterpart of the open conversation
    pub async fn send(&self, text: &str) -> Result<String> {
        let recipient = self.active_counterpart().await?;
        self.composer.send(&recipient, text).await
    }

    async fn active_counterpart(&self) -> Result<String> {
        let me = self.auth.user_id().ok_or(ChatError::NotAuthenticated)?;
        let active = self
            .store
            .active_conversation_id()
            .await
            .ok_or_else(|| ChatError::NoConversation("nothing selected".to_string()))?;

        let listed = self
            .store
            .conversations()
            .await
            .into_iter()
            .find(|c| c.id == active);
        let conversation = match listed {
            Some(c) => c,
            None => {
                let fetched = self.backend.get_conversation(&active).await?;
                self.store.upsert_conversation(fetched.clone()).await;
                fetched
            }
        };
        conversation
            .counterpart(&me)
            .map(str::to_string)
            .ok_or(ChatError::MissingRecipient)
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    /// Route bus events into the store and follow identity changes
    async fn run_event_pump(
        &self,
        mut events: broadcast::Receiver<ChatEvent>,
        mut identity: watch::Receiver<Option<Session>>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ChatEvent::Inbound { message }) => {
                        let id = message.id.clone();
                        let outcome = self.store.apply_inbound_message(message).await;
                        debug!("Inbound {}: {:?}", id, outcome);
                    }
                    Ok(ChatEvent::Ack { response }) => {
                        self.store.apply_ack(&response).await;
                    }
                    Ok(ChatEvent::Connected { user_id }) => {
                        info!("Realtime chat connected for {}", user_id);
                        self.store.clear_error().await;
                    }
                    Ok(ChatEvent::Disconnected { reason }) => {
                        warn!("Realtime chat disconnected: {}", reason);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event pump lagged {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = identity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let session = identity.borrow_and_update().clone();
                    self.follow_identity(session).await;
                }
            }
        }
        debug!("Event pump stopped");
    }

    async fn follow_identity(&self, session: Option<Session>) {
        match session {
            None => {
                info!("Logged out, closing realtime chat");
                self.connection.disconnect().await;
                self.store.clear().await;
            }
            Some(session) => {
                let current = self.connection.current_user().await;
                if current.as_deref() != Some(session.user_id.as_str()) {
                    self.store.clear().await;
                    if let Err(e) = self.connection.connect(&session.user_id).await {
                        warn!("Reconnect for {} failed: {}", session.user_id, e);
                    }
                }
            }
        }
    }
}
