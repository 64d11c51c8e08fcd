/// REST client for the chat endpoints of the marketplace backend
///
/// Endpoints (base = configured API origin):
///   GET  /chats/conservations                     ?page=N&size=N
///   GET  /chats/conservations/:id
///   GET  /chats/conservations/with/:other_user_id ?itemId=...
///   POST /chats/conservations/create/:other_user_id ?itemId=...
///   GET  /chats/conservations/:id/messages        ?page=N&size=N
use crate::auth::AuthContext;
use crate::error::{ChatError, Result};
use crate::messenger_types::{Conversation, Message, Page};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the caller's user id on chat endpoints
pub const USER_ID_HEADER: &str = "X-User-Id";

const CHAT_BASE: &str = "/chats/conservations";

/// Chat REST operations, abstracted for testing the store without HTTP.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn list_conversations(&self, page: u32, size: u32) -> Result<Page<Conversation>>;

    async fn get_conversation(&self, id: &str) -> Result<Conversation>;

    /// Existing conversation with `other_user_id`, if any
    async fn find_conversation_with(
        &self,
        other_user_id: &str,
        item_id: Option<&str>,
    ) -> Result<Option<Conversation>>;

    /// Create-or-get a conversation with `other_user_id`
    async fn create_conversation(
        &self,
        other_user_id: &str,
        item_id: Option<&str>,
    ) -> Result<Conversation>;

    async fn list_messages(
        &self,
        conversation_id: &str,
        page: u32,
        size: u32,
    ) -> Result<Page<Message>>;
}

/// reqwest-backed [`ChatBackend`]
#[derive(Clone)]
pub struct HttpChatBackend {
    client: Client,
    origin: String,
    auth: AuthContext,
}

impl HttpChatBackend {
    pub fn new(origin: impl Into<String>, auth: AuthContext, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            origin: origin.into().trim_end_matches('/').to_string(),
            auth,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.origin, path)
    }

    /// Attach bearer token and user id; fails before any I/O when logged out
    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let session = self.auth.require()?;
        Ok(self
            .client
            .request(method, self.url(path))
            .bearer_auth(&session.token)
            .header(USER_ID_HEADER, &session.user_id))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await?;
        let status = response.status();
        debug!("{} {}", status.as_u16(), response.url().path());
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!("Chat API rejected credentials ({})", status.as_u16());
            return Err(ChatError::Unauthorized(body));
        }
        Err(ChatError::Http {
            status: status.as_u16(),
            body,
        })
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let bytes = self.send(builder).await?.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ChatError::Malformed(e.to_string()))
    }
}

fn item_query(item_id: Option<&str>) -> Vec<(&'static str, String)> {
    item_id
        .filter(|id| !id.is_empty())
        .map(|id| vec![("itemId", id.to_string())])
        .unwrap_or_default()
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn list_conversations(&self, page: u32, size: u32) -> Result<Page<Conversation>> {
        let req = self
            .request(Method::GET, CHAT_BASE)?
            .query(&[("page", page), ("size", size)]);
        self.json(req).await
    }

    async fn get_conversation(&self, id: &str) -> Result<Conversation> {
        let path = format!("{}/{}", CHAT_BASE, urlencoding::encode(id));
        self.json(self.request(Method::GET, &path)?).await
    }

    async fn find_conversation_with(
        &self,
        other_user_id: &str,
        item_id: Option<&str>,
    ) -> Result<Option<Conversation>> {
        let path = format!("{}/with/{}", CHAT_BASE, urlencoding::encode(other_user_id));
        let req = self
            .request(Method::GET, &path)?
            .query(&item_query(item_id));
        let response = match self.send(req).await {
            Ok(response) => response,
            Err(ChatError::Http { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let bytes = response.bytes().await?;
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(None);
        }
        serde_json::from_slice::<Option<Conversation>>(&bytes)
            .map_err(|e| ChatError::Malformed(e.to_string()))
    }

    async fn create_conversation(
        &self,
        other_user_id: &str,
        item_id: Option<&str>,
    ) -> Result<Conversation> {
        if other_user_id.trim().is_empty() {
            return Err(ChatError::MissingRecipient);
        }
        let path = format!("{}/create/{}", CHAT_BASE, urlencoding::encode(other_user_id));
        let req = self
            .request(Method::POST, &path)?
            .query(&item_query(item_id));
        self.json(req).await
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        page: u32,
        size: u32,
    ) -> Result<Page<Message>> {
        let path = format!(
            "{}/{}/messages",
            CHAT_BASE,
            urlencoding::encode(conversation_id)
        );
        let req = self
            .request(Method::GET, &path)?
            .query(&[("page", page), ("size", size)]);
        self.json(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requests_require_session() {
        let api = HttpChatBackend::new(
            "http://127.0.0.1:9",
            AuthContext::new(),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(matches!(
            api.list_conversations(0, 20).await,
            Err(ChatError::NotAuthenticated)
        ));
    }

    #[test]
    fn test_item_query_skips_blank() {
        assert!(item_query(None).is_empty());
        assert!(item_query(Some("")).is_empty());
        assert_eq!(item_query(Some("42")), vec![("itemId", "42".to_string())]);
    }
}
