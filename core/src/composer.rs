/// Outbound composer: optimistic local entry first, then the bus publish
use crate::auth::AuthContext;
use crate::bus::ConnectionManager;
use crate::conversation_store::ConversationStore;
use crate::error::{ChatError, Result};
use crate::messenger_types::{new_local_id, Message, OutboundEnvelope};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Composer {
    auth: AuthContext,
    store: ConversationStore,
    connection: ConnectionManager,
}

impl Composer {
    pub fn new(auth: AuthContext, store: ConversationStore, connection: ConnectionManager) -> Self {
        Self {
            auth,
            store,
            connection,
        }
    }

    /// Send `text` to `recipient_id` in the open conversation.
    ///
    /// Validation and the connection check happen before anything is shown;
    /// a send that is rejected up front leaves no optimistic entry. Returns
    /// the local id of the optimistic entry.
    pub async fn send(&self, recipient_id: &str, text: &str) -> Result<String> {
        let content = text.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let recipient_id = recipient_id.trim();
        if recipient_id.is_empty() {
            return Err(ChatError::MissingRecipient);
        }
        let sender_id = self.auth.user_id().ok_or(ChatError::NotAuthenticated)?;
        if !self.connection.is_connected() {
            self.store.set_error(ChatError::NotConnected.user_message()).await;
            return Err(ChatError::NotConnected);
        }
        let conversation_id = self
            .store
            .active_conversation_id()
            .await
            .ok_or_else(|| ChatError::NoConversation("nothing selected".to_string()))?;

        let local_id = new_local_id();
        let optimistic = Message::text(
            local_id.clone(),
            conversation_id,
            sender_id.clone(),
            recipient_id,
            content,
        );
        self.store.insert_pending(optimistic).await?;

        let envelope = OutboundEnvelope {
            sender_id,
            recipient_id: recipient_id.to_string(),
            content: content.to_string(),
            client_message_id: Some(local_id.clone()),
        };
        self.publish_or_fail(&local_id, &envelope).await?;
        debug!("Published {} to {}", local_id, recipient_id);
        Ok(local_id)
    }

    /// Republish a failed optimistic entry under the same local id
    pub async fn retry(&self, local_id: &str) -> Result<()> {
        if !self.connection.is_connected() {
            return Err(ChatError::NotConnected);
        }
        let message = self
            .store
            .begin_retry(local_id)
            .await
            .ok_or_else(|| ChatError::NotFound(format!("no failed message {}", local_id)))?;
        let envelope = OutboundEnvelope {
            sender_id: message.sender_id,
            recipient_id: message.recipient_id,
            content: message.content,
            client_message_id: Some(local_id.to_string()),
        };
        self.publish_or_fail(local_id, &envelope).await
    }

    /// Media upload is not supported by this client
    pub async fn send_attachment(&self, _recipient_id: &str, path: &Path) -> Result<String> {
        Err(ChatError::Unsupported(format!(
            "sending attachments is not implemented ({})",
            path.display()
        )))
    }

    async fn publish_or_fail(&self, local_id: &str, envelope: &OutboundEnvelope) -> Result<()> {
        if let Err(e) = self.connection.publish(envelope).await {
            warn!("Send {} failed: {}", local_id, e);
            self.store.mark_failed(local_id).await;
            self.store.set_error(e.user_message()).await;
            return Err(e);
        }
        Ok(())
    }
}
