//! Mock backend for unit testing the store and composer without HTTP.

use crate::api::ChatBackend;
use crate::error::{ChatError, Result};
use crate::messenger_types::{Conversation, ConversationStatus, Message, Page};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Build a conversation between two users
pub fn conversation(id: &str, a: &str, b: &str) -> Conversation {
    Conversation {
        id: id.to_string(),
        participants: vec![a.to_string(), b.to_string()],
        last_message_id: None,
        last_message_at: None,
        last_message_preview: None,
        unread_count: 0,
        status: ConversationStatus::Active,
        listing: None,
    }
}

/// Wrap items in a page of the given requested size
pub fn page<T>(content: Vec<T>, number: u32, size: u32, last: bool) -> Page<T> {
    let len = content.len() as u64;
    Page {
        content,
        number,
        size,
        total_elements: len,
        total_pages: number + 1,
        last,
    }
}

/// In-memory [`ChatBackend`] with canned pages.
#[derive(Clone, Default)]
pub struct MockBackend {
    conversations: Arc<RwLock<Vec<Conversation>>>,
    /// Message pages per conversation, indexed by page number
    messages: Arc<RwLock<HashMap<String, Vec<Vec<Message>>>>>,
    /// Artificial latency per conversation for message fetches
    delays: Arc<RwLock<HashMap<String, Duration>>>,
    /// Artificial latency for conversation list fetches
    list_delay: Arc<RwLock<Option<Duration>>>,
    fail: Arc<RwLock<bool>>,
    calls: Arc<RwLock<Vec<String>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_conversations(&self, list: Vec<Conversation>) {
        *self.conversations.write().await = list;
    }

    pub async fn set_message_pages(&self, conversation_id: &str, pages: Vec<Vec<Message>>) {
        self.messages
            .write()
            .await
            .insert(conversation_id.to_string(), pages);
    }

    pub async fn set_delay(&self, conversation_id: &str, delay: Duration) {
        self.delays
            .write()
            .await
            .insert(conversation_id.to_string(), delay);
    }

    pub async fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.write().await = Some(delay);
    }

    pub async fn set_fail(&self, fail: bool) {
        *self.fail.write().await = fail;
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.read().await.clone()
    }

    async fn record(&self, call: String) -> Result<()> {
        self.calls.write().await.push(call);
        if *self.fail.read().await {
            return Err(ChatError::Http {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn list_conversations(&self, page_no: u32, size: u32) -> Result<Page<Conversation>> {
        let delay = *self.list_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record(format!("list_conversations:{}:{}", page_no, size))
            .await?;
        let all = self.conversations.read().await;
        let start = (page_no * size) as usize;
        let chunk: Vec<_> = all.iter().skip(start).take(size as usize).cloned().collect();
        let last = start + chunk.len() >= all.len();
        Ok(page(chunk, page_no, size, last))
    }

    async fn get_conversation(&self, id: &str) -> Result<Conversation> {
        self.record(format!("get_conversation:{}", id)).await?;
        self.conversations
            .read()
            .await
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(id.to_string()))
    }

    async fn find_conversation_with(
        &self,
        other_user_id: &str,
        _item_id: Option<&str>,
    ) -> Result<Option<Conversation>> {
        self.record(format!("find_conversation_with:{}", other_user_id))
            .await?;
        Ok(self
            .conversations
            .read()
            .await
            .iter()
            .find(|c| c.participants.iter().any(|p| p == other_user_id))
            .cloned())
    }

    async fn create_conversation(
        &self,
        other_user_id: &str,
        item_id: Option<&str>,
    ) -> Result<Conversation> {
        if let Some(existing) = self.find_conversation_with(other_user_id, item_id).await? {
            return Ok(existing);
        }
        self.record(format!("create_conversation:{}", other_user_id))
            .await?;
        let mut list = self.conversations.write().await;
        let created = conversation(&format!("c-{}", list.len() + 1), "me", other_user_id);
        list.insert(0, created.clone());
        Ok(created)
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        page_no: u32,
        size: u32,
    ) -> Result<Page<Message>> {
        let delay = self.delays.read().await.get(conversation_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record(format!("list_messages:{}:{}", conversation_id, page_no))
            .await?;
        let pages = self.messages.read().await;
        let list = pages.get(conversation_id);
        let content = list
            .and_then(|p| p.get(page_no as usize))
            .cloned()
            .unwrap_or_default();
        let last = list.map(|p| page_no as usize + 1 >= p.len()).unwrap_or(true);
        Ok(page(content, page_no, size, last))
    }
}
