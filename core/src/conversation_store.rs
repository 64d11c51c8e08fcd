/// Conversation store: the in-memory conversation list and active thread
///
/// Reconciles three inputs into one view: the conversation list fetch, paged
/// history fetches, and realtime events from the bus. Only this type mutates
/// the lists; everyone else reads snapshots.
use crate::api::ChatBackend;
use crate::auth::AuthContext;
use crate::error::{ChatError, Result};
use crate::messenger_types::{
    AckStatus, Conversation, Message, MessageEntry, ResponseEnvelope,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// What `apply_inbound_message` did with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// New message appended to the open conversation
    Appended,
    /// Replaced the optimistic entry `local_id`
    Reconciled { local_id: String },
    /// Already present; nothing changed
    Duplicate,
    /// Not for the open conversation; only the list summary was updated
    Summarized,
}

/// Result of a history page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLoad {
    Loaded { count: usize, has_more: bool },
    /// The user switched conversations while the request was in flight
    Stale,
}

#[derive(Debug)]
struct ActiveConversation {
    id: String,
    entries: Vec<MessageEntry>,
    has_more: bool,
    next_page: u32,
}

impl ActiveConversation {
    fn new(id: String) -> Self {
        Self {
            id,
            entries: Vec::new(),
            has_more: false,
            next_page: 0,
        }
    }

    fn contains_confirmed(&self, id: &str) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e, MessageEntry::Confirmed(m) if m.id == id))
    }

    /// Index of the pending entry this confirmed message settles
    fn correlated_pending(
        &self,
        message: &Message,
        acked_local_id: Option<&str>,
    ) -> Option<usize> {
        let by_local_id = |wanted: &str| {
            self.entries.iter().position(
                |e| matches!(e, MessageEntry::Pending { local_id, .. } if local_id == wanted),
            )
        };
        if let Some(idx) = message.client_message_id.as_deref().and_then(by_local_id) {
            return Some(idx);
        }
        if let Some(idx) = acked_local_id.and_then(by_local_id) {
            return Some(idx);
        }
        self.entries.iter().position(|e| match e {
            MessageEntry::Pending {
                message: pending,
                failed: false,
                ..
            } => {
                pending.sender_id == message.sender_id
                    && pending.recipient_id == message.recipient_id
                    && pending.content == message.content
            }
            _ => false,
        })
    }
}

#[derive(Debug, Default)]
struct StoreState {
    conversations: Vec<Conversation>,
    active: Option<ActiveConversation>,
    /// Bumped on every conversation switch; stale history responses compare against it
    generation: u64,
    /// Bumped on `clear`; stale list responses compare against it
    epoch: u64,
    /// server message id -> local id, from success acks that beat the message
    acked: HashMap<String, String>,
    last_error: Option<String>,
}

/// Single source of truth for conversations and the open thread
#[derive(Clone)]
pub struct ConversationStore {
    backend: Arc<dyn ChatBackend>,
    auth: AuthContext,
    page_size: u32,
    state: Arc<RwLock<StoreState>>,
}

impl ConversationStore {
    pub fn new(backend: Arc<dyn ChatBackend>, auth: AuthContext, page_size: u32) -> Self {
        Self {
            backend,
            auth,
            page_size: page_size.max(1),
            state: Arc::new(RwLock::new(StoreState::default())),
        }
    }

    /// Fetch page 0 of the conversation list and replace the local list
    pub async fn load_conversations(&self) -> Result<usize> {
        let epoch = self.state.read().await.epoch;
        let page = match self.backend.list_conversations(0, self.page_size).await {
            Ok(page) => page,
            Err(e) => {
                error!("Failed to load conversations: {}", e);
                self.set_error(e.user_message()).await;
                return Err(e);
            }
        };

        let mut state = self.state.write().await;
        if state.epoch != epoch {
            debug!("Discarding conversation list from a previous session");
            return Ok(0);
        }
        let count = page.content.len();
        state.conversations = page.content;
        info!("Loaded {} conversations", count);
        Ok(count)
    }

    /// Make `conversation_id` the open conversation with an empty message list.
    ///
    /// Re-opening the conversation that is already open keeps its optimistic
    /// entries, failed ones included, so they can still be retried.
    pub async fn open_conversation(&self, conversation_id: &str) {
        let mut state = self.state.write().await;
        state.generation += 1;
        let mut fresh = ActiveConversation::new(conversation_id.to_string());
        let previous = state.active.take();
        match previous {
            Some(previous) if previous.id == conversation_id => {
                fresh.entries = previous
                    .entries
                    .into_iter()
                    .filter(MessageEntry::is_pending)
                    .collect();
            }
            _ => state.acked.clear(),
        }
        state.active = Some(fresh);
        debug!(
            "Opened conversation {} (generation {})",
            conversation_id, state.generation
        );
    }

    /// Fetch one page of history.
    ///
    /// Page 0 replaces the list (opening the conversation if needed) and keeps
    /// any still-pending optimistic entries at the end; later pages are older
    /// and go to the front. Ids already present are skipped.
    pub async fn load_messages(&self, conversation_id: &str, page: u32) -> Result<PageLoad> {
        let generation = {
            let state = self.state.read().await;
            match &state.active {
                Some(active) if active.id == conversation_id => Some(state.generation),
                _ => None,
            }
        };
        let generation = match generation {
            Some(g) => g,
            None if page == 0 => {
                self.open_conversation(conversation_id).await;
                self.state.read().await.generation
            }
            None => {
                return Err(ChatError::NoConversation(format!(
                    "{} is not open",
                    conversation_id
                )))
            }
        };

        let fetched = match self
            .backend
            .list_messages(conversation_id, page, self.page_size)
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                error!(
                    "Failed to load messages for {} (page {}): {}",
                    conversation_id, page, e
                );
                self.set_error(e.user_message()).await;
                return Err(e);
            }
        };
        let has_more = fetched.has_more(self.page_size);

        let mut state = self.state.write().await;
        if state.generation != generation {
            debug!(
                "Discarding stale page {} for {} (generation {} != {})",
                page, conversation_id, generation, state.generation
            );
            return Ok(PageLoad::Stale);
        }
        let active = match state.active.as_mut() {
            Some(active) if active.id == conversation_id => active,
            _ => return Ok(PageLoad::Stale),
        };

        let count = fetched.content.len();
        if page == 0 {
            let mut entries: Vec<MessageEntry> = Vec::with_capacity(count);
            let mut seen = HashSet::new();
            for message in fetched.content {
                if seen.insert(message.id.clone()) {
                    entries.push(MessageEntry::Confirmed(message));
                }
            }
            entries.extend(active.entries.drain(..).filter(MessageEntry::is_pending));
            active.entries = entries;
        } else {
            let older: Vec<MessageEntry> = fetched
                .content
                .into_iter()
                .filter(|m| !active.contains_confirmed(&m.id))
                .map(MessageEntry::Confirmed)
                .collect();
            active.entries.splice(0..0, older);
        }
        active.has_more = has_more;
        active.next_page = page + 1;
        debug!(
            "Loaded page {} of {}: {} messages, has_more={}",
            page, conversation_id, count, has_more
        );
        Ok(PageLoad::Loaded { count, has_more })
    }

    /// Load the next older page of the open conversation, if any
    pub async fn load_older(&self) -> Result<PageLoad> {
        let (id, next) = {
            let state = self.state.read().await;
            match &state.active {
                Some(active) if active.has_more => (active.id.clone(), active.next_page),
                Some(_) => {
                    return Ok(PageLoad::Loaded {
                        count: 0,
                        has_more: false,
                    })
                }
                None => return Err(ChatError::NoConversation("nothing selected".to_string())),
            }
        };
        self.load_messages(&id, next).await
    }

    /// Apply a realtime message delivered for this user
    pub async fn apply_inbound_message(&self, message: Message) -> InboundOutcome {
        let me = self.auth.user_id();
        let mut state = self.state.write().await;

        let is_active = state
            .active
            .as_ref()
            .map(|a| a.id == message.conversation_id)
            .unwrap_or(false);
        let from_other = me.as_deref() != Some(message.sender_id.as_str());
        update_summary(
            &mut state.conversations,
            &message,
            !is_active && from_other,
        );
        if !is_active {
            return InboundOutcome::Summarized;
        }

        let acked_local_id = state.acked.remove(&message.id);
        let Some(active) = state.active.as_mut() else {
            return InboundOutcome::Summarized;
        };

        let pending = active.correlated_pending(&message, acked_local_id.as_deref());
        if active.contains_confirmed(&message.id) {
            if let Some(idx) = pending {
                active.entries.remove(idx);
            }
            debug!("Duplicate delivery of message {}", message.id);
            return InboundOutcome::Duplicate;
        }

        match pending {
            Some(idx) => {
                let local_id = active.entries.remove(idx).id().to_string();
                debug!("Reconciled {} -> {}", local_id, message.id);
                active.entries.push(MessageEntry::Confirmed(message));
                InboundOutcome::Reconciled { local_id }
            }
            None => {
                active.entries.push(MessageEntry::Confirmed(message));
                InboundOutcome::Appended
            }
        }
    }

    /// Apply an acknowledgement from the responses queue
    pub async fn apply_ack(&self, response: &ResponseEnvelope) -> bool {
        let mut state = self.state.write().await;
        match response.status {
            AckStatus::Success => {
                let (Some(local_id), Some(server_id)) =
                    (&response.client_message_id, &response.message_id)
                else {
                    return false;
                };
                let still_pending = state.active.as_ref().is_some_and(|a| {
                    a.entries
                        .iter()
                        .any(|e| e.is_pending() && e.id() == local_id)
                });
                if still_pending {
                    state.acked.insert(server_id.clone(), local_id.clone());
                }
                still_pending
            }
            AckStatus::Error => {
                let reason = response
                    .message
                    .clone()
                    .unwrap_or_else(|| "send rejected by server".to_string());
                warn!("Server rejected send: {}", reason);
                state.last_error = Some(reason);
                match &response.client_message_id {
                    Some(local_id) => mark_failed_in(&mut state, local_id),
                    None => false,
                }
            }
        }
    }

    /// Zero the unread counter locally; the backend has no read endpoint
    pub async fn mark_conversation_read(&self, conversation_id: &str) -> bool {
        let mut state = self.state.write().await;
        match state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            Some(conversation) => {
                conversation.unread_count = 0;
                true
            }
            None => false,
        }
    }

    /// Append an optimistic entry to the open conversation
    pub async fn insert_pending(&self, message: Message) -> Result<()> {
        let mut state = self.state.write().await;
        let active = match state.active.as_mut() {
            Some(active) if active.id == message.conversation_id => active,
            _ => {
                return Err(ChatError::NoConversation(format!(
                    "{} is not open",
                    message.conversation_id
                )))
            }
        };
        active.entries.push(MessageEntry::Pending {
            local_id: message.id.clone(),
            message,
            failed: false,
        });
        Ok(())
    }

    /// Flag a pending entry as failed
    pub async fn mark_failed(&self, local_id: &str) -> bool {
        let mut state = self.state.write().await;
        mark_failed_in(&mut state, local_id)
    }

    /// Clear the failed flag of a pending entry and hand back its message
    pub async fn begin_retry(&self, local_id: &str) -> Option<Message> {
        let mut state = self.state.write().await;
        let active = state.active.as_mut()?;
        active.entries.iter_mut().find_map(|e| match e {
            MessageEntry::Pending {
                local_id: id,
                message,
                failed,
            } if id == local_id && *failed => {
                *failed = false;
                Some(message.clone())
            }
            _ => None,
        })
    }

    /// Insert or refresh one conversation (e.g. after create-or-get)
    pub async fn upsert_conversation(&self, conversation: Conversation) {
        let mut state = self.state.write().await;
        match state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation.id)
        {
            Some(existing) => *existing = conversation,
            None => state.conversations.insert(0, conversation),
        }
    }

    /// Drop everything, e.g. on logout; in-flight loads are discarded
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        let epoch = state.epoch + 1;
        let generation = state.generation + 1;
        *state = StoreState {
            epoch,
            generation,
            ..Default::default()
        };
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.state.read().await.conversations.clone()
    }

    pub async fn active_conversation_id(&self) -> Option<String> {
        self.state.read().await.active.as_ref().map(|a| a.id.clone())
    }

    /// Snapshot of the open conversation's entries, oldest first
    pub async fn messages(&self) -> Vec<MessageEntry> {
        self.state
            .read()
            .await
            .active
            .as_ref()
            .map(|a| a.entries.clone())
            .unwrap_or_default()
    }

    pub async fn has_more(&self) -> bool {
        self.state
            .read()
            .await
            .active
            .as_ref()
            .map(|a| a.has_more)
            .unwrap_or(false)
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.read().await.last_error.clone()
    }

    pub async fn set_error(&self, message: impl Into<String>) {
        self.state.write().await.last_error = Some(message.into());
    }

    pub async fn clear_error(&self) {
        self.state.write().await.last_error = None;
    }
}

fn mark_failed_in(state: &mut StoreState, local_id: &str) -> bool {
    let Some(active) = state.active.as_mut() else {
        return false;
    };
    for entry in active.entries.iter_mut() {
        if let MessageEntry::Pending {
            local_id: id,
            failed,
            ..
        } = entry
        {
            if id == local_id {
                *failed = true;
                return true;
            }
        }
    }
    false
}

/// Patch the list's last-message fields for the message's conversation
fn update_summary(conversations: &mut [Conversation], message: &Message, bump_unread: bool) {
    let Some(conversation) = conversations
        .iter_mut()
        .find(|c| c.id == message.conversation_id)
    else {
        debug!(
            "Message {} for conversation {} not in list",
            message.id, message.conversation_id
        );
        return;
    };
    conversation.last_message_id = Some(message.id.clone());
    conversation.last_message_at = message.created_at.or(conversation.last_message_at);
    conversation.last_message_preview = Some(message.preview());
    if bump_unread {
        conversation.unread_count += 1;
    }
}
