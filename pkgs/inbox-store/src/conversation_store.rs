//! Conversation store - in-memory source of truth for conversations and their messages

use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::events::{
    AppendOutcome, Conversation, ConversationSummary, DeliveryState, Message, MessageId, SenderRole,
};
use crate::read_receipts::PendingReceipts;
use crate::StoreConfig;

/// Conversation store
///
/// Not synchronized; callers that share it across tasks wrap it in a single
/// mutex so that each operation is observed atomically.
#[derive(Debug)]
pub struct ConversationStore {
    pub(crate) conversations: HashMap<String, Conversation>,
    pub(crate) pending_receipts: PendingReceipts,
    config: StoreConfig,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    /// Create an empty store with default settings
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            conversations: HashMap::new(),
            pending_receipts: PendingReceipts::new(config.max_pending_receipts),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Drop every conversation and retained receipt
    pub fn reset(&mut self) {
        info!(
            "Resetting conversation store ({} conversations)",
            self.conversations.len()
        );
        self.conversations.clear();
        self.pending_receipts.clear();
    }

    /// Create or update conversation metadata.
    ///
    /// Empty fields in `summary` never overwrite known values. Returns `true`
    /// when the conversation was created.
    pub fn upsert_conversation(&mut self, summary: ConversationSummary) -> bool {
        match self.conversations.get_mut(&summary.id) {
            Some(existing) => {
                if !summary.title.is_empty() {
                    existing.title = summary.title;
                }
                if !summary.participant_name.is_empty() {
                    existing.participant_name = summary.participant_name;
                }
                if !summary.participant_contact.is_empty() {
                    existing.participant_contact = summary.participant_contact;
                }
                false
            }
            None => {
                debug!("Creating conversation {}", summary.id);
                self.conversations
                    .insert(summary.id.clone(), Conversation::from_summary(summary));
                true
            }
        }
    }

    /// Add a message to its conversation.
    ///
    /// Re-deliveries are ignored, server echoes of optimistic sends replace the
    /// placeholder in place, everything else lands at its `created_at`
    /// position after any messages with an equal timestamp.
    pub fn append_message(&mut self, message: Message) -> AppendOutcome {
        let conversation_id = message.conversation_id.clone();
        let conversation = self
            .conversations
            .entry(conversation_id.clone())
            .or_insert_with(|| {
                debug!("Synthesizing conversation {} from message", conversation_id);
                Conversation::placeholder(conversation_id.clone())
            });

        if conversation.position(&message.id).is_some() {
            // The server copy may already be stored through the other channel;
            // the placeholder it was correlated with is then obsolete.
            if let Some(index) = optimistic_by_token(conversation, message.client_token.as_deref())
            {
                debug!(
                    "Dropping superseded placeholder {} in {}",
                    conversation.messages[index].id, conversation_id
                );
                conversation.messages.remove(index);
                conversation.recompute();
            }
            return AppendOutcome::Duplicate;
        }

        let mut message = message;
        if let Some(server_id) = message.id.server() {
            if let Some(read_at) = self.pending_receipts.take(&conversation_id, server_id) {
                debug!("Applying retained read receipt to message {}", server_id);
                message.read_at.get_or_insert(read_at);
            }
        }

        if let Some(index) = optimistic_match(conversation, &message) {
            let previous = &conversation.messages[index];
            debug!(
                "Replacing optimistic {} with {} in {}",
                previous.id, message.id, conversation_id
            );
            if message.client_token.is_none() {
                message.client_token = previous.client_token.clone();
            }
            // Keeps the list sorted by created_at
            message.created_at = previous.created_at;
            conversation.messages[index] = message;
            conversation.recompute();
            return AppendOutcome::Replaced { index };
        }

        let index = conversation
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        conversation.messages.insert(index, message);
        conversation.recompute();
        AppendOutcome::Inserted { index }
    }

    /// Conversations for the list view: unread ones first, then most recent activity
    pub fn get_ordered_conversation_list(&self) -> Vec<&Conversation> {
        let mut list: Vec<&Conversation> = self.conversations.values().collect();
        list.sort_by(|a, b| {
            (b.unread_count > 0)
                .cmp(&(a.unread_count > 0))
                .then_with(|| b.last_activity_at.cmp(&a.last_activity_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    pub fn get_conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn messages(&self, conversation_id: &str) -> Option<&[Message]> {
        self.conversations
            .get(conversation_id)
            .map(|c| c.messages.as_slice())
    }

    pub fn contains_conversation(&self, id: &str) -> bool {
        self.conversations.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// The optimistic message with this temporary id, if it is still a placeholder
    pub fn optimistic_message(&self, conversation_id: &str, local_id: &str) -> Option<&Message> {
        self.conversations
            .get(conversation_id)?
            .message(&MessageId::Local(local_id.to_string()))
    }

    /// Flag an optimistic send as failed, keeping it in place
    pub fn mark_send_failed(&mut self, conversation_id: &str, local_id: &str) -> Result<()> {
        self.set_delivery(conversation_id, local_id, DeliveryState::Failed)
    }

    /// Put a failed optimistic send back in flight before a retry
    pub fn mark_send_pending(&mut self, conversation_id: &str, local_id: &str) -> Result<()> {
        self.set_delivery(conversation_id, local_id, DeliveryState::Pending)
    }

    fn set_delivery(
        &mut self,
        conversation_id: &str,
        local_id: &str,
        state: DeliveryState,
    ) -> Result<()> {
        let conversation = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))?;
        let id = MessageId::Local(local_id.to_string());
        let message = conversation
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StoreError::MessageNotFound {
                conversation_id: conversation_id.to_string(),
                message_id: id.clone(),
            })?;
        message.delivery = state;
        Ok(())
    }
}

fn optimistic_by_token(conversation: &Conversation, token: Option<&str>) -> Option<usize> {
    let token = token?;
    conversation
        .messages
        .iter()
        .position(|m| m.is_optimistic() && m.client_token.as_deref() == Some(token))
}

/// Find the placeholder a server message confirms.
///
/// A correlation token is authoritative. Without one, an admin message matches
/// the oldest in-flight placeholder with identical body and attachments.
fn optimistic_match(conversation: &Conversation, incoming: &Message) -> Option<usize> {
    if incoming.is_optimistic() {
        return None;
    }
    if incoming.client_token.is_some() {
        return optimistic_by_token(conversation, incoming.client_token.as_deref());
    }
    if incoming.sender_role != SenderRole::Internal {
        return None;
    }
    conversation.messages.iter().position(|m| {
        m.is_optimistic()
            && m.delivery == DeliveryState::Pending
            && m.content == incoming.content
            && m.attachments == incoming.attachments
    })
}
