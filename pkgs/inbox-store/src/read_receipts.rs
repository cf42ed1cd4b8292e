//! Read receipts - local mark-as-read and remote receipt application

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::conversation_store::ConversationStore;
use crate::events::{Conversation, MessageId, ReadReceipt, ReceiptOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReceiptKey {
    /// `None` for single receipts, which do not name their conversation
    conversation_id: Option<String>,
    message_id: i64,
}

/// Receipts that referenced messages not stored yet, oldest evicted first
#[derive(Debug)]
pub(crate) struct PendingReceipts {
    entries: HashMap<ReceiptKey, DateTime<Utc>>,
    order: VecDeque<ReceiptKey>,
    capacity: usize,
}

impl PendingReceipts {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn retain(&mut self, conversation_id: Option<&str>, message_id: i64, read_at: DateTime<Utc>) {
        if self.capacity == 0 {
            return;
        }
        let key = ReceiptKey {
            conversation_id: conversation_id.map(str::to_string),
            message_id,
        };
        if self.entries.insert(key.clone(), read_at).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    trace!("Evicting retained receipt for message {}", oldest.message_id);
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Remove and return the read time recorded for a message, if any
    pub(crate) fn take(&mut self, conversation_id: &str, message_id: i64) -> Option<DateTime<Utc>> {
        let scoped = ReceiptKey {
            conversation_id: Some(conversation_id.to_string()),
            message_id,
        };
        let unscoped = ReceiptKey {
            conversation_id: None,
            message_id,
        };
        [scoped, unscoped]
            .into_iter()
            .filter_map(|key| {
                let read_at = self.entries.remove(&key)?;
                self.order.retain(|k| k != &key);
                Some(read_at)
            })
            .min()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

fn mark_read(conversation: &mut Conversation, message_id: i64, read_at: DateTime<Utc>) -> Option<bool> {
    let id = MessageId::Server(message_id);
    let message = conversation.messages.iter_mut().find(|m| m.id == id)?;
    if message.read_at.is_some() {
        return Some(false);
    }
    message.read_at = Some(read_at);
    Some(true)
}

impl ConversationStore {
    /// Mark every unread customer message in a conversation as read at `now`.
    ///
    /// Returns the server ids that still have to be reported upstream.
    /// Unknown conversations yield nothing.
    pub fn mark_conversation_read(&mut self, conversation_id: &str, now: DateTime<Utc>) -> Vec<i64> {
        let Some(conversation) = self.conversations.get_mut(conversation_id) else {
            return Vec::new();
        };

        let mut reported = Vec::new();
        for message in conversation.messages.iter_mut().filter(|m| m.is_unread()) {
            message.read_at = Some(now);
            if let Some(id) = message.id.server() {
                reported.push(id);
            }
        }
        conversation.recompute();

        if !reported.is_empty() {
            debug!(
                "Marked {} messages read in {}",
                reported.len(),
                conversation_id
            );
        }
        reported
    }

    /// Apply a read receipt pushed by the server.
    ///
    /// Only unset `read_at` values are filled in. Receipts for messages that
    /// are not loaded are retained and applied when the message is appended.
    pub fn apply_receipt(&mut self, receipt: ReadReceipt) -> ReceiptOutcome {
        let mut outcome = ReceiptOutcome::default();
        match receipt {
            ReadReceipt::Single {
                message_id,
                read_at,
            } => {
                let owner = self
                    .conversations
                    .values_mut()
                    .find(|c| c.message(&MessageId::Server(message_id)).is_some());
                match owner {
                    Some(conversation) => {
                        if mark_read(conversation, message_id, read_at) == Some(true) {
                            outcome.applied += 1;
                            conversation.recompute();
                        }
                    }
                    None => {
                        self.pending_receipts.retain(None, message_id, read_at);
                        outcome.deferred += 1;
                    }
                }
            }
            ReadReceipt::Batch {
                conversation_id,
                message_ids,
                read_at,
            } => match self.conversations.get_mut(&conversation_id) {
                Some(conversation) => {
                    for message_id in message_ids {
                        match mark_read(conversation, message_id, read_at) {
                            Some(true) => outcome.applied += 1,
                            Some(false) => {}
                            None => {
                                self.pending_receipts
                                    .retain(Some(&conversation_id), message_id, read_at);
                                outcome.deferred += 1;
                            }
                        }
                    }
                    conversation.recompute();
                }
                None => {
                    for message_id in message_ids {
                        self.pending_receipts
                            .retain(Some(&conversation_id), message_id, read_at);
                        outcome.deferred += 1;
                    }
                }
            },
        }

        if outcome.deferred > 0 {
            debug!(
                "Retained {} read receipts for messages not loaded yet",
                outcome.deferred
            );
        }
        outcome
    }

    /// Number of receipts waiting for their message
    pub fn pending_receipt_count(&self) -> usize {
        self.pending_receipts.len()
    }
}
