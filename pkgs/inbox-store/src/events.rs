//! Data model shared by the store, the receipt synchronizer and thread clustering

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message identity
///
/// Server ids are integers assigned on persistence. Local ids are temporary
/// UUID strings handed out for optimistic sends and replaced once the server
/// copy is observed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Server(i64),
    Local(String),
}

impl MessageId {
    pub fn server(&self) -> Option<i64> {
        match self {
            MessageId::Server(id) => Some(*id),
            MessageId::Local(_) => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Server(id) => write!(f, "{}", id),
            MessageId::Local(id) => write!(f, "local:{}", id),
        }
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        MessageId::Server(id)
    }
}

/// Which side of the conversation sent a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    /// Admin side
    #[serde(alias = "admin")]
    Internal,
    /// Customer side; only these count towards unread
    #[serde(alias = "client", alias = "customer")]
    External,
}

/// Delivery state of a message as seen by the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Confirmed by the server
    #[default]
    Sent,
    /// Optimistic, request in flight
    Pending,
    /// Optimistic, request failed; the user can retry
    Failed,
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub sender_role: SenderRole,
    #[serde(default)]
    pub sender_label: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    /// Correlates an optimistic message with its server echo
    #[serde(default)]
    pub client_token: Option<String>,
    #[serde(default)]
    pub delivery: DeliveryState,
}

impl Message {
    /// A server-confirmed message
    pub fn new(
        id: impl Into<MessageId>,
        conversation_id: impl Into<String>,
        sender_role: SenderRole,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            content: content.into(),
            attachments: Vec::new(),
            sender_role,
            sender_label: String::new(),
            created_at,
            read_at: None,
            client_token: None,
            delivery: DeliveryState::Sent,
        }
    }

    /// A locally originated message awaiting server confirmation.
    ///
    /// The temporary id doubles as the correlation token.
    pub fn optimistic(
        local_id: impl Into<String>,
        conversation_id: impl Into<String>,
        content: impl Into<String>,
        attachments: Vec<String>,
        sender_label: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let local_id = local_id.into();
        Self {
            id: MessageId::Local(local_id.clone()),
            conversation_id: conversation_id.into(),
            content: content.into(),
            attachments,
            sender_role: SenderRole::Internal,
            sender_label: sender_label.into(),
            created_at,
            read_at: None,
            client_token: Some(local_id),
            delivery: DeliveryState::Pending,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_sender_label(mut self, label: impl Into<String>) -> Self {
        self.sender_label = label.into();
        self
    }

    pub fn with_client_token(mut self, token: impl Into<String>) -> Self {
        self.client_token = Some(token.into());
        self
    }

    pub fn with_read_at(mut self, read_at: DateTime<Utc>) -> Self {
        self.read_at = Some(read_at);
        self
    }

    pub fn is_unread(&self) -> bool {
        self.sender_role == SenderRole::External && self.read_at.is_none()
    }

    /// Still a local placeholder (pending or failed)
    pub fn is_optimistic(&self) -> bool {
        self.id.is_local()
    }

    pub fn send_failed(&self) -> bool {
        self.delivery == DeliveryState::Failed
    }
}

/// Conversation metadata as reported by the history endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub participant_name: String,
    #[serde(default)]
    pub participant_contact: String,
}

impl ConversationSummary {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// A conversation with one external party
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub participant_name: String,
    pub participant_contact: String,
    pub messages: Vec<Message>,
    pub unread_count: usize,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn from_summary(summary: ConversationSummary) -> Self {
        Self {
            id: summary.id,
            title: summary.title,
            participant_name: summary.participant_name,
            participant_contact: summary.participant_contact,
            messages: Vec::new(),
            unread_count: 0,
            last_activity_at: None,
        }
    }

    /// Minimal record for a conversation first seen through a live event
    pub fn placeholder(id: impl Into<String>) -> Self {
        Self::from_summary(ConversationSummary::new(id))
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub(crate) fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    /// Refresh the derived fields from message state.
    ///
    /// `unread_count` is never adjusted anywhere else.
    pub(crate) fn recompute(&mut self) {
        self.unread_count = self.messages.iter().filter(|m| m.is_unread()).count();
        self.last_activity_at = self.messages.last().map(|m| m.created_at);
    }
}

/// Read receipt pushed by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadReceipt {
    Single {
        message_id: i64,
        read_at: DateTime<Utc>,
    },
    Batch {
        conversation_id: String,
        message_ids: Vec<i64>,
        read_at: DateTime<Utc>,
    },
}

/// Result of `ConversationStore::append_message`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A message with this id was already stored
    Duplicate,
    /// An optimistic entry was superseded in place
    Replaced { index: usize },
    /// Inserted at its timestamp position
    Inserted { index: usize },
}

/// Result of applying a remote read receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiptOutcome {
    /// Messages whose `read_at` changed
    pub applied: usize,
    /// Ids kept until their message shows up
    pub deferred: usize,
}
