//! JSON payloads exchanged with the inbox server
//!
//! Push frames look like `{"event": "<name>", "data": {...}}`. The REST
//! bodies reuse the same message payload shape.

use chrono::{DateTime, Utc};
use inbox_store::{ConversationSummary, Message, MessageId, ReadReceipt, SenderRole};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::transport::TransportEvent;

pub const EVENT_NEW_MESSAGE: &str = "newMessage";
pub const EVENT_MESSAGE_READ: &str = "messageRead";
pub const EVENT_MESSAGES_READ: &str = "messagesRead";

/// A message as the server reports it, in push events and REST responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: i64,
    /// May be omitted when the message is nested in a conversation payload
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, alias = "sender")]
    pub sender_name: String,
    pub sender_role: SenderRole,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "clientId")]
    pub client_message_id: Option<String>,
}

impl MessagePayload {
    pub fn into_message(self) -> Message {
        Message {
            id: MessageId::Server(self.id),
            conversation_id: self.conversation_id,
            content: self.content.unwrap_or_default(),
            attachments: self.attachments,
            sender_role: self.sender_role,
            sender_label: self.sender_name,
            created_at: self.created_at,
            read_at: self.read_at,
            client_token: self.client_message_id,
            delivery: Default::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReadPayload {
    pub message_id: i64,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesReadPayload {
    pub conversation_id: String,
    pub message_ids: Vec<i64>,
    pub read_at: DateTime<Utc>,
}

/// One conversation with its embedded history, as returned by `GET /conversations`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub participant_name: String,
    #[serde(default)]
    pub participant_contact: String,
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
}

impl ConversationPayload {
    /// Split into store inputs; nested messages inherit the conversation id
    pub fn into_parts(self) -> (ConversationSummary, Vec<Message>) {
        let summary = ConversationSummary {
            id: self.id.clone(),
            title: self.title,
            participant_name: self.participant_name,
            participant_contact: self.participant_contact,
        };
        let messages = self
            .messages
            .into_iter()
            .map(|mut payload| {
                if payload.conversation_id.is_empty() {
                    payload.conversation_id = self.id.clone();
                }
                payload.into_message()
            })
            .collect();
        (summary, messages)
    }
}

/// Body of `POST /messages`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub sender: String,
    pub body: String,
    pub attachment_keys: Vec<String>,
    pub client_message_id: String,
}

/// Frames the client sends on the push channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientFrame {
    Join { channel: String },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Decode one push frame.
///
/// Unknown event names yield `Ok(None)`; known events with missing or
/// invalid fields are `MalformedEvent`.
pub fn decode_frame(text: &str) -> Result<Option<TransportEvent>> {
    let raw: RawFrame = serde_json::from_str(text)
        .map_err(|e| SyncError::MalformedEvent(format!("invalid frame: {}", e)))?;

    let event = match raw.event.as_str() {
        EVENT_NEW_MESSAGE => {
            let payload: MessagePayload = parse_data(&raw.event, raw.data)?;
            if payload.conversation_id.trim().is_empty() {
                return Err(SyncError::MalformedEvent(format!(
                    "{} {} without conversationId",
                    EVENT_NEW_MESSAGE, payload.id
                )));
            }
            TransportEvent::Message(payload.into_message())
        }
        EVENT_MESSAGE_READ => {
            let payload: MessageReadPayload = parse_data(&raw.event, raw.data)?;
            TransportEvent::ReadReceipt(ReadReceipt::Single {
                message_id: payload.message_id,
                read_at: payload.read_at,
            })
        }
        EVENT_MESSAGES_READ => {
            let payload: MessagesReadPayload = parse_data(&raw.event, raw.data)?;
            TransportEvent::ReadReceipt(ReadReceipt::Batch {
                conversation_id: payload.conversation_id,
                message_ids: payload.message_ids,
                read_at: payload.read_at,
            })
        }
        other => {
            debug!("Ignoring push event {}", other);
            return Ok(None);
        }
    };
    Ok(Some(event))
}

fn parse_data<T: for<'de> Deserialize<'de>>(event: &str, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| SyncError::MalformedEvent(format!("{}: {}", event, e)))
}

pub fn encode_frame(frame: &ClientFrame) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}
