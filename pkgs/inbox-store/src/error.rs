use thiserror::Error;

use crate::events::MessageId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Message {message_id} not found in conversation {conversation_id}")]
    MessageNotFound {
        conversation_id: String,
        message_id: MessageId,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;
