//! Inbox Store - in-memory conversation state for the admin inbox
//!
//! This crate holds the client-side view of every conversation the admin
//! inbox knows about, and the pure logic that keeps it consistent while
//! messages arrive from a history fetch, a live push channel and local
//! optimistic sends.
//!
//! # Architecture
//!
//! - **ConversationStore**: conversations keyed by id, each with a message list
//!   ordered by `created_at` and deduplicated by message id
//! - **Read receipts**: local mark-as-read and remote receipt application,
//!   including receipts that arrive before their message
//! - **Threads**: read-time projection of a message list into display threads
//!
//! Nothing here performs I/O. Sharing a store between tasks means wrapping it
//! in a single mutex; every operation completes under one lock acquisition.
//!
//! # Derived state
//!
//! `Conversation::unread_count` and `Conversation::last_activity_at` are
//! recomputed from the message list after every mutation. There is no
//! separately maintained counter.
//!
//! # Example Usage
//!
//! ```rust
//! use chrono::Utc;
//! use inbox_store::{ConversationStore, Message, SenderRole};
//!
//! let mut store = ConversationStore::new();
//! store.append_message(Message::new(1, "project-42", SenderRole::External, "Hi!", Utc::now()));
//!
//! let list = store.get_ordered_conversation_list();
//! assert_eq!(list[0].unread_count, 1);
//!
//! let to_report = store.mark_conversation_read("project-42", Utc::now());
//! assert_eq!(to_report, vec![1]);
//! ```

pub mod conversation_store;
pub mod error;
pub mod read_receipts;
pub mod threads;

mod events;

pub use conversation_store::ConversationStore;
pub use error::StoreError;
pub use events::{
    AppendOutcome, Conversation, ConversationSummary, DeliveryState, Message, MessageId,
    ReadReceipt, ReceiptOutcome, SenderRole,
};
pub use threads::{cluster_threads, derive_category, Thread, ThreadConfig};

/// Configuration for the conversation store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Receipts kept for messages that have not arrived yet (default: 1024)
    pub max_pending_receipts: usize,

    /// Thread clustering parameters
    pub threads: ThreadConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_pending_receipts: 1024,
            threads: ThreadConfig::default(),
        }
    }
}

impl ConversationStore {
    /// Threads of one conversation using the store's clustering settings
    pub fn threads(&self, conversation_id: &str) -> Vec<Thread> {
        self.messages(conversation_id)
            .map(|messages| cluster_threads(conversation_id, messages, &self.config().threads))
            .unwrap_or_default()
    }
}
