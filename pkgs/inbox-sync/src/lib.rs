//! Inbox Sync - keeps the admin inbox in step with the server
//!
//! Wraps an [`inbox_store::ConversationStore`] with the I/O around it:
//!
//! - **WsTransport**: push connection with channel join, frame decoding and
//!   reconnect backoff
//! - **HttpInboxApi**: REST history, message sends and read reports
//! - **SyncEngine**: applies history, push events and local actions to the
//!   shared store and broadcasts what changed
//!
//! # Example
//!
//! ```no_run
//! use inbox_sync::{HttpInboxApi, SyncConfig, SyncEngine, WsTransport};
//!
//! # async fn demo() -> inbox_sync::Result<()> {
//! let config = SyncConfig::default();
//! let engine = SyncEngine::new(HttpInboxApi::new(&config)?, config.clone());
//! engine.cold_start().await?;
//!
//! let (_transport, events) = WsTransport::spawn(&config)?;
//! tokio::spawn({
//!     let engine = engine.clone();
//!     async move { engine.run(events).await }
//! });
//!
//! for conversation in engine.conversation_list() {
//!     println!("{} ({} unread)", conversation.title, conversation.unread_count);
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod transport;
pub mod wire;

pub use api::{HttpInboxApi, InboxApi};
pub use config::SyncConfig;
pub use engine::{FetchTicket, SharedStore, StoreUpdate, SyncEngine};
pub use error::{Result, SyncError};
pub use transport::{Backoff, ConnectionStatus, TransportEvent, TransportHandle, WsTransport};
pub use wire::{decode_frame, ConversationPayload, MessagePayload, SendMessageRequest};
