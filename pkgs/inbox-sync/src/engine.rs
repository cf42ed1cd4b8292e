//! Reconciliation engine
//!
//! Applies REST history, push events and local actions to one shared
//! [`ConversationStore`]. Store access is synchronous and never held across
//! an await point, so every event is applied atomically with respect to the
//! others. Observers learn about changes through [`StoreUpdate`] broadcasts
//! and the connectivity watch channel.

use std::sync::Arc;

use chrono::Utc;
use inbox_store::{
    AppendOutcome, Conversation, ConversationStore, Message, MessageId, ReadReceipt, StoreError,
    Thread,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::InboxApi;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::transport::{ConnectionStatus, TransportEvent};
use crate::wire::{ConversationPayload, SendMessageRequest};

pub type SharedStore = Arc<Mutex<ConversationStore>>;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Change notification for the render layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreUpdate {
    /// One conversation's messages or metadata changed
    Conversation { conversation_id: String },
    /// Several conversations may have changed
    Conversations,
    Connectivity { status: ConnectionStatus },
}

/// Identifies one history fetch; results for a superseded ticket are dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub conversation_id: String,
    generation: u64,
}

#[derive(Debug, Default)]
struct ViewState {
    selected: Option<String>,
    generation: u64,
}

pub struct SyncEngine<A: InboxApi> {
    store: SharedStore,
    api: Arc<A>,
    config: SyncConfig,
    view: Arc<Mutex<ViewState>>,
    updates: broadcast::Sender<StoreUpdate>,
    status: Arc<watch::Sender<ConnectionStatus>>,
}

impl<A: InboxApi> Clone for SyncEngine<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            api: self.api.clone(),
            config: self.config.clone(),
            view: self.view.clone(),
            updates: self.updates.clone(),
            status: self.status.clone(),
        }
    }
}

impl<A: InboxApi> SyncEngine<A> {
    pub fn new(api: A, config: SyncConfig) -> Self {
        let store = Arc::new(Mutex::new(ConversationStore::with_config(
            config.store_config(),
        )));
        Self::with_store(store, Arc::new(api), config)
    }

    pub fn with_store(store: SharedStore, api: Arc<A>, config: SyncConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(ConnectionStatus::Stopped);
        Self {
            store,
            api,
            config,
            view: Arc::new(Mutex::new(ViewState::default())),
            updates,
            status: Arc::new(status),
        }
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates.subscribe()
    }

    pub fn connectivity(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Snapshot of the conversation list in display order
    pub fn conversation_list(&self) -> Vec<Conversation> {
        self.store
            .lock()
            .get_ordered_conversation_list()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.store.lock().get_conversation(conversation_id).cloned()
    }

    pub fn threads(&self, conversation_id: &str) -> Vec<Thread> {
        self.store.lock().threads(conversation_id)
    }

    pub fn selected_conversation(&self) -> Option<String> {
        self.view.lock().selected.clone()
    }

    /// Drop all state, e.g. on logout. In-flight fetches become stale.
    pub fn reset(&self) {
        self.store.lock().reset();
        let mut view = self.view.lock();
        view.selected = None;
        view.generation += 1;
        drop(view);
        info!("Inbox state reset");
        self.notify(StoreUpdate::Conversations);
    }

    /// Load every conversation and its history. Returns the number of
    /// messages applied.
    pub async fn cold_start(&self) -> Result<usize> {
        let payloads = self.api.fetch_conversations().await?;
        let conversations = payloads.len();
        let applied = {
            let mut store = self.store.lock();
            payloads
                .into_iter()
                .map(|payload| apply_history(&mut store, payload))
                .sum()
        };
        info!(
            "Cold start loaded {} conversations, {} messages",
            conversations, applied
        );
        self.notify(StoreUpdate::Conversations);
        Ok(applied)
    }

    /// Start a history fetch for `conversation_id` and make it the open one.
    /// Any earlier ticket becomes stale.
    pub fn begin_fetch(&self, conversation_id: &str) -> FetchTicket {
        let mut view = self.view.lock();
        view.selected = Some(conversation_id.to_string());
        view.generation += 1;
        FetchTicket {
            conversation_id: conversation_id.to_string(),
            generation: view.generation,
        }
    }

    fn is_current(&self, ticket: &FetchTicket) -> bool {
        let view = self.view.lock();
        view.generation == ticket.generation
            && view.selected.as_deref() == Some(ticket.conversation_id.as_str())
    }

    /// Fetch and apply history for a ticket. Returns `false` when the
    /// result arrived after another conversation was selected.
    pub async fn load_conversation(&self, ticket: FetchTicket) -> Result<bool> {
        let payload = self.api.fetch_conversation(&ticket.conversation_id).await?;
        if !self.is_current(&ticket) {
            debug!(
                "Discarding stale history for {} (generation {})",
                ticket.conversation_id, ticket.generation
            );
            return Ok(false);
        }

        let applied = apply_history(&mut self.store.lock(), payload);
        debug!(
            "Loaded {} messages for {}",
            applied, ticket.conversation_id
        );
        self.notify(StoreUpdate::Conversation {
            conversation_id: ticket.conversation_id.clone(),
        });
        self.mark_read(&ticket.conversation_id);
        Ok(true)
    }

    /// Open a conversation: mark it read locally, report the receipts and
    /// refresh its history.
    pub async fn select_conversation(&self, conversation_id: &str) -> Result<bool> {
        let ticket = self.begin_fetch(conversation_id);
        self.mark_read(conversation_id);
        self.load_conversation(ticket).await
    }

    /// Mark every unread message in the conversation as read. The local
    /// change is immediate; each id is reported to the server in the
    /// background and failures are only logged.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn mark_read(&self, conversation_id: &str) -> Vec<JoinHandle<()>> {
        let ids = self
            .store
            .lock()
            .mark_conversation_read(conversation_id, Utc::now());
        if ids.is_empty() {
            return Vec::new();
        }

        debug!("Marked {} messages read in {}", ids.len(), conversation_id);
        self.notify(StoreUpdate::Conversation {
            conversation_id: conversation_id.to_string(),
        });
        ids.into_iter()
            .map(|id| {
                let api = self.api.clone();
                tokio::spawn(async move {
                    if let Err(e) = api.mark_read(id).await {
                        warn!("Failed to report message {} as read: {}", id, e);
                    }
                })
            })
            .collect()
    }

    /// Show the message immediately, then post it. On failure the
    /// placeholder stays visible and flagged so it can be retried.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        body: &str,
        attachments: Vec<String>,
    ) -> Result<MessageId> {
        let local_id = Uuid::new_v4().to_string();
        let placeholder = Message::optimistic(
            &local_id,
            conversation_id,
            body,
            attachments,
            &self.config.admin_label,
            Utc::now(),
        );
        self.store.lock().append_message(placeholder);
        self.notify(StoreUpdate::Conversation {
            conversation_id: conversation_id.to_string(),
        });

        self.deliver(conversation_id, &local_id).await
    }

    /// Re-post a failed message under the same local id
    pub async fn retry_send(&self, conversation_id: &str, local_id: &str) -> Result<MessageId> {
        self.store.lock().mark_send_pending(conversation_id, local_id)?;
        self.notify(StoreUpdate::Conversation {
            conversation_id: conversation_id.to_string(),
        });
        self.deliver(conversation_id, local_id).await
    }

    async fn deliver(&self, conversation_id: &str, local_id: &str) -> Result<MessageId> {
        let request = {
            let store = self.store.lock();
            let placeholder = store.optimistic_message(conversation_id, local_id).ok_or_else(|| {
                StoreError::MessageNotFound {
                    conversation_id: conversation_id.to_string(),
                    message_id: MessageId::Local(local_id.to_string()),
                }
            })?;
            SendMessageRequest {
                conversation_id: conversation_id.to_string(),
                sender: self.config.admin_label.clone(),
                body: placeholder.content.clone(),
                attachment_keys: placeholder.attachments.clone(),
                client_message_id: local_id.to_string(),
            }
        };

        match self.api.send_message(&request).await {
            Ok(payload) => {
                let mut message = payload.into_message();
                if message.conversation_id.is_empty() {
                    message.conversation_id = conversation_id.to_string();
                }
                if message.client_token.is_none() {
                    message.client_token = Some(local_id.to_string());
                }
                let id = message.id.clone();
                let outcome = self.store.lock().append_message(message);
                debug!("Send {} confirmed as {} ({:?})", local_id, id, outcome);
                self.notify(StoreUpdate::Conversation {
                    conversation_id: conversation_id.to_string(),
                });
                Ok(id)
            }
            Err(e) => {
                let mut store = self.store.lock();
                // The push channel may have confirmed it while the request failed
                if let Some(id) = confirmed_id(&store, conversation_id, local_id) {
                    debug!("Send {} already confirmed as {}", local_id, id);
                    return Ok(id);
                }
                // The placeholder is gone after a reset; the request error still wins
                if let Err(store_err) = store.mark_send_failed(conversation_id, local_id) {
                    debug!("Could not flag send {} as failed: {}", local_id, store_err);
                }
                drop(store);
                warn!("Send {} to {} failed: {}", local_id, conversation_id, e);
                self.notify(StoreUpdate::Conversation {
                    conversation_id: conversation_id.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Apply one decoded push event
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => {
                let conversation_id = message.conversation_id.clone();
                let id = message.id.clone();
                let outcome = self.store.lock().append_message(message);
                if outcome == AppendOutcome::Duplicate {
                    debug!("Ignoring duplicate message {} in {}", id, conversation_id);
                } else {
                    self.notify(StoreUpdate::Conversation { conversation_id });
                }
            }
            TransportEvent::ReadReceipt(receipt) => {
                let scope = match &receipt {
                    ReadReceipt::Batch {
                        conversation_id, ..
                    } => Some(conversation_id.clone()),
                    ReadReceipt::Single { .. } => None,
                };
                let outcome = self.store.lock().apply_receipt(receipt);
                if outcome.deferred > 0 {
                    debug!("Deferred {} read receipts", outcome.deferred);
                }
                if outcome.applied > 0 {
                    self.notify(match scope {
                        Some(conversation_id) => StoreUpdate::Conversation { conversation_id },
                        None => StoreUpdate::Conversations,
                    });
                }
            }
            TransportEvent::Status(status) => {
                if *self.status.borrow() != status {
                    info!("Connectivity: {:?}", status);
                }
                self.status.send_replace(status);
                self.notify(StoreUpdate::Connectivity { status });
            }
        }
    }

    /// Apply transport events until the sender side closes
    pub async fn run(&self, mut events: UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        info!("Transport event stream ended");
        self.handle_event(TransportEvent::Status(ConnectionStatus::Stopped));
    }

    fn notify(&self, update: StoreUpdate) {
        // No subscribers is fine
        let _ = self.updates.send(update);
    }
}

fn apply_history(store: &mut ConversationStore, payload: ConversationPayload) -> usize {
    let (summary, messages) = payload.into_parts();
    store.upsert_conversation(summary);
    messages
        .into_iter()
        .map(|message| store.append_message(message))
        .filter(|outcome| *outcome != AppendOutcome::Duplicate)
        .count()
}

fn confirmed_id(store: &ConversationStore, conversation_id: &str, local_id: &str) -> Option<MessageId> {
    store
        .messages(conversation_id)?
        .iter()
        .find(|m| !m.is_optimistic() && m.client_token.as_deref() == Some(local_id))
        .map(|m| m.id.clone())
}
