//! Push connection to the inbox server
//!
//! A background task keeps one WebSocket open, joins the admin channel,
//! decodes frames and forwards them as [`TransportEvent`]s. Dropped
//! connections are retried with exponential backoff. Malformed frames are
//! logged and skipped; they never end the stream.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use inbox_store::{Message, ReadReceipt};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::wire::{decode_frame, encode_frame, ClientFrame};

/// State of the push connection as seen by the render layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    /// Waiting before the next connection attempt
    Reconnecting { attempt: u32, retry_in_ms: u64 },
    Stopped,
}

/// Decoded input for the reconciliation engine
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(Message),
    ReadReceipt(ReadReceipt),
    Status(ConnectionStatus),
}

/// Exponential reconnect delay, doubled per failure and capped
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);
        self.attempt += 1;
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Handle to the background connection task
pub struct TransportHandle {
    task: JoinHandle<()>,
}

impl TransportHandle {
    pub fn shutdown(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub struct WsTransport;

impl WsTransport {
    /// Start the connection loop. The loop ends once the receiver is dropped.
    pub fn spawn(config: &SyncConfig) -> Result<(TransportHandle, UnboundedReceiver<TransportEvent>)> {
        config.validate()?;
        let join = encode_frame(&ClientFrame::Join {
            channel: config.channel.clone(),
        })?;
        let url = config.events_url.clone();
        let backoff = config.backoff();
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(connection_loop(url, join, backoff, tx));
        Ok((TransportHandle { task }, rx))
    }
}

async fn connection_loop(
    url: String,
    join: String,
    mut backoff: Backoff,
    tx: UnboundedSender<TransportEvent>,
) {
    loop {
        if tx.send(TransportEvent::Status(ConnectionStatus::Connecting)).is_err() {
            return;
        }

        match connect_async(url.as_str()).await {
            Ok((ws_stream, _response)) => {
                backoff.reset();
                info!("Push channel connected: {}", url);
                if tx.send(TransportEvent::Status(ConnectionStatus::Connected)).is_err() {
                    return;
                }

                let (mut write, mut read) = ws_stream.split();
                if let Err(e) = write.send(WsMessage::Text(join.clone())).await {
                    warn!("Failed to join channel: {}", e);
                } else {
                    while let Some(frame) = read.next().await {
                        match frame {
                            Ok(WsMessage::Text(text)) => {
                                if !dispatch_frame(&text, &tx) {
                                    return;
                                }
                            }
                            Ok(WsMessage::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                                Ok(text) => {
                                    if !dispatch_frame(text, &tx) {
                                        return;
                                    }
                                }
                                Err(_) => warn!("Dropping non-UTF-8 binary frame"),
                            },
                            Ok(WsMessage::Close(_)) => {
                                info!("Push channel closed by server");
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!("Push channel read error: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => warn!("Push channel connect to {} failed: {}", url, e),
        }

        let delay = backoff.next_delay();
        let status = ConnectionStatus::Reconnecting {
            attempt: backoff.attempt(),
            retry_in_ms: delay.as_millis() as u64,
        };
        if tx.send(TransportEvent::Status(status)).is_err() {
            return;
        }
        debug!("Reconnecting in {:?} (attempt {})", delay, backoff.attempt());
        tokio::time::sleep(delay).await;
    }
}

/// Decode and forward one frame. Returns false once the receiver is gone.
fn dispatch_frame(text: &str, tx: &UnboundedSender<TransportEvent>) -> bool {
    match decode_frame(text) {
        Ok(Some(event)) => tx.send(event).is_ok(),
        Ok(None) => true,
        Err(e) => {
            warn!("Dropping push frame: {}", e);
            true
        }
    }
}
