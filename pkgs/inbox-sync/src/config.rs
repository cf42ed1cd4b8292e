//! Sync configuration loaded from TOML
//!
//! Every field has a default, so a config file only needs the values it
//! overrides. [`SyncConfig::validate`] runs after loading.

use std::path::Path;
use std::time::Duration;

use inbox_store::{StoreConfig, ThreadConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SyncError};
use crate::transport::Backoff;

/// Connection and reconciliation settings.
///
/// Every field has a default, so a TOML file only needs the keys it
/// overrides:
///
/// ```toml
/// api_base_url = "https://inbox.example.com/api/"
/// events_url = "wss://inbox.example.com/events"
///
/// [threads]
/// gap_minutes = 90
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub events_url: String,
    /// Channel joined on the push connection
    pub channel: String,
    /// Sender name attached to outgoing messages
    pub admin_label: String,
    pub request_timeout_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_pending_receipts: usize,
    pub threads: ThreadConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000/api/".to_string(),
            events_url: "ws://localhost:3000/events".to_string(),
            channel: "admin-inbox".to_string(),
            admin_label: "Admin".to_string(),
            request_timeout_secs: 10,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            max_pending_receipts: StoreConfig::default().max_pending_receipts,
            threads: ThreadConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: SyncConfig = toml::from_str(&raw)?;
        config.validate()?;
        info!("Loaded sync config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.api_base_url)?;
        let events = url::Url::parse(&self.events_url)?;
        if !matches!(events.scheme(), "ws" | "wss") {
            return Err(SyncError::InvalidConfig(format!(
                "events_url must use ws or wss, got {}",
                events.scheme()
            )));
        }
        if self.channel.trim().is_empty() {
            return Err(SyncError::InvalidConfig("channel is empty".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.reconnect_initial_ms == 0 || self.reconnect_initial_ms > self.reconnect_max_ms {
            return Err(SyncError::InvalidConfig(format!(
                "reconnect delays out of range: initial {}ms, max {}ms",
                self.reconnect_initial_ms, self.reconnect_max_ms
            )));
        }
        if self.threads.gap_minutes <= 0 || self.threads.title_max_chars == 0 {
            return Err(SyncError::InvalidConfig(
                "thread gap and title length must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_initial_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_pending_receipts: self.max_pending_receipts,
            threads: self.threads.clone(),
        }
    }
}
