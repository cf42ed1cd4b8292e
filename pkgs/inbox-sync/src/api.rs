//! REST collaborator used for history, sends and read reports

use std::future::Future;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::wire::{ConversationPayload, MessagePayload, SendMessageRequest};

/// Server operations the engine depends on
#[async_trait]
pub trait InboxApi: Send + Sync + 'static {
    /// All conversations with their message history
    async fn fetch_conversations(&self) -> Result<Vec<ConversationPayload>>;

    async fn fetch_conversation(&self, conversation_id: &str) -> Result<ConversationPayload>;

    /// Returns the server copy of the stored message
    async fn send_message(&self, request: &SendMessageRequest) -> Result<MessagePayload>;

    async fn mark_read(&self, message_id: i64) -> Result<()>;
}

/// [`InboxApi`] over HTTP with a fixed request timeout.
///
/// Reads and read reports are repeated once on a transient failure.
/// Sends are not; the caller decides whether to retry.
pub struct HttpInboxApi {
    client: Client,
    base: Url,
}

impl HttpInboxApi {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        let mut base = Url::parse(&config.api_base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { client, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = &self.endpoint(path)?;
        let client = &self.client;
        with_one_retry(path, || async move {
            let response = client.get(url.clone()).send().await?;
            let response = check_status(response, path)?;
            Ok(response.json::<T>().await?)
        })
        .await
    }
}

#[async_trait]
impl InboxApi for HttpInboxApi {
    async fn fetch_conversations(&self) -> Result<Vec<ConversationPayload>> {
        self.get_json("conversations").await
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> Result<ConversationPayload> {
        self.get_json(&format!("conversations/{}", conversation_id))
            .await
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<MessagePayload> {
        let url = self.endpoint("messages")?;
        debug!(
            "Sending message {} to {}",
            request.client_message_id, request.conversation_id
        );
        let response = self.client.post(url).json(request).send().await?;
        let response = check_status(response, "messages")?;
        Ok(response.json::<MessagePayload>().await?)
    }

    async fn mark_read(&self, message_id: i64) -> Result<()> {
        let path = format!("messages/{}/read", message_id);
        let url = &self.endpoint(&path)?;
        let client = &self.client;
        let label = path.as_str();
        with_one_retry(label, || async move {
            let response = client.post(url.clone()).send().await?;
            check_status(response, label)?;
            Ok(())
        })
        .await
    }
}

fn check_status(response: Response, endpoint: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(SyncError::Rejected {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        })
    }
}

async fn with_one_retry<T, F, Fut>(label: &str, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(e) if e.is_retryable() => {
            warn!("{} failed ({}), retrying once", label, e);
            op().await
        }
        other => other,
    }
}
