//! Webhook completion notifier
//!
//! POSTs a JSON document describing the finished upload:
//!
//! ```json
//! {
//!   "id": "9f1c...",
//!   "path": "/tmp/files/9f1c...",
//!   "size": 1048576,
//!   "metadata": { "filename": "report.pdf" }
//! }
//! ```
//!
//! Any non-2xx response counts as a failure of the hook.

use super::{CompletedUpload, CompletionNotifier, NotifyError};
use crate::upload::record::ClientMetadata;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Default timeout for webhook requests (10 seconds)
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Webhook configuration
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    id: &'a str,
    path: String,
    size: u64,
    metadata: &'a ClientMetadata,
}

/// Webhook notifier
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(|e| NotifyError::Other(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: config.url,
            client,
        })
    }
}

#[async_trait]
impl CompletionNotifier for WebhookNotifier {
    #[tracing::instrument(
        name = "notify.webhook",
        skip(self, upload),
        fields(upload_id = %upload.id, webhook.url = %self.url),
        err
    )]
    async fn notify(&self, upload: &CompletedUpload) -> Result<(), NotifyError> {
        let payload = WebhookPayload {
            id: &upload.id,
            path: upload.storage_path.display().to_string(),
            size: upload.size,
            metadata: &upload.metadata,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::BadStatus(status.as_u16()));
        }

        tracing::debug!(status = status.as_u16(), "Webhook delivered");
        Ok(())
    }
}
