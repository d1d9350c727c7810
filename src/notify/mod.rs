//! Completion notification
//!
//! A [`CompletionNotifier`] is told exactly once when an upload reaches its
//! final size. The triggering request waits for the notifier to return, and a
//! notifier error fails that request.

use crate::config::HooksConfig;
use crate::upload::record::ClientMetadata;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod webhook;

pub use webhook::{WebhookConfig, WebhookNotifier};

/// Notification errors
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Webhook request failed: {0}")]
    RequestFailed(String),

    #[error("Webhook returned status {0}")]
    BadStatus(u16),

    #[error("Notifier error: {0}")]
    Other(String),
}

/// A finished upload, as handed to the notifier
#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub id: String,
    /// Where the payload is stored
    pub storage_path: PathBuf,
    pub size: u64,
    pub metadata: ClientMetadata,
}

/// Completion hook
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    /// Called once per upload after its last byte is committed
    async fn notify(&self, upload: &CompletedUpload) -> Result<(), NotifyError>;
}

/// Notifier that does nothing
pub struct NoopNotifier;

#[async_trait]
impl CompletionNotifier for NoopNotifier {
    async fn notify(&self, _upload: &CompletedUpload) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Notifier that writes one log line per completed upload
pub struct LogNotifier;

#[async_trait]
impl CompletionNotifier for LogNotifier {
    async fn notify(&self, upload: &CompletedUpload) -> Result<(), NotifyError> {
        tracing::info!(
            upload_id = %upload.id,
            path = %upload.storage_path.display(),
            size = upload.size,
            filename = upload.metadata.filename().unwrap_or(""),
            "Upload complete"
        );
        Ok(())
    }
}

/// Pick the notifier named by the `hooks` configuration section.
///
/// A webhook wins over `log_completions`; with neither, completions are
/// not reported anywhere.
pub fn from_config(config: &HooksConfig) -> Result<Arc<dyn CompletionNotifier>, NotifyError> {
    if let Some(webhook) = &config.completion_webhook {
        let notifier = WebhookNotifier::new(WebhookConfig {
            url: webhook.url.clone(),
            timeout: Some(Duration::from_secs(webhook.timeout_secs)),
        })?;
        return Ok(Arc::new(notifier));
    }
    if config.log_completions {
        return Ok(Arc::new(LogNotifier));
    }
    Ok(Arc::new(NoopNotifier))
}
