//! Expiry reaper
//!
//! Sweeps the registry and removes uploads whose `expires_at` has passed.
//! Uploads held by an in-flight request are skipped and picked up by a
//! later sweep.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tus_uploadr::reaper::ExpiryReaper;
//! use tus_uploadr::upload::UploadService;
//!
//! # async fn example(service: Arc<UploadService>) {
//! let mut reaper = ExpiryReaper::new(service);
//! reaper.start(Duration::from_secs(3600));
//! // ...
//! reaper.shutdown().await;
//! # }
//! ```

use crate::metrics;
use crate::upload::service::ExpiryOutcome;
use crate::upload::UploadService;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Counts from one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub busy: usize,
    pub failed: usize,
}

/// Periodic expiry sweeper
pub struct ExpiryReaper {
    service: Arc<UploadService>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl ExpiryReaper {
    pub fn new(service: Arc<UploadService>) -> Self {
        Self {
            service,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Run a single sweep against `now`
    #[tracing::instrument(name = "reaper.sweep", skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        sweep_once(&self.service, now).await
    }

    /// Spawn the background loop, one sweep per `interval`
    pub fn start(&mut self, interval: Duration) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        let service = Arc::clone(&self.service);
        self.handle = Some(tokio::spawn(async move {
            run_loop(service, interval, shutdown_rx).await;
        }));
    }

    /// Stop the background loop and wait for it
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn run_loop(
    service: Arc<UploadService>,
    interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup isn't a sweep.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {
                sweep_once(&service, Utc::now()).await;
            }
        }
    }
}

async fn sweep_once(service: &UploadService, now: DateTime<Utc>) -> SweepReport {
    let mut report = SweepReport::default();

    let ids = match service.list_ids().await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "Expiry sweep could not list uploads");
            metrics::record_error(e.kind());
            return report;
        }
    };

    for id in ids {
        report.scanned += 1;
        match service.expire_if_due(&id, now).await {
            Ok(ExpiryOutcome::Expired) => report.expired += 1,
            Ok(ExpiryOutcome::Busy) => report.busy += 1,
            Ok(ExpiryOutcome::Kept) | Ok(ExpiryOutcome::Missing) => {}
            Err(e) => {
                report.failed += 1;
                warn!(upload_id = %id, error = %e, "Failed to expire upload");
            }
        }
    }

    metrics::record_sweep();
    info!(
        scanned = report.scanned,
        expired = report.expired,
        busy = report.busy,
        failed = report.failed,
        "Expiry sweep finished"
    );
    report
}
