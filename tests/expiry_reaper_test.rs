//! Expiry Reaper Integration Tests
//!
//! Sweeps run against an explicit `now`, so nothing here sleeps for a TTL.

use bytes::Bytes;
use chrono::{Duration, Utc};
use futures::channel::mpsc;
use std::sync::Arc;
use tempfile::TempDir;
use tus_uploadr::config::{ExpirationConfig, ExpiryPolicy};
use tus_uploadr::reaper::{ExpiryReaper, SweepReport};
use tus_uploadr::storage::{FilePayloadStore, FileRegistry};
use tus_uploadr::upload::{ChunkRequest, CreateRequest, UploadError, UploadService, OFFSET_CONTENT_TYPE};

fn service(dir: &TempDir, policy: ExpiryPolicy) -> Arc<UploadService> {
    Arc::new(
        UploadService::builder()
            .expiration(ExpirationConfig {
                ttl_secs: 60,
                policy,
                sweep_interval_secs: 0,
            })
            .registry(Arc::new(FileRegistry::new(dir.path())))
            .payloads(Arc::new(FilePayloadStore::new(dir.path())))
            .build()
            .unwrap(),
    )
}

fn sized(len: u64) -> CreateRequest {
    CreateRequest {
        upload_length: Some(len),
        ..Default::default()
    }
}

fn chunk(offset: u64) -> ChunkRequest {
    ChunkRequest {
        offset,
        upload_length: None,
        content_type: Some(OFFSET_CONTENT_TYPE.to_string()),
    }
}

mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sweep_keeps_uploads_within_ttl() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, ExpiryPolicy::OnCreate);
        let record = svc.initiate(sized(10)).await.unwrap();

        let reaper = ExpiryReaper::new(Arc::clone(&svc));
        let report = reaper.sweep(Utc::now()).await;

        assert_eq!(report.scanned, 1);
        assert_eq!(report.expired, 0);
        assert!(svc.query_head(&record.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_sweep_deletes_expired_uploads() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, ExpiryPolicy::OnCreate);
        let old = svc.initiate(sized(10)).await.unwrap();

        let reaper = ExpiryReaper::new(Arc::clone(&svc));
        let report = reaper.sweep(Utc::now() + Duration::minutes(5)).await;

        assert_eq!(
            report,
            SweepReport {
                scanned: 1,
                expired: 1,
                busy: 0,
                failed: 0
            }
        );
        assert!(matches!(
            svc.query_head(&old.id).await,
            Err(UploadError::NotFound(_))
        ));
        assert!(!dir.path().join(&old.id).exists());
        assert!(!dir.path().join(format!("{}.info", old.id)).exists());
    }

    #[tokio::test]
    async fn test_uploads_without_expiry_are_never_swept() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, ExpiryPolicy::OnFirstChunk);
        let idle = svc.initiate(sized(10)).await.unwrap();
        let active = svc.initiate(sized(10)).await.unwrap();
        svc.append_bytes(&active.id, chunk(0), Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let reaper = ExpiryReaper::new(Arc::clone(&svc));
        let report = reaper.sweep(Utc::now() + Duration::days(365)).await;

        assert_eq!(report.scanned, 2);
        assert_eq!(report.expired, 1);
        assert!(svc.query_head(&idle.id).await.is_ok());
        assert!(svc.query_head(&active.id).await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_skips_upload_mid_chunk() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, ExpiryPolicy::OnCreate);
        let record = svc.initiate(sized(8)).await.unwrap();

        let (tx, rx) = mpsc::unbounded::<Result<Bytes, std::io::Error>>();
        let upload = {
            let svc = Arc::clone(&svc);
            let id = record.id.clone();
            tokio::spawn(async move { svc.append_chunk(&id, chunk(0), rx).await })
        };

        tx.unbounded_send(Ok(Bytes::from_static(b"abcd"))).unwrap();
        for _ in 0..100 {
            if svc.query_head(&record.id).await.unwrap().offset == 4 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let reaper = ExpiryReaper::new(Arc::clone(&svc));
        let far_future = Utc::now() + Duration::days(1);
        let report = reaper.sweep(far_future).await;
        assert_eq!(report.busy, 1);
        assert_eq!(report.expired, 0);

        drop(tx);
        let outcome = upload.await.unwrap().unwrap();
        assert_eq!(outcome.offset, 4);

        let report = reaper.sweep(far_future).await;
        assert_eq!(report.expired, 1);
    }
}
