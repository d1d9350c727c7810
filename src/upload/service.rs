//! Upload session state machine
//!
//! Owns the protocol logic on top of an [`UploadRegistry`] and a
//! [`PayloadStore`]:
//!
//! ```text
//! Created ──chunk──▶ Uploading ──last chunk──▶ Completed
//!    │                   │                        │
//!    └───────────────────┴──── delete / expire ───┴──▶ (gone)
//! ```
//!
//! Every mutating operation on an upload holds that upload's lock, so chunk
//! appends are serialized per id. Each write-unit of a chunk is appended and
//! flushed before the offset is committed with a compare-and-swap, so a
//! dropped connection keeps every byte committed before it.

use super::locks::UploadLocks;
use super::record::UploadRecord;
use super::{
    Capabilities, ChunkOutcome, ChunkRequest, CreateRequest, Download, UploadError,
    OFFSET_CONTENT_TYPE, TUS_EXTENSIONS, TUS_VERSION,
};
use crate::config::{
    Config, ConfigError, ExpirationConfig, ExpiryPolicy, StorageBackend, TusConfig,
};
use crate::metrics;
use crate::notify::{CompletedUpload, CompletionNotifier, NoopNotifier};
use crate::storage::{
    FilePayloadStore, FileRegistry, MemoryPayloadStore, MemoryRegistry, PayloadStore, StoreError,
    UploadRegistry,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What the reaper did with one upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// Past its expiry, removed
    Expired,
    /// Not expired (or no expiry set)
    Kept,
    /// A request currently holds the upload
    Busy,
    /// Already gone
    Missing,
}

/// Upload session state machine
pub struct UploadService {
    tus: TusConfig,
    expiration: ExpirationConfig,
    registry: Arc<dyn UploadRegistry>,
    payloads: Arc<dyn PayloadStore>,
    notifier: Arc<dyn CompletionNotifier>,
    locks: UploadLocks,
}

/// Builder for UploadService
#[derive(Default)]
pub struct UploadServiceBuilder {
    tus: Option<TusConfig>,
    expiration: Option<ExpirationConfig>,
    registry: Option<Arc<dyn UploadRegistry>>,
    payloads: Option<Arc<dyn PayloadStore>>,
    notifier: Option<Arc<dyn CompletionNotifier>>,
}

impl UploadServiceBuilder {
    pub fn tus(mut self, tus: TusConfig) -> Self {
        self.tus = Some(tus);
        self
    }

    pub fn expiration(mut self, expiration: ExpirationConfig) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn UploadRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn payloads(mut self, payloads: Arc<dyn PayloadStore>) -> Self {
        self.payloads = Some(payloads);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn CompletionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Build the service. Registry and payload store are required.
    pub fn build(self) -> Result<UploadService, ConfigError> {
        let registry = self
            .registry
            .ok_or_else(|| ConfigError::ValidationError("Upload registry is required".into()))?;
        let payloads = self
            .payloads
            .ok_or_else(|| ConfigError::ValidationError("Payload store is required".into()))?;

        Ok(UploadService {
            tus: self.tus.unwrap_or_default(),
            expiration: self.expiration.unwrap_or_default(),
            registry,
            payloads,
            notifier: self.notifier.unwrap_or_else(|| Arc::new(NoopNotifier)),
            locks: UploadLocks::new(),
        })
    }
}

impl UploadService {
    pub fn builder() -> UploadServiceBuilder {
        UploadServiceBuilder::default()
    }

    /// Build the service with the storage backend named in the configuration
    pub fn from_config(
        config: &Config,
        notifier: Arc<dyn CompletionNotifier>,
    ) -> Result<Self, ConfigError> {
        let (registry, payloads): (Arc<dyn UploadRegistry>, Arc<dyn PayloadStore>) =
            match config.storage.backend {
                StorageBackend::Filesystem => (
                    Arc::new(FileRegistry::new(&config.storage.files_dir)),
                    Arc::new(FilePayloadStore::new(&config.storage.files_dir)),
                ),
                StorageBackend::Memory => (
                    Arc::new(MemoryRegistry::new()),
                    Arc::new(MemoryPayloadStore::new()),
                ),
            };

        Self::builder()
            .tus(config.tus.clone())
            .expiration(config.expiration.clone())
            .registry(registry)
            .payloads(payloads)
            .notifier(notifier)
            .build()
    }

    pub fn tus_config(&self) -> &TusConfig {
        &self.tus
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Create a new upload.
    ///
    /// Exactly one of `upload_length` and `defer_length` must be given. A
    /// zero-length upload is complete on creation and is notified at once.
    #[tracing::instrument(
        name = "upload.initiate",
        skip(self, request),
        fields(
            upload.length = ?request.upload_length,
            upload.defer_length = request.defer_length,
            upload_id = tracing::field::Empty
        ),
        err
    )]
    pub async fn initiate(&self, request: CreateRequest) -> Result<UploadRecord, UploadError> {
        let size = match (request.upload_length, request.defer_length) {
            (Some(_), true) => {
                return Err(UploadError::BadRequest(
                    "Upload-Length and Upload-Defer-Length are mutually exclusive".into(),
                ))
            }
            (None, false) => {
                return Err(UploadError::BadRequest(
                    "Upload-Length or Upload-Defer-Length: 1 is required".into(),
                ))
            }
            (Some(len), false) => {
                self.check_max_size(len)?;
                Some(len)
            }
            (None, true) => None,
        };

        let now = Utc::now();
        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut record = UploadRecord::new(id.clone(), request.metadata, size, now);
        if self.expiration.policy == ExpiryPolicy::OnCreate {
            record.expires_at = Some(now + self.expiration.ttl());
        }

        let _guard = self.locks.acquire(&id).await;

        self.payloads.initialize(&id).await?;
        if let Err(e) = self.registry.create(&record).await {
            if let Err(cleanup) = self.payloads.delete(&id).await {
                warn!(
                    upload_id = %id,
                    error = %cleanup,
                    "Failed to remove payload after registry create failed"
                );
            }
            return Err(e.into());
        }

        tracing::Span::current().record("upload_id", id.as_str());
        metrics::record_upload_created(record.defer_length);
        info!(
            upload_id = %id,
            size = ?record.size,
            metadata_keys = record.metadata.len(),
            "Created upload"
        );

        self.notify_if_complete(record).await
    }

    /// Append one chunk read from `body`.
    ///
    /// Every item of the stream is one write-unit: it is appended, flushed
    /// and committed before the next one is read. If the stream fails, the
    /// units committed so far stay and `Interrupted` is returned.
    #[tracing::instrument(
        name = "upload.append_chunk",
        skip(self, request, body),
        fields(
            upload_id = %id,
            upload.offset = request.offset,
            upload.length = ?request.upload_length,
            upload.bytes_received = tracing::field::Empty
        ),
        err
    )]
    pub async fn append_chunk<S, E>(
        &self,
        id: &str,
        request: ChunkRequest,
        mut body: S,
    ) -> Result<ChunkOutcome, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
        E: std::fmt::Display,
    {
        let started = Instant::now();
        let result = self.append_chunk_locked(id, &request, &mut body).await;

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(outcome) => {
                tracing::Span::current().record("upload.bytes_received", outcome.bytes_received);
                metrics::record_chunk(true, elapsed);
            }
            Err(_) => metrics::record_chunk(false, elapsed),
        }
        result
    }

    /// Append a chunk that is already in memory as a single write-unit
    pub async fn append_bytes(
        &self,
        id: &str,
        request: ChunkRequest,
        data: Bytes,
    ) -> Result<ChunkOutcome, UploadError> {
        let body = futures::stream::iter(std::iter::once(Ok::<_, std::convert::Infallible>(data)));
        self.append_chunk(id, request, body).await
    }

    async fn append_chunk_locked<S, E>(
        &self,
        id: &str,
        request: &ChunkRequest,
        body: &mut S,
    ) -> Result<ChunkOutcome, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
        E: std::fmt::Display,
    {
        let _guard = self.locks.acquire(id).await;
        let mut record = self.load(id, true).await?;
        self.check_content_type(request.content_type.as_deref())?;

        // A deferred length is resolved by the first chunk that names it;
        // after that the length is fixed.
        let mut resolved = false;
        match (record.size, request.upload_length) {
            (None, Some(len)) => {
                if len < record.offset {
                    return Err(UploadError::BadRequest(format!(
                        "Upload-Length {} is below the current offset {}",
                        len, record.offset
                    )));
                }
                self.check_max_size(len)?;
                resolved = true;
            }
            (Some(size), Some(len)) if size != len => {
                return Err(UploadError::BadRequest(format!(
                    "Upload-Length cannot change from {} to {}",
                    size, len
                )));
            }
            _ => {}
        }

        if request.offset != record.offset {
            return Err(UploadError::Conflict {
                declared: request.offset,
                current: record.offset,
            });
        }

        if resolved {
            let committed = record.offset;
            record.size = request.upload_length;
            self.start_expiry_clock(&mut record);
            self.commit(committed, &record).await?;
            info!(upload_id = %id, size = ?record.size, "Resolved deferred length");
        }

        let ceiling = record
            .size
            .map_or(self.tus.max_size, |size| size.min(self.tus.max_size));
        let mut received = 0u64;

        while let Some(frame) = body.next().await {
            let data = match frame {
                Ok(data) => data,
                Err(e) => {
                    warn!(
                        upload_id = %id,
                        offset = record.offset,
                        error = %e,
                        "Chunk body interrupted"
                    );
                    return Err(UploadError::Interrupted {
                        offset: record.offset,
                        reason: e.to_string(),
                    });
                }
            };
            if data.is_empty() {
                continue;
            }

            let unit = data.len() as u64;
            let next_offset = record.offset + unit;
            if next_offset > ceiling {
                return Err(UploadError::PayloadTooLarge {
                    size: next_offset,
                    max: ceiling,
                });
            }

            let committed = record.offset;
            let length = self.payloads.append(id, &data).await?;
            if length != next_offset {
                return Err(UploadError::Corrupted(format!(
                    "payload of {} is {} bytes after append, expected {}",
                    id, length, next_offset
                )));
            }

            record.record_write(unit);
            self.start_expiry_clock(&mut record);
            self.commit(committed, &record).await?;

            received += unit;
            metrics::record_bytes_received(unit);
        }

        if received == 0 && record.is_length_deferred() {
            return Err(UploadError::BadRequest(
                "Chunk for a deferred-length upload carries neither data nor Upload-Length"
                    .into(),
            ));
        }

        debug!(upload_id = %id, received, offset = record.offset, "Chunk appended");

        let record = self.notify_if_complete(record).await?;
        Ok(ChunkOutcome {
            offset: record.offset,
            size: record.size,
            expires_at: record.expires_at,
            bytes_received: received,
            completed: record.is_complete(),
        })
    }

    /// Current state of an upload (for HEAD)
    pub async fn query_head(&self, id: &str) -> Result<UploadRecord, UploadError> {
        self.load(id, false).await
    }

    /// Static capabilities. With an id, the upload must exist.
    pub async fn query_options(&self, id: Option<&str>) -> Result<Capabilities, UploadError> {
        if let Some(id) = id {
            self.load(id, false).await?;
        }
        Ok(Capabilities {
            version: TUS_VERSION,
            extensions: TUS_EXTENSIONS,
            max_size: self.tus.max_size,
        })
    }

    /// Remove an upload and its payload
    #[tracing::instrument(name = "upload.delete", skip(self), err)]
    pub async fn delete(&self, id: &str) -> Result<(), UploadError> {
        let guard = self.locks.acquire(id).await;
        self.load(id, false).await?;
        self.remove(id).await?;
        drop(guard);
        self.locks.release(id);

        metrics::record_upload_deleted("terminated");
        info!(upload_id = %id, "Deleted upload");
        Ok(())
    }

    /// Committed payload bytes and the client's file name
    pub async fn download(&self, id: &str) -> Result<Download, UploadError> {
        let record = self.load(id, false).await?;
        let mut data = self.payloads.read(id).await?;
        // An append may be in flight; only committed bytes are served.
        if (data.len() as u64) > record.offset {
            data = data.slice(..record.offset as usize);
        }

        Ok(Download {
            data,
            filename: record
                .metadata
                .filename()
                .map(str::to_string)
                .unwrap_or_else(|| record.id.clone()),
            content_type: record
                .metadata
                .get("filetype")
                .or_else(|| record.metadata.get("type"))
                .map(str::to_string),
        })
    }

    /// Ids of every stored upload
    pub async fn list_ids(&self) -> Result<Vec<String>, UploadError> {
        Ok(self.registry.list().await?)
    }

    /// Remove the upload if it expired before `now`.
    ///
    /// Never waits: an upload whose lock is held by a live request is left
    /// alone until the next sweep.
    pub async fn expire_if_due(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<ExpiryOutcome, UploadError> {
        let Some(guard) = self.locks.try_acquire(id) else {
            return Ok(ExpiryOutcome::Busy);
        };

        let outcome = match self.registry.read(id).await? {
            None => ExpiryOutcome::Missing,
            Some(record) if record.is_expired(now) => {
                self.remove(id).await?;
                metrics::record_upload_deleted("expired");
                info!(upload_id = %id, expires_at = ?record.expires_at, "Expired upload");
                ExpiryOutcome::Expired
            }
            Some(_) => ExpiryOutcome::Kept,
        };

        drop(guard);
        if outcome != ExpiryOutcome::Kept {
            self.locks.release(id);
        }
        Ok(outcome)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn check_max_size(&self, len: u64) -> Result<(), UploadError> {
        if len > self.tus.max_size {
            return Err(UploadError::PayloadTooLarge {
                size: len,
                max: self.tus.max_size,
            });
        }
        Ok(())
    }

    fn check_content_type(&self, content_type: Option<&str>) -> Result<(), UploadError> {
        if !self.tus.strict_content_type {
            return Ok(());
        }
        let media_type = content_type
            .and_then(|ct| ct.split(';').next())
            .map(str::trim);
        match media_type {
            Some(ct) if ct.eq_ignore_ascii_case(OFFSET_CONTENT_TYPE) => Ok(()),
            other => Err(UploadError::UnsupportedMediaType(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }

    fn start_expiry_clock(&self, record: &mut UploadRecord) {
        if record.expires_at.is_none() {
            record.expires_at = Some(Utc::now() + self.expiration.ttl());
        }
    }

    /// Read a record and reconcile it with its payload.
    ///
    /// A payload longer than the committed offset is an uncommitted tail; it
    /// is cut back only when `repair` is set, which callers may do only while
    /// holding the upload's lock.
    async fn load(&self, id: &str, repair: bool) -> Result<UploadRecord, UploadError> {
        let record = self
            .registry
            .read(id)
            .await?
            .ok_or_else(|| UploadError::NotFound(id.to_string()))?;
        let length = self
            .payloads
            .length(id)
            .await?
            .ok_or_else(|| UploadError::NotFound(id.to_string()))?;

        match length.cmp(&record.offset) {
            Ordering::Equal => {}
            Ordering::Greater if repair => {
                warn!(
                    upload_id = %id,
                    payload_length = length,
                    offset = record.offset,
                    "Truncating uncommitted payload tail"
                );
                self.payloads.truncate(id, record.offset).await?;
            }
            Ordering::Greater => {}
            Ordering::Less => {
                return Err(UploadError::Corrupted(format!(
                    "payload of {} has {} bytes but {} are committed",
                    id, length, record.offset
                )));
            }
        }
        Ok(record)
    }

    async fn commit(&self, committed_offset: u64, record: &UploadRecord) -> Result<(), UploadError> {
        self.registry
            .compare_and_swap(committed_offset, record)
            .await
            .map_err(|e| match e {
                StoreError::OffsetMismatch { expected, actual } => UploadError::Conflict {
                    declared: expected,
                    current: actual,
                },
                StoreError::NotFound(id) => UploadError::NotFound(id),
                other => UploadError::Storage(other),
            })
    }

    /// Run the completion hook once, then persist that it ran.
    ///
    /// If the hook fails the flag stays unset, so a later zero-length chunk
    /// at the final offset retries it.
    async fn notify_if_complete(&self, mut record: UploadRecord) -> Result<UploadRecord, UploadError> {
        if !record.is_complete() || record.completion_notified {
            return Ok(record);
        }

        let completed = CompletedUpload {
            id: record.id.clone(),
            storage_path: self.payloads.storage_path(&record.id),
            size: record.offset,
            metadata: record.metadata.clone(),
        };
        self.notifier
            .notify(&completed)
            .await
            .map_err(|e| UploadError::Notification(e.to_string()))?;

        record.completion_notified = true;
        self.commit(record.offset, &record).await?;

        metrics::record_upload_completed();
        info!(upload_id = %record.id, size = record.offset, "Upload completed");
        Ok(record)
    }

    /// Delete record then payload; a payload without a record is invisible
    async fn remove(&self, id: &str) -> Result<(), UploadError> {
        self.registry.delete(id).await?;
        self.payloads.delete(id).await?;
        Ok(())
    }
}
