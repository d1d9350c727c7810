//! Local filesystem backend
//!
//! Layout under the configured directory:
//!
//! ```text
//! <files_dir>/<id>        raw payload bytes
//! <files_dir>/<id>.info   JSON sidecar record
//! ```

use super::{is_valid_id, PayloadStore, StoreError, UploadRegistry};
use crate::upload::record::UploadRecord;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const RECORD_EXTENSION: &str = "info";

async fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dir).await?;
    Ok(())
}

// ============================================================================
// Registry
// ============================================================================

/// JSON sidecar registry
pub struct FileRegistry {
    dir: PathBuf,
    /// Serializes read-compare-write cycles on records
    write_lock: Mutex<()>,
}

impl FileRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, RECORD_EXTENSION))
    }

    async fn read_unlocked(&self, id: &str) -> Result<Option<UploadRecord>, StoreError> {
        match fs::read(self.record_path(id)).await {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a temp file, sync, then rename over the record
    async fn write_unlocked(&self, record: &UploadRecord) -> Result<(), StoreError> {
        ensure_dir(&self.dir).await?;
        let content = serde_json::to_vec_pretty(record)?;
        let tmp_path = self.dir.join(format!(
            ".{}.{}.tmp",
            record.id,
            uuid::Uuid::new_v4().simple()
        ));

        let mut file = fs::File::create(&tmp_path).await?;
        let written = async {
            file.write_all(&content).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        drop(file);

        if let Err(e) = fs::rename(&tmp_path, self.record_path(&record.id)).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl UploadRegistry for FileRegistry {
    async fn create(&self, record: &UploadRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if fs::try_exists(self.record_path(&record.id)).await? {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }
        self.write_unlocked(record).await
    }

    async fn read(&self, id: &str) -> Result<Option<UploadRecord>, StoreError> {
        if !is_valid_id(id) {
            return Ok(None);
        }
        self.read_unlocked(id).await
    }

    async fn write(&self, record: &UploadRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_unlocked(record).await
    }

    async fn compare_and_swap(
        &self,
        expected_offset: u64,
        record: &UploadRecord,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let current = self
            .read_unlocked(&record.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;
        if current.offset != expected_offset {
            return Err(StoreError::OffsetMismatch {
                expected: expected_offset,
                actual: current.offset,
            });
        }
        self.write_unlocked(record).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        if !is_valid_id(id) {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(".info") {
                if is_valid_id(id) {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

// ============================================================================
// Payload Store
// ============================================================================

/// Raw payload files
pub struct FilePayloadStore {
    dir: PathBuf,
}

impl FilePayloadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn payload_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_id(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(self.dir.join(id))
    }
}

#[async_trait]
impl PayloadStore for FilePayloadStore {
    async fn initialize(&self, id: &str) -> Result<(), StoreError> {
        ensure_dir(&self.dir).await?;
        let path = self.payload_path(id)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => StoreError::AlreadyExists(id.to_string()),
                _ => StoreError::IoError(e),
            })?;
        file.sync_all().await?;
        Ok(())
    }

    async fn append(&self, id: &str, data: &[u8]) -> Result<u64, StoreError> {
        let path = self.payload_path(id)?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => StoreError::NotFound(id.to_string()),
                _ => StoreError::IoError(e),
            })?;
        file.write_all(data).await?;
        file.sync_data().await?;
        Ok(file.metadata().await?.len())
    }

    async fn length(&self, id: &str) -> Result<Option<u64>, StoreError> {
        let path = match self.payload_path(id) {
            Ok(path) => path,
            Err(_) => return Ok(None),
        };
        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn truncate(&self, id: &str, len: u64) -> Result<(), StoreError> {
        let path = self.payload_path(id)?;
        let file = OpenOptions::new().write(true).open(&path).await?;
        file.set_len(len).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn read(&self, id: &str) -> Result<Bytes, StoreError> {
        let path = self.payload_path(id)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let Ok(path) = self.payload_path(id) else {
            return Ok(());
        };
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn storage_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }
}
