//! In-memory backend
//!
//! Used by tests and by ephemeral deployments (`storage.backend: memory`).
//! Nothing survives a restart.

use super::{PayloadStore, StoreError, UploadRegistry};
use crate::upload::record::UploadRecord;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;

/// In-memory registry
#[derive(Default)]
pub struct MemoryRegistry {
    records: RwLock<HashMap<String, UploadRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UploadRegistry for MemoryRegistry {
    async fn create(&self, record: &UploadRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn read(&self, id: &str) -> Result<Option<UploadRecord>, StoreError> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn write(&self, record: &UploadRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        expected_offset: u64,
        record: &UploadRecord,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let current = records
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;
        if current.offset != expected_offset {
            return Err(StoreError::OffsetMismatch {
                expected: expected_offset,
                actual: current.offset,
            });
        }
        *current = record.clone();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records.write().remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.records.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// In-memory payload store
pub struct MemoryPayloadStore {
    /// Virtual root reported by `storage_path`
    root: PathBuf,
    payloads: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryPayloadStore {
    pub fn new() -> Self {
        Self::with_root("memory://")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            payloads: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryPayloadStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PayloadStore for MemoryPayloadStore {
    async fn initialize(&self, id: &str) -> Result<(), StoreError> {
        let mut payloads = self.payloads.write();
        if payloads.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        payloads.insert(id.to_string(), Vec::new());
        Ok(())
    }

    async fn append(&self, id: &str, data: &[u8]) -> Result<u64, StoreError> {
        let mut payloads = self.payloads.write();
        let payload = payloads
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        payload.extend_from_slice(data);
        Ok(payload.len() as u64)
    }

    async fn length(&self, id: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.payloads.read().get(id).map(|p| p.len() as u64))
    }

    async fn truncate(&self, id: &str, len: u64) -> Result<(), StoreError> {
        let mut payloads = self.payloads.write();
        let payload = payloads
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        payload.truncate(len as usize);
        Ok(())
    }

    async fn read(&self, id: &str) -> Result<Bytes, StoreError> {
        self.payloads
            .read()
            .get(id)
            .map(|p| Bytes::copy_from_slice(p))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.payloads.write().remove(id);
        Ok(())
    }

    fn storage_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }
}
