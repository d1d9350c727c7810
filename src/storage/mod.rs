//! Storage module
//!
//! Persistence for upload sessions, split into two stores keyed by upload id:
//!
//! - [`UploadRegistry`]: the sidecar record holding session metadata
//! - [`PayloadStore`]: the raw, append-only payload bytes
//!
//! The payload length must always equal the offset recorded in the registry.
//! Appends are flushed before the registry is updated, so after a crash the
//! payload can only ever be *longer* than the committed offset, never shorter.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use thiserror::Error;

use crate::upload::record::UploadRecord;

pub mod filesystem;
pub mod memory;

pub use filesystem::{FilePayloadStore, FileRegistry};
pub use memory::{MemoryPayloadStore, MemoryRegistry};

/// Storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Upload already exists: {0}")]
    AlreadyExists(String),

    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("Offset mismatch: expected {expected}, stored {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Durable mapping from upload id to session record
#[async_trait]
pub trait UploadRegistry: Send + Sync {
    /// Store a new record. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, record: &UploadRecord) -> Result<(), StoreError>;

    /// Read a record, `None` if absent
    async fn read(&self, id: &str) -> Result<Option<UploadRecord>, StoreError>;

    /// Replace the whole record. Readers never observe a partial write.
    async fn write(&self, record: &UploadRecord) -> Result<(), StoreError>;

    /// Replace the record only if the stored offset equals `expected_offset`
    async fn compare_and_swap(
        &self,
        expected_offset: u64,
        record: &UploadRecord,
    ) -> Result<(), StoreError>;

    /// Remove a record. No-op if absent.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Ids of all stored records
    async fn list(&self) -> Result<Vec<String>, StoreError>;
}

/// One append-only byte sequence per upload id
#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Create an empty payload
    async fn initialize(&self, id: &str) -> Result<(), StoreError>;

    /// Append bytes durably and return the new total length
    async fn append(&self, id: &str, data: &[u8]) -> Result<u64, StoreError>;

    /// Current payload length, `None` if the payload does not exist
    async fn length(&self, id: &str) -> Result<Option<u64>, StoreError>;

    /// Cut the payload back to `len` bytes
    async fn truncate(&self, id: &str, len: u64) -> Result<(), StoreError>;

    /// Full payload contents
    async fn read(&self, id: &str) -> Result<Bytes, StoreError>;

    /// Remove the payload. No-op if absent.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Location handed to the completion hook
    fn storage_path(&self, id: &str) -> PathBuf;
}

/// Check that an id is safe to use as a storage key.
///
/// Ids are generated as 32 lowercase hex characters; anything else coming in
/// from a request path is treated as unknown.
pub fn is_valid_id(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
