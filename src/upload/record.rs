//! Upload session record
//!
//! The sidecar persisted next to every payload.

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

// ============================================================================
// Client Metadata
// ============================================================================

/// Ordered key/value pairs supplied by the client at creation.
///
/// Insertion order is kept so that `Upload-Metadata` round-trips in the order
/// the client sent it. Serialized as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientMetadata {
    entries: Vec<(String, String)>,
}

impl ClientMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pair, replacing the value of an existing key in place
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Client-supplied file name, if any
    pub fn filename(&self) -> Option<&str> {
        self.get("filename").or_else(|| self.get("name"))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ClientMetadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = ClientMetadata::new();
        for (k, v) in iter {
            metadata.insert(k, v);
        }
        metadata
    }
}

impl Serialize for ClientMetadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ClientMetadata {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MetadataVisitor;

        impl<'de> Visitor<'de> for MetadataVisitor {
            type Value = ClientMetadata;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of string keys to string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut metadata = ClientMetadata::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    metadata.insert(k, v);
                }
                Ok(metadata)
            }
        }

        deserializer.deserialize_map(MetadataVisitor)
    }
}

// ============================================================================
// Session Record
// ============================================================================

/// Protocol state of an upload, derived from its record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Nothing received yet
    Created,
    /// Some bytes received, final size not reached or unknown
    Uploading,
    /// Offset equals the finalized size
    Completed,
}

/// Session metadata persisted for every upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    /// 128-bit hex token, immutable
    pub id: String,

    /// Client key/value pairs from `Upload-Metadata`, immutable
    pub metadata: ClientMetadata,

    /// Total expected length, `None` while deferred
    pub size: Option<u64>,

    /// Bytes durably persisted
    pub offset: u64,

    /// Size of the most recent write-unit
    pub last_chunk_size: u64,

    /// Number of write-units appended
    pub chunk_count: u64,

    pub created_at: DateTime<Utc>,

    /// True if the size was unknown at creation
    pub defer_length: bool,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Set once the completion hook has run
    #[serde(default)]
    pub completion_notified: bool,
}

impl UploadRecord {
    pub fn new(id: String, metadata: ClientMetadata, size: Option<u64>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            metadata,
            defer_length: size.is_none(),
            size,
            offset: 0,
            last_chunk_size: 0,
            chunk_count: 0,
            created_at: now,
            expires_at: None,
            completion_notified: false,
        }
    }

    pub fn state(&self) -> UploadState {
        match self.size {
            Some(size) if self.offset == size => UploadState::Completed,
            _ if self.offset == 0 => UploadState::Created,
            _ => UploadState::Uploading,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state() == UploadState::Completed
    }

    /// Size still waiting to be supplied by a chunk
    pub fn is_length_deferred(&self) -> bool {
        self.size.is_none()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires) if expires < now)
    }

    /// Record one durable write-unit
    pub fn record_write(&mut self, len: u64) {
        self.offset += len;
        self.last_chunk_size = len;
        self.chunk_count += 1;
    }
}
