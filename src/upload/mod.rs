//! Upload module
//!
//! The tus session state machine and the types it exchanges with the HTTP
//! surface.

use crate::storage::StoreError;
use chrono::{DateTime, Utc};
use hyper::StatusCode;
use thiserror::Error;

pub mod location;
pub mod locks;
pub mod metadata;
pub mod record;
pub mod service;

pub use record::{ClientMetadata, UploadRecord, UploadState};
pub use service::UploadService;

// ============================================================================
// Protocol Constants
// ============================================================================

/// Protocol version spoken by this server
pub const TUS_VERSION: &str = "1.0.0";

/// Extensions advertised in `Tus-Extension`
pub const TUS_EXTENSIONS: &str =
    "creation,creation-defer-length,creation-with-upload,expiration,termination";

/// Required content type of chunk bodies
pub const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

/// Default maximum upload size (120 GiB)
pub const DEFAULT_MAX_SIZE: u64 = 128_849_018_880;

// ============================================================================
// Errors
// ============================================================================

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("Offset conflict: client sent {declared}, server has {current}")]
    Conflict { declared: u64, current: u64 },

    #[error("Upload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Request body interrupted at offset {offset}: {reason}")]
    Interrupted { offset: u64, reason: String },

    #[error("Upload corrupted: {0}")]
    Corrupted(String),

    #[error("Completion hook failed: {0}")]
    Notification(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedVersion(_) => StatusCode::PRECONDITION_FAILED,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Interrupted { .. } => StatusCode::BAD_REQUEST,
            Self::Corrupted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Notification(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::UnsupportedMediaType(_) => "unsupported_media_type",
            Self::BadRequest(_) => "bad_request",
            Self::UnsupportedVersion(_) => "unsupported_version",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Interrupted { .. } => "interrupted",
            Self::Corrupted(_) => "corrupted",
            Self::Notification(_) => "notification",
            Self::Storage(_) => "storage",
        }
    }
}

// ============================================================================
// Request / Result Types
// ============================================================================

/// Parameters of an Initiate operation
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// `Upload-Length`
    pub upload_length: Option<u64>,
    /// `Upload-Defer-Length: 1`
    pub defer_length: bool,
    /// Decoded `Upload-Metadata`
    pub metadata: ClientMetadata,
}

/// Parameters of an AppendChunk operation
#[derive(Debug, Clone, Default)]
pub struct ChunkRequest {
    /// `Upload-Offset` the client believes the upload is at
    pub offset: u64,
    /// `Upload-Length`, used to resolve a deferred length
    pub upload_length: Option<u64>,
    /// `Content-Type` of the body
    pub content_type: Option<String>,
}

/// Result of an AppendChunk operation
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub offset: u64,
    pub size: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Bytes accepted by this request
    pub bytes_received: u64,
    pub completed: bool,
}

/// Static server capabilities, for OPTIONS
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    pub version: &'static str,
    pub extensions: &'static str,
    pub max_size: u64,
}

/// A completed payload handed out by Download
#[derive(Debug, Clone)]
pub struct Download {
    pub data: bytes::Bytes,
    pub filename: String,
    pub content_type: Option<String>,
}

/// Parse an `Upload-Defer-Length` header; only `1` is valid
pub fn parse_defer_length(value: Option<&str>) -> Result<bool, UploadError> {
    match value.map(str::trim) {
        None => Ok(false),
        Some("1") => Ok(true),
        Some(other) => Err(UploadError::BadRequest(format!(
            "Invalid Upload-Defer-Length: {}",
            other
        ))),
    }
}

/// Parse a non-negative integer header such as `Upload-Length`
pub fn parse_u64_header(name: &str, value: Option<&str>) -> Result<Option<u64>, UploadError> {
    value
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| UploadError::BadRequest(format!("Invalid {}: {}", name, v)))
        })
        .transpose()
}

/// Format a timestamp as an HTTP-date (`Upload-Expires`)
pub fn http_date(ts: DateTime<Utc>) -> String {
    ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_codes() {
        assert_eq!(UploadError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            UploadError::Conflict { declared: 0, current: 5 }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            UploadError::PayloadTooLarge { size: 2, max: 1 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            UploadError::UnsupportedMediaType("text/plain".into()).status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            UploadError::UnsupportedVersion("0.2.2".into()).status_code(),
            StatusCode::PRECONDITION_FAILED
        );
    }

    #[test]
    fn test_parse_defer_length() {
        assert!(!parse_defer_length(None).unwrap());
        assert!(parse_defer_length(Some("1")).unwrap());
        assert!(parse_defer_length(Some("0")).is_err());
        assert!(parse_defer_length(Some("yes")).is_err());
    }

    #[test]
    fn test_parse_u64_header() {
        assert_eq!(parse_u64_header("Upload-Length", Some("42")).unwrap(), Some(42));
        assert_eq!(parse_u64_header("Upload-Length", None).unwrap(), None);
        assert!(parse_u64_header("Upload-Length", Some("-1")).is_err());
    }

    #[test]
    fn test_http_date() {
        let ts = Utc.with_ymd_and_hms(2014, 6, 25, 16, 0, 0).unwrap();
        assert_eq!(http_date(ts), "Wed, 25 Jun 2014 16:00:00 GMT");
    }
}
