//! HTTP server module
//!
//! The hyper front end that translates tus requests into
//! [`UploadService`](crate::upload::UploadService) operations.

use thiserror::Error;

pub mod http;

pub use http::TusServer;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    #[error("Server error: {0}")]
    RuntimeError(String),
}
