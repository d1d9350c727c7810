//! Tus Uploadr Library
//!
//! Resumable upload server for the tus.io 1.0.0 protocol.
//!
//! # Features
//!
//! - **Resumable**: chunks are flushed and committed per write-unit, so an
//!   interrupted request keeps every byte received before the break
//! - **Extensions**: creation, creation-defer-length, creation-with-upload,
//!   expiration, termination
//! - **Hooks**: pluggable authorization and a once-only completion callback
//!   (log line or webhook)
//! - **Storage**: local filesystem with JSON sidecars, or in memory
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tus_uploadr::authz::AllowAllAuthorizer;
//! use tus_uploadr::notify::NoopNotifier;
//! use tus_uploadr::{Config, TusServer, UploadService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let service = Arc::new(UploadService::from_config(&config, Arc::new(NoopNotifier))?);
//!     let server =
//!         TusServer::bind(&config.server.address, service, Arc::new(AllowAllAuthorizer)).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod authz;
pub mod config;
pub mod metrics;
pub mod notify;
pub mod reaper;
pub mod router;
pub mod server;
pub mod storage;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use server::TusServer;
pub use upload::UploadService;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
