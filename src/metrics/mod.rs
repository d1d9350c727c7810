//! Metrics module
//!
//! Provides Prometheus metrics for the upload state machine.

pub mod server;

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_int_counter,
    register_int_counter_vec, Counter, CounterVec, Histogram, IntCounter, IntCounterVec,
};

lazy_static! {
    // Session lifecycle
    pub static ref UPLOADS_CREATED: IntCounterVec = register_int_counter_vec!(
        "tus_uploads_created_total",
        "Total number of uploads created",
        &["length"]  // "known" or "deferred"
    ).unwrap();

    pub static ref UPLOADS_COMPLETED: IntCounter = register_int_counter!(
        "tus_uploads_completed_total",
        "Uploads that reached their final size"
    ).unwrap();

    pub static ref UPLOADS_DELETED: IntCounterVec = register_int_counter_vec!(
        "tus_uploads_deleted_total",
        "Uploads removed",
        &["reason"]  // "terminated" or "expired"
    ).unwrap();

    // Chunk traffic
    pub static ref CHUNKS_TOTAL: CounterVec = register_counter_vec!(
        "tus_chunks_total",
        "Chunk append requests",
        &["status"]
    ).unwrap();

    pub static ref BYTES_RECEIVED: Counter = register_counter!(
        "tus_bytes_received_total",
        "Payload bytes durably appended"
    ).unwrap();

    pub static ref CHUNK_DURATION: Histogram = register_histogram!(
        "tus_chunk_duration_seconds",
        "Time spent receiving one chunk request",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0]
    ).unwrap();

    // Reaper
    pub static ref SWEEPS_TOTAL: IntCounter = register_int_counter!(
        "tus_expiry_sweeps_total",
        "Expiry sweeps run"
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tus_errors_total",
        "Total errors",
        &["type"]
    ).unwrap();
}

/// Record a new upload
pub fn record_upload_created(deferred: bool) {
    let length = if deferred { "deferred" } else { "known" };
    UPLOADS_CREATED.with_label_values(&[length]).inc();
}

/// Record a finished chunk request
pub fn record_chunk(success: bool, duration_secs: f64) {
    let status = if success { "success" } else { "failure" };
    CHUNKS_TOTAL.with_label_values(&[status]).inc();
    CHUNK_DURATION.observe(duration_secs);
}

/// Record one committed write-unit
pub fn record_bytes_received(bytes: u64) {
    BYTES_RECEIVED.inc_by(bytes as f64);
}

/// Record an upload reaching its final size
pub fn record_upload_completed() {
    UPLOADS_COMPLETED.inc();
}

/// Record an upload removal
pub fn record_upload_deleted(reason: &str) {
    UPLOADS_DELETED.with_label_values(&[reason]).inc();
}

/// Record a reaper sweep
pub fn record_sweep() {
    SWEEPS_TOTAL.inc();
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}
