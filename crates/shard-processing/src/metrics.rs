//! Thin wrappers over the shared telemetry metrics.
//!
//! Emission never fails and never influences a block outcome.

use crate::error::ProcessError;
use crate::ports::RequestKind;
use shard_telemetry::metrics::{
    BLOCKS_COMMITTED, BLOCKS_CREATED, BLOCKS_PROCESSED, BLOCK_PROCESSING_DURATION,
    BLOCK_REJECTIONS, CURRENT_BLOCK_NONCE, DATA_REQUESTS, HOUSEKEEPING_FAILURES,
    LAST_CROSS_NOTARIZED_META_NONCE,
};
use shard_telemetry::HistogramTimer;

pub fn record_processed() {
    BLOCKS_PROCESSED.inc();
}

pub fn record_created() {
    BLOCKS_CREATED.inc();
}

pub fn record_committed(nonce: u64) {
    BLOCKS_COMMITTED.inc();
    CURRENT_BLOCK_NONCE.set(nonce as f64);
}

pub fn record_rejection(error: &ProcessError) {
    BLOCK_REJECTIONS
        .with_label_values(&[error.kind().as_str()])
        .inc();
}

pub fn record_last_cross_notarized_meta(nonce: u64) {
    LAST_CROSS_NOTARIZED_META_NONCE.set(nonce as f64);
}

pub fn record_request(kind: &RequestKind, outcome: &str) {
    DATA_REQUESTS
        .with_label_values(&[kind.label(), outcome])
        .inc();
}

pub fn record_housekeeping_failure(operation: &str) {
    HOUSEKEEPING_FAILURES.with_label_values(&[operation]).inc();
}

/// Observes block processing duration when dropped.
pub fn processing_timer() -> HistogramTimer {
    HistogramTimer::new(&BLOCK_PROCESSING_DURATION)
}
