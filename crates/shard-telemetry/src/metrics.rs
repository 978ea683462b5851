//! Prometheus metrics for shard block processing.
//!
//! All metrics follow the naming convention: `shard_<area>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: blocks processed/committed, rejections, header requests
//! - **Gauge**: last cross-notarized metachain nonce, current block nonce
//! - **Histogram**: block processing duration

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, Opts, Registry,
    TextEncoder,
};
use std::sync::Once;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // BLOCK LIFECYCLE
    // =========================================================================

    /// Blocks that passed full processing
    pub static ref BLOCKS_PROCESSED: Counter = Counter::new(
        "shard_blocks_processed_total",
        "Total number of blocks that passed processing and state-root verification"
    ).expect("metric creation failed");

    /// Blocks committed to the local chain
    pub static ref BLOCKS_COMMITTED: Counter = Counter::new(
        "shard_blocks_committed_total",
        "Total number of blocks committed"
    ).expect("metric creation failed");

    /// Blocks created by this node
    pub static ref BLOCKS_CREATED: Counter = Counter::new(
        "shard_blocks_created_total",
        "Total number of candidate blocks assembled"
    ).expect("metric creation failed");

    /// Rejected blocks by error kind
    pub static ref BLOCK_REJECTIONS: CounterVec = CounterVec::new(
        Opts::new("shard_block_rejections_total", "Blocks rejected during processing"),
        &["kind"]  // kind: structural/transient/confirmation/fatal/infrastructure
    ).expect("metric creation failed");

    /// Block processing duration histogram
    pub static ref BLOCK_PROCESSING_DURATION: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "shard_block_processing_duration_seconds",
            "Time spent in ProcessBlock"
        ).buckets(exponential_buckets(0.001, 2.0, 15).expect("valid buckets"))
    ).expect("metric creation failed");

    /// Nonce of the current committed block
    pub static ref CURRENT_BLOCK_NONCE: Gauge = Gauge::new(
        "shard_current_block_nonce",
        "Nonce of the last committed block"
    ).expect("metric creation failed");

    // =========================================================================
    // NOTARIZATION
    // =========================================================================

    /// Last cross-notarized metachain nonce
    pub static ref LAST_CROSS_NOTARIZED_META_NONCE: Gauge = Gauge::new(
        "shard_last_cross_notarized_meta_nonce",
        "Nonce of the last metachain header notarized by this shard"
    ).expect("metric creation failed");

    // =========================================================================
    // REQUESTS + HOUSEKEEPING
    // =========================================================================

    /// Header/miniblock requests by kind and outcome
    pub static ref DATA_REQUESTS: CounterVec = CounterVec::new(
        Opts::new("shard_data_requests_total", "Requests handed to the request dispatcher"),
        &["kind", "outcome"]  // outcome: sent/deduplicated/dropped
    ).expect("metric creation failed");

    /// Swallowed housekeeping failures by operation
    pub static ref HOUSEKEEPING_FAILURES: CounterVec = CounterVec::new(
        Opts::new("shard_housekeeping_failures_total", "Best-effort operations that failed"),
        &["operation"]
    ).expect("metric creation failed");
}

static REGISTER: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Safe to call more than once; only the first call registers.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let mut result = Ok(());
    REGISTER.call_once(|| {
        let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(BLOCKS_PROCESSED.clone()),
            Box::new(BLOCKS_COMMITTED.clone()),
            Box::new(BLOCKS_CREATED.clone()),
            Box::new(BLOCK_REJECTIONS.clone()),
            Box::new(BLOCK_PROCESSING_DURATION.clone()),
            Box::new(CURRENT_BLOCK_NONCE.clone()),
            Box::new(LAST_CROSS_NOTARIZED_META_NONCE.clone()),
            Box::new(DATA_REQUESTS.clone()),
            Box::new(HOUSEKEEPING_FAILURES.clone()),
        ];

        for metric in metrics {
            if let Err(e) = REGISTRY.register(metric) {
                result = Err(TelemetryError::MetricsInit(e.to_string()));
                return;
            }
        }
    });
    result
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}

/// Start timing for a histogram. Observation happens on drop.
#[macro_export]
macro_rules! time_histogram {
    ($histogram:expr) => {
        $crate::metrics::HistogramTimer::new(&$histogram)
    };
}
