//! # Shard Telemetry
//!
//! Logging and metrics for the shard block processor.
//!
//! ## Components
//!
//! - **Logging**: `tracing-subscriber` with `EnvFilter`, plain or JSON output
//! - **Metrics**: Prometheus counters, gauges and histograms in a private
//!   registry, rendered with [`encode_metrics`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shard_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::for_shard(0);
//! init_telemetry(&config).expect("telemetry");
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SHARD_SERVICE_NAME` | `shard-node` | Service name in logs |
//! | `SHARD_LOG_LEVEL` | `info` | Log level filter (`RUST_LOG` also honored) |
//! | `SHARD_CONSOLE_OUTPUT` | `true` | Write logs to stdout |
//! | `SHARD_JSON_LOGS` | `false` | JSON log lines |

#![warn(missing_docs)]

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::init_logging;
pub use metrics::{
    encode_metrics, register_metrics, HistogramTimer, BLOCKS_COMMITTED, BLOCKS_CREATED,
    BLOCKS_PROCESSED, BLOCK_PROCESSING_DURATION, BLOCK_REJECTIONS, CURRENT_BLOCK_NONCE,
    DATA_REQUESTS, HOUSEKEEPING_FAILURES, LAST_CROSS_NOTARIZED_META_NONCE,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Registering or encoding Prometheus metrics failed
    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    /// Bad filter directive or other configuration problem
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Register metrics and install the log subscriber.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    register_metrics()?;
    init_logging(config)?;
    Ok(())
}

/// Convenience macro for recording a metric increment.
#[macro_export]
macro_rules! metric_inc {
    ($metric:expr) => {
        $metric.inc()
    };
    ($metric:expr, $labels:expr) => {
        $metric.with_label_values($labels).inc()
    };
}
