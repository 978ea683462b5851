//! # Domain Layer
//!
//! Pure state and rules of shard block processing. Nothing in here talks to
//! the network or to storage.

pub mod block_tracker;
pub mod body;
pub mod bootstrap;
pub mod deadline;
pub mod header_validator;
pub mod in_flight;
pub mod processed_mb;

pub use block_tracker::{BlockTracker, TrackedHeader};
pub use body::{
    bodies_by_destination, check_header_body_correlation, create_mini_block_headers,
    delete_self_receipts_mini_blocks,
};
pub use bootstrap::{BootstrapData, BootstrapHeaderInfo};
pub use deadline::Deadline;
pub use header_validator::{check_construction, is_construction_valid};
pub use in_flight::{HeaderInfo, InFlightHeaderSet, InFlightHeaders, MissingCounts};
pub use processed_mb::{MiniBlocksInMeta, ProcessedMiniBlockTracker};
