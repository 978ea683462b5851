//! # Shard Block Processing
//!
//! Validates, builds and commits the blocks of one shard, and keeps track of
//! which metachain headers this shard has notarized.
//!
//! ## Pipeline
//!
//! ```text
//! (header, body) ──→ check_block_validity ──→ resolve referenced meta headers
//!                                                 │   (request + bounded wait)
//!                                                 ↓
//!                    epoch rules ──→ meta construction + K-finality
//!                                                 ↓
//!                    cross-shard confirmation ──→ execute txs ──→ state root
//!                                                 ↓
//!                    commit: persist, advance anchors, prune, bootstrap
//! ```
//!
//! ## Crate Structure (Hexagonal Architecture)
//!
//! - `domain/` - header rules, in-flight header set, block tracker,
//!   processed miniblocks, bootstrap data
//! - `ports/` - inbound `BlockProcessor` API, outbound capabilities
//! - `service/` - `ShardBlockProcessor`, the state machine
//! - `adapters/` - request dispatcher, pools, chain handle, in-memory storage
//!
//! ## Usage
//!
//! ```ignore
//! use shard_processing::{ShardBlockProcessor, ShardProcessorDependencies, ProcessorConfig};
//!
//! let processor = ShardBlockProcessor::new(deps, ProcessorConfig::default())?;
//! processor.process_block(&header, &body, Deadline::after(round_time)).await?;
//! processor.commit_block(&header, &body).await?;
//! ```

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod ports;
pub mod service;

#[cfg(test)]
mod test_utils;

pub use adapters::{BlockChain, DataPool, MemoryStorage, RequestDispatcher, StorageBootstrapper};
pub use config::{ProcessorConfig, RequestDispatcherConfig};
pub use domain::{
    BlockTracker, BootstrapData, BootstrapHeaderInfo, Deadline, ProcessedMiniBlockTracker,
    TrackedHeader,
};
pub use error::{ErrorKind, ProcessError, ProcessResult};
pub use ports::{BlockProcessor, BroadcastData};
pub use service::{ShardBlockProcessor, ShardProcessorDependencies};
