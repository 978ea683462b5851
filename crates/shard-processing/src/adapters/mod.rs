//! # Adapters
//!
//! - `request_dispatcher` - bounded, de-duplicating `RequestHandler`
//! - `pools` - in-memory header and miniblock pools
//! - `chain` - genesis and current block handle
//! - `storage` - in-memory persisted units and the bootstrap store

pub mod chain;
pub mod pools;
pub mod request_dispatcher;
pub mod storage;

pub use chain::BlockChain;
pub use pools::{DataPool, HeadersPool, MiniBlocksPool};
pub use request_dispatcher::{DispatcherStatsSnapshot, RequestDispatcher};
pub use storage::{MemoryStorage, StorageBootstrapper};
