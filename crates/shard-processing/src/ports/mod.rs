//! # Ports Layer
//!
//! - `inbound.rs` - API the node drives the processor through
//! - `outbound.rs` - capabilities the processor depends on

pub mod inbound;
pub mod outbound;

pub use inbound::{BlockProcessor, BroadcastData};
pub use outbound::{
    epoch_start_identifier, nonce_key, AccountsAdapter, BootstrapStorer, CrossShardOutcome,
    DataRequest, EpochStartTrigger, ForkDetector, NetworkRequester, NodesCoordinator,
    PruneDirection, RequestHandler, RequestKind, StorageService, TransactionCoordinator, UnitType,
};
