//! # Shared Types Crate
//!
//! Block data model shared by the shard block processor and its
//! collaborators.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: headers, miniblocks and bodies are defined
//!   here and nowhere else.
//! - **Closed header variant**: `Header` is either a shard or a metachain
//!   header; code that only needs nonce/round/hash goes through
//!   `HeaderHandler`.
//! - **Deterministic hashing**: every entity is hashed through its bincode
//!   encoding (see `codec`).

pub mod codec;
pub mod entities;
pub mod errors;

pub use codec::{calculate_hash, header_hash, keccak256, marshal, short_hex, unmarshal};
pub use entities::*;
pub use errors::*;
