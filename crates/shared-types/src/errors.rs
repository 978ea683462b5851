//! # Error Types
//!
//! Errors raised while encoding, decoding or hashing block entities.

use thiserror::Error;

/// Errors from the block codec.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Value could not be serialized.
    #[error("Marshal failed: {0}")]
    Marshal(String),

    /// Bytes do not decode into the requested type.
    #[error("Unmarshal failed: {0}")]
    Unmarshal(String),
}

impl From<bincode::Error> for CodecError {
    fn from(e: bincode::Error) -> Self {
        CodecError::Unmarshal(e.to_string())
    }
}
