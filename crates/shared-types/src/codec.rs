//! # Codec
//!
//! Deterministic encoding and content hashing for block entities.
//!
//! Hash = Keccak-256 over the bincode encoding. Two structurally equal
//! values always encode to the same bytes, so they always hash the same.

use crate::entities::{Hash, Header};
use crate::errors::CodecError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha3::{Digest, Keccak256};

/// Encodes a value with bincode.
pub fn marshal<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(value).map_err(|e| CodecError::Marshal(e.to_string()))
}

/// Decodes a bincode-encoded value.
pub fn unmarshal<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Keccak-256 of raw bytes.
pub fn keccak256(bytes: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Content hash of any serializable value.
pub fn calculate_hash<T: Serialize + ?Sized>(value: &T) -> Result<Hash, CodecError> {
    Ok(keccak256(&marshal(value)?))
}

/// Hash of a header.
///
/// Hashes the inner shard or metachain header so the result does not depend
/// on whether the caller holds the concrete type or the `Header` wrapper.
pub fn header_hash(header: &Header) -> Result<Hash, CodecError> {
    match header {
        Header::Shard(h) => calculate_hash(h),
        Header::Meta(h) => calculate_hash(h),
    }
}

/// Short hex form of a hash for log fields.
pub fn short_hex(hash: &Hash) -> String {
    hex::encode(&hash[..8])
}
