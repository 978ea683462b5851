//! Configuration types for shard block processing

use crate::error::{ProcessError, ProcessResult};
use serde::Deserialize;
use shared_types::ShardId;

/// Metachain headers that must chain on top of a referenced one
pub const DEFAULT_META_BLOCK_FINALITY: u32 = 1;
/// Rounds after the epoch finality attesting round before old-epoch blocks are refused
pub const DEFAULT_EPOCH_CHANGE_GRACE_PERIOD: u64 = 1;
/// Cap on nonce-gap requests issued per call
pub const DEFAULT_MAX_HEADER_REQUESTS_ALLOWED: usize = 10;
/// Miniblocks are pre-fetched only for metachain headers this close to the anchor
pub const DEFAULT_MAX_HEADERS_TO_REQUEST_IN_ADVANCE: u64 = 10;
/// Share of the headers pool a shard may fill ahead of its anchor
pub const DEFAULT_MAX_OCCUPANCY_PERCENTAGE_ALLOWED: f64 = 0.9;
/// Cap on metachain headers referenced by one shard block
pub const DEFAULT_MAX_META_HEADERS_IN_ONE_SHARD_BLOCK: u32 = 100;
/// Largest accepted request backoff exponent
pub const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Runtime configuration for the shard block processor
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Shard this processor builds blocks for
    pub self_shard_id: ShardId,

    /// Number of regular shards (metachain excluded)
    pub number_of_shards: u32,

    /// Attesting metachain headers required before a referenced one is usable
    pub meta_block_finality: u32,

    /// Maximum metachain headers referenced by a single shard block
    pub max_meta_headers_in_one_shard_block: u32,

    /// Maximum nonce-gap requests per `request_headers_if_missing` call
    pub max_header_requests_allowed: usize,

    /// Miniblock pre-fetch distance from the last cross-notarized nonce
    pub max_headers_to_request_in_advance: u64,

    /// Grace rounds after the epoch finality attesting round
    pub epoch_change_grace_period: u64,

    /// A trie checkpoint is taken every this many nonces (0 disables)
    pub state_checkpoint_modulus: u64,

    /// Fraction of the headers pool a shard may occupy ahead of its anchor
    pub max_occupancy_percentage_allowed: f64,

    /// Headers pool capacity
    pub headers_pool_capacity: usize,

    /// Miniblocks pool capacity
    pub mini_blocks_pool_capacity: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            self_shard_id: 0,
            number_of_shards: 2,
            meta_block_finality: DEFAULT_META_BLOCK_FINALITY,
            max_meta_headers_in_one_shard_block: DEFAULT_MAX_META_HEADERS_IN_ONE_SHARD_BLOCK,
            max_header_requests_allowed: DEFAULT_MAX_HEADER_REQUESTS_ALLOWED,
            max_headers_to_request_in_advance: DEFAULT_MAX_HEADERS_TO_REQUEST_IN_ADVANCE,
            epoch_change_grace_period: DEFAULT_EPOCH_CHANGE_GRACE_PERIOD,
            state_checkpoint_modulus: 100,
            max_occupancy_percentage_allowed: DEFAULT_MAX_OCCUPANCY_PERCENTAGE_ALLOWED,
            headers_pool_capacity: 1000,
            mini_blocks_pool_capacity: 10_000,
        }
    }
}

impl ProcessorConfig {
    /// Small pools and finality 1, for tests.
    pub fn for_testing() -> Self {
        Self {
            headers_pool_capacity: 100,
            mini_blocks_pool_capacity: 1000,
            state_checkpoint_modulus: 10,
            ..Self::default()
        }
    }

    /// Parse from JSON, filling missing fields with defaults.
    pub fn from_json(json: &str) -> ProcessResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| ProcessError::Config {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the processor cannot run with.
    pub fn validate(&self) -> ProcessResult<()> {
        if self.number_of_shards == 0 {
            return Err(config_err("number_of_shards must be at least 1"));
        }
        if self.self_shard_id >= self.number_of_shards {
            return Err(config_err("self_shard_id must be a regular shard"));
        }
        if self.meta_block_finality == 0 {
            return Err(config_err("meta_block_finality must be at least 1"));
        }
        if !(self.max_occupancy_percentage_allowed > 0.0
            && self.max_occupancy_percentage_allowed <= 1.0)
        {
            return Err(config_err("max_occupancy_percentage_allowed must be in (0, 1]"));
        }
        if self.headers_pool_capacity == 0 {
            return Err(config_err("headers_pool_capacity must be non-zero"));
        }
        Ok(())
    }

    /// Nonces a shard may run ahead of its last cross-notarized header.
    pub fn allowed_headers_ahead(&self) -> u64 {
        (self.headers_pool_capacity as f64 * self.max_occupancy_percentage_allowed) as u64
    }
}

fn config_err(reason: &str) -> ProcessError {
    ProcessError::Config {
        reason: reason.to_string(),
    }
}

/// Configuration for the request dispatcher adapter
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RequestDispatcherConfig {
    /// Bounded queue depth between callers and the network worker
    pub queue_depth: usize,

    /// Identical requests inside this window are suppressed (milliseconds)
    pub dedup_window_ms: u64,

    /// Outstanding network requests allowed per target shard
    pub max_outstanding_per_shard: usize,

    /// Upper bound on the backoff doubling for a repeatedly requested key
    pub max_backoff_exponent: u32,
}

impl Default for RequestDispatcherConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            dedup_window_ms: 500,
            max_outstanding_per_shard: 8,
            max_backoff_exponent: 5,
        }
    }
}

impl RequestDispatcherConfig {
    /// Parse from JSON, filling missing fields with defaults.
    pub fn from_json(json: &str) -> ProcessResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| ProcessError::Config {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ProcessResult<()> {
        if self.queue_depth == 0 {
            return Err(config_err("queue_depth must be non-zero"));
        }
        if self.max_outstanding_per_shard == 0 {
            return Err(config_err("max_outstanding_per_shard must be non-zero"));
        }
        if self.max_backoff_exponent > MAX_BACKOFF_EXPONENT {
            return Err(config_err("max_backoff_exponent is too large"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ProcessorConfig::default().validate().is_ok());
        assert!(ProcessorConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_allowed_headers_ahead() {
        let config = ProcessorConfig::default();
        assert_eq!(config.allowed_headers_ahead(), 900);
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            ProcessorConfig::from_json(r#"{"self_shard_id": 1, "meta_block_finality": 2}"#)
                .unwrap();
        assert_eq!(config.self_shard_id, 1);
        assert_eq!(config.meta_block_finality, 2);
        assert_eq!(config.max_header_requests_allowed, 10);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let zero_finality = ProcessorConfig {
            meta_block_finality: 0,
            ..ProcessorConfig::default()
        };
        assert!(matches!(
            zero_finality.validate(),
            Err(ProcessError::Config { .. })
        ));

        assert!(ProcessorConfig::from_json(r#"{"self_shard_id": 5}"#).is_err());
        assert!(ProcessorConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_dispatcher_config_bounds() {
        assert!(RequestDispatcherConfig::default().validate().is_ok());

        let huge_backoff = RequestDispatcherConfig {
            max_backoff_exponent: 64,
            ..RequestDispatcherConfig::default()
        };
        assert!(matches!(
            huge_backoff.validate(),
            Err(ProcessError::Config { .. })
        ));

        assert!(RequestDispatcherConfig::from_json(r#"{"max_outstanding_per_shard": 0}"#).is_err());
        let parsed = RequestDispatcherConfig::from_json(r#"{"queue_depth": 16}"#).unwrap();
        assert_eq!(parsed.queue_depth, 16);
        assert_eq!(parsed.max_backoff_exponent, 5);
    }
}
