//! Data persisted after every commit so a restarted node resumes where it
//! stopped.

use crate::domain::processed_mb::MiniBlocksInMeta;
use crate::error::ProcessResult;
use serde::{Deserialize, Serialize};
use shared_types::{marshal, unmarshal, Hash, ShardId};

/// Shard, nonce and hash of one header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapHeaderInfo {
    pub shard_id: ShardId,
    pub nonce: u64,
    pub hash: Hash,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapData {
    pub last_header: Option<BootstrapHeaderInfo>,
    pub last_cross_notarized_headers: Vec<BootstrapHeaderInfo>,
    pub last_self_notarized_headers: Vec<BootstrapHeaderInfo>,
    pub highest_final_block_nonce: u64,
    pub processed_mini_blocks: Vec<MiniBlocksInMeta>,
    /// Restore point of the nodes coordinator, opaque here.
    pub nodes_coordinator_config_key: Vec<u8>,
    /// Restore point of the epoch-start trigger, opaque here.
    pub epoch_start_trigger_config_key: Vec<u8>,
}

impl BootstrapData {
    pub fn marshal(&self) -> ProcessResult<Vec<u8>> {
        Ok(marshal(self)?)
    }

    pub fn unmarshal(bytes: &[u8]) -> ProcessResult<Self> {
        Ok(unmarshal(bytes)?)
    }

    /// Cross-notarized anchor recorded for `shard`, if any.
    pub fn cross_notarized_for(&self, shard: ShardId) -> Option<&BootstrapHeaderInfo> {
        self.last_cross_notarized_headers
            .iter()
            .find(|info| info.shard_id == shard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_survives_encoding() {
        let data = BootstrapData {
            last_header: Some(BootstrapHeaderInfo {
                shard_id: 0,
                nonce: 7,
                hash: [7; 32],
            }),
            last_cross_notarized_headers: vec![BootstrapHeaderInfo {
                shard_id: u32::MAX,
                nonce: 4,
                hash: [4; 32],
            }],
            highest_final_block_nonce: 6,
            processed_mini_blocks: vec![MiniBlocksInMeta {
                meta_hash: [4; 32],
                mini_blocks_hashes: vec![[40; 32]],
            }],
            nodes_coordinator_config_key: b"nc".to_vec(),
            epoch_start_trigger_config_key: b"es".to_vec(),
            ..Default::default()
        };

        let bytes = data.marshal().unwrap();
        let decoded = BootstrapData::unmarshal(&bytes).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(decoded.cross_notarized_for(u32::MAX).unwrap().nonce, 4);
        assert!(decoded.cross_notarized_for(1).is_none());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(BootstrapData::unmarshal(&[1, 2, 3]).is_err());
    }
}
