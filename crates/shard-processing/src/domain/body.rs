//! Block body helpers: miniblock header construction, header/body
//! correlation and per-destination splitting.

use crate::error::{ProcessError, ProcessResult};
use shared_types::{calculate_hash, Body, Hash, MiniBlock, MiniBlockHeader, MiniBlockType, ShardId};
use std::collections::{BTreeMap, HashMap};

/// Builds one miniblock header per miniblock, in body order.
///
/// Returns the total transaction count alongside the headers.
pub fn create_mini_block_headers(body: &Body) -> ProcessResult<(u32, Vec<MiniBlockHeader>)> {
    let mut total_tx_count = 0u32;
    let mut headers = Vec::with_capacity(body.mini_blocks.len());
    for mini_block in &body.mini_blocks {
        let tx_count = mini_block.tx_hashes.len() as u32;
        total_tx_count += tx_count;
        headers.push(MiniBlockHeader {
            hash: calculate_hash(mini_block)?,
            sender_shard_id: mini_block.sender_shard_id,
            receiver_shard_id: mini_block.receiver_shard_id,
            tx_count,
            mb_type: mini_block.mb_type,
        });
    }
    Ok((total_tx_count, headers))
}

/// Checks that `headers` describe exactly the miniblocks of `body`.
///
/// Every miniblock must hash to a listed header with the same tx count,
/// sender and receiver, and the two lists must have the same length.
pub fn check_header_body_correlation(headers: &[MiniBlockHeader], body: &Body) -> ProcessResult<()> {
    if headers.len() != body.mini_blocks.len() {
        return Err(ProcessError::HeaderBodyMismatch);
    }

    let by_hash: HashMap<&Hash, &MiniBlockHeader> = headers.iter().map(|h| (&h.hash, h)).collect();

    for mini_block in &body.mini_blocks {
        let hash = calculate_hash(mini_block)?;
        let header = by_hash.get(&hash).ok_or(ProcessError::HeaderBodyMismatch)?;
        if header.tx_count as usize != mini_block.tx_hashes.len()
            || header.receiver_shard_id != mini_block.receiver_shard_id
            || header.sender_shard_id != mini_block.sender_shard_id
        {
            return Err(ProcessError::HeaderBodyMismatch);
        }
    }
    Ok(())
}

/// Drops intra-shard receipt and smart-contract-result miniblocks.
///
/// Those are regenerated locally by every node and never travel with the
/// body. Relative order of the remaining miniblocks is kept.
pub fn delete_self_receipts_mini_blocks(body: &mut Body) {
    body.mini_blocks.retain(|mb| {
        !(mb.is_intra_shard()
            && matches!(mb.mb_type, MiniBlockType::Receipt | MiniBlockType::SmartContractResult))
    });
}

/// Groups miniblocks by receiver shard, skipping those for `self_shard`.
pub fn bodies_by_destination(body: &Body, self_shard: ShardId) -> BTreeMap<ShardId, Body> {
    let mut bodies: BTreeMap<ShardId, Vec<MiniBlock>> = BTreeMap::new();
    for mini_block in &body.mini_blocks {
        if mini_block.receiver_shard_id == self_shard {
            continue;
        }
        bodies
            .entry(mini_block.receiver_shard_id)
            .or_default()
            .push(mini_block.clone());
    }
    bodies.into_iter().map(|(shard, mbs)| (shard, Body::new(mbs))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mb(sender: ShardId, receiver: ShardId, mb_type: MiniBlockType, txs: u8) -> MiniBlock {
        MiniBlock::new(sender, receiver, mb_type, (0..txs).map(|i| [i; 32]).collect())
    }

    #[test]
    fn test_headers_follow_body_order() {
        let body = Body::new(vec![
            mb(0, 1, MiniBlockType::Transaction, 2),
            mb(0, 0, MiniBlockType::Transaction, 3),
        ]);
        let (count, headers) = create_mini_block_headers(&body).unwrap();
        assert_eq!(count, 5);
        assert_eq!(headers[0].receiver_shard_id, 1);
        assert_eq!(headers[1].tx_count, 3);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let body = Body::new(vec![mb(0, 1, MiniBlockType::Transaction, 1)]);
        assert_eq!(
            check_header_body_correlation(&[], &body),
            Err(ProcessError::HeaderBodyMismatch)
        );
    }

    #[test]
    fn test_unknown_mini_block_rejected() {
        let body = Body::new(vec![mb(0, 1, MiniBlockType::Transaction, 1)]);
        let other = Body::new(vec![mb(0, 1, MiniBlockType::Transaction, 2)]);
        let (_, headers) = create_mini_block_headers(&other).unwrap();
        assert_eq!(
            check_header_body_correlation(&headers, &body),
            Err(ProcessError::HeaderBodyMismatch)
        );
    }

    #[test]
    fn test_self_receipts_removed_in_order() {
        let mut body = Body::new(vec![
            mb(0, 1, MiniBlockType::Transaction, 1),
            mb(0, 0, MiniBlockType::Receipt, 1),
            mb(0, 0, MiniBlockType::Transaction, 1),
            mb(0, 0, MiniBlockType::SmartContractResult, 1),
            mb(1, 0, MiniBlockType::SmartContractResult, 1),
        ]);
        delete_self_receipts_mini_blocks(&mut body);
        let kinds: Vec<_> = body
            .mini_blocks
            .iter()
            .map(|m| (m.sender_shard_id, m.receiver_shard_id, m.mb_type))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (0, 1, MiniBlockType::Transaction),
                (0, 0, MiniBlockType::Transaction),
                (1, 0, MiniBlockType::SmartContractResult),
            ]
        );
    }

    #[test]
    fn test_bodies_by_destination_skip_self() {
        let body = Body::new(vec![
            mb(0, 1, MiniBlockType::Transaction, 1),
            mb(0, 0, MiniBlockType::Transaction, 1),
            mb(0, 2, MiniBlockType::Transaction, 1),
            mb(0, 1, MiniBlockType::Transaction, 2),
        ]);
        let bodies = bodies_by_destination(&body, 0);
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[&1].mini_blocks.len(), 2);
        assert!(!bodies.contains_key(&0));
    }

    fn mini_block_strategy() -> impl Strategy<Value = MiniBlock> {
        (0u32..3, 0u32..3, 1usize..5, 0u8..200).prop_map(|(sender, receiver, txs, seed)| {
            MiniBlock::new(
                sender,
                receiver,
                MiniBlockType::Transaction,
                (0..txs).map(|i| [seed + i as u8; 32]).collect(),
            )
        })
    }

    proptest! {
        #[test]
        fn correlation_holds_for_generated_headers(mbs in prop::collection::vec(mini_block_strategy(), 0..8)) {
            let body = Body::new(mbs);
            let (_, headers) = create_mini_block_headers(&body).unwrap();
            prop_assert!(check_header_body_correlation(&headers, &body).is_ok());
        }

        #[test]
        fn mutated_mini_block_breaks_correlation(
            mbs in prop::collection::vec(mini_block_strategy(), 1..8),
            pick in any::<prop::sample::Index>(),
            field in 0u8..3,
        ) {
            let mut body = Body::new(mbs);
            let (_, headers) = create_mini_block_headers(&body).unwrap();
            let idx = pick.index(body.mini_blocks.len());
            let target = &mut body.mini_blocks[idx];
            match field {
                0 => target.tx_hashes.push([0xFF; 32]),
                1 => target.sender_shard_id += 10,
                _ => target.receiver_shard_id += 10,
            }
            prop_assert_eq!(
                check_header_body_correlation(&headers, &body),
                Err(ProcessError::HeaderBodyMismatch)
            );
        }
    }
}
