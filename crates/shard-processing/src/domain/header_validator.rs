//! Header chaining rules.
//!
//! Pure checks, no I/O. Consensus depends on every node applying exactly
//! these rules in exactly this order.

use crate::error::{ProcessError, ProcessResult};
use shared_types::{header_hash, Header, HeaderHandler};

/// Checks that `candidate` is built directly on top of `predecessor`.
///
/// Order: predecessor present, nonce, round, previous hash, previous
/// random seed. The first failing rule decides the error.
pub fn check_construction(candidate: &Header, predecessor: Option<&Header>) -> ProcessResult<()> {
    let predecessor = predecessor.ok_or(ProcessError::NilBlockHeader)?;

    let expected = predecessor.nonce() + 1;
    if candidate.nonce() != expected {
        return Err(ProcessError::WrongNonceInBlock {
            expected,
            actual: candidate.nonce(),
        });
    }

    if candidate.round() <= predecessor.round() {
        return Err(ProcessError::LowerRoundInBlock {
            local: predecessor.round(),
            received: candidate.round(),
        });
    }

    if *candidate.prev_hash() != header_hash(predecessor)? {
        return Err(ProcessError::BlockHashDoesNotMatch);
    }

    if candidate.prev_rand_seed() != predecessor.rand_seed() {
        return Err(ProcessError::RandSeedDoesNotMatch);
    }

    Ok(())
}

/// Boolean form of [`check_construction`].
pub fn is_construction_valid(candidate: &Header, predecessor: Option<&Header>) -> bool {
    check_construction(candidate, predecessor).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use shared_types::MetaHeader;

    fn meta(nonce: u64, round: u64, prev: Option<&Header>) -> Header {
        let (prev_hash, prev_rand_seed) = match prev {
            Some(p) => (header_hash(p).unwrap(), p.rand_seed().to_vec()),
            None => ([0; 32], vec![]),
        };
        Header::Meta(MetaHeader {
            nonce,
            round,
            prev_hash,
            prev_rand_seed,
            rand_seed: vec![nonce as u8; 4],
            ..Default::default()
        })
    }

    #[test]
    fn test_valid_successor() {
        let genesis = meta(0, 0, None);
        let next = meta(1, 1, Some(&genesis));
        assert!(check_construction(&next, Some(&genesis)).is_ok());
        assert!(is_construction_valid(&next, Some(&genesis)));
    }

    #[test]
    fn test_missing_predecessor() {
        let next = meta(1, 1, None);
        assert_eq!(
            check_construction(&next, None),
            Err(ProcessError::NilBlockHeader)
        );
    }

    #[test]
    fn test_nonce_gap() {
        let genesis = meta(0, 0, None);
        let skipped = meta(2, 1, Some(&genesis));
        assert_eq!(
            check_construction(&skipped, Some(&genesis)),
            Err(ProcessError::WrongNonceInBlock {
                expected: 1,
                actual: 2
            })
        );
    }

    #[test]
    fn test_round_not_increasing() {
        let genesis = meta(0, 5, None);
        let next = meta(1, 5, Some(&genesis));
        assert!(matches!(
            check_construction(&next, Some(&genesis)),
            Err(ProcessError::LowerRoundInBlock { local: 5, received: 5 })
        ));
    }

    #[test]
    fn test_wrong_prev_hash() {
        let genesis = meta(0, 0, None);
        let other = meta(0, 0, Some(&genesis));
        let next = meta(1, 1, Some(&other));
        assert_eq!(
            check_construction(&next, Some(&genesis)),
            Err(ProcessError::BlockHashDoesNotMatch)
        );
    }

    #[test]
    fn test_wrong_rand_seed() {
        let genesis = meta(0, 0, None);
        let mut next = meta(1, 1, Some(&genesis));
        if let Header::Meta(m) = &mut next {
            m.prev_rand_seed = vec![9, 9];
        }
        assert_eq!(
            check_construction(&next, Some(&genesis)),
            Err(ProcessError::RandSeedDoesNotMatch)
        );
    }

    #[test]
    fn test_nonce_checked_before_round() {
        let genesis = meta(0, 5, None);
        let bad = meta(3, 1, Some(&genesis));
        assert!(matches!(
            check_construction(&bad, Some(&genesis)),
            Err(ProcessError::WrongNonceInBlock { .. })
        ));
    }

    proptest! {
        #[test]
        fn valid_sequences_are_monotone(
            steps in prop::collection::vec((1u64..5, any::<[u8; 4]>()), 1..24)
        ) {
            let mut prev = meta(0, 0, None);
            for (round_step, seed) in steps {
                let mut next = meta(prev.nonce() + 1, prev.round() + round_step, Some(&prev));
                if let Header::Meta(m) = &mut next {
                    m.rand_seed = seed.to_vec();
                }
                prop_assert!(check_construction(&next, Some(&prev)).is_ok());
                prop_assert_eq!(next.nonce(), prev.nonce() + 1);
                prop_assert_eq!(*next.prev_hash(), header_hash(&prev).unwrap());
                prop_assert!(next.round() > prev.round());
                prev = next;
            }
        }

        #[test]
        fn nonce_jumps_never_chain(jump in 2u64..64, round in 1u64..64) {
            let genesis = meta(0, 0, None);
            let jumped = meta(jump, round, Some(&genesis));
            prop_assert!(!is_construction_valid(&jumped, Some(&genesis)));
        }
    }
}
