// Block validity rule and rejection reasons

use crate::consensus::pow::{MAX_DIFFICULTY, difficulty, elapsed};
use crate::core::{Block, BlockHeader, Hash256, OutputId, unix_now};
use thiserror::Error;

/// Reasons a candidate block is rejected before its transactions are looked at
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("previous hash {found:?} does not match tip {expected}")]
    PrevHashMismatch {
        expected: Hash256,
        found: Option<Hash256>,
    },
    #[error("timestamp {timestamp} is in the future (now {now})")]
    FutureTimestamp { timestamp: u64, now: u64 },
    #[error("block follows its predecessor after {elapsed}s, minimum spacing is 31s")]
    TooSoon { elapsed: i64 },
    #[error("difficulty {0} exceeds the ceiling")]
    DifficultyTooHigh(u32),
    #[error("hash {hash} does not have {required} leading zeros")]
    InsufficientWork { hash: Hash256, required: u32 },
    #[error("transactions root does not match carried transactions")]
    TransactionsRootMismatch,
}

/// Reasons a transaction is rejected by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("transaction is not signed")]
    MissingSignature,
    #[error("signature does not verify")]
    InvalidSignature,
    #[error("input {0} is not an unspent output")]
    MissingInput(OutputId),
    #[error("input {0} belongs to a different address")]
    ForeignInput(OutputId),
    #[error("input {0} is listed twice")]
    DuplicateInput(OutputId),
    #[error("output {0} is created twice")]
    DuplicateOutput(OutputId),
    #[error("outputs ({outputs}) exceed inputs ({inputs})")]
    Overspend { inputs: u64, outputs: u64 },
    #[error("amount overflow")]
    AmountOverflow,
    #[error("coinbase must have no inputs and exactly one output")]
    MalformedCoinbase,
    #[error("coinbase pays {amount}, allowed {allowed}")]
    CoinbaseOverpays { amount: u64, allowed: u64 },
    #[error("transaction without inputs outside the coinbase position")]
    MisplacedCoinbase,
    #[error("transaction is already recorded in the chain")]
    AlreadyRecorded,
}

/// Why an append was refused. The store is untouched in every case.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("invalid block: {0}")]
    InvalidBlock(#[from] BlockError),
    #[error("invalid transaction {tx}: {reason}")]
    InvalidTransaction {
        tx: Hash256,
        reason: TransactionError,
    },
}

impl Rejection {
    /// Linkage failures hint that the sender is on another chain or ahead of us
    pub fn is_linkage(&self) -> bool {
        matches!(
            self,
            Rejection::InvalidBlock(BlockError::PrevHashMismatch { .. })
        )
    }
}

/// `valid(last, new)` evaluated against an explicit clock
pub fn validate_successor(
    last: &BlockHeader,
    new: &BlockHeader,
    now: u64,
) -> Result<(), BlockError> {
    let expected = last.hash();
    if new.prev_hash != Some(expected) {
        return Err(BlockError::PrevHashMismatch {
            expected,
            found: new.prev_hash,
        });
    }

    if new.timestamp > now {
        return Err(BlockError::FutureTimestamp {
            timestamp: new.timestamp,
            now,
        });
    }

    let required = match difficulty(last.timestamp, new.timestamp) {
        Some(d) if d > MAX_DIFFICULTY => return Err(BlockError::DifficultyTooHigh(d)),
        Some(d) => d,
        None => {
            return Err(BlockError::TooSoon {
                elapsed: elapsed(last.timestamp, new.timestamp),
            });
        }
    };

    let hash = new.hash();
    if hash.leading_zero_nibbles() < required {
        return Err(BlockError::InsufficientWork { hash, required });
    }

    Ok(())
}

/// `valid(last, new)` against the wall clock
pub fn validate_successor_now(last: &BlockHeader, new: &BlockHeader) -> Result<(), BlockError> {
    validate_successor(last, new, unix_now())
}

/// Header rule plus the transactions-root commitment
pub fn validate_block(last: &BlockHeader, block: &Block, now: u64) -> Result<(), BlockError> {
    validate_successor(last, &block.header, now)?;
    if !block.has_valid_root() {
        return Err(BlockError::TransactionsRootMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Address, Transaction, sha256};

    const NOW: u64 = 2_000_000_000;

    fn genesis() -> BlockHeader {
        BlockHeader::new(None, 1_000_000, 0, None)
    }

    fn child(last: &BlockHeader, timestamp: u64) -> BlockHeader {
        BlockHeader::new(None, timestamp, 0, Some(last.hash()))
    }

    /// Search nonces until the header meets the difficulty for its spacing
    fn mined_child(last: &BlockHeader, timestamp: u64) -> BlockHeader {
        let mut header = child(last, timestamp);
        while validate_successor(last, &header, NOW).is_err() {
            header.nonce += 1;
        }
        header
    }

    #[test]
    fn test_zero_difficulty_accepts_any_nonce() {
        let last = genesis();
        // 531s apart -> floor(500 / 501) = 0
        let header = child(&last, last.timestamp + 531);
        assert!(validate_successor(&last, &header, NOW).is_ok());
    }

    #[test]
    fn test_prev_hash_mismatch() {
        let last = genesis();
        let mut header = child(&last, last.timestamp + 1000);
        header.prev_hash = Some(sha256(b"elsewhere"));
        assert!(matches!(
            validate_successor(&last, &header, NOW),
            Err(BlockError::PrevHashMismatch { .. })
        ));

        header.prev_hash = None;
        assert!(matches!(
            validate_successor(&last, &header, NOW),
            Err(BlockError::PrevHashMismatch { found: None, .. })
        ));
    }

    #[test]
    fn test_predecessor_far_in_the_future() {
        let last = BlockHeader::new(None, 1 << 63, 0, None);
        let header = child(&last, 1000);
        assert_eq!(
            validate_successor(&last, &header, NOW),
            Err(BlockError::TooSoon { elapsed: i64::MIN })
        );
    }

    #[test]
    fn test_future_timestamp() {
        let last = genesis();
        let header = child(&last, NOW + 1);
        assert_eq!(
            validate_successor(&last, &header, NOW),
            Err(BlockError::FutureTimestamp { timestamp: NOW + 1, now: NOW })
        );
    }

    #[test]
    fn test_within_thirty_seconds_never_valid() {
        let last = genesis();
        for gap in [0, 1, 15, 30] {
            for nonce in 0..64 {
                let mut header = child(&last, last.timestamp + gap);
                header.nonce = nonce;
                assert!(matches!(
                    validate_successor(&last, &header, NOW),
                    Err(BlockError::TooSoon { .. })
                ));
            }
        }
    }

    #[test]
    fn test_earlier_than_predecessor_is_too_soon() {
        let last = genesis();
        let header = child(&last, last.timestamp - 100);
        assert_eq!(
            validate_successor(&last, &header, NOW),
            Err(BlockError::TooSoon { elapsed: -100 })
        );
    }

    #[test]
    fn test_difficulty_ceiling() {
        let last = genesis();
        // 37s apart -> floor(500 / 7) = 71 > 64
        let header = child(&last, last.timestamp + 37);
        assert_eq!(
            validate_successor(&last, &header, NOW),
            Err(BlockError::DifficultyTooHigh(71))
        );
    }

    #[test]
    fn test_insufficient_work() {
        let last = genesis();
        // 280s apart -> difficulty 2; find a nonce whose hash fails it
        let mut header = child(&last, last.timestamp + 280);
        while header.hash().leading_zero_nibbles() >= 2 {
            header.nonce += 1;
        }
        assert!(matches!(
            validate_successor(&last, &header, NOW),
            Err(BlockError::InsufficientWork { required: 2, .. })
        ));
    }

    #[test]
    fn test_mined_header_is_valid() {
        let last = genesis();
        // 280s apart -> difficulty 2, about 256 attempts on average
        let header = mined_child(&last, last.timestamp + 280);
        assert!(header.hash().leading_zero_nibbles() >= 2);
        assert!(validate_successor(&last, &header, NOW).is_ok());
    }

    #[test]
    fn test_root_mismatch() {
        let last = genesis();
        let tx = Transaction::coinbase(Address(sha256(b"m")), 1, 1);
        let block = Block::new(child(&last, last.timestamp + 1000), vec![tx]);
        assert_eq!(
            validate_block(&last, &block, NOW),
            Err(BlockError::TransactionsRootMismatch)
        );
    }

    #[test]
    fn test_linkage_rejection_flag() {
        let linkage = Rejection::from(BlockError::PrevHashMismatch {
            expected: Hash256::default(),
            found: None,
        });
        assert!(linkage.is_linkage());
        assert!(!Rejection::from(BlockError::TooSoon { elapsed: 1 }).is_linkage());
    }
}
