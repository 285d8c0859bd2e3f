// Proof of Work: difficulty retarget, reward schedule and the nonce search

use crate::core::{Block, BlockHeader};
use std::thread;
use std::time::{Duration, Instant};

/// Highest difficulty a block may carry; a 64-char hex hash cannot exceed it
pub const MAX_DIFFICULTY: u32 = 64;

/// Blocks closer than this many seconds to their predecessor are unmineable
pub const MIN_BLOCK_SPACING: i64 = 30;

/// Numerator of the retarget curve
const DIFFICULTY_SCALE: i64 = 500;

/// 1 coin in the smallest unit
pub const COIN: u64 = 1_000_000;

/// Reward of the first era (50 coins)
pub const INITIAL_REWARD: u64 = 50 * COIN;

/// Heights per halving: roughly a year of one-minute blocks
pub const HALVING_INTERVAL: u64 = 525_960;

/// Required leading zero hex characters for a block at `new_ts` following
/// one at `last_ts`. `None` means unbounded: the block is too close to its
/// predecessor to ever be valid.
pub fn difficulty(last_ts: u64, new_ts: u64) -> Option<u32> {
    let gap = elapsed(last_ts, new_ts);
    if gap <= MIN_BLOCK_SPACING {
        return None;
    }
    let d = DIFFICULTY_SCALE / (gap - MIN_BLOCK_SPACING);
    Some(u32::try_from(d).unwrap_or(u32::MAX))
}

/// Signed seconds from `last_ts` to `new_ts`, saturating at the `i64` range
pub fn elapsed(last_ts: u64, new_ts: u64) -> i64 {
    let gap = i128::from(new_ts) - i128::from(last_ts);
    i64::try_from(gap).unwrap_or(if gap < 0 { i64::MIN } else { i64::MAX })
}

/// Coinbase reward at `height`, halving every `HALVING_INTERVAL` blocks
pub fn reward(height: u64) -> u64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_REWARD >> halvings
}

/// Outcome of a mining attempt
#[derive(Debug)]
pub struct MiningResult {
    /// The sealed block, `None` if the attempt was interrupted
    pub block: Option<Block>,
    /// Number of hashes tried
    pub attempts: u64,
    /// Time taken
    pub duration: Duration,
}

impl MiningResult {
    pub fn success(&self) -> bool {
        self.block.is_some()
    }

    /// Calculate hash rate (hashes per second)
    pub fn hash_rate(&self) -> f64 {
        self.attempts as f64 / self.duration.as_secs_f64()
    }
}

/// Cooperative proof-of-work miner.
///
/// Every candidate nonce re-stamps the header with the current time, so the
/// difficulty relaxes while the search runs. The caller's `interrupted`
/// predicate is polled before each attempt; it should report a changed tip
/// or a grown transaction pool so the block can be reassembled.
pub struct Miner {
    /// Pause while the minimum spacing has not elapsed yet
    idle_wait: Duration,
}

impl Miner {
    pub fn new() -> Self {
        Self {
            idle_wait: Duration::from_millis(250),
        }
    }

    pub fn with_idle_wait(idle_wait: Duration) -> Self {
        Self { idle_wait }
    }

    /// Search for a nonce sealing `block` on top of `last`
    pub fn mine<C, I>(&self, last: &BlockHeader, mut block: Block, clock: C, interrupted: I) -> MiningResult
    where
        C: Fn() -> u64,
        I: Fn() -> bool,
    {
        let start_time = Instant::now();
        let mut attempts = 0u64;

        loop {
            if interrupted() {
                return MiningResult {
                    block: None,
                    attempts,
                    duration: start_time.elapsed(),
                };
            }

            let now = clock();
            block.header.timestamp = now;

            let required = match difficulty(last.timestamp, now) {
                Some(d) if d <= MAX_DIFFICULTY => d,
                _ => {
                    thread::sleep(self.idle_wait);
                    continue;
                }
            };

            attempts += 1;
            if block.header.hash().leading_zero_nibbles() >= required {
                log::debug!(
                    "Sealed block {} after {} attempts (difficulty {})",
                    block.hash(),
                    attempts,
                    required
                );
                return MiningResult {
                    block: Some(block),
                    attempts,
                    duration: start_time.elapsed(),
                };
            }

            block.header.nonce = block.header.nonce.wrapping_add(1);

            if attempts % 100_000 == 0 {
                let elapsed = start_time.elapsed();
                log::debug!("Mining attempts: {} ({:.1} KH/s)",
                    attempts,
                    attempts as f64 / elapsed.as_secs_f64() / 1000.0
                );
            }
        }
    }
}

impl Default for Miner {
    fn default() -> Self {
        Self::new()
    }
}
