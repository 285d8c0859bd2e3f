// Core ledger data structures

mod types;
mod hash;
mod merkle;
mod address;
mod transaction;
mod block;

pub use types::*;
pub use hash::*;
pub use merkle::*;
pub use address::*;
pub use transaction::*;
pub use block::*;

/// Current Unix time in seconds
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
