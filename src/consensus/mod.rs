// Consensus and validation logic

pub mod pow;
pub mod validation;

pub use pow::{Miner, MiningResult, difficulty, reward};
pub use validation::{
    BlockError, Rejection, TransactionError, validate_block, validate_successor,
    validate_successor_now,
};
