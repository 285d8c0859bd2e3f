// Minichain - a minimal proof-of-work cryptocurrency

pub mod cli;
pub mod config;
pub mod consensus;
pub mod core;
pub mod mempool;
pub mod network;
pub mod storage;
pub mod wallet;

// Re-exports for convenience
pub use config::NodeConfig;
pub use consensus::{Miner, Rejection, TransactionError, difficulty, reward};
pub use core::{Address, Block, BlockHeader, Hash256, KeyPair, MerkleTree, Transaction, TxOutput};
pub use mempool::TransactionPool;
pub use network::{ChainSync, ForkChoice, Node};
pub use storage::{AppendOutcome, ChainStore, UtxoSet};
