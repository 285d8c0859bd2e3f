// Block data structures

use crate::core::{Hash256, MerkleTree, Transaction, sha256_str};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Timestamp of the default genesis block (2023-11-14T22:13:20Z)
pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Merkle root of the transaction hashes, `None` for an empty block
    pub transactions_root: Option<Hash256>,
    /// Block timestamp (Unix seconds)
    pub timestamp: u64,
    /// Nonce for proof-of-work
    pub nonce: u64,
    /// Hash of the previous block, `None` only for genesis
    pub prev_hash: Option<Hash256>,
}

impl BlockHeader {
    /// Create a new block header
    pub fn new(
        transactions_root: Option<Hash256>,
        timestamp: u64,
        nonce: u64,
        prev_hash: Option<Hash256>,
    ) -> Self {
        Self {
            transactions_root,
            timestamp,
            nonce,
            prev_hash,
        }
    }

    /// Canonical textual encoding `[root, timestamp, nonce, prev]`
    pub fn canonical(&self) -> String {
        json!([
            self.transactions_root.map(|h| h.to_hex()),
            self.timestamp,
            self.nonce,
            self.prev_hash.map(|h| h.to_hex()),
        ])
        .to_string()
    }

    /// Calculate the hash of this block header
    pub fn hash(&self) -> Hash256 {
        sha256_str(&self.canonical())
    }
}

/// Block - contains header and transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    /// Transactions in this block; the first one, if any, is the coinbase
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create a new block
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// Assemble a block on top of `prev_hash`, computing the transactions root
    pub fn assemble(
        prev_hash: Hash256,
        timestamp: u64,
        transactions: Vec<Transaction>,
    ) -> Self {
        let root = Self::compute_transactions_root(&transactions);
        Self::new(
            BlockHeader::new(root, timestamp, 0, Some(prev_hash)),
            transactions,
        )
    }

    /// Default genesis block: empty, no predecessor
    pub fn genesis() -> Self {
        Self::new(BlockHeader::new(None, GENESIS_TIMESTAMP, 0, None), vec![])
    }

    /// Merkle root over the transaction hashes
    pub fn compute_transactions_root(transactions: &[Transaction]) -> Option<Hash256> {
        MerkleTree::from_leaves(transactions.iter().map(Transaction::hash)).root()
    }

    /// Check that the header commits to the carried transactions
    pub fn has_valid_root(&self) -> bool {
        Self::compute_transactions_root(&self.transactions) == self.header.transactions_root
    }

    /// Get the block hash
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn prev_hash(&self) -> Option<Hash256> {
        self.header.prev_hash
    }

    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    /// Check if this is the genesis block
    pub fn is_genesis(&self) -> bool {
        self.header.prev_hash.is_none()
    }
}
