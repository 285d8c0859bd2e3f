// Persisted chain using sled

use crate::consensus::{Rejection, TransactionError, validate_block, validate_successor};
use crate::core::{Block, BlockHeader, Hash256, OutputId, Transaction, TxOutput, unix_now};
use crate::storage::rows::{
    self, BLOCK_INDEX, HEADER, HeaderRow, INPUT, LENGTH_KEY, MEMBERSHIP, OUTPUT, OutputRow, Row, TABLES,
    TRANSACTION, TxRow,
};
use crate::storage::{Utxo, UtxoSet};
use sled::transaction::{ConflictableTransactionResult, TransactionError as SledTransactionError};
use sled::{Db, IVec};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Infrastructure failures of the store. Validation failures are not
/// errors; they come back as `AppendOutcome::Rejected`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Self-verification failed; the store must not be used
    #[error("chain is corrupted at height {height}: {reason}")]
    InvalidChain { height: u64, reason: String },
    #[error("genesis block must have no predecessor, a matching transactions root and a past timestamp")]
    InvalidGenesis,
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("row encoding error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("malformed row: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Result of offering a block to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Accepted { height: u64 },
    /// The block hash is already stored; nothing changed
    AlreadyKnown,
    Rejected(Rejection),
}

/// Append-only block store.
///
/// A single writer at a time: `append` and `replace_with` hold the write
/// lock across validate and commit, readers share the read lock so they
/// never observe half of a block.
pub struct ChainStore {
    db: Db,
    lock: RwLock<()>,
}

impl ChainStore {
    /// Open (or create) a store with the default genesis block
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open_with_genesis(path, &Block::genesis())
    }

    /// Open a store, seeding `genesis` if it is empty
    pub fn open_with_genesis<P: AsRef<Path>>(path: P, genesis: &Block) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db, genesis)
    }

    /// In-memory store (for testing and for staging a replacement chain)
    pub fn memory() -> Result<Self, StoreError> {
        Self::memory_with_genesis(&Block::genesis())
    }

    pub fn memory_with_genesis(genesis: &Block) -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, genesis)
    }

    /// Wrap an open database. Seeds `genesis` when empty, then walks the
    /// whole chain; any tampering surfaces as `StoreError::InvalidChain`.
    pub fn from_db(db: Db, genesis: &Block) -> Result<Self, StoreError> {
        let store = Self {
            db,
            lock: RwLock::new(()),
        };

        if store.read_length()? == 0 {
            if !genesis.is_genesis() || !genesis.has_valid_root() || genesis.timestamp() > unix_now()
            {
                return Err(StoreError::InvalidGenesis);
            }
            store.commit(&[], &rows::encode_block(0, genesis)?, 1)?;
            log::info!("Initialized chain with genesis {}", genesis.hash());
        }

        store.verify()?;
        Ok(store)
    }

    /// Validate `block` against the tip and the ledger, then persist it
    /// atomically. Rejections leave the store untouched.
    pub fn append(&self, block: &Block) -> Result<AppendOutcome, StoreError> {
        let _guard = self.write_guard()?;

        let hash = block.hash();
        if self.db.contains_key(rows::hash_key(BLOCK_INDEX, &hash))? {
            return Ok(AppendOutcome::AlreadyKnown);
        }

        let height = self.read_length()?;
        let last = self.read_header_row(height.saturating_sub(1))?.ok_or_else(|| {
            StoreError::Corrupt(format!("missing header at height {}", height.saturating_sub(1)))
        })?;

        if let Err(e) = validate_block(&last.header(), block, unix_now()) {
            return Ok(AppendOutcome::Rejected(e.into()));
        }

        for tx in &block.transactions {
            let tx_hash = tx.hash();
            if self.db.contains_key(rows::hash_key(TRANSACTION, &tx_hash))? {
                return Ok(AppendOutcome::Rejected(Rejection::InvalidTransaction {
                    tx: tx_hash,
                    reason: TransactionError::AlreadyRecorded,
                }));
            }
        }

        if let Err(rejection) = self.read_utxos()?.check_block(block, height) {
            return Ok(AppendOutcome::Rejected(rejection));
        }

        self.commit(&[], &rows::encode_block(height, block)?, height + 1)?;
        log::info!("Appended block {} at height {}", hash, height);
        Ok(AppendOutcome::Accepted { height })
    }

    /// Number of stored blocks (genesis included)
    pub fn length(&self) -> Result<u64, StoreError> {
        let _guard = self.read_guard()?;
        self.read_length()
    }

    /// Genesis header and chain length, read under one lock so a concurrent
    /// replacement cannot mix two chains
    pub fn summary(&self) -> Result<(BlockHeader, u64), StoreError> {
        let _guard = self.read_guard()?;
        let genesis = self
            .read_header_row(0)?
            .ok_or_else(|| StoreError::Corrupt("missing genesis block".to_string()))?;
        Ok((genesis.header(), self.read_length()?))
    }

    /// Fully reconstructed block at `height`
    pub fn get(&self, height: u64) -> Result<Option<Block>, StoreError> {
        let _guard = self.read_guard()?;
        match self.read_header_row(height)? {
            Some(row) => Ok(Some(self.read_block(&row)?)),
            None => Ok(None),
        }
    }

    pub fn genesis(&self) -> Result<Block, StoreError> {
        self.get(0)?
            .ok_or_else(|| StoreError::Corrupt("missing genesis block".to_string()))
    }

    /// Tip of the chain
    pub fn last_block(&self) -> Result<Block, StoreError> {
        let _guard = self.read_guard()?;
        let height = self.read_length()?.saturating_sub(1);
        let row = self
            .read_header_row(height)?
            .ok_or_else(|| StoreError::Corrupt(format!("missing header at height {}", height)))?;
        self.read_block(&row)
    }

    /// Hash of the tip without loading its transactions
    pub fn tip_hash(&self) -> Result<Hash256, StoreError> {
        let _guard = self.read_guard()?;
        let height = self.read_length()?.saturating_sub(1);
        self.read_header_row(height)?
            .map(|row| row.hash)
            .ok_or_else(|| StoreError::Corrupt(format!("missing header at height {}", height)))
    }

    pub fn block_exists(&self, hash: &Hash256) -> Result<bool, StoreError> {
        let _guard = self.read_guard()?;
        Ok(self.db.contains_key(rows::hash_key(BLOCK_INDEX, hash))?)
    }

    pub fn height_of(&self, hash: &Hash256) -> Result<Option<u64>, StoreError> {
        let _guard = self.read_guard()?;
        match self.db.get(rows::hash_key(BLOCK_INDEX, hash))? {
            Some(bytes) => rows::decode_u64(&bytes)
                .map(Some)
                .ok_or_else(|| StoreError::Corrupt("block index entry".to_string())),
            None => Ok(None),
        }
    }

    /// All outputs minus all spent outputs over the stored chain
    pub fn get_utxos(&self) -> Result<UtxoSet, StoreError> {
        let _guard = self.read_guard()?;
        self.read_utxos()
    }

    /// Check a pending transaction against the current ledger.
    /// The outer result reports store failures, the inner one the verdict
    /// (the fee when valid).
    pub fn validate_transaction(
        &self,
        tx: &Transaction,
    ) -> Result<Result<u64, TransactionError>, StoreError> {
        Ok(self.get_utxos()?.validate_transaction(tx))
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Walk the stored chain: recompute every hash, re-check the
    /// transactions root, the transaction and output rows and the validity
    /// rule against the predecessor. Rows no stored block reaches are
    /// tampering too.
    pub fn verify(&self) -> Result<(), StoreError> {
        let _guard = self.read_guard()?;
        let length = self.read_length()?;
        let now = unix_now();
        let invalid_at = |height: u64| {
            move |e: StoreError| match e {
                StoreError::Codec(_) | StoreError::Corrupt(_) => StoreError::InvalidChain {
                    height,
                    reason: e.to_string(),
                },
                other => other,
            }
        };

        let mut blocks: HashSet<Hash256> = HashSet::new();
        let mut transactions: HashSet<Hash256> = HashSet::new();
        let mut previous: Option<BlockHeader> = None;
        for height in 0..length {
            let (header, hash, members) = self
                .verify_height(height, previous.as_ref(), now)
                .map_err(invalid_at(height))?;
            blocks.insert(hash);
            transactions.extend(members);
            previous = Some(header);
        }

        self.verify_unreachable_rows(length, &blocks, &transactions)
            .map_err(invalid_at(length.saturating_sub(1)))?;

        log::debug!("Verified {} stored blocks", length);
        Ok(())
    }

    /// Atomically swap the whole chain for the contents of `staged`
    pub fn replace_with(&self, staged: &ChainStore) -> Result<(), StoreError> {
        let (fresh, length) = {
            let _staged_guard = staged.read_guard()?;
            let mut fresh: Vec<Row> = Vec::new();
            for table in TABLES {
                for item in staged.db.scan_prefix([table]) {
                    let (key, value) = item?;
                    fresh.push((key.to_vec(), value.to_vec()));
                }
            }
            (fresh, staged.read_length()?)
        };

        let _guard = self.write_guard()?;
        let mut stale: Vec<IVec> = Vec::new();
        for table in TABLES {
            for key in self.db.scan_prefix([table]).keys() {
                stale.push(key?);
            }
        }

        self.commit(&stale, &fresh, length)?;
        log::info!("Replaced local chain with {} staged blocks", length);
        Ok(())
    }

    /// Checks one height; returns its header, hash and member transactions
    fn verify_height(
        &self,
        height: u64,
        previous: Option<&BlockHeader>,
        now: u64,
    ) -> Result<(BlockHeader, Hash256, Vec<Hash256>), StoreError> {
        let corrupted = |reason: String| StoreError::InvalidChain { height, reason };

        let row = self
            .read_header_row(height)?
            .ok_or_else(|| corrupted("missing header".to_string()))?;
        let header = row.header();
        let recomputed = header.hash();
        if recomputed != row.hash {
            return Err(corrupted(format!(
                "stored hash {} does not match recomputed {}",
                row.hash, recomputed
            )));
        }

        let indexed = self
            .db
            .get(rows::hash_key(BLOCK_INDEX, &row.hash))?
            .and_then(|bytes| rows::decode_u64(&bytes));
        if indexed != Some(height) {
            return Err(corrupted("block index does not point at this height".to_string()));
        }

        let members = self.read_membership(&row.hash)?;
        let mut transactions = Vec::with_capacity(members.len());
        for tx_hash in &members {
            let tx = self.read_transaction(tx_hash)?;
            if tx.hash() != *tx_hash {
                return Err(corrupted(format!("transaction rows of {} hash differently", tx_hash)));
            }
            self.verify_transaction_rows(tx_hash)?;
            transactions.push(tx);
        }

        let block = Block::new(row.header(), transactions);
        if !block.has_valid_root() {
            return Err(corrupted("transactions do not match the stored root".to_string()));
        }

        match previous {
            None if !header.prev_hash.is_none() => {
                return Err(corrupted("genesis block has a predecessor".to_string()));
            }
            None if header.timestamp > now => {
                return Err(corrupted("genesis block is dated in the future".to_string()));
            }
            None => {}
            Some(prev) => {
                validate_successor(prev, &header, now).map_err(|e| corrupted(e.to_string()))?;
            }
        }

        Ok((header, row.hash, members))
    }

    /// Stored hashes and output ids must match what the rows recompute to
    fn verify_transaction_rows(&self, tx_hash: &Hash256) -> Result<(), StoreError> {
        let row: TxRow = match self.db.get(rows::hash_key(TRANSACTION, tx_hash))? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => return Err(StoreError::Corrupt(format!("missing transaction {}", tx_hash))),
        };
        if row.hash != *tx_hash {
            return Err(StoreError::Corrupt(format!(
                "transaction row {} records hash {}",
                tx_hash, row.hash
            )));
        }

        for item in self.db.scan_prefix(rows::hash_key(OUTPUT, tx_hash)) {
            let (_, value) = item?;
            let output: OutputRow = serde_json::from_slice(&value)?;
            let expected = TxOutput::new(output.address, output.amount).id(tx_hash);
            if output.tx_hash != *tx_hash || output.output_id != expected {
                return Err(StoreError::Corrupt(format!(
                    "output row {} of transaction {} does not match its content",
                    output.output_id, tx_hash
                )));
            }
        }
        Ok(())
    }

    /// Every row must belong to a block within the stored length
    fn verify_unreachable_rows(
        &self,
        length: u64,
        blocks: &HashSet<Hash256>,
        transactions: &HashSet<Hash256>,
    ) -> Result<(), StoreError> {
        for key in self.db.scan_prefix([HEADER]).keys() {
            let key = key?;
            let height = key
                .get(1..)
                .and_then(rows::decode_u64)
                .ok_or_else(|| StoreError::Corrupt("header key".to_string()))?;
            if height >= length {
                return Err(StoreError::Corrupt(format!("header stored beyond the tip at height {}", height)));
            }
        }

        for (table, owners) in [
            (BLOCK_INDEX, blocks),
            (MEMBERSHIP, blocks),
            (TRANSACTION, transactions),
            (INPUT, transactions),
            (OUTPUT, transactions),
        ] {
            for key in self.db.scan_prefix([table]).keys() {
                let key = key?;
                let owner = parse_hash(key.get(1..33).unwrap_or_default())?;
                if !owners.contains(&owner) {
                    return Err(StoreError::Corrupt(format!(
                        "'{}' row of {} is not reachable from any stored block",
                        table as char, owner
                    )));
                }
            }
        }
        Ok(())
    }

    fn commit(&self, stale: &[IVec], fresh: &[Row], length: u64) -> Result<(), StoreError> {
        self.db
            .transaction(|tree| -> ConflictableTransactionResult<(), ()> {
                for key in stale {
                    tree.remove(&key[..])?;
                }
                for (key, value) in fresh {
                    tree.insert(key.as_slice(), value.as_slice())?;
                }
                tree.insert(LENGTH_KEY, &length.to_be_bytes()[..])?;
                Ok(())
            })
            .map_err(|e: SledTransactionError<()>| match e {
                SledTransactionError::Storage(err) => StoreError::Database(err),
                SledTransactionError::Abort(()) => {
                    StoreError::Corrupt("transaction aborted".to_string())
                }
            })?;
        self.db.flush()?;
        Ok(())
    }

    fn read_length(&self) -> Result<u64, StoreError> {
        match self.db.get(LENGTH_KEY)? {
            Some(bytes) => rows::decode_u64(&bytes)
                .ok_or_else(|| StoreError::Corrupt("chain length".to_string())),
            None => Ok(0),
        }
    }

    fn read_header_row(&self, height: u64) -> Result<Option<HeaderRow>, StoreError> {
        match self.db.get(rows::header_key(height))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_block(&self, row: &HeaderRow) -> Result<Block, StoreError> {
        let mut transactions = Vec::new();
        for tx_hash in self.read_membership(&row.hash)? {
            transactions.push(self.read_transaction(&tx_hash)?);
        }
        Ok(Block::new(row.header(), transactions))
    }

    /// Hashes of a block's transactions, in block order
    fn read_membership(&self, block_hash: &Hash256) -> Result<Vec<Hash256>, StoreError> {
        let mut members = Vec::new();
        for item in self.db.scan_prefix(rows::hash_key(MEMBERSHIP, block_hash)) {
            let (_, tx_hash) = item?;
            members.push(parse_hash(&tx_hash)?);
        }
        Ok(members)
    }

    fn read_transaction(&self, tx_hash: &Hash256) -> Result<Transaction, StoreError> {
        let row: TxRow = match self.db.get(rows::hash_key(TRANSACTION, tx_hash))? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => return Err(StoreError::Corrupt(format!("missing transaction {}", tx_hash))),
        };

        let mut inputs: Vec<OutputId> = Vec::new();
        for item in self.db.scan_prefix(rows::hash_key(INPUT, tx_hash)) {
            let (_, spent) = item?;
            inputs.push(parse_hash(&spent)?);
        }

        let mut outputs: Vec<OutputRow> = Vec::new();
        for item in self.db.scan_prefix(rows::hash_key(OUTPUT, tx_hash)) {
            let (_, value) = item?;
            outputs.push(serde_json::from_slice(&value)?);
        }

        Ok(rows::transaction_from_rows(row, inputs, outputs))
    }

    fn read_utxos(&self) -> Result<UtxoSet, StoreError> {
        let mut utxos = UtxoSet::new();
        for item in self.db.scan_prefix([OUTPUT]) {
            let (_, value) = item?;
            let row: OutputRow = serde_json::from_slice(&value)?;
            utxos.insert(row.output_id, Utxo::new(row.address, row.amount));
        }
        for item in self.db.scan_prefix([INPUT]) {
            let (_, spent) = item?;
            utxos.remove(&parse_hash(&spent)?);
        }
        Ok(utxos)
    }

    fn read_guard(&self) -> Result<RwLockReadGuard<'_, ()>, StoreError> {
        self.lock.read().map_err(|_| StoreError::Poisoned)
    }

    fn write_guard(&self) -> Result<RwLockWriteGuard<'_, ()>, StoreError> {
        self.lock.write().map_err(|_| StoreError::Poisoned)
    }
}

fn parse_hash(bytes: &[u8]) -> Result<Hash256, StoreError> {
    Hash256::from_slice(bytes).map_err(StoreError::Corrupt)
}
