// Pending transaction pool

use crate::consensus::TransactionError;
use crate::core::{Hash256, OutputId, Transaction};
use crate::storage::UtxoSet;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("transaction {0} is already pooled")]
    Duplicate(Hash256),
    #[error("transactions without inputs are only minted by block producers")]
    Coinbase,
    #[error("input {input} is already claimed by pooled transaction {claimed_by}")]
    Conflict { input: OutputId, claimed_by: Hash256 },
    #[error(transparent)]
    Invalid(#[from] TransactionError),
}

/// Transactions waiting to be mined, in arrival order.
///
/// No two pooled transactions spend the same output.
#[derive(Debug, Default)]
pub struct TransactionPool {
    transactions: Vec<Transaction>,
    /// input -> hash of the pooled transaction spending it
    claimed: HashMap<OutputId, Hash256>,
    /// Bumped on every change so the miner can notice a grown pool
    revision: u64,
}

impl TransactionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `tx` against `utxos` and pool it. Returns its fee.
    pub fn add(&mut self, tx: Transaction, utxos: &UtxoSet) -> Result<u64, PoolError> {
        let hash = tx.hash();
        if self.contains(&hash) {
            return Err(PoolError::Duplicate(hash));
        }
        if tx.is_coinbase() {
            return Err(PoolError::Coinbase);
        }
        if let Some((input, claimed_by)) = tx
            .inputs
            .iter()
            .find_map(|input| self.claimed.get(input).map(|by| (*input, *by)))
        {
            return Err(PoolError::Conflict { input, claimed_by });
        }

        let fee = utxos.validate_transaction(&tx)?;

        for input in &tx.inputs {
            self.claimed.insert(*input, hash);
        }
        self.transactions.push(tx);
        self.revision += 1;
        log::debug!("Pooled transaction {} (fee {})", hash, fee);
        Ok(fee)
    }

    /// Drop every transaction `utxos` no longer accepts, e.g. after a new
    /// tip spent its inputs. Returns how many were dropped.
    pub fn prune(&mut self, utxos: &UtxoSet) -> usize {
        let before = self.transactions.len();
        self.transactions
            .retain(|tx| utxos.validate_transaction(tx).is_ok());
        let dropped = before - self.transactions.len();

        if dropped > 0 {
            self.claimed = self
                .transactions
                .iter()
                .flat_map(|tx| {
                    let hash = tx.hash();
                    tx.inputs.iter().map(move |input| (*input, hash))
                })
                .collect();
            self.revision += 1;
            log::debug!("Pruned {} stale transactions from the pool", dropped);
        }
        dropped
    }

    /// Conflict-free batch valid against `utxos`, with its total fee
    pub fn select(&self, utxos: &UtxoSet, limit: usize) -> (Vec<Transaction>, u64) {
        let mut selected = Vec::new();
        let mut spent: HashSet<OutputId> = HashSet::new();
        let mut fees = 0u64;

        for tx in &self.transactions {
            if selected.len() >= limit {
                break;
            }
            if tx.inputs.iter().any(|input| spent.contains(input)) {
                continue;
            }
            let Ok(fee) = utxos.validate_transaction(tx) else {
                continue;
            };
            let Some(total) = fees.checked_add(fee) else {
                continue;
            };
            fees = total;
            spent.extend(tx.inputs.iter().copied());
            selected.push(tx.clone());
        }

        (selected, fees)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.transactions.iter().any(|tx| tx.hash() == *hash)
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}
