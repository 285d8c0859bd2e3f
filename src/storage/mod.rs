// Storage layer: persisted chain and the UTXO ledger derived from it

mod chain_store;
mod rows;
mod utxo_set;

pub use chain_store::{AppendOutcome, ChainStore, StoreError};
pub use utxo_set::{Utxo, UtxoSet};
