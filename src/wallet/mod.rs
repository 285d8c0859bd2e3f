// Wallet and transaction building

mod keystore;
mod tx_builder;

pub use keystore::Keystore;
pub use tx_builder::TransactionBuilder;

use crate::core::Address;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("keystore I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("keystore format error: {0}")]
    Format(#[from] serde_json::Error),
    #[error("invalid secret key: {0}")]
    InvalidKey(String),
    #[error("stored key does not derive address {0}")]
    AddressMismatch(Address),
    #[error("address {0} is not in the keystore")]
    UnknownAddress(Address),
    #[error("no default address, create one with 'wallet new-address'")]
    NoDefaultAddress,
    #[error("insufficient funds: have {available}, need {required}")]
    InsufficientFunds { available: u64, required: u64 },
    #[error("amount must be positive")]
    ZeroAmount,
    #[error("amount overflow")]
    AmountOverflow,
}
