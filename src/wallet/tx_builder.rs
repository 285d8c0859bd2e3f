// Transaction builder

use crate::core::{Address, OutputId, Transaction, TxOutput, unix_now};
use crate::storage::{Utxo, UtxoSet};
use crate::wallet::{Keystore, WalletError};

/// Builds signed payments from a wallet's unspent outputs
pub struct TransactionBuilder<'a> {
    keystore: &'a Keystore,
    utxo_set: &'a UtxoSet,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(keystore: &'a Keystore, utxo_set: &'a UtxoSet) -> Self {
        Self { keystore, utxo_set }
    }

    /// Pay `amount` to `to` from `from`, leaving `fee` to the miner.
    /// Any surplus of the selected outputs returns to `from` as change.
    pub fn build(
        &self,
        from: &Address,
        to: &Address,
        amount: u64,
        fee: u64,
    ) -> Result<Transaction, WalletError> {
        self.build_at(from, to, amount, fee, unix_now())
    }

    pub fn build_at(
        &self,
        from: &Address,
        to: &Address,
        amount: u64,
        fee: u64,
        timestamp: u64,
    ) -> Result<Transaction, WalletError> {
        if amount == 0 {
            return Err(WalletError::ZeroAmount);
        }
        let keypair = self
            .keystore
            .get_keypair(from)
            .ok_or(WalletError::UnknownAddress(*from))?;

        let target = amount.checked_add(fee).ok_or(WalletError::AmountOverflow)?;
        let (inputs, total_input) = self.select_utxos(&self.utxo_set.owned_by(from), target)?;

        let change = total_input - target;
        // paying oneself: a separate change output could duplicate the payment
        let outputs = if change > 0 && to != from {
            vec![TxOutput::new(*to, amount), TxOutput::new(*from, change)]
        } else {
            vec![TxOutput::new(*to, amount + change)]
        };

        let mut tx = Transaction::new(inputs, outputs, timestamp);
        tx.sign(keypair);
        log::debug!(
            "Built transaction {} spending {} outputs (change {})",
            tx.hash(),
            tx.inputs.len(),
            change
        );
        Ok(tx)
    }

    /// Take outputs in order until `target` is covered
    fn select_utxos(
        &self,
        utxos: &[(OutputId, Utxo)],
        target: u64,
    ) -> Result<(Vec<OutputId>, u64), WalletError> {
        let mut selected = Vec::new();
        let mut total = 0u64;

        for (id, utxo) in utxos {
            selected.push(*id);
            total = total.checked_add(utxo.amount).ok_or(WalletError::AmountOverflow)?;

            if total >= target {
                return Ok((selected, total));
            }
        }

        Err(WalletError::InsufficientFunds {
            available: total,
            required: target,
        })
    }

    /// Balance of one address
    pub fn get_balance(&self, address: &Address) -> u64 {
        self.utxo_set.balance(address)
    }

    /// Combined balance of every address in the keystore
    pub fn total_balance(&self) -> u64 {
        self.keystore
            .list_addresses()
            .iter()
            .map(|address| self.utxo_set.balance(address))
            .sum()
    }

    pub fn list_utxos(&self, address: &Address) -> Vec<(OutputId, Utxo)> {
        self.utxo_set.owned_by(address)
    }
}
