// UTXO (Unspent Transaction Output) set and ledger rules

use crate::consensus::{Rejection, TransactionError, reward};
use crate::core::{Address, Block, OutputId, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Unspent output: who owns it and how much
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub address: Address,
    pub amount: u64,
}

impl Utxo {
    pub fn new(address: Address, amount: u64) -> Self {
        Self { address, amount }
    }
}

/// Snapshot of the unspent outputs derived from a chain.
///
/// Never persisted; `ChainStore::get_utxos` recomputes it from the stored
/// inputs and outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoSet {
    utxos: HashMap<OutputId, Utxo>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &OutputId) -> Option<&Utxo> {
        self.utxos.get(id)
    }

    pub fn contains(&self, id: &OutputId) -> bool {
        self.utxos.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutputId, &Utxo)> {
        self.utxos.iter()
    }

    pub(crate) fn insert(&mut self, id: OutputId, utxo: Utxo) {
        self.utxos.insert(id, utxo);
    }

    pub(crate) fn remove(&mut self, id: &OutputId) -> Option<Utxo> {
        self.utxos.remove(id)
    }

    /// Sum of all outputs owned by `address`
    pub fn balance(&self, address: &Address) -> u64 {
        self.utxos
            .values()
            .filter(|u| u.address == *address)
            .map(|u| u.amount)
            .sum()
    }

    /// Outputs owned by `address`, sorted by id for deterministic selection
    pub fn owned_by(&self, address: &Address) -> Vec<(OutputId, Utxo)> {
        let mut owned: Vec<(OutputId, Utxo)> = self
            .utxos
            .iter()
            .filter(|(_, u)| u.address == *address)
            .map(|(id, u)| (*id, u.clone()))
            .collect();
        owned.sort_by_key(|(id, _)| *id);
        owned
    }

    /// Check a spending transaction against this snapshot. Returns the fee
    /// (inputs minus outputs) on success.
    pub fn validate_transaction(&self, tx: &Transaction) -> Result<u64, TransactionError> {
        self.validate_excluding(tx, &HashSet::new())
    }

    /// Like `validate_transaction`, treating `spent` as already consumed
    fn validate_excluding(
        &self,
        tx: &Transaction,
        spent: &HashSet<OutputId>,
    ) -> Result<u64, TransactionError> {
        let signer = match &tx.signature {
            None => return Err(TransactionError::MissingSignature),
            Some(signature) => signature.signer(),
        };
        if !tx.verify() {
            return Err(TransactionError::InvalidSignature);
        }

        let mut seen = HashSet::with_capacity(tx.inputs.len());
        let mut total_in = 0u64;
        for input in &tx.inputs {
            if !seen.insert(*input) {
                return Err(TransactionError::DuplicateInput(*input));
            }
            let utxo = match self.utxos.get(input) {
                Some(utxo) if !spent.contains(input) => utxo,
                _ => return Err(TransactionError::MissingInput(*input)),
            };
            if utxo.address != signer {
                return Err(TransactionError::ForeignInput(*input));
            }
            total_in = total_in
                .checked_add(utxo.amount)
                .ok_or(TransactionError::AmountOverflow)?;
        }

        check_unique_outputs(tx)?;

        let total_out = tx
            .total_output_value()
            .ok_or(TransactionError::AmountOverflow)?;
        if total_out > total_in {
            return Err(TransactionError::Overspend {
                inputs: total_in,
                outputs: total_out,
            });
        }

        Ok(total_in - total_out)
    }

    /// Check every transaction of a block appended at `height`.
    ///
    /// Spending transactions are validated against this snapshot; an
    /// output consumed earlier in the block is unavailable to later ones.
    /// The first transaction is the coinbase and may pay at most
    /// `reward(height)` plus the collected fees. Returns the total fees.
    pub fn check_block(&self, block: &Block, height: u64) -> Result<u64, Rejection> {
        let Some((coinbase, spends)) = block.transactions.split_first() else {
            return Ok(0);
        };

        let mut spent = HashSet::new();
        let mut fees = 0u64;
        for tx in spends {
            let reject = |reason| Rejection::InvalidTransaction {
                tx: tx.hash(),
                reason,
            };
            if tx.is_coinbase() {
                return Err(reject(TransactionError::MisplacedCoinbase));
            }
            let fee = self.validate_excluding(tx, &spent).map_err(reject)?;
            fees = fees
                .checked_add(fee)
                .ok_or_else(|| reject(TransactionError::AmountOverflow))?;
            spent.extend(tx.inputs.iter().copied());
        }

        let reject = |reason| Rejection::InvalidTransaction {
            tx: coinbase.hash(),
            reason,
        };
        if !coinbase.is_coinbase() || coinbase.outputs.len() != 1 {
            return Err(reject(TransactionError::MalformedCoinbase));
        }
        let allowed = reward(height).saturating_add(fees);
        let amount = coinbase.outputs[0].amount;
        if amount > allowed {
            return Err(reject(TransactionError::CoinbaseOverpays { amount, allowed }));
        }

        Ok(fees)
    }

    /// Consume the inputs and add the outputs of `tx`
    pub fn apply_transaction(&mut self, tx: &Transaction) {
        for input in &tx.inputs {
            self.utxos.remove(input);
        }
        let hash = tx.hash();
        for output in &tx.outputs {
            self.utxos
                .insert(output.id(&hash), Utxo::new(output.address, output.amount));
        }
    }

    pub fn apply_block(&mut self, block: &Block) {
        for tx in &block.transactions {
            self.apply_transaction(tx);
        }
    }
}

fn check_unique_outputs(tx: &Transaction) -> Result<(), TransactionError> {
    let mut ids = HashSet::with_capacity(tx.outputs.len());
    for id in tx.output_ids() {
        if !ids.insert(id) {
            return Err(TransactionError::DuplicateOutput(id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Hash256, KeyPair, TxOutput, sha256};

    struct Fixture {
        alice: KeyPair,
        bob: KeyPair,
        utxos: UtxoSet,
        /// Alice's funding outputs
        funds: Vec<OutputId>,
    }

    fn fixture() -> Fixture {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut utxos = UtxoSet::new();

        let funding = Transaction::new(
            vec![],
            vec![TxOutput::new(alice.address(), 1000), TxOutput::new(alice.address(), 500)],
            1,
        );
        utxos.apply_transaction(&funding);
        let funds = funding.output_ids();

        Fixture { alice, bob, utxos, funds }
    }

    fn spend(kp: &KeyPair, inputs: Vec<OutputId>, outputs: Vec<TxOutput>) -> Transaction {
        let mut tx = Transaction::new(inputs, outputs, 2);
        tx.sign(kp);
        tx
    }

    fn block_with(transactions: Vec<Transaction>) -> Block {
        Block::assemble(Hash256::default(), 100, transactions)
    }

    #[test]
    fn test_valid_transfer_returns_fee() {
        let f = fixture();
        let tx = spend(&f.alice, vec![f.funds[0]], vec![TxOutput::new(f.bob.address(), 900)]);
        assert_eq!(f.utxos.validate_transaction(&tx), Ok(100));
    }

    #[test]
    fn test_unsigned_rejected() {
        let f = fixture();
        let tx = Transaction::new(vec![f.funds[0]], vec![TxOutput::new(f.bob.address(), 1)], 2);
        assert_eq!(
            f.utxos.validate_transaction(&tx),
            Err(TransactionError::MissingSignature)
        );
    }

    #[test]
    fn test_tampered_rejected() {
        let f = fixture();
        let mut tx = spend(&f.alice, vec![f.funds[0]], vec![TxOutput::new(f.bob.address(), 900)]);
        tx.outputs[0].amount = 950;
        assert_eq!(
            f.utxos.validate_transaction(&tx),
            Err(TransactionError::InvalidSignature)
        );
    }

    #[test]
    fn test_missing_input_rejected() {
        let f = fixture();
        let unknown = sha256(b"never existed");
        let tx = spend(&f.alice, vec![unknown], vec![]);
        assert_eq!(
            f.utxos.validate_transaction(&tx),
            Err(TransactionError::MissingInput(unknown))
        );
    }

    #[test]
    fn test_foreign_input_rejected() {
        let f = fixture();
        // bob signs a spend of alice's output
        let tx = spend(&f.bob, vec![f.funds[0]], vec![TxOutput::new(f.bob.address(), 10)]);
        assert_eq!(
            f.utxos.validate_transaction(&tx),
            Err(TransactionError::ForeignInput(f.funds[0]))
        );
    }

    #[test]
    fn test_overspend_rejected() {
        let f = fixture();
        let tx = spend(&f.alice, vec![f.funds[1]], vec![TxOutput::new(f.bob.address(), 501)]);
        assert_eq!(
            f.utxos.validate_transaction(&tx),
            Err(TransactionError::Overspend { inputs: 500, outputs: 501 })
        );
    }

    #[test]
    fn test_duplicate_input_rejected() {
        let f = fixture();
        let tx = spend(
            &f.alice,
            vec![f.funds[0], f.funds[0]],
            vec![TxOutput::new(f.bob.address(), 1500)],
        );
        assert_eq!(
            f.utxos.validate_transaction(&tx),
            Err(TransactionError::DuplicateInput(f.funds[0]))
        );
    }

    #[test]
    fn test_duplicate_output_rejected() {
        let f = fixture();
        let tx = spend(
            &f.alice,
            vec![f.funds[0]],
            vec![TxOutput::new(f.bob.address(), 10), TxOutput::new(f.bob.address(), 10)],
        );
        assert!(matches!(
            f.utxos.validate_transaction(&tx),
            Err(TransactionError::DuplicateOutput(_))
        ));
    }

    #[test]
    fn test_double_spend_within_block_rejected() {
        let f = fixture();
        let first = spend(&f.alice, vec![f.funds[0]], vec![TxOutput::new(f.bob.address(), 1000)]);
        let second = spend(&f.alice, vec![f.funds[0]], vec![TxOutput::new(f.alice.address(), 1000)]);
        let coinbase = Transaction::coinbase(f.bob.address(), reward(1), 3);

        let block = block_with(vec![coinbase, first, second.clone()]);
        assert_eq!(
            f.utxos.check_block(&block, 1),
            Err(Rejection::InvalidTransaction {
                tx: second.hash(),
                reason: TransactionError::MissingInput(f.funds[0]),
            })
        );
    }

    #[test]
    fn test_outputs_of_same_block_not_spendable() {
        let f = fixture();
        let first = spend(&f.alice, vec![f.funds[0]], vec![TxOutput::new(f.alice.address(), 1000)]);
        let chained = spend(&f.alice, first.output_ids(), vec![TxOutput::new(f.bob.address(), 1000)]);
        let coinbase = Transaction::coinbase(f.bob.address(), reward(1), 3);

        let block = block_with(vec![coinbase, first, chained]);
        assert!(matches!(
            f.utxos.check_block(&block, 1),
            Err(Rejection::InvalidTransaction { reason: TransactionError::MissingInput(_), .. })
        ));
    }

    #[test]
    fn test_coinbase_collects_fees() {
        let f = fixture();
        let tx = spend(&f.alice, vec![f.funds[0]], vec![TxOutput::new(f.bob.address(), 700)]);
        let coinbase = Transaction::coinbase(f.bob.address(), reward(1) + 300, 3);

        let block = block_with(vec![coinbase, tx]);
        assert_eq!(f.utxos.check_block(&block, 1), Ok(300));
    }

    #[test]
    fn test_coinbase_overpay_rejected() {
        let f = fixture();
        let coinbase = Transaction::coinbase(f.bob.address(), reward(1) + 1, 3);
        let block = block_with(vec![coinbase]);
        assert!(matches!(
            f.utxos.check_block(&block, 1),
            Err(Rejection::InvalidTransaction {
                reason: TransactionError::CoinbaseOverpays { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_coinbase_shape() {
        let f = fixture();
        let two_outputs = Transaction::new(
            vec![],
            vec![TxOutput::new(f.bob.address(), 1), TxOutput::new(f.alice.address(), 1)],
            3,
        );
        assert!(matches!(
            f.utxos.check_block(&block_with(vec![two_outputs]), 1),
            Err(Rejection::InvalidTransaction { reason: TransactionError::MalformedCoinbase, .. })
        ));

        let spend_first = spend(&f.alice, vec![f.funds[0]], vec![TxOutput::new(f.bob.address(), 1)]);
        assert!(matches!(
            f.utxos.check_block(&block_with(vec![spend_first]), 1),
            Err(Rejection::InvalidTransaction { reason: TransactionError::MalformedCoinbase, .. })
        ));
    }

    #[test]
    fn test_second_coinbase_rejected() {
        let f = fixture();
        let coinbase = Transaction::coinbase(f.bob.address(), 1, 3);
        let extra = Transaction::coinbase(f.alice.address(), 1, 4);
        assert!(matches!(
            f.utxos.check_block(&block_with(vec![coinbase, extra]), 1),
            Err(Rejection::InvalidTransaction { reason: TransactionError::MisplacedCoinbase, .. })
        ));
    }

    #[test]
    fn test_empty_block_has_no_fees() {
        let f = fixture();
        assert_eq!(f.utxos.check_block(&block_with(vec![]), 1), Ok(0));
    }

    #[test]
    fn test_apply_and_balance() {
        let mut f = fixture();
        assert_eq!(f.utxos.balance(&f.alice.address()), 1500);

        let tx = spend(
            &f.alice,
            vec![f.funds[0]],
            vec![TxOutput::new(f.bob.address(), 600), TxOutput::new(f.alice.address(), 350)],
        );
        f.utxos.apply_transaction(&tx);

        assert!(!f.utxos.contains(&f.funds[0]));
        assert_eq!(f.utxos.balance(&f.alice.address()), 850);
        assert_eq!(f.utxos.balance(&f.bob.address()), 600);
        assert_eq!(f.utxos.owned_by(&f.alice.address()).len(), 2);
    }
}
