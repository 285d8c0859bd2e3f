// Transaction data structures

use crate::core::{Address, Hash256, KeyPair, OutputId, Signature, sha256_str};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Transaction output - an amount assigned to an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: Address,
    /// Amount in the smallest unit (1 coin = 1,000,000 units)
    pub amount: u64,
}

impl TxOutput {
    pub fn new(address: Address, amount: u64) -> Self {
        Self { address, amount }
    }

    /// Output identifier: `hash(tx_hash, address, amount)`
    pub fn id(&self, tx_hash: &Hash256) -> OutputId {
        let canonical = json!([tx_hash.to_hex(), self.address.to_hex(), self.amount]);
        sha256_str(&canonical.to_string())
    }
}

/// Transaction: spends prior outputs (inputs) and creates new ones
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Ids of the outputs being spent
    pub inputs: Vec<OutputId>,
    /// Newly created outputs
    pub outputs: Vec<TxOutput>,
    /// Creation time (Unix seconds)
    pub timestamp: u64,
    /// Unset until the owner signs
    pub signature: Option<Signature>,
}

impl Transaction {
    /// Create an unsigned transaction
    pub fn new(inputs: Vec<OutputId>, outputs: Vec<TxOutput>, timestamp: u64) -> Self {
        Self {
            inputs,
            outputs,
            timestamp,
            signature: None,
        }
    }

    /// Create a coinbase transaction (mining reward)
    pub fn coinbase(address: Address, amount: u64, timestamp: u64) -> Self {
        Self::new(vec![], vec![TxOutput::new(address, amount)], timestamp)
    }

    /// Check if this is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Canonical textual encoding of `(inputs, outputs, timestamp)`
    pub fn canonical(&self) -> String {
        let inputs: Vec<String> = self.inputs.iter().map(Hash256::to_hex).collect();
        let outputs: Vec<_> = self
            .outputs
            .iter()
            .map(|o| json!([o.address.to_hex(), o.amount]))
            .collect();
        json!([inputs, outputs, self.timestamp]).to_string()
    }

    /// Transaction hash. The signature is not part of the identity.
    pub fn hash(&self) -> Hash256 {
        sha256_str(&self.canonical())
    }

    /// Sign the transaction hash with `keypair`
    pub fn sign(&mut self, keypair: &KeyPair) {
        let hash = self.hash();
        self.signature = Some(keypair.sign(hash.to_hex().as_bytes()));
    }

    /// Fails closed: an unsigned transaction never verifies
    pub fn verify(&self) -> bool {
        match &self.signature {
            Some(signature) => signature.verify(self.hash().to_hex().as_bytes()),
            None => false,
        }
    }

    /// Address derived from the signing key, if signed
    pub fn signer(&self) -> Option<Address> {
        self.signature.as_ref().map(Signature::signer)
    }

    /// Ids of the outputs this transaction creates, in order
    pub fn output_ids(&self) -> Vec<OutputId> {
        let hash = self.hash();
        self.outputs.iter().map(|o| o.id(&hash)).collect()
    }

    /// Calculate total output value; `None` on overflow
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.amount))
    }
}
