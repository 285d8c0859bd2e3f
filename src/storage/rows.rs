// Row layout of the persisted chain
//
// Everything lives in one sled tree; the first key byte names the table:
//   'h' height            -> HeaderRow
//   'b' block hash        -> height
//   't' tx hash           -> TxRow
//   'i' tx hash ‖ index   -> spent output id
//   'o' tx hash ‖ index   -> OutputRow
//   'm' block hash ‖ pos  -> tx hash
//   "length"              -> number of stored blocks

use crate::core::{Address, Block, BlockHeader, Hash256, OutputId, Signature, Transaction, TxOutput};
use serde::{Deserialize, Serialize};

pub const HEADER: u8 = b'h';
pub const BLOCK_INDEX: u8 = b'b';
pub const TRANSACTION: u8 = b't';
pub const INPUT: u8 = b'i';
pub const OUTPUT: u8 = b'o';
pub const MEMBERSHIP: u8 = b'm';
pub const LENGTH_KEY: &[u8] = b"length";

/// Key prefixes of every table, used when the whole chain is replaced
pub const TABLES: [u8; 6] = [HEADER, BLOCK_INDEX, TRANSACTION, INPUT, OUTPUT, MEMBERSHIP];

/// `(transactions_root, timestamp, nonce, prev_hash, hash)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRow {
    pub transactions_root: Option<Hash256>,
    pub timestamp: u64,
    pub nonce: u64,
    pub prev_hash: Option<Hash256>,
    /// Hash at insertion time, re-checked on load
    pub hash: Hash256,
}

impl HeaderRow {
    pub fn from_header(header: &BlockHeader) -> Self {
        Self {
            transactions_root: header.transactions_root,
            timestamp: header.timestamp,
            nonce: header.nonce,
            prev_hash: header.prev_hash,
            hash: header.hash(),
        }
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader::new(self.transactions_root, self.timestamp, self.nonce, self.prev_hash)
    }
}

/// `(timestamp, public_key, signature, tx_hash)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRow {
    pub timestamp: u64,
    pub signature: Option<Signature>,
    pub hash: Hash256,
}

/// `(output_id, tx_hash, address, amount)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRow {
    pub output_id: OutputId,
    pub tx_hash: Hash256,
    pub address: Address,
    pub amount: u64,
}

pub type Row = (Vec<u8>, Vec<u8>);

/// Every key/value pair a block at `height` contributes
pub fn encode_block(height: u64, block: &Block) -> Result<Vec<Row>, serde_json::Error> {
    let block_hash = block.hash();
    let mut rows = vec![
        (
            header_key(height),
            serde_json::to_vec(&HeaderRow::from_header(&block.header))?,
        ),
        (
            hash_key(BLOCK_INDEX, &block_hash),
            height.to_be_bytes().to_vec(),
        ),
    ];

    for (position, tx) in block.transactions.iter().enumerate() {
        let tx_hash = tx.hash();
        rows.push((
            indexed_key(MEMBERSHIP, &block_hash, position),
            tx_hash.0.to_vec(),
        ));

        let row = TxRow {
            timestamp: tx.timestamp,
            signature: tx.signature.clone(),
            hash: tx_hash,
        };
        rows.push((hash_key(TRANSACTION, &tx_hash), serde_json::to_vec(&row)?));

        for (index, input) in tx.inputs.iter().enumerate() {
            rows.push((indexed_key(INPUT, &tx_hash, index), input.0.to_vec()));
        }

        for (index, output) in tx.outputs.iter().enumerate() {
            let row = OutputRow {
                output_id: output.id(&tx_hash),
                tx_hash,
                address: output.address,
                amount: output.amount,
            };
            rows.push((indexed_key(OUTPUT, &tx_hash, index), serde_json::to_vec(&row)?));
        }
    }

    Ok(rows)
}

/// Rebuild a transaction from its rows
pub fn transaction_from_rows(row: TxRow, inputs: Vec<OutputId>, outputs: Vec<OutputRow>) -> Transaction {
    Transaction {
        inputs,
        outputs: outputs
            .into_iter()
            .map(|o| TxOutput::new(o.address, o.amount))
            .collect(),
        timestamp: row.timestamp,
        signature: row.signature,
    }
}

/// Big-endian so sled iterates headers in chain order
pub fn header_key(height: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(HEADER);
    key.extend_from_slice(&height.to_be_bytes());
    key
}

pub fn hash_key(table: u8, hash: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(table);
    key.extend_from_slice(hash.as_bytes());
    key
}

/// `table ‖ hash ‖ index` keeps a transaction's inputs/outputs (or a
/// block's transactions) contiguous and ordered under `hash_key`
pub fn indexed_key(table: u8, hash: &Hash256, index: usize) -> Vec<u8> {
    let mut key = hash_key(table, hash);
    key.extend_from_slice(&(index as u32).to_be_bytes());
    key
}

pub fn decode_u64(bytes: &[u8]) -> Option<u64> {
    let array: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(array))
}
