// Hashing utilities

use sha2::{Sha256, Digest};
use crate::core::Hash256;

/// Single SHA256 hash
pub fn sha256(data: &[u8]) -> Hash256 {
    Hash256::new(Sha256::digest(data).into())
}

/// Hash of a canonical textual encoding
pub fn sha256_str(text: &str) -> Hash256 {
    sha256(text.as_bytes())
}

/// Parent node of two Merkle children: the hex forms are concatenated
/// and hashed
pub fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut joined = String::with_capacity(128);
    joined.push_str(&left.to_hex());
    joined.push_str(&right.to_hex());
    sha256_str(&joined)
}
