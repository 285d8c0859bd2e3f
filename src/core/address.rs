// Addresses, key pairs and signatures

use crate::core::{Hash256, hex_bytes, sha256};
use rand::rngs::OsRng;
use secp256k1::{ecdsa, Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Public identity: SHA-256 of a serialized public key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub Hash256);

impl Address {
    /// Derive the address owning a serialized public key
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(sha256(public_key))
    }

    pub fn from_hex(s: &str) -> Result<Self, String> {
        Hash256::from_hex(s).map(Self)
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(public_key, signature)` pair attached to a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Compressed secp256k1 public key
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    /// DER-encoded ECDSA signature over `sha256(data)`
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl Signature {
    /// Address of the key that produced this signature
    pub fn signer(&self) -> Address {
        Address::from_public_key(&self.public_key)
    }

    /// Check the signature over `data`. Malformed keys or signatures
    /// verify as false.
    pub fn verify(&self, data: &[u8]) -> bool {
        let Ok(public_key) = PublicKey::from_slice(&self.public_key) else {
            return false;
        };
        let Ok(signature) = ecdsa::Signature::from_der(&self.signature) else {
            return false;
        };
        let message = Message::from_digest(sha256(data).0);
        Secp256k1::verification_only()
            .verify_ecdsa(&message, &signature, &public_key)
            .is_ok()
    }
}

/// Key pair owned by a wallet. The secret key never leaves this type
/// except through `secret_bytes` for keystore persistence.
#[derive(Clone)]
pub struct KeyPair {
    secret_key: SecretKey,
    public_key: PublicKey,
    address: Address,
}

impl KeyPair {
    /// Generate a new key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::new(&mut OsRng);
        let public_key = secret_key.public_key(&secp);
        Self::assemble(secret_key, public_key)
    }

    /// Load from secret key bytes
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, String> {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(bytes)
            .map_err(|e| format!("Invalid secret key: {}", e))?;
        let public_key = secret_key.public_key(&secp);
        Ok(Self::assemble(secret_key, public_key))
    }

    fn assemble(secret_key: SecretKey, public_key: PublicKey) -> Self {
        let address = Address::from_public_key(&public_key.serialize());
        Self {
            secret_key,
            public_key,
            address,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.serialize().to_vec()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret_key.secret_bytes()
    }

    /// Sign `sha256(data)`
    pub fn sign(&self, data: &[u8]) -> Signature {
        let secp = Secp256k1::signing_only();
        let message = Message::from_digest(sha256(data).0);
        let signature = secp.sign_ecdsa(&message, &self.secret_key);
        Signature {
            public_key: self.public_key_bytes(),
            signature: signature.serialize_der().to_vec(),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
