// Key management

use crate::core::{Address, KeyPair};
use crate::wallet::WalletError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// On-disk form of one key
#[derive(Serialize, Deserialize)]
struct StoredKey {
    address: Address,
    /// Hex-encoded secp256k1 secret key
    secret_key: String,
}

#[derive(Serialize, Deserialize)]
struct StoredKeystore {
    keys: Vec<StoredKey>,
    default_address: Option<Address>,
}

/// Keystore - manages multiple key pairs
#[derive(Debug, Default)]
pub struct Keystore {
    keys: BTreeMap<Address, KeyPair>,
    default_address: Option<Address>,
}

impl Keystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a new address; the first one becomes the default
    pub fn new_address(&mut self) -> Address {
        self.insert(KeyPair::generate())
    }

    /// Add an existing key pair
    pub fn insert(&mut self, keypair: KeyPair) -> Address {
        let address = keypair.address();
        if self.default_address.is_none() {
            self.default_address = Some(address);
        }
        self.keys.insert(address, keypair);
        address
    }

    pub fn get_keypair(&self, address: &Address) -> Option<&KeyPair> {
        self.keys.get(address)
    }

    /// All addresses, sorted
    pub fn list_addresses(&self) -> Vec<Address> {
        self.keys.keys().copied().collect()
    }

    pub fn default_address(&self) -> Option<Address> {
        self.default_address
    }

    pub fn set_default(&mut self, address: Address) -> Result<(), WalletError> {
        if !self.keys.contains_key(&address) {
            return Err(WalletError::UnknownAddress(address));
        }
        self.default_address = Some(address);
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.keys.len()
    }

    /// Load a keystore, or start an empty one if the file does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        if path.as_ref().exists() {
            log::info!("Loading keystore from {}", path.as_ref().display());
            Self::load(path)
        } else {
            log::info!("Creating new keystore");
            Ok(Self::new())
        }
    }

    /// Save keystore to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), WalletError> {
        let data = StoredKeystore {
            keys: self
                .keys
                .values()
                .map(|kp| StoredKey {
                    address: kp.address(),
                    secret_key: hex::encode(kp.secret_bytes()),
                })
                .collect(),
            default_address: self.default_address,
        };

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&data)?)?;
        Ok(())
    }

    /// Load keystore from file. Every key is re-derived and checked
    /// against the address stored next to it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        let json = fs::read_to_string(path)?;
        let data: StoredKeystore = serde_json::from_str(&json)?;

        let mut keys = BTreeMap::new();
        for stored in data.keys {
            let bytes: [u8; 32] = hex::decode(&stored.secret_key)
                .map_err(|e| WalletError::InvalidKey(e.to_string()))?
                .try_into()
                .map_err(|_| WalletError::InvalidKey("secret key must be 32 bytes".to_string()))?;
            let keypair = KeyPair::from_secret_bytes(&bytes).map_err(WalletError::InvalidKey)?;
            if keypair.address() != stored.address {
                return Err(WalletError::AddressMismatch(stored.address));
            }
            keys.insert(stored.address, keypair);
        }

        if let Some(address) = data.default_address {
            if !keys.contains_key(&address) {
                return Err(WalletError::UnknownAddress(address));
            }
        }

        Ok(Self {
            keys,
            default_address: data.default_address,
        })
    }
}
