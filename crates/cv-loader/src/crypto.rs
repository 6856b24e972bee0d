//! Cryptographic operations for package entries
//!
//! Note: Retail keys are not included for legal reasons.
//! Key derivation is outside this crate: keys arrive through [`KeyProvider`],
//! either registered directly or loaded from a key database file.

use crate::pkg::{PackageHeader, PkgMagic};
use ctr::cipher::{KeyIvInit, StreamCipher};
use cv_core::error::PackageError;
use cv_core::title::Serial;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// AES-128 in big-endian counter mode
pub type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Supplies the 16-byte content key for a package
pub trait KeyProvider: Send + Sync {
    fn entry_key(&self, header: &PackageHeader) -> Result<[u8; 16], PackageError>;
}

/// Key families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// Retail (production) keys
    Retail,
    /// Debug keys
    Debug,
}

impl From<PkgMagic> for KeyType {
    fn from(magic: PkgMagic) -> Self {
        match magic {
            PkgMagic::Retail => KeyType::Retail,
            PkgMagic::Debug => KeyType::Debug,
        }
    }
}

/// Key database entry
#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub key_type: KeyType,
    /// Title the key belongs to, `None` for a family-wide key
    pub serial: Option<Serial>,
    pub key: [u8; 16],
    pub description: String,
}

/// On-disk form of a key database entry
#[derive(Debug, Deserialize)]
struct KeyFileEntry {
    #[serde(rename = "type")]
    key_type: KeyType,
    #[serde(default)]
    serial: Option<Serial>,
    key: String,
    #[serde(default)]
    description: String,
}

/// Key database and entry decryption
pub struct CryptoEngine {
    keys: HashMap<KeyType, Vec<KeyEntry>>,
}

impl CryptoEngine {
    /// Create an engine with no registered keys
    ///
    /// Debug packages carry their key seed in the clear and need no database.
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
        }
    }

    /// Add a key to the database
    pub fn add_key(&mut self, entry: KeyEntry) {
        debug!("Adding key: {}", entry.description);
        self.keys.entry(entry.key_type).or_default().push(entry);
    }

    /// Find the most specific key for a title
    pub fn get_key(&self, key_type: KeyType, serial: &Serial) -> Option<&[u8; 16]> {
        let entries = self.keys.get(&key_type)?;
        entries
            .iter()
            .find(|entry| entry.serial.as_ref() == Some(serial))
            .or_else(|| entries.iter().find(|entry| entry.serial.is_none()))
            .map(|entry| &entry.key)
    }

    /// Check if a key type is available
    pub fn has_key(&self, key_type: KeyType) -> bool {
        self.keys.get(&key_type).is_some_and(|entries| !entries.is_empty())
    }

    /// Load keys from a JSON key database
    ///
    /// ```json
    /// [{ "type": "retail", "serial": "CUSA00001", "key": "00112233...", "description": "..." }]
    /// ```
    pub fn load_keys_from_file(&mut self, path: &Path) -> Result<usize, PackageError> {
        let content = std::fs::read_to_string(path)?;
        let entries: Vec<KeyFileEntry> = serde_json::from_str(&content).map_err(|e| {
            PackageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Invalid key file {}: {}", path.display(), e),
            ))
        })?;

        let mut loaded = 0;
        for entry in entries {
            let bytes = match hex::decode(entry.key.trim()) {
                Ok(bytes) if bytes.len() == 16 => bytes,
                _ => {
                    warn!("Skipping malformed key entry: {}", entry.description);
                    continue;
                }
            };
            let mut key = [0u8; 16];
            key.copy_from_slice(&bytes);
            self.add_key(KeyEntry {
                key_type: entry.key_type,
                serial: entry.serial,
                key,
                description: entry.description,
            });
            loaded += 1;
        }

        info!("Loaded {} keys from {}", loaded, path.display());
        Ok(loaded)
    }

    /// Get key database statistics
    pub fn get_stats(&self) -> KeyStats {
        let count = |key_type| self.keys.get(&key_type).map_or(0, Vec::len);
        KeyStats {
            retail_keys: count(KeyType::Retail),
            debug_keys: count(KeyType::Debug),
        }
    }
}

impl KeyProvider for CryptoEngine {
    fn entry_key(&self, header: &PackageHeader) -> Result<[u8; 16], PackageError> {
        let key_type = KeyType::from(header.magic);
        if let Some(key) = self.get_key(key_type, &header.serial) {
            return Ok(*key);
        }
        match key_type {
            KeyType::Debug => Ok(header.key_seed),
            KeyType::Retail => Err(PackageError::DecryptionFailed {
                path: header.serial.to_string(),
                reason: "no retail key registered for this title".to_string(),
            }),
        }
    }
}

impl Default for CryptoEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Key database statistics
#[derive(Debug, Default)]
pub struct KeyStats {
    pub retail_keys: usize,
    pub debug_keys: usize,
}

/// Apply the AES-128-CTR keystream in place (encrypts and decrypts)
pub fn apply_ctr(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(&(*key).into(), &(*iv).into());
    cipher.apply_keystream(data);
}

/// SHA-1 digest of a byte slice
pub fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Sha1::digest(data));
    out
}
