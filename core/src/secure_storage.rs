//! Opaque key→bytes store. The core defines the contract; platform
//! keystores are adapter work. The one concrete implementation here is an
//! encrypted-file backend used on platforms with no native keystore
//! binding and in tests.
//!
//! Persistence writes to a temp file in the same directory, `fsync`s, then
//! atomically renames over the destination, so a crash mid-write never
//! corrupts the store.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::{FamilyVaultError, Result};

/// Reserved keys the core itself writes through this contract.
pub const KEY_FAMILY_SECRET: &str = "family_secret";
pub const KEY_DEVICE_ID: &str = "device_id";
pub const KEY_DEVICE_NAME: &str = "device_name";

pub trait SecureStorage: Send + Sync {
    fn store(&self, key: &str, bytes: &[u8]) -> Result<()>;
    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn remove(&self, key: &str) -> Result<()>;
    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.retrieve(key)?.is_some())
    }

    fn store_string(&self, key: &str, value: &str) -> Result<()> {
        self.store(key, value.as_bytes())
    }

    fn retrieve_string(&self, key: &str) -> Result<Option<String>> {
        match self.retrieve(key)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| FamilyVaultError::Internal(format!("non-utf8 value for {key}: {e}"))),
            None => Ok(None),
        }
    }
}

/// A simple XOR-with-derived-keystream file backend. This is not meant to
/// resist an attacker with filesystem access to a compromised device (the
/// spec's non-goals exclude at-rest encryption beyond the OS) — it only
/// keeps the family secret out of plaintext on disk for platforms that
/// have no OS keystore binding wired up yet.
pub struct EncryptedFileStorage {
    path: PathBuf,
    key: [u8; 32],
    cache: RwLock<HashMap<String, Vec<u8>>>,
}

#[derive(Serialize, Deserialize, Default)]
struct OnDiskEntries(HashMap<String, String>); // key -> base64(ciphertext)

impl EncryptedFileStorage {
    /// `storage_path` is the file backing this store; `passphrase` derives
    /// the keystream key via HKDF so the same passphrase always unlocks the
    /// same store.
    pub fn open(storage_path: impl AsRef<Path>, passphrase: &[u8]) -> Result<Self> {
        let path = storage_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let key_vec = crypto::hkdf(passphrase, b"familyvault-secure-storage", b"file-key", 32)?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&key_vec);

        let entries = Self::load_entries(&path)?;
        let mut cache = HashMap::new();
        for (k, ciphertext_b64) in entries.0 {
            let ciphertext = crypto::base64_decode(&ciphertext_b64)?;
            cache.insert(k, xor_keystream(&key, &ciphertext));
        }

        #[cfg(unix)]
        Self::restrict_permissions(&path)?;

        Ok(Self {
            path,
            key,
            cache: RwLock::new(cache),
        })
    }

    fn load_entries(path: &Path) -> Result<OnDiskEntries> {
        if !path.exists() {
            return Ok(OnDiskEntries::default());
        }
        let raw = fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(OnDiskEntries::default());
        }
        match serde_json::from_str(&raw) {
            Ok(entries) => Ok(entries),
            Err(_) => {
                // Corrupt file: preserve it for inspection, start fresh.
                let backup = path.with_extension(format!(
                    "corrupt.{}",
                    std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs()
                ));
                let _ = fs::rename(path, backup);
                Ok(OnDiskEntries::default())
            }
        }
    }

    fn persist(&self) -> Result<()> {
        let cache = self.cache.read();
        let mut entries = HashMap::new();
        for (k, v) in cache.iter() {
            let ciphertext = xor_keystream(&self.key, v);
            entries.insert(k.clone(), crypto::base64_encode(&ciphertext));
        }
        drop(cache);

        let json = serde_json::to_string_pretty(&OnDiskEntries(entries))?;
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp_path)?;
            f.write_all(json.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        #[cfg(unix)]
        Self::restrict_permissions(&self.path)?;

        Ok(())
    }

    #[cfg(unix)]
    fn restrict_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)?;
        Ok(())
    }
}

impl SecureStorage for EncryptedFileStorage {
    fn store(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.cache.write().insert(key.to_string(), bytes.to_vec());
        self.persist()
    }

    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.cache.read().get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.cache.write().remove(key);
        self.persist()
    }
}

fn xor_keystream(key: &[u8; 32], data: &[u8]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()])
        .collect()
}

/// An in-memory backend used by tests and by embedders that manage secret
/// persistence themselves.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl SecureStorage for MemoryStorage {
    fn store(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_retrieve_returns_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = EncryptedFileStorage::open(dir.path().join("secrets.json"), b"pass").unwrap();
        storage.store(KEY_FAMILY_SECRET, &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            storage.retrieve(KEY_FAMILY_SECRET).unwrap(),
            Some(vec![1, 2, 3, 4])
        );
    }

    #[test]
    fn remove_then_retrieve_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = EncryptedFileStorage::open(dir.path().join("secrets.json"), b"pass").unwrap();
        storage.store(KEY_DEVICE_ID, b"abc").unwrap();
        storage.remove(KEY_DEVICE_ID).unwrap();
        assert_eq!(storage.retrieve(KEY_DEVICE_ID).unwrap(), None);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        {
            let storage = EncryptedFileStorage::open(&path, b"pass").unwrap();
            storage.store(KEY_FAMILY_SECRET, &[9, 9, 9]).unwrap();
        }
        let reopened = EncryptedFileStorage::open(&path, b"pass").unwrap();
        assert_eq!(
            reopened.retrieve(KEY_FAMILY_SECRET).unwrap(),
            Some(vec![9, 9, 9])
        );
    }
}
