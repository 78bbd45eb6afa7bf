//! Hardware-backed secret storage.
//!
//! Short, high-value secrets never touch the blob container: they live in
//! the platform credential store (Keychain / Credential Manager / Secret
//! Service) with the policy "available after first unlock on this device,
//! not exportable, not synced". The storage master key that seals every
//! blob is one of these secrets, so purging the secret store is the
//! factory-reset primitive — all at-rest blobs become undecryptable.
//!
//! `SecretStore` is the seam between the core and the platform; tests and
//! keyring-less environments use the in-memory implementation.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use keyring::Entry;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;

use crate::error::StoreError;

/// Secret names. The set is closed: `wipe` purges exactly these.
pub const SECRET_IDENTITY_KEY_PAIR: &str = "identity_key_pair";
pub const SECRET_REGISTRATION_ID: &str = "local_registration_id";
pub const SECRET_ACCOUNT_UUID: &str = "account_uuid";
pub const SECRET_ACCOUNT_DEVICE_ID: &str = "account_device_id";
pub const SECRET_MASTER_KEY: &str = "storage_master_key";

const ALL_SECRETS: &[&str] = &[
    SECRET_IDENTITY_KEY_PAIR,
    SECRET_REGISTRATION_ID,
    SECRET_ACCOUNT_UUID,
    SECRET_ACCOUNT_DEVICE_ID,
    SECRET_MASTER_KEY,
];

/// Scoped access to the hardware-protected secret store.
pub trait SecretStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&self, name: &str, value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Idempotent master-key acquisition: generates and stores a fresh
    /// 256-bit key on first call, returns the same key afterwards.
    fn load_or_create_master_key(&self) -> Result<[u8; 32], StoreError> {
        if let Some(bytes) = self.get(SECRET_MASTER_KEY)? {
            let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                StoreError::SecretStore("stored master key has wrong length".into())
            })?;
            return Ok(key);
        }
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        self.set(SECRET_MASTER_KEY, &key)?;
        Ok(key)
    }

    /// Purge every secret, master key included. Factory reset.
    fn wipe(&self) -> Result<(), StoreError> {
        for name in ALL_SECRETS {
            self.delete(name)?;
        }
        Ok(())
    }
}

// ── OS keyring ───────────────────────────────────────────────────────────────

/// Secret store backed by the platform keyring. One entry per secret,
/// values base64-encoded (credential stores are string-oriented).
pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }

    fn entry(&self, name: &str) -> Result<Entry, StoreError> {
        Entry::new(&self.service, name)
            .map_err(|e| StoreError::SecretStore(format!("keyring init: {e}")))
    }
}

impl SecretStore for KeyringSecretStore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.entry(name)?.get_password() {
            Ok(encoded) => {
                let bytes = STANDARD
                    .decode(&encoded)
                    .map_err(|e| StoreError::SecretStore(format!("decode secret: {e}")))?;
                Ok(Some(bytes))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StoreError::SecretStore(format!("load secret: {e}"))),
        }
    }

    fn set(&self, name: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entry(name)?
            .set_password(&STANDARD.encode(value))
            .map_err(|e| StoreError::SecretStore(format!("store secret: {e}")))
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        match self.entry(name)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::SecretStore(format!("delete secret: {e}"))),
        }
    }
}

// ── In-memory (tests, keyring-less hosts) ────────────────────────────────────

#[derive(Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.lock().get(name).cloned())
    }

    fn set(&self, name: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries.lock().insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_key_is_idempotent() {
        let store = MemorySecretStore::new();
        let first = store.load_or_create_master_key().unwrap();
        let second = store.load_or_create_master_key().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn wipe_forces_a_fresh_master_key() {
        let store = MemorySecretStore::new();
        let first = store.load_or_create_master_key().unwrap();
        store.wipe().unwrap();
        assert!(store.get(SECRET_MASTER_KEY).unwrap().is_none());
        let second = store.load_or_create_master_key().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn get_set_delete_roundtrip() {
        let store = MemorySecretStore::new();
        assert!(store.get(SECRET_ACCOUNT_UUID).unwrap().is_none());
        store.set(SECRET_ACCOUNT_UUID, b"uuid-bytes").unwrap();
        assert_eq!(store.get(SECRET_ACCOUNT_UUID).unwrap().unwrap(), b"uuid-bytes");
        store.delete(SECRET_ACCOUNT_UUID).unwrap();
        assert!(store.get(SECRET_ACCOUNT_UUID).unwrap().is_none());
    }
}
