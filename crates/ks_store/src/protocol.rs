//! The typed protocol store: in-memory caches in front of sealed buckets.
//!
//! Each bucket is guarded by its own mutex; operations that need more than
//! one bucket acquire locks in the fixed order
//!   pre-keys ≺ signed ≺ kyber ≺ sessions ≺ identities ≺ contacts ≺
//!   messages ≺ metadata
//! which precludes deadlock. Every mutating method ends with a through-write
//! of the whole bucket inside its critical section.
//!
//! Persistence failures do not poison the in-memory state: the cache stays
//! authoritative, the write is retried on the next mutation of the same
//! bucket, and only repeated failure surfaces as `Unavailable`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::container::BlobContainer;
use crate::error::StoreError;
use crate::records::{
    Contact, KyberPreKeyRecord, LocalAddress, PreKeyMetadata, PreKeyRecord, SignedPreKeyRecord,
    StorageMessage,
};

/// Consecutive persist failures tolerated before surfacing `Unavailable`.
const MAX_PERSIST_FAILURES: u32 = 3;

pub const BUCKET_PREKEYS: &str = "prekeys";
pub const BUCKET_SIGNED_PREKEYS: &str = "signed_prekeys";
pub const BUCKET_KYBER_PREKEYS: &str = "kyber_prekeys";
pub const BUCKET_SESSIONS: &str = "sessions";
pub const BUCKET_IDENTITIES: &str = "identities";
pub const BUCKET_CONTACTS: &str = "contacts";
pub const BUCKET_MESSAGES: &str = "messages";
pub const BUCKET_METADATA: &str = "metadata";

pub struct ProtocolStore {
    container: BlobContainer,

    pre_keys: Mutex<HashMap<u32, PreKeyRecord>>,
    signed_pre_keys: Mutex<HashMap<u32, SignedPreKeyRecord>>,
    kyber_pre_keys: Mutex<HashMap<u32, KyberPreKeyRecord>>,
    /// address key → base64 of the opaque session record
    sessions: Mutex<HashMap<String, String>>,
    /// address key → base64 of the trusted identity public key
    identities: Mutex<HashMap<String, String>>,
    contacts: Mutex<Vec<Contact>>,
    messages: Mutex<Vec<StorageMessage>>,
    metadata: Mutex<Option<PreKeyMetadata>>,

    persist_failures: AtomicU32,
}

impl ProtocolStore {
    /// Open the store over a sealed container. Caches start empty; call
    /// `load` to populate them from disk.
    pub fn open(container: BlobContainer) -> Self {
        Self {
            container,
            pre_keys: Mutex::new(HashMap::new()),
            signed_pre_keys: Mutex::new(HashMap::new()),
            kyber_pre_keys: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            identities: Mutex::new(HashMap::new()),
            contacts: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            metadata: Mutex::new(None),
            persist_failures: AtomicU32::new(0),
        }
    }

    fn read_bucket<T: DeserializeOwned>(&self, bucket: &str) -> Result<Option<T>, StoreError> {
        let bytes = self
            .container
            .read(bucket, |raw| serde_json::from_slice::<T>(raw).is_ok())?;
        match bytes {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Write-through helper with the deferred-failure policy.
    fn persist<T: Serialize>(&self, bucket: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        match self.container.write(bucket, &bytes) {
            Ok(()) => {
                self.persist_failures.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                let failures = self.persist_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= MAX_PERSIST_FAILURES {
                    Err(StoreError::Unavailable(format!(
                        "bucket {bucket} failed to persist {failures} times: {e}"
                    )))
                } else {
                    warn!(bucket, %e, "bucket persist failed; memory stays authoritative");
                    Ok(())
                }
            }
        }
    }

    /// Populate every cache from the sealed buckets. Missing or corrupt
    /// buckets load as empty — the lifecycle layer judges whether that is
    /// fatal via `critical_buckets_present`.
    pub fn load(&self) -> Result<(), StoreError> {
        *self.pre_keys.lock() = self.read_bucket(BUCKET_PREKEYS)?.unwrap_or_default();
        *self.signed_pre_keys.lock() =
            self.read_bucket(BUCKET_SIGNED_PREKEYS)?.unwrap_or_default();
        *self.kyber_pre_keys.lock() = self.read_bucket(BUCKET_KYBER_PREKEYS)?.unwrap_or_default();
        *self.sessions.lock() = self.read_bucket(BUCKET_SESSIONS)?.unwrap_or_default();
        *self.identities.lock() = self.read_bucket(BUCKET_IDENTITIES)?.unwrap_or_default();
        *self.contacts.lock() = self.read_bucket(BUCKET_CONTACTS)?.unwrap_or_default();
        *self.messages.lock() = self.read_bucket(BUCKET_MESSAGES)?.unwrap_or_default();
        *self.metadata.lock() = self.read_bucket(BUCKET_METADATA)?.unwrap_or_default();
        Ok(())
    }

    /// A reload is only trustworthy when every key-material bucket survived.
    pub fn critical_buckets_present(&self) -> bool {
        !self.pre_keys.lock().is_empty()
            && !self.signed_pre_keys.lock().is_empty()
            && !self.kyber_pre_keys.lock().is_empty()
            && self.metadata.lock().is_some()
    }

    /// Drop every cache and every bucket file.
    pub fn wipe(&self) -> Result<(), StoreError> {
        self.pre_keys.lock().clear();
        self.signed_pre_keys.lock().clear();
        self.kyber_pre_keys.lock().clear();
        self.sessions.lock().clear();
        self.identities.lock().clear();
        self.contacts.lock().clear();
        self.messages.lock().clear();
        *self.metadata.lock() = None;
        self.container.wipe()
    }

    // ── One-time pre-keys ────────────────────────────────────────────────

    pub fn put_pre_key(&self, record: PreKeyRecord) -> Result<(), StoreError> {
        let mut guard = self.pre_keys.lock();
        guard.insert(record.id, record);
        self.persist(BUCKET_PREKEYS, &*guard)
    }

    pub fn pre_key(&self, id: u32) -> Option<PreKeyRecord> {
        self.pre_keys.lock().get(&id).cloned()
    }

    pub fn remove_pre_key(&self, id: u32) -> Result<(), StoreError> {
        let mut guard = self.pre_keys.lock();
        guard.remove(&id);
        self.persist(BUCKET_PREKEYS, &*guard)
    }

    pub fn mark_pre_key_used(&self, id: u32) -> Result<(), StoreError> {
        let mut guard = self.pre_keys.lock();
        if let Some(record) = guard.get_mut(&id) {
            record.used = true;
        }
        self.persist(BUCKET_PREKEYS, &*guard)
    }

    /// Ids in ascending order.
    pub fn pre_key_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.pre_keys.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Smallest id whose record has not been handed out yet.
    pub fn smallest_unused_pre_key_id(&self) -> Option<u32> {
        self.pre_keys
            .lock()
            .values()
            .filter(|r| !r.used)
            .map(|r| r.id)
            .min()
    }

    pub fn pre_key_count(&self) -> usize {
        self.pre_keys.lock().len()
    }

    // ── Signed pre-keys ──────────────────────────────────────────────────

    pub fn put_signed_pre_key(&self, record: SignedPreKeyRecord) -> Result<(), StoreError> {
        let mut guard = self.signed_pre_keys.lock();
        guard.insert(record.id, record);
        self.persist(BUCKET_SIGNED_PREKEYS, &*guard)
    }

    pub fn signed_pre_key(&self, id: u32) -> Option<SignedPreKeyRecord> {
        self.signed_pre_keys.lock().get(&id).cloned()
    }

    pub fn signed_pre_key_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.signed_pre_keys.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Drop every signed pre-key except the given id.
    pub fn retain_signed_pre_key(&self, keep_id: u32) -> Result<(), StoreError> {
        let mut guard = self.signed_pre_keys.lock();
        guard.retain(|id, _| *id == keep_id);
        self.persist(BUCKET_SIGNED_PREKEYS, &*guard)
    }

    // ── Kyber pre-keys ───────────────────────────────────────────────────

    pub fn put_kyber_pre_key(&self, record: KyberPreKeyRecord) -> Result<(), StoreError> {
        let mut guard = self.kyber_pre_keys.lock();
        guard.insert(record.id, record);
        self.persist(BUCKET_KYBER_PREKEYS, &*guard)
    }

    pub fn kyber_pre_key(&self, id: u32) -> Option<KyberPreKeyRecord> {
        self.kyber_pre_keys.lock().get(&id).cloned()
    }

    pub fn kyber_pre_key_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.kyber_pre_keys.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn retain_kyber_pre_key(&self, keep_id: u32) -> Result<(), StoreError> {
        let mut guard = self.kyber_pre_keys.lock();
        guard.retain(|id, _| *id == keep_id);
        self.persist(BUCKET_KYBER_PREKEYS, &*guard)
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    pub fn store_session(&self, address: &LocalAddress, record: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.sessions.lock();
        guard.insert(address.storage_key(), URL_SAFE_NO_PAD.encode(record));
        self.persist(BUCKET_SESSIONS, &*guard)
    }

    pub fn load_session(&self, address: &LocalAddress) -> Result<Option<Vec<u8>>, StoreError> {
        match self.sessions.lock().get(&address.storage_key()) {
            Some(encoded) => Ok(Some(
                URL_SAFE_NO_PAD
                    .decode(encoded)
                    .map_err(ks_crypto::CryptoError::Base64Decode)
                    .map_err(StoreError::Crypto)?,
            )),
            None => Ok(None),
        }
    }

    pub fn has_session(&self, address: &LocalAddress) -> bool {
        self.sessions.lock().contains_key(&address.storage_key())
    }

    pub fn remove_session(&self, address: &LocalAddress) -> Result<(), StoreError> {
        let mut guard = self.sessions.lock();
        guard.remove(&address.storage_key());
        self.persist(BUCKET_SESSIONS, &*guard)
    }

    // ── Trusted identities ───────────────────────────────────────────────

    pub fn save_identity(&self, address: &LocalAddress, identity: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.identities.lock();
        guard.insert(address.storage_key(), URL_SAFE_NO_PAD.encode(identity));
        self.persist(BUCKET_IDENTITIES, &*guard)
    }

    pub fn get_identity(&self, address: &LocalAddress) -> Result<Option<Vec<u8>>, StoreError> {
        match self.identities.lock().get(&address.storage_key()) {
            Some(encoded) => Ok(Some(
                URL_SAFE_NO_PAD
                    .decode(encoded)
                    .map_err(ks_crypto::CryptoError::Base64Decode)
                    .map_err(StoreError::Crypto)?,
            )),
            None => Ok(None),
        }
    }

    pub fn remove_identity(&self, address: &LocalAddress) -> Result<(), StoreError> {
        let mut guard = self.identities.lock();
        guard.remove(&address.storage_key());
        self.persist(BUCKET_IDENTITIES, &*guard)
    }

    // ── Contacts ─────────────────────────────────────────────────────────

    pub fn contacts(&self) -> Vec<Contact> {
        self.contacts.lock().clone()
    }

    pub fn find_contact(&self, address: &LocalAddress) -> Option<Contact> {
        self.contacts.lock().iter().find(|c| &c.address == address).cloned()
    }

    /// Returns false (and leaves the bucket untouched) on a duplicate address.
    pub fn add_contact(&self, contact: Contact) -> Result<bool, StoreError> {
        let mut guard = self.contacts.lock();
        if guard.iter().any(|c| c.address == contact.address) {
            return Ok(false);
        }
        guard.push(contact);
        self.persist(BUCKET_CONTACTS, &*guard)?;
        Ok(true)
    }

    pub fn remove_contact(&self, address: &LocalAddress) -> Result<bool, StoreError> {
        let mut guard = self.contacts.lock();
        let before = guard.len();
        guard.retain(|c| &c.address != address);
        let removed = guard.len() != before;
        if removed {
            self.persist(BUCKET_CONTACTS, &*guard)?;
        }
        Ok(removed)
    }

    pub fn set_contact_verified(
        &self,
        address: &LocalAddress,
        verified: bool,
    ) -> Result<bool, StoreError> {
        let mut guard = self.contacts.lock();
        let Some(contact) = guard.iter_mut().find(|c| &c.address == address) else {
            return Ok(false);
        };
        contact.verified = verified;
        self.persist(BUCKET_CONTACTS, &*guard)?;
        Ok(true)
    }

    // ── Message history ──────────────────────────────────────────────────

    pub fn append_message(&self, message: StorageMessage) -> Result<(), StoreError> {
        let mut guard = self.messages.lock();
        guard.push(message);
        self.persist(BUCKET_MESSAGES, &*guard)
    }

    pub fn messages_with(&self, peer: &LocalAddress) -> Vec<StorageMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| &m.peer == peer)
            .cloned()
            .collect()
    }

    pub fn remove_messages_with(&self, peer: &LocalAddress) -> Result<(), StoreError> {
        let mut guard = self.messages.lock();
        guard.retain(|m| &m.peer != peer);
        self.persist(BUCKET_MESSAGES, &*guard)
    }

    // ── Metadata ─────────────────────────────────────────────────────────

    pub fn metadata(&self) -> Option<PreKeyMetadata> {
        self.metadata.lock().clone()
    }

    pub fn set_metadata(&self, metadata: PreKeyMetadata) -> Result<(), StoreError> {
        let mut guard = self.metadata.lock();
        *guard = Some(metadata);
        self.persist(BUCKET_METADATA, &*guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ProtocolStore) {
        let dir = tempfile::tempdir().unwrap();
        let container = BlobContainer::open(dir.path(), [3u8; 32]).unwrap();
        (dir, ProtocolStore::open(container))
    }

    fn reopen(dir: &tempfile::TempDir) -> ProtocolStore {
        let container = BlobContainer::open(dir.path(), [3u8; 32]).unwrap();
        let store = ProtocolStore::open(container);
        store.load().unwrap();
        store
    }

    fn pre_key(id: u32) -> PreKeyRecord {
        PreKeyRecord { id, public: [id as u8; 32], secret: [id as u8 + 1; 32], used: false }
    }

    #[test]
    fn pre_keys_survive_reload() {
        let (dir, store) = store();
        store.put_pre_key(pre_key(1)).unwrap();
        store.put_pre_key(pre_key(2)).unwrap();
        store.mark_pre_key_used(1).unwrap();

        let reloaded = reopen(&dir);
        assert_eq!(reloaded.pre_key_ids(), vec![1, 2]);
        assert!(reloaded.pre_key(1).unwrap().used);
        assert_eq!(reloaded.smallest_unused_pre_key_id(), Some(2));
    }

    #[test]
    fn sessions_round_trip_as_opaque_bytes() {
        let (dir, store) = store();
        let addr = LocalAddress::new("peer", 1);
        store.store_session(&addr, b"opaque ratchet state").unwrap();

        let reloaded = reopen(&dir);
        assert_eq!(
            reloaded.load_session(&addr).unwrap().unwrap(),
            b"opaque ratchet state"
        );
    }

    #[test]
    fn duplicate_contact_is_refused() {
        let (_dir, store) = store();
        let contact = Contact {
            address: LocalAddress::new("peer", 1),
            first_name: "Alice".into(),
            last_name: String::new(),
            verified: false,
        };
        assert!(store.add_contact(contact.clone()).unwrap());
        assert!(!store.add_contact(contact).unwrap());
        assert_eq!(store.contacts().len(), 1);
    }

    #[test]
    fn message_history_filters_by_peer() {
        let (_dir, store) = store();
        let alice = LocalAddress::new("alice", 1);
        let carol = LocalAddress::new("carol", 1);
        for (peer, text) in [(&alice, "hi"), (&carol, "yo"), (&alice, "again")] {
            store
                .append_message(StorageMessage {
                    peer: peer.clone(),
                    sender: peer.clone(),
                    recipient: LocalAddress::new("me", 1),
                    timestamp_ms: 0,
                    text: text.into(),
                })
                .unwrap();
        }
        assert_eq!(store.messages_with(&alice).len(), 2);
        store.remove_messages_with(&alice).unwrap();
        assert!(store.messages_with(&alice).is_empty());
        assert_eq!(store.messages_with(&carol).len(), 1);
    }

    #[test]
    fn critical_buckets_gate_reload() {
        let (dir, store) = store();
        assert!(!store.critical_buckets_present());

        store.put_pre_key(pre_key(1)).unwrap();
        store
            .put_signed_pre_key(SignedPreKeyRecord {
                id: 1,
                created_at_ms: 0,
                public: [1; 32],
                secret: [2; 32],
                signature: vec![0; 64],
            })
            .unwrap();
        store
            .put_kyber_pre_key(KyberPreKeyRecord {
                id: 1,
                created_at_ms: 0,
                public: vec![1; 8],
                secret: vec![2; 8],
                signature: vec![0; 64],
            })
            .unwrap();
        store
            .set_metadata(PreKeyMetadata {
                next_one_time_id: 3,
                next_signed_id: 2,
                active_signed_id: 1,
                is_signed_registered: false,
                signed_failure_count: 0,
                next_signed_refresh_ms: 0,
                old_signed_deletion_ms: 0,
                next_kyber_refresh_ms: 0,
                old_kyber_deletion_ms: 0,
            })
            .unwrap();

        let reloaded = reopen(&dir);
        assert!(reloaded.critical_buckets_present());
    }

    #[test]
    fn wipe_clears_memory_and_disk() {
        let (dir, store) = store();
        store.put_pre_key(pre_key(1)).unwrap();
        store.wipe().unwrap();
        assert_eq!(store.pre_key_count(), 0);

        let reloaded = reopen(&dir);
        assert_eq!(reloaded.pre_key_count(), 0);
    }
}
