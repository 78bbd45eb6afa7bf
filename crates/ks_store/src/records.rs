//! Persisted record types — the values inside the typed buckets.

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

// ── Addresses ────────────────────────────────────────────────────────────────

/// A protocol address: account uuid plus device id. Two records refer to the
/// same peer iff both components match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalAddress {
    pub uuid: String,
    pub device_id: u32,
}

impl LocalAddress {
    pub fn new(uuid: impl Into<String>, device_id: u32) -> Self {
        Self { uuid: uuid.into(), device_id }
    }

    /// Deterministic bucket key: `"uuid.deviceId"`.
    pub fn storage_key(&self) -> String {
        format!("{}.{}", self.uuid, self.device_id)
    }
}

impl std::fmt::Display for LocalAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.uuid, self.device_id)
    }
}

// ── Pre-key records ──────────────────────────────────────────────────────────

/// One-time ECC pre-key. `used` flips when the key is handed out in a
/// published bundle; the record is deleted outright once a handshake
/// consumes it and a fresh key is regenerated under the same id.
#[derive(Clone, Serialize, Deserialize)]
pub struct PreKeyRecord {
    pub id: u32,
    pub public: [u8; 32],
    pub secret: [u8; 32],
    pub used: bool,
}

impl Drop for PreKeyRecord {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Medium-lived signed pre-key; the public half is signed by the identity
/// key. Exactly one is active; predecessors stay until the archive age so
/// in-flight messages keep decrypting.
#[derive(Clone, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    pub id: u32,
    pub created_at_ms: i64,
    pub public: [u8; 32],
    pub secret: [u8; 32],
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl Drop for SignedPreKeyRecord {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// ML-KEM-1024 pre-key with identity signature. Same active/archive
/// lifecycle as the signed pre-key, on its own schedule.
#[derive(Clone, Serialize, Deserialize)]
pub struct KyberPreKeyRecord {
    pub id: u32,
    pub created_at_ms: i64,
    #[serde(with = "serde_bytes")]
    pub public: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub secret: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl Drop for KyberPreKeyRecord {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

// ── Contacts & history ───────────────────────────────────────────────────────

/// A peer the user talks to. Equality is on the address only.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub address: LocalAddress,
    pub first_name: String,
    pub last_name: String,
    pub verified: bool,
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

/// One row of local plaintext history. Protected by the at-rest seal only;
/// the ratchet protects the wire, not the disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageMessage {
    pub peer: LocalAddress,
    pub sender: LocalAddress,
    pub recipient: LocalAddress,
    pub timestamp_ms: i64,
    pub text: String,
}

// ── Scheduling metadata ──────────────────────────────────────────────────────

/// Pre-key lifecycle bookkeeping, persisted in the metadata bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreKeyMetadata {
    pub next_one_time_id: u32,
    pub next_signed_id: u32,
    pub active_signed_id: u32,
    pub is_signed_registered: bool,
    pub signed_failure_count: u32,
    pub next_signed_refresh_ms: i64,
    pub old_signed_deletion_ms: i64,
    pub next_kyber_refresh_ms: i64,
    pub old_kyber_deletion_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_storage_key_format() {
        let addr = LocalAddress::new("9f0e2b2c-aaaa-bbbb-cccc-1234567890ab", 1);
        assert_eq!(addr.storage_key(), "9f0e2b2c-aaaa-bbbb-cccc-1234567890ab.1");
    }

    #[test]
    fn contact_equality_is_address_only() {
        let a = Contact {
            address: LocalAddress::new("u", 1),
            first_name: "Alice".into(),
            last_name: "A".into(),
            verified: false,
        };
        let b = Contact {
            address: LocalAddress::new("u", 1),
            first_name: "Renamed".into(),
            last_name: "B".into(),
            verified: true,
        };
        let c = Contact { address: LocalAddress::new("u", 2), ..a.clone() };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
