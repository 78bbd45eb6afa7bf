//! ks_store — Encrypted local persistence for Keyseal
//!
//! # Storage strategy
//! Two tiers, split by size and sensitivity:
//! - **Hardware secret store** (`keyholder`): short values — the identity
//!   keypair, registration id, account uuid, device id, and the 256-bit
//!   storage master key — live in the platform's hardware-backed credential
//!   store, never on the filesystem.
//! - **Sealed blob container** (`container`): everything larger is a typed
//!   bucket, serialized to canonical JSON and sealed with ChaCha20-Poly1305
//!   under the master key (`nonce || ciphertext || tag`, fresh 96-bit nonce
//!   per write, bucket name as associated data).
//!
//! `protocol` layers the in-memory caches over the container: every mutation
//! writes through to disk inside the same critical section, so a crash can
//! never leave the two views divergent. Corrupt blobs read as "not found" —
//! the lifecycle layer decides whether that means re-initialization.

pub mod container;
pub mod error;
pub mod keyholder;
pub mod protocol;
pub mod records;

pub use container::BlobContainer;
pub use error::StoreError;
pub use keyholder::{KeyringSecretStore, MemorySecretStore, SecretStore};
pub use protocol::ProtocolStore;
