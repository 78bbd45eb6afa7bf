//! ks_crypto — Keyseal cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Public APIs return typed errors; callers decide recovery policy.
//!
//! # Module layout
//! - `identity`    — long-term Ed25519 identity keypair + Ed→X25519 conversion
//! - `kem`         — ML-KEM-1024 (Kyber) keypair / encapsulate / decapsulate
//! - `pqxdh`       — hybrid asynchronous key agreement (X3DH DHs + KEM)
//! - `ratchet`     — Double Ratchet with DH steps and skipped message keys
//! - `fingerprint` — iterated-hash 60-digit safety number
//! - `aead`        — ChaCha20-Poly1305 seal/open helpers
//! - `kdf`         — HKDF-SHA256 expansion
//! - `error`       — unified error type

pub mod aead;
pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod kdf;
pub mod kem;
pub mod pqxdh;
pub mod ratchet;

pub use error::CryptoError;
