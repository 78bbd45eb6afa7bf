//! ks_proto — Wire types and canonical serialisation for Keyseal
//!
//! Everything that crosses the transport boundary is a compact JSON record
//! with fixed camelCase field names; byte fields travel base64url (no pad).
//! Decoding is strict: unknown fields and duplicate fields are rejected, so
//! a decoded envelope is structurally canonical or it is `Invalid`.
//!
//! # Modules
//! - `envelope` — the outer message envelope and the pre-key response payload
//! - `message`  — PREKEY / WHISPER ciphertext bodies and type tags
//! - `codec`    — encode/decode entry points and message-type discrimination
//!
//! The codec is pure: it never touches key material or storage.

pub mod codec;
pub mod envelope;
pub mod message;

pub use codec::{classify, decode_envelope, encode_envelope, CodecError, EnvelopeKind};
pub use envelope::{MessageEnvelope, PreKeyResponse};
pub use message::{CiphertextKind, PreKeyMessage, WhisperMessage};
