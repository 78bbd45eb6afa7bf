//! Envelope encode/decode and message-type discrimination.
//!
//! The canonical form is compact JSON with the fixed field names declared in
//! `envelope`. Decoding is strict — unknown fields, duplicated fields, or
//! malformed base64 fail the parse — so discrimination only ever runs on a
//! structurally sound envelope.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::MessageEnvelope;
use crate::message::CiphertextKind;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed wire data: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid wire structure: {0}")]
    Invalid(String),

    #[error("Unsupported message version {0}")]
    UnsupportedVersion(u8),
}

/// What a decoded envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Rotation-with-message: a fresh bundle riding along with a ciphertext.
    /// The bundle must be applied before the ciphertext is decrypted.
    UpdatedPreKeyResponseAndSignalMessage,
    /// Pure invite: a bundle and nothing else.
    PreKeyResponseMessage,
    /// An ordinary ciphertext (PREKEY or WHISPER body).
    SignalMessage,
    /// Structurally decoded but not a valid combination.
    Invalid,
}

/// Serialize an envelope to its canonical compact form.
pub fn encode_envelope(envelope: &MessageEnvelope) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Parse canonical bytes into an envelope. Strict: rejects unknown and
/// duplicate fields; never panics on arbitrary input.
pub fn decode_envelope(bytes: &[u8]) -> Result<MessageEnvelope, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Discriminate a decoded envelope.
pub fn classify(envelope: &MessageEnvelope) -> EnvelopeKind {
    let has_ciphertext = match (&envelope.ciphertext_message, envelope.ciphertext_type) {
        (Some(_), Some(tag)) => {
            if CiphertextKind::from_tag(tag).is_none() {
                return EnvelopeKind::Invalid;
            }
            true
        }
        // A ciphertext without a type tag (or vice versa) is not decodable.
        (Some(_), None) | (None, Some(_)) => return EnvelopeKind::Invalid,
        (None, None) => false,
    };

    match (envelope.pre_key_response.is_some(), has_ciphertext) {
        (true, true) => EnvelopeKind::UpdatedPreKeyResponseAndSignalMessage,
        (true, false) => EnvelopeKind::PreKeyResponseMessage,
        (false, true) => EnvelopeKind::SignalMessage,
        (false, false) => EnvelopeKind::Invalid,
    }
}
