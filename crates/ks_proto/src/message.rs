//! Ciphertext bodies: what `ciphertextMessage` bytes decode to.
//!
//! Two body shapes, discriminated by the envelope's `ciphertextType` tag:
//!
//!   WHISPER (2) — a post-handshake message: ratchet header + sealed payload.
//!   PREKEY  (3) — the first message(s) of a session: a handshake header
//!                 wrapping an ordinary WHISPER body, so the responder can
//!                 complete session establishment and decrypt in one shot.

use serde::{Deserialize, Serialize};

use ks_crypto::pqxdh::HandshakeHeader;
use ks_crypto::ratchet::RatchetHeader;

use crate::codec::CodecError;

/// Current body format version.
pub const MESSAGE_VERSION: u8 = 1;

/// 1-byte envelope tags for `ciphertextType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiphertextKind {
    Whisper = 2,
    PreKey = 3,
}

impl CiphertextKind {
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            2 => Some(Self::Whisper),
            3 => Some(Self::PreKey),
            _ => None,
        }
    }

    pub fn tag(self) -> i32 {
        self as i32
    }
}

// ── WHISPER ──────────────────────────────────────────────────────────────────

/// Post-handshake ciphertext: ratchet header + AEAD-sealed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhisperMessage {
    pub version: u8,
    pub header: RatchetHeader,
    /// AEAD output (nonce || ciphertext+tag), base64
    pub payload: String,
}

impl WhisperMessage {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let msg: Self = serde_json::from_slice(bytes)?;
        if msg.version != MESSAGE_VERSION {
            return Err(CodecError::UnsupportedVersion(msg.version));
        }
        Ok(msg)
    }
}

// ── PREKEY ───────────────────────────────────────────────────────────────────

/// Session-establishing ciphertext: handshake material + the first WHISPER.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreKeyMessage {
    pub version: u8,
    pub handshake: HandshakeHeader,
    pub message: WhisperMessage,
}

impl PreKeyMessage {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let msg: Self = serde_json::from_slice(bytes)?;
        if msg.version != MESSAGE_VERSION {
            return Err(CodecError::UnsupportedVersion(msg.version));
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whisper() -> WhisperMessage {
        WhisperMessage {
            version: MESSAGE_VERSION,
            header: RatchetHeader {
                dh_pub: "AAAA".into(),
                n: 3,
                pn: 0,
            },
            payload: "cGF5bG9hZA".into(),
        }
    }

    #[test]
    fn whisper_roundtrip() {
        let msg = whisper();
        let decoded = WhisperMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.header, msg.header);
        assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut msg = whisper();
        msg.version = 99;
        let bytes = serde_json::to_vec(&msg).unwrap();
        assert!(matches!(
            WhisperMessage::decode(&bytes),
            Err(CodecError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn tag_mapping_is_exhaustive() {
        assert_eq!(CiphertextKind::from_tag(2), Some(CiphertextKind::Whisper));
        assert_eq!(CiphertextKind::from_tag(3), Some(CiphertextKind::PreKey));
        assert_eq!(CiphertextKind::from_tag(0), None);
        assert_eq!(CiphertextKind::from_tag(4), None);
        assert_eq!(CiphertextKind::Whisper.tag(), 2);
        assert_eq!(CiphertextKind::PreKey.tag(), 3);
    }
}
