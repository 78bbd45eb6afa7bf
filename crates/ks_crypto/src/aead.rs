//! Authenticated Encryption with Associated Data
//!
//! Uses ChaCha20-Poly1305 (96-bit nonce).
//! Key size: 32 bytes.  Nonce: 12 bytes (random).  Tag: 16 bytes.
//!
//! Ciphertext wire format:
//!   [ nonce (12 bytes) | ciphertext + tag ]

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng},
    ChaCha20Poly1305,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Nonce length prepended to every sealed value.
pub const NONCE_LEN: usize = 12;

/// Encrypt `plaintext` with a 32-byte key, prepending a random 12-byte nonce.
/// `aad` — additional associated data (authenticated but not encrypted).
pub fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let nonce = ChaCha20Poly1305::generate_nonce(&mut AeadOsRng);

    let ciphertext = cipher
        .encrypt(&nonce, chacha20poly1305::aead::Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    // Prepend nonce
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag).
pub fn open(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(NONCE_LEN);
    let nonce = chacha20poly1305::Nonce::from_slice(nonce_bytes);

    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::AeadDecrypt)?;

    let plaintext = cipher
        .decrypt(nonce, chacha20poly1305::aead::Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = [7u8; 32];
        let sealed = seal(&key, b"hello", b"bucket").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 5 + 16);
        let opened = open(&key, &sealed, b"bucket").unwrap();
        assert_eq!(&*opened, b"hello");
    }

    #[test]
    fn open_rejects_wrong_aad() {
        let key = [7u8; 32];
        let sealed = seal(&key, b"hello", b"bucket-a").unwrap();
        assert!(open(&key, &sealed, b"bucket-b").is_err());
    }

    #[test]
    fn open_rejects_flipped_byte() {
        let key = [7u8; 32];
        let mut sealed = seal(&key, b"hello", b"bucket").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(open(&key, &sealed, b"bucket").is_err());
    }

    #[test]
    fn nonces_are_fresh_per_seal() {
        let key = [7u8; 32];
        let a = seal(&key, b"x", b"").unwrap();
        let b = seal(&key, b"x", b"").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }
}
