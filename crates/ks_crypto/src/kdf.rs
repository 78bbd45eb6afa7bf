//! Key derivation functions
//!
//! `hkdf_expand` — HKDF-SHA256, used for handshake and ratchet key material.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be empty (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_is_deterministic() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        hkdf_expand(b"ikm", Some(&[0u8; 32]), b"info", &mut a).unwrap();
        hkdf_expand(b"ikm", Some(&[0u8; 32]), b"info", &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn info_separates_outputs() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        hkdf_expand(b"ikm", None, b"info-a", &mut a).unwrap();
        hkdf_expand(b"ikm", None, b"info-b", &mut b).unwrap();
        assert_ne!(a, b);
    }
}
