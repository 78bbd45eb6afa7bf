//! ML-KEM-1024 (Kyber) wrapper.
//!
//! Thin typed layer over `pqcrypto-kyber`'s `kyber1024` module. All key and
//! ciphertext material crosses this boundary as raw byte vectors so the rest
//! of the crate stays free of the pqcrypto trait imports.
//!
//! Shared secrets are 32 bytes and feed the PQXDH key derivation together
//! with the classical DH outputs.

use pqcrypto_kyber::kyber1024;
use pqcrypto_traits::kem::{
    Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _,
};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// ML-KEM-1024 keypair. The secret half zeroizes on drop.
#[derive(ZeroizeOnDrop)]
pub struct KemKeyPair {
    #[zeroize(skip)]
    pub public: Vec<u8>,
    secret: Vec<u8>,
}

impl KemKeyPair {
    /// Generate a fresh ML-KEM-1024 keypair.
    pub fn generate() -> Self {
        let (pk, sk) = kyber1024::keypair();
        Self {
            public: pk.as_bytes().to_vec(),
            secret: sk.as_bytes().to_vec(),
        }
    }

    pub fn from_parts(public: Vec<u8>, secret: Vec<u8>) -> Self {
        Self { public, secret }
    }

    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret
    }
}

/// Encapsulate to a peer's ML-KEM-1024 public key.
/// Returns (kem_ciphertext, 32-byte shared secret).
pub fn encapsulate(public: &[u8]) -> Result<(Vec<u8>, [u8; 32]), CryptoError> {
    let pk = kyber1024::PublicKey::from_bytes(public)
        .map_err(|e| CryptoError::Kem(format!("bad KEM public key: {e}")))?;
    let (ss, ct) = kyber1024::encapsulate(&pk);
    let mut shared = [0u8; 32];
    shared.copy_from_slice(ss.as_bytes());
    Ok((ct.as_bytes().to_vec(), shared))
}

/// Open a KEM ciphertext with our secret key. Returns the 32-byte shared secret.
pub fn decapsulate(ciphertext: &[u8], secret: &[u8]) -> Result<[u8; 32], CryptoError> {
    let sk = kyber1024::SecretKey::from_bytes(secret)
        .map_err(|e| CryptoError::Kem(format!("bad KEM secret key: {e}")))?;
    let ct = kyber1024::Ciphertext::from_bytes(ciphertext)
        .map_err(|e| CryptoError::Kem(format!("bad KEM ciphertext: {e}")))?;
    let ss = kyber1024::decapsulate(&ct, &sk);
    let mut shared = [0u8; 32];
    shared.copy_from_slice(ss.as_bytes());
    Ok(shared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encapsulate_decapsulate_roundtrip() {
        let pair = KemKeyPair::generate();
        let (ct, ss_sender) = encapsulate(&pair.public).unwrap();
        let ss_receiver = decapsulate(&ct, pair.secret_bytes()).unwrap();
        assert_eq!(ss_sender, ss_receiver);
    }

    #[test]
    fn decapsulate_rejects_truncated_ciphertext() {
        let pair = KemKeyPair::generate();
        let (ct, _) = encapsulate(&pair.public).unwrap();
        assert!(decapsulate(&ct[..ct.len() - 1], pair.secret_bytes()).is_err());
    }

    #[test]
    fn encapsulate_rejects_bad_public_key() {
        assert!(encapsulate(&[0u8; 16]).is_err());
    }
}
