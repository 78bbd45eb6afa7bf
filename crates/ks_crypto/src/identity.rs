//! Identity key management
//!
//! Each account has one long-term `IdentityKeyPair` (Ed25519). It is
//! generated once at account creation and never rotated; every signed
//! pre-key and Kyber pre-key carries a signature made by this key.
//!
//! The same keypair participates in the PQXDH agreement after conversion
//! to X25519 (clamped SHA-512 expansion for the secret, birational map for
//! the public half), mirroring libsignal's identity-key handling.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

// ── Newtype wrappers ──────────────────────────────────────────────────────────

/// 32-byte Ed25519 public key, base64url-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(pub Vec<u8>);

impl PublicKeyBytes {
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(s)?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Public key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn as_array(&self) -> Result<[u8; 32], CryptoError> {
        self.0
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("public key not 32 bytes".into()))
    }
}

// ── Identity keypair ──────────────────────────────────────────────────────────

/// Long-term identity signing key.  Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    pub public: PublicKeyBytes,
    secret_bytes: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes().to_vec());
        let secret_bytes = signing_key.to_bytes();
        Self { public, secret_bytes }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Identity key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        let signing_key = SigningKey::from_bytes(&arr);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes().to_vec());
        Ok(Self { public, secret_bytes: arr })
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret_bytes)
    }

    /// Sign arbitrary bytes; returns 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing_key().sign(msg).to_bytes().to_vec()
    }

    /// Verify a signature made by any Ed25519 public key.
    pub fn verify(public_bytes: &[u8], msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(
            public_bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("Bad pubkey len".into()))?,
        )
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = Signature::from_bytes(
            sig_bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("Bad sig len".into()))?,
        );
        vk.verify(msg, &sig).map_err(|_| CryptoError::SignatureVerification)
    }

    /// Convert this key's secret half to an X25519 static secret for DH.
    pub fn to_x25519_secret(&self) -> StaticSecret {
        ed25519_secret_to_x25519(&self.secret_bytes)
    }

    /// Convert this key's public half to X25519 for DH operations.
    pub fn to_x25519_public(&self) -> Result<X25519Public, CryptoError> {
        ed25519_pub_to_x25519(&self.public.as_array()?)
    }
}

// ── Ed25519 → X25519 conversion ───────────────────────────────────────────────

/// Convert an Ed25519 signing key (32 bytes) to an X25519 static secret.
/// This uses the clamped SHA-512 expansion that ed25519-dalek uses internally.
pub fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> StaticSecret {
    use sha2::{Digest, Sha512};
    let mut h = Sha512::digest(ed_secret);
    // Clamp as per RFC 7748 §5
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    StaticSecret::from(key)
}

/// Convert an Ed25519 verifying key (public, 32 bytes) to an X25519 public key.
/// Uses the birational map from the Ed25519 curve to Curve25519.
pub fn ed25519_pub_to_x25519(ed_pub: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY::from_slice(ed_pub)
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed.decompress().ok_or_else(|| {
        CryptoError::InvalidKey("Ed25519 public key decompression failed".into())
    })?;
    let montgomery = point.to_montgomery();
    Ok(X25519Public::from(montgomery.to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let ik = IdentityKeyPair::generate();
        let sig = ik.sign(b"prekey-public");
        IdentityKeyPair::verify(&ik.public.0, b"prekey-public", &sig).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_signer() {
        let ik = IdentityKeyPair::generate();
        let other = IdentityKeyPair::generate();
        let sig = other.sign(b"prekey-public");
        assert!(IdentityKeyPair::verify(&ik.public.0, b"prekey-public", &sig).is_err());
    }

    #[test]
    fn converted_keys_agree_on_dh() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();

        let a_secret = a.to_x25519_secret();
        let b_secret = b.to_x25519_secret();
        let a_public = a.to_x25519_public().unwrap();
        let b_public = b.to_x25519_public().unwrap();

        let ab = a_secret.diffie_hellman(&b_public);
        let ba = b_secret.diffie_hellman(&a_public);
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn from_bytes_restores_public() {
        let ik = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_bytes(ik.secret_bytes()).unwrap();
        assert_eq!(restored.public, ik.public);
    }
}
