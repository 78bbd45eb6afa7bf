//! PQXDH — hybrid asynchronous key agreement.
//!
//! References:
//!   - Signal PQXDH spec: <https://signal.org/docs/specifications/pqxdh/>
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!   - RFC 5869 (HKDF):  <https://datatracker.ietf.org/doc/html/rfc5869>
//!
//! Protocol:
//!   The initiator consumes the responder's published key bundle:
//!     IK_B  (identity, Ed25519 public → converted to X25519)
//!     SPK_B (signed prekey, X25519) + IK_B signature over SPK_B
//!     OPK_B (optional one-time prekey, X25519)
//!     KYB_B (ML-KEM-1024 prekey) + IK_B signature over KYB_B
//!
//!   The initiator generates ONE ephemeral keypair EK_A (X25519) and one
//!   KEM encapsulation against KYB_B.
//!
//!   Secret inputs (single EK_A throughout):
//!     DH1 = DH(IK_A_x25519, SPK_B)      — mutual authentication
//!     DH2 = DH(EK_A,        IK_B_x25519) — forward secrecy
//!     DH3 = DH(EK_A,        SPK_B)      — replay protection
//!     DH4 = DH(EK_A,        OPK_B)      — one-time forward secrecy [optional]
//!     SS  = KEM-Encaps(KYB_B)           — post-quantum forward secrecy
//!
//!   SK = HKDF(salt=0, ikm = 0xFF*32 || DH1 || DH2 || DH3 [|| DH4] || SS,
//!             info="keyseal-pqxdh-v1")
//!
//! Non-negotiable:
//!   - Both prekey signatures MUST verify before any DH is computed.
//!   - A bundle without a Kyber prekey is not a valid bundle; there is no
//!     classical-only fallback path.
//!   - The SK feeds into the Double Ratchet as the initial root key.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    identity::{ed25519_pub_to_x25519, IdentityKeyPair},
    kdf, kem,
};

const PQXDH_INFO: &[u8] = b"keyseal-pqxdh-v1";

// ── Helpers ──────────────────────────────────────────────────────────────────

fn b64d(s: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD.decode(s).map_err(CryptoError::Base64Decode)
}

fn to_32(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32-byte key".into()))
}

// ── Prekey bundle ────────────────────────────────────────────────────────────

/// An unused one-time prekey advertised inside a bundle.
#[derive(Debug, Clone)]
pub struct OneTimePreKeyPublic {
    pub id: u32,
    pub public: [u8; 32],
}

/// Everything a peer needs to start a session with us.
/// Derived from the prekey stores on demand; never persisted as-is.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub device_id: u32,
    /// Ed25519 identity public key (32 bytes)
    pub identity_pub: Vec<u8>,
    pub signed_pre_key_id: u32,
    /// X25519 signed prekey public
    pub signed_pre_key_pub: [u8; 32],
    /// Ed25519 signature over the raw SPK public bytes
    pub signed_pre_key_sig: Vec<u8>,
    pub one_time_pre_key: Option<OneTimePreKeyPublic>,
    pub kyber_pre_key_id: u32,
    /// ML-KEM-1024 public key
    pub kyber_pre_key_pub: Vec<u8>,
    /// Ed25519 signature over the raw KEM public bytes
    pub kyber_pre_key_sig: Vec<u8>,
}

// ── Handshake header ─────────────────────────────────────────────────────────

/// Travels with every PREKEY-type message so the responder can derive SK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeHeader {
    /// Initiator's Ed25519 identity public key (base64)
    pub identity_key: String,
    /// Initiator's ephemeral X25519 public key (base64)
    pub base_key: String,
    /// Initiator's registration id
    pub registration_id: u32,
    /// Which of the responder's signed prekeys was used
    pub signed_pre_key_id: u32,
    /// Which one-time prekey was consumed (`None` if the bundle had none)
    pub pre_key_id: Option<u32>,
    /// Which Kyber prekey the encapsulation targets
    pub kyber_pre_key_id: u32,
    /// ML-KEM-1024 ciphertext (base64)
    pub kyber_ciphertext: String,
}

impl HandshakeHeader {
    pub fn base_key_bytes(&self) -> Result<[u8; 32], CryptoError> {
        to_32(&b64d(&self.base_key)?)
    }

    pub fn identity_key_bytes(&self) -> Result<[u8; 32], CryptoError> {
        to_32(&b64d(&self.identity_key)?)
    }
}

// ── Output ───────────────────────────────────────────────────────────────────

/// Result of the initiator side: a shared secret plus the handshake header.
pub struct InitiatorHandshake {
    /// 32-byte shared key → feeds into the Double Ratchet as initial root key
    pub shared_key: [u8; 32],
    pub header: HandshakeHeader,
}

// ── Initiator ────────────────────────────────────────────────────────────────

/// Initiate a session from a peer's published bundle.
///
/// Steps:
///   1. Verify the SPK and Kyber signatures using IK_B (Ed25519).
///   2. Convert IK_A secret → X25519; convert IK_B pub → X25519.
///   3. Generate ONE ephemeral X25519 keypair EK_A.
///   4. Compute DH1..DH4 and the KEM encapsulation.
///   5. Derive SK via HKDF.
pub fn initiate(
    my_ik: &IdentityKeyPair,
    my_registration_id: u32,
    bundle: &PreKeyBundle,
) -> Result<InitiatorHandshake, CryptoError> {
    // ── 1. Verify prekey signatures ──────────────────────────────────────
    let ik_b_ed = to_32(&bundle.identity_pub)?;
    IdentityKeyPair::verify(&ik_b_ed, &bundle.signed_pre_key_pub, &bundle.signed_pre_key_sig)?;
    IdentityKeyPair::verify(&ik_b_ed, &bundle.kyber_pre_key_pub, &bundle.kyber_pre_key_sig)?;

    // ── 2. Convert identity keys to X25519 ───────────────────────────────
    let ik_a_x = my_ik.to_x25519_secret();
    let ik_b_x = ed25519_pub_to_x25519(&ik_b_ed)?;
    let spk_b = X25519Public::from(bundle.signed_pre_key_pub);

    // ── 3. Generate ephemeral key ────────────────────────────────────────
    let ek_a = StaticSecret::random_from_rng(OsRng);
    let ek_a_pub = X25519Public::from(&ek_a);

    // ── 4. Secret inputs (single EK for all DHs) ─────────────────────────
    let dh1 = ik_a_x.diffie_hellman(&spk_b); // IK_A × SPK_B
    let dh2 = ek_a.diffie_hellman(&ik_b_x); // EK_A × IK_B
    let dh3 = ek_a.diffie_hellman(&spk_b); // EK_A × SPK_B

    let mut ikm = vec![0xFFu8; 32]; // domain separation pad
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    let mut pre_key_id = None;
    if let Some(ref opk) = bundle.one_time_pre_key {
        let opk_b = X25519Public::from(opk.public);
        let dh4 = ek_a.diffie_hellman(&opk_b); // EK_A × OPK_B
        ikm.extend_from_slice(dh4.as_bytes());
        pre_key_id = Some(opk.id);
    }

    let (kyber_ct, mut kyber_ss) = kem::encapsulate(&bundle.kyber_pre_key_pub)?;
    ikm.extend_from_slice(&kyber_ss);
    kyber_ss.zeroize();

    // ── 5. Derive SK ─────────────────────────────────────────────────────
    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), PQXDH_INFO, &mut sk)?;
    ikm.zeroize();

    Ok(InitiatorHandshake {
        shared_key: sk,
        header: HandshakeHeader {
            identity_key: URL_SAFE_NO_PAD.encode(&my_ik.public.0),
            base_key: URL_SAFE_NO_PAD.encode(ek_a_pub.as_bytes()),
            registration_id: my_registration_id,
            signed_pre_key_id: bundle.signed_pre_key_id,
            pre_key_id,
            kyber_pre_key_id: bundle.kyber_pre_key_id,
            kyber_ciphertext: URL_SAFE_NO_PAD.encode(&kyber_ct),
        },
    })
}

// ── Responder ────────────────────────────────────────────────────────────────

/// Reconstruct SK from a received handshake header.
///
/// `my_ik` — our Ed25519 identity keypair
/// `my_spk_secret` — our signed prekey X25519 secret (the one the header names)
/// `my_opk_secret` — the consumed OPK secret (if the initiator used one)
/// `my_kyber_secret` — the ML-KEM secret key the encapsulation targets
pub fn respond(
    my_ik: &IdentityKeyPair,
    my_spk_secret: &StaticSecret,
    my_opk_secret: Option<&StaticSecret>,
    my_kyber_secret: &[u8],
    header: &HandshakeHeader,
) -> Result<[u8; 32], CryptoError> {
    let ek_a = X25519Public::from(header.base_key_bytes()?);
    let sender_ik_x = ed25519_pub_to_x25519(&header.identity_key_bytes()?)?;
    let ik_b_x = my_ik.to_x25519_secret();

    // Mirror the initiator's DH order exactly (DH is commutative):
    //   DH1 = IK_A × SPK_B   →  SPK_B × IK_A
    //   DH2 = EK_A × IK_B    →  IK_B × EK_A
    //   DH3 = EK_A × SPK_B   →  SPK_B × EK_A
    let dh1 = my_spk_secret.diffie_hellman(&sender_ik_x);
    let dh2 = ik_b_x.diffie_hellman(&ek_a);
    let dh3 = my_spk_secret.diffie_hellman(&ek_a);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    if let Some(opk_sec) = my_opk_secret {
        let dh4 = opk_sec.diffie_hellman(&ek_a);
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let kyber_ct = b64d(&header.kyber_ciphertext)?;
    let mut kyber_ss = kem::decapsulate(&kyber_ct, my_kyber_secret)?;
    ikm.extend_from_slice(&kyber_ss);
    kyber_ss.zeroize();

    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), PQXDH_INFO, &mut sk)?;
    ikm.zeroize();

    Ok(sk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kem::KemKeyPair;

    struct Responder {
        ik: IdentityKeyPair,
        spk_secret: StaticSecret,
        opk_secret: StaticSecret,
        kyber: KemKeyPair,
        bundle: PreKeyBundle,
    }

    fn responder(with_opk: bool) -> Responder {
        let ik = IdentityKeyPair::generate();
        let spk_secret = StaticSecret::random_from_rng(OsRng);
        let spk_pub = X25519Public::from(&spk_secret);
        let spk_sig = ik.sign(spk_pub.as_bytes());
        let opk_secret = StaticSecret::random_from_rng(OsRng);
        let opk_pub = X25519Public::from(&opk_secret);
        let kyber = KemKeyPair::generate();
        let kyber_sig = ik.sign(&kyber.public);

        let bundle = PreKeyBundle {
            registration_id: 4242,
            device_id: 1,
            identity_pub: ik.public.0.clone(),
            signed_pre_key_id: 1,
            signed_pre_key_pub: *spk_pub.as_bytes(),
            signed_pre_key_sig: spk_sig,
            one_time_pre_key: with_opk.then(|| OneTimePreKeyPublic {
                id: 7,
                public: *opk_pub.as_bytes(),
            }),
            kyber_pre_key_id: 1,
            kyber_pre_key_pub: kyber.public.clone(),
            kyber_pre_key_sig: kyber_sig,
        };

        Responder { ik, spk_secret, opk_secret, kyber, bundle }
    }

    #[test]
    fn handshake_roundtrip_with_opk() {
        let alice_ik = IdentityKeyPair::generate();
        let bob = responder(true);

        let result = initiate(&alice_ik, 1111, &bob.bundle).unwrap();
        assert_eq!(result.header.pre_key_id, Some(7));

        let bob_sk = respond(
            &bob.ik,
            &bob.spk_secret,
            Some(&bob.opk_secret),
            bob.kyber.secret_bytes(),
            &result.header,
        )
        .unwrap();

        assert_eq!(result.shared_key, bob_sk, "both sides must derive the same SK");
    }

    #[test]
    fn handshake_roundtrip_without_opk() {
        let alice_ik = IdentityKeyPair::generate();
        let bob = responder(false);

        let result = initiate(&alice_ik, 1111, &bob.bundle).unwrap();
        assert_eq!(result.header.pre_key_id, None);

        let bob_sk = respond(
            &bob.ik,
            &bob.spk_secret,
            None,
            bob.kyber.secret_bytes(),
            &result.header,
        )
        .unwrap();

        assert_eq!(result.shared_key, bob_sk);
    }

    #[test]
    fn rejects_forged_signed_prekey_signature() {
        let alice_ik = IdentityKeyPair::generate();
        let evil = IdentityKeyPair::generate();
        let mut bob = responder(true);
        bob.bundle.signed_pre_key_sig = evil.sign(&bob.bundle.signed_pre_key_pub);

        assert!(matches!(
            initiate(&alice_ik, 1111, &bob.bundle),
            Err(CryptoError::SignatureVerification)
        ));
    }

    #[test]
    fn rejects_forged_kyber_signature() {
        let alice_ik = IdentityKeyPair::generate();
        let evil = IdentityKeyPair::generate();
        let mut bob = responder(true);
        bob.bundle.kyber_pre_key_sig = evil.sign(&bob.bundle.kyber_pre_key_pub);

        assert!(matches!(
            initiate(&alice_ik, 1111, &bob.bundle),
            Err(CryptoError::SignatureVerification)
        ));
    }

    #[test]
    fn shared_key_depends_on_kem_secret() {
        let alice_ik = IdentityKeyPair::generate();
        let bob = responder(false);
        let result = initiate(&alice_ik, 1111, &bob.bundle).unwrap();

        // A different Kyber secret must not reproduce the same SK.
        let other_kyber = KemKeyPair::generate();
        let sk = respond(
            &bob.ik,
            &bob.spk_secret,
            None,
            other_kyber.secret_bytes(),
            &result.header,
        )
        .unwrap();
        assert_ne!(result.shared_key, sk);
    }
}
