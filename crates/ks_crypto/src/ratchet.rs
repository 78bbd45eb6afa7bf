//! Double Ratchet with DH ratchet steps.
//!
//! References:
//!   - Signal Double Ratchet spec: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation (non-negotiable):
//!   RK  — root key (updated on every DH ratchet step)
//!   CKs — sending chain key (updated per message)
//!   CKr — receiving chain key (updated per message)
//!   MK  — message key (derived from CK, used once, then DELETED)
//!
//! DH Ratchet:
//!   Each party generates a new X25519 ratchet keypair per "turn" (when they
//!   receive a message with a new ratchet public key). The DH output is mixed
//!   into the root key via HKDF, producing a new root key and a new chain key.
//!
//! Forward secrecy: old chain keys and message keys are deleted.
//! Post-compromise security: a new DH ratchet step restores secrecy.
//!
//! Out-of-order delivery is tolerated within a bounded window of skipped
//! message keys; a counter that is already behind the receiving chain and
//! not present in that window is a replay and is rejected as a duplicate.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// How many dead receiving-chain keys we remember for replay detection.
const MAX_PREVIOUS_CHAINS: usize = 8;

// ── Ratchet header (included in every message, unencrypted) ──────────────────

/// Sent alongside every ciphertext so the recipient can advance their ratchet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key (base64)
    pub dh_pub: String,
    /// Message number in the current sending chain
    pub n: u64,
    /// Number of messages in the previous sending chain (for skip handling)
    pub pn: u64,
}

// ── Skipped message keys ─────────────────────────────────────────────────────

/// A message key retained for an out-of-order ciphertext.
/// Kept in insertion order so eviction drops the oldest entry first.
#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    dh_pub: String,
    n: u64,
    mk: [u8; 32],
}

// ── Ratchet state ────────────────────────────────────────────────────────────

/// Complete Double Ratchet state for one session.
/// Serialized (and AEAD-sealed) into the session bucket by the store layer.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    // ── Root key ─────────────────────────────────────────────────────────
    root_key: [u8; 32],

    // ── Sending chain ────────────────────────────────────────────────────
    /// Our current DH ratchet secret (X25519). Regenerated on each DH step.
    dh_send_secret: [u8; 32],
    /// Our current DH ratchet public key (base64)
    dh_send_pub: String,
    /// Sending chain key
    send_ck: [u8; 32],
    /// Send message counter (resets to 0 on DH ratchet)
    pub send_n: u64,

    // ── Receiving chain ──────────────────────────────────────────────────
    /// Peer's last known DH ratchet public key (base64)
    dh_recv_pub: Option<String>,
    /// Receiving chain key
    recv_ck: [u8; 32],
    /// Recv message counter within current chain
    pub recv_n: u64,
    /// Previous send chain length (for skip counting)
    pub prev_send_n: u64,

    /// Receiving-chain keys we have ratcheted away from; counters under
    /// these that are not in `skipped` are replays.
    prev_recv_pubs: Vec<String>,

    /// Message keys for out-of-order ciphertexts. Bounded by `max_skip`.
    skipped: Vec<SkippedKey>,

    /// Out-of-order window bound (from configuration).
    max_skip: u64,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_send_secret.zeroize();
        self.send_ck.zeroize();
        self.recv_ck.zeroize();
        for entry in self.skipped.iter_mut() {
            entry.mk.zeroize();
        }
    }
}

// ── Construction ─────────────────────────────────────────────────────────────

impl RatchetState {
    /// Create a new session as the INITIATOR.
    ///
    /// The initiator has the shared key from PQXDH and the responder's SPK
    /// (which becomes the first "received" DH ratchet key). She immediately
    /// performs a DH ratchet so her first message already rides a fresh chain.
    pub fn init_initiator(
        shared_key: [u8; 32],
        responder_spk_pub: &X25519Public,
        max_skip: u64,
    ) -> Result<Self, CryptoError> {
        let dh_send_secret = StaticSecret::random_from_rng(OsRng);
        let dh_send_pub = X25519Public::from(&dh_send_secret);

        // First DH ratchet step: mix DH(our new key, their SPK) into the root key
        let dh_output = dh_send_secret.diffie_hellman(responder_spk_pub);
        let (new_rk, new_ck) = kdf_rk(&shared_key, dh_output.as_bytes())?;

        Ok(Self {
            root_key: new_rk,
            dh_send_secret: dh_send_secret.to_bytes(),
            dh_send_pub: URL_SAFE_NO_PAD.encode(dh_send_pub.as_bytes()),
            send_ck: new_ck,
            send_n: 0,
            dh_recv_pub: Some(URL_SAFE_NO_PAD.encode(responder_spk_pub.as_bytes())),
            recv_ck: [0u8; 32], // first message from the responder will set this
            recv_n: 0,
            prev_send_n: 0,
            prev_recv_pubs: Vec::new(),
            skipped: Vec::new(),
            max_skip,
        })
    }

    /// Create a new session as the RESPONDER.
    ///
    /// The responder has the shared key from PQXDH. His SPK secret doubles as
    /// the initial DH ratchet key; the actual ratchet happens when the
    /// initiator's first message (with her ratchet public key) arrives.
    pub fn init_responder(
        shared_key: [u8; 32],
        my_spk_secret: &StaticSecret,
        my_spk_pub: &X25519Public,
        max_skip: u64,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            root_key: shared_key,
            dh_send_secret: my_spk_secret.to_bytes(),
            dh_send_pub: URL_SAFE_NO_PAD.encode(my_spk_pub.as_bytes()),
            send_ck: [0u8; 32], // set on first DH ratchet when sending
            send_n: 0,
            dh_recv_pub: None, // set when the initiator's first message arrives
            recv_ck: [0u8; 32],
            recv_n: 0,
            prev_send_n: 0,
            prev_recv_pubs: Vec::new(),
            skipped: Vec::new(),
            max_skip,
        })
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    /// Advance the sending chain. Returns (RatchetHeader, message_key).
    ///
    /// The caller encrypts the plaintext under the message key with AEAD;
    /// the header travels unencrypted alongside the ciphertext.
    pub fn encrypt_step(&mut self) -> Result<(RatchetHeader, [u8; 32]), CryptoError> {
        let (new_ck, mk) = kdf_ck(&self.send_ck)?;
        self.send_ck = new_ck;
        let header = RatchetHeader {
            dh_pub: self.dh_send_pub.clone(),
            n: self.send_n,
            pn: self.prev_send_n,
        };
        self.send_n += 1;
        Ok((header, mk))
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Derive the message key for a received message.
    ///
    /// Handles four cases:
    ///   1. Message from the current receiving chain (normal)
    ///   2. Skipped message in the current or a previous chain
    ///   3. New DH ratchet (peer's dh_pub changed)
    ///   4. Replay of an already-consumed counter → `DuplicateMessage`
    pub fn decrypt_step(&mut self, header: &RatchetHeader) -> Result<[u8; 32], CryptoError> {
        let peer_dh_bytes: [u8; 32] = URL_SAFE_NO_PAD
            .decode(&header.dh_pub)
            .map_err(CryptoError::Base64Decode)?
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("bad ratchet DH pub".into()))?;
        let peer_dh = X25519Public::from(peer_dh_bytes);

        // Case 2: skipped keys first
        if let Some(pos) = self
            .skipped
            .iter()
            .position(|s| s.dh_pub == header.dh_pub && s.n == header.n)
        {
            let entry = self.skipped.remove(pos);
            return Ok(entry.mk);
        }

        // Case 4: a chain we already ratcheted away from, and the key is
        // no longer in the skip window — this counter was consumed.
        if self.prev_recv_pubs.iter().any(|p| p == &header.dh_pub) {
            return Err(CryptoError::DuplicateMessage);
        }

        // Case 3: DH ratchet needed?
        let need_dh_ratchet = match self.dh_recv_pub {
            Some(ref current) => current != &header.dh_pub,
            None => true, // responder receiving the initiator's first message
        };

        if need_dh_ratchet {
            // Bank any remaining keys of the chain we are leaving
            if let Some(current) = self.dh_recv_pub.clone() {
                self.skip_message_keys(&current, header.pn)?;
                self.prev_recv_pubs.push(current);
                if self.prev_recv_pubs.len() > MAX_PREVIOUS_CHAINS {
                    self.prev_recv_pubs.remove(0);
                }
            }

            self.dh_recv_pub = Some(header.dh_pub.clone());

            // Receiving DH ratchet step
            let dh_recv_output =
                StaticSecret::from(self.dh_send_secret).diffie_hellman(&peer_dh);
            let (new_rk, new_recv_ck) = kdf_rk(&self.root_key, dh_recv_output.as_bytes())?;
            self.root_key = new_rk;
            self.recv_ck = new_recv_ck;
            self.recv_n = 0;

            // Sending DH ratchet step (generate a new ratchet keypair)
            self.prev_send_n = self.send_n;
            self.send_n = 0;
            let new_dh = StaticSecret::random_from_rng(OsRng);
            self.dh_send_pub = URL_SAFE_NO_PAD.encode(X25519Public::from(&new_dh).as_bytes());
            let dh_send_output = new_dh.diffie_hellman(&peer_dh);
            let (new_rk2, new_send_ck) = kdf_rk(&self.root_key, dh_send_output.as_bytes())?;
            self.root_key = new_rk2;
            self.send_ck = new_send_ck;
            self.dh_send_secret = new_dh.to_bytes();
        } else if header.n < self.recv_n {
            // Case 4 on the current chain: behind the counter and not skipped.
            return Err(CryptoError::DuplicateMessage);
        }

        // Bank keys in the current chain up to header.n
        let current = self
            .dh_recv_pub
            .clone()
            .ok_or_else(|| CryptoError::RatchetStep("no receiving chain".into()))?;
        self.skip_message_keys(&current, header.n)?;

        // Case 1: derive the message key
        let (new_ck, mk) = kdf_ck(&self.recv_ck)?;
        self.recv_ck = new_ck;
        self.recv_n += 1;

        Ok(mk)
    }

    // ── Internal ─────────────────────────────────────────────────────────

    /// Store skipped message keys from recv_n up to (but not including) `until`.
    fn skip_message_keys(&mut self, dh_pub: &str, until: u64) -> Result<(), CryptoError> {
        if until <= self.recv_n {
            return Ok(());
        }
        let skip_count = until - self.recv_n;
        if skip_count > self.max_skip {
            return Err(CryptoError::SkippedWindowExceeded {
                requested: skip_count,
                max: self.max_skip,
            });
        }

        while self.recv_n < until {
            let (new_ck, mk) = kdf_ck(&self.recv_ck)?;
            self.recv_ck = new_ck;
            self.skipped.push(SkippedKey {
                dh_pub: dh_pub.to_string(),
                n: self.recv_n,
                mk,
            });
            self.recv_n += 1;
        }

        // Evict the oldest banked keys when over the window
        while self.skipped.len() as u64 > self.max_skip {
            let mut entry = self.skipped.remove(0);
            entry.mk.zeroize();
        }

        Ok(())
    }

    /// Our current DH ratchet public key (base64).
    pub fn our_ratchet_pub(&self) -> &str {
        &self.dh_send_pub
    }
}

// ── KDF helpers (per Signal spec) ────────────────────────────────────────────

/// KDF_RK: root key derivation from DH output.
/// Returns (new_root_key, new_chain_key).
fn kdf_rk(rk: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = hkdf::Hkdf::<sha2::Sha256>::new(Some(rk), dh_output);
    let mut new_rk = [0u8; 32];
    let mut ck = [0u8; 32];
    hk.expand(b"keyseal-ratchet-rk", &mut new_rk)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(b"keyseal-ratchet-ck", &mut ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok((new_rk, ck))
}

/// KDF_CK: chain key → (next_chain_key, message_key).
/// Uses HMAC-based derivation per the Signal spec.
fn kdf_ck(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let mut mac_ck = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_ck.update(&[0x01]); // chain key derivation constant
    let new_ck: [u8; 32] = mac_ck.finalize().into_bytes().into();

    let mut mac_mk = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_mk.update(&[0x02]); // message key derivation constant
    let mk: [u8; 32] = mac_mk.finalize().into_bytes().into();

    Ok((new_ck, mk))
}
