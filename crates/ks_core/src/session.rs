//! Session engine: one Double-Ratchet record per peer.
//!
//! A `SessionRecord` holds the current ratchet state plus a bounded list of
//! archived states. Archives exist so that a pre-key rotation riding along
//! with a message ("rotation-with-message") can install a fresh session
//! without losing the ability to decrypt ciphertexts already in flight on
//! the old one; a successful decrypt against an archived state promotes it
//! back to current.
//!
//! Mutation discipline: every operation ratchets a working copy and commits
//! (in-memory record and sealed bucket) only after the cryptography
//! succeeded. A verification failure therefore leaves the record, the
//! pre-key stores, and the trust store exactly as they were.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::debug;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use ks_crypto::identity::IdentityKeyPair;
use ks_crypto::pqxdh::{self, HandshakeHeader, PreKeyBundle};
use ks_crypto::ratchet::RatchetState;
use ks_crypto::{aead, CryptoError};
use ks_proto::message::{CiphertextKind, PreKeyMessage, WhisperMessage, MESSAGE_VERSION};
use ks_proto::CodecError;
use ks_store::records::LocalAddress;
use ks_store::ProtocolStore;

use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::prekeys;

/// Associated data binding whisper payloads to this protocol revision.
const WHISPER_AAD: &[u8] = b"keyseal-whisper-v1";

/// How many superseded ratchet states a record keeps around.
const MAX_ARCHIVED_SESSIONS: usize = 5;

// ── Session record ───────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    ratchet: RatchetState,
    remote_registration_id: u32,
    /// Base key of the PREKEY message that created this state (responder
    /// side). A re-delivered PREKEY message with the same base key belongs
    /// to this state rather than to a new handshake.
    alice_base_key: Option<String>,
    /// Unacknowledged handshake header (initiator side): prepended to every
    /// outbound message until the first inbound message proves the peer has
    /// the session.
    pending: Option<HandshakeHeader>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    current: SessionState,
    previous: Vec<SessionState>,
}

impl SessionRecord {
    fn new(current: SessionState) -> Self {
        Self { current, previous: Vec::new() }
    }

    /// Install a new current state, archiving the old one.
    fn promote_new(&mut self, state: SessionState) {
        let old = std::mem::replace(&mut self.current, state);
        self.previous.insert(0, old);
        self.previous.truncate(MAX_ARCHIVED_SESSIONS);
    }

    fn serialize(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(self).map_err(|e| CoreError::Internal(e.to_string()))
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::Internal(e.to_string()))
    }
}

fn load_record(
    store: &ProtocolStore,
    remote: &LocalAddress,
) -> Result<Option<SessionRecord>, CoreError> {
    match store.load_session(remote)? {
        Some(bytes) => Ok(Some(SessionRecord::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

fn save_record(
    store: &ProtocolStore,
    remote: &LocalAddress,
    record: &SessionRecord,
) -> Result<(), CoreError> {
    store.store_session(remote, &record.serialize()?)?;
    Ok(())
}

pub fn has_session(store: &ProtocolStore, remote: &LocalAddress) -> bool {
    store.has_session(remote)
}

// ── Error mapping ────────────────────────────────────────────────────────────

fn map_ratchet_err(err: CryptoError) -> CoreError {
    match err {
        CryptoError::DuplicateMessage => CoreError::Duplicate,
        CryptoError::SkippedWindowExceeded { .. } => CoreError::OutOfOrderTooFar,
        CryptoError::AeadDecrypt => CoreError::BadMac,
        _ => CoreError::BadMac,
    }
}

fn map_handshake_err(err: CryptoError) -> CoreError {
    match err {
        CryptoError::SignatureVerification => CoreError::BadSignature,
        CryptoError::InvalidKey(msg) | CryptoError::Kem(msg) => CoreError::BadBundle(msg),
        other => CoreError::Internal(other.to_string()),
    }
}

fn map_body_err(err: CodecError) -> CoreError {
    match err {
        CodecError::UnsupportedVersion(v) => CoreError::InvalidVersion(v),
        // A body that does not even parse cannot authenticate.
        _ => CoreError::BadMac,
    }
}

// ── Bundle processing (initiator) ────────────────────────────────────────────

/// Build a session from a peer's published bundle: verify both pre-key
/// signatures, run the hybrid agreement, install the record, and trust the
/// identity on first use.
pub fn process_incoming_bundle(
    store: &ProtocolStore,
    identity: &IdentityKeyPair,
    my_registration_id: u32,
    config: &CoreConfig,
    bundle: &PreKeyBundle,
    remote: &LocalAddress,
) -> Result<(), CoreError> {
    // Trust check before any cryptography.
    if let Some(known) = store.get_identity(remote)? {
        if known != bundle.identity_pub {
            return Err(CoreError::UntrustedIdentity(remote.to_string()));
        }
    }

    let handshake =
        pqxdh::initiate(identity, my_registration_id, bundle).map_err(map_handshake_err)?;

    let spk_pub = X25519Public::from(bundle.signed_pre_key_pub);
    let ratchet = RatchetState::init_initiator(
        handshake.shared_key,
        &spk_pub,
        config.max_skipped_message_keys,
    )
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    let state = SessionState {
        ratchet,
        remote_registration_id: bundle.registration_id,
        alice_base_key: None,
        pending: Some(handshake.header),
    };

    let record = match load_record(store, remote)? {
        Some(mut record) => {
            record.promote_new(state);
            record
        }
        None => SessionRecord::new(state),
    };

    save_record(store, remote, &record)?;
    store.save_identity(remote, &bundle.identity_pub)?;
    debug!(peer = %remote, "session installed from bundle");
    Ok(())
}

// ── Encrypt ──────────────────────────────────────────────────────────────────

/// Advance the sending chain and seal one message. The ciphertext type is
/// PREKEY while the handshake is unacknowledged, WHISPER afterwards.
pub fn encrypt_message(
    store: &ProtocolStore,
    plaintext: &[u8],
    remote: &LocalAddress,
) -> Result<(Vec<u8>, CiphertextKind), CoreError> {
    let Some(mut record) = load_record(store, remote)? else {
        return Err(CoreError::NoSession(remote.to_string()));
    };

    let mut work = record.current.clone();
    let (header, mk) = work
        .ratchet
        .encrypt_step()
        .map_err(|e| CoreError::Internal(e.to_string()))?;
    let sealed = aead::seal(&mk, plaintext, WHISPER_AAD)
        .map_err(|e| CoreError::Internal(e.to_string()))?;

    let whisper = WhisperMessage {
        version: MESSAGE_VERSION,
        header,
        payload: URL_SAFE_NO_PAD.encode(&sealed),
    };

    let (bytes, kind) = match work.pending.clone() {
        Some(handshake) => {
            let msg = PreKeyMessage { version: MESSAGE_VERSION, handshake, message: whisper };
            (
                msg.encode().map_err(|e| CoreError::Internal(e.to_string()))?,
                CiphertextKind::PreKey,
            )
        }
        None => (
            whisper.encode().map_err(|e| CoreError::Internal(e.to_string()))?,
            CiphertextKind::Whisper,
        ),
    };

    record.current = work;
    save_record(store, remote, &record)?;
    Ok((bytes, kind))
}

// ── Decrypt ──────────────────────────────────────────────────────────────────

/// Run one whisper through a state copy. Nothing is committed here.
fn try_decrypt(
    state: &SessionState,
    whisper: &WhisperMessage,
) -> Result<(SessionState, Vec<u8>), CoreError> {
    let mut work = state.clone();
    let mk = work.ratchet.decrypt_step(&whisper.header).map_err(map_ratchet_err)?;
    let sealed = URL_SAFE_NO_PAD
        .decode(&whisper.payload)
        .map_err(|_| CoreError::BadMac)?;
    let plaintext = aead::open(&mk, &sealed, WHISPER_AAD).map_err(|_| CoreError::BadMac)?;
    // An inbound message proves the peer holds the session.
    work.pending = None;
    Ok((work, plaintext.to_vec()))
}

/// Decrypt against the record: current state first, then the archives.
/// A hit on an archived state promotes it back to current.
fn decrypt_with_record(
    record: &mut SessionRecord,
    whisper: &WhisperMessage,
) -> Result<Vec<u8>, CoreError> {
    let current_err = match try_decrypt(&record.current, whisper) {
        Ok((state, plaintext)) => {
            record.current = state;
            return Ok(plaintext);
        }
        Err(e) => e,
    };

    for idx in 0..record.previous.len() {
        if let Ok((state, plaintext)) = try_decrypt(&record.previous[idx], whisper) {
            let demoted = std::mem::replace(&mut record.current, state);
            record.previous[idx] = demoted;
            debug!("archived session promoted to current");
            return Ok(plaintext);
        }
    }

    Err(current_err)
}

pub fn decrypt_message(
    store: &ProtocolStore,
    identity: &IdentityKeyPair,
    config: &CoreConfig,
    ciphertext: &[u8],
    kind: CiphertextKind,
    remote: &LocalAddress,
) -> Result<Vec<u8>, CoreError> {
    match kind {
        CiphertextKind::Whisper => decrypt_whisper(store, ciphertext, remote),
        CiphertextKind::PreKey => decrypt_pre_key(store, identity, config, ciphertext, remote),
    }
}

fn decrypt_whisper(
    store: &ProtocolStore,
    ciphertext: &[u8],
    remote: &LocalAddress,
) -> Result<Vec<u8>, CoreError> {
    let Some(mut record) = load_record(store, remote)? else {
        return Err(CoreError::NoSession(remote.to_string()));
    };
    let whisper = WhisperMessage::decode(ciphertext).map_err(map_body_err)?;

    let plaintext = decrypt_with_record(&mut record, &whisper)?;
    save_record(store, remote, &record)?;
    Ok(plaintext)
}

fn decrypt_pre_key(
    store: &ProtocolStore,
    identity: &IdentityKeyPair,
    config: &CoreConfig,
    ciphertext: &[u8],
    remote: &LocalAddress,
) -> Result<Vec<u8>, CoreError> {
    let msg = PreKeyMessage::decode(ciphertext).map_err(map_body_err)?;
    let sender_identity = msg
        .handshake
        .identity_key_bytes()
        .map_err(|_| CoreError::BadBundle("bad identity key".into()))?;

    // Trust-on-first-use, hard failure on change.
    if let Some(known) = store.get_identity(remote)? {
        if known != sender_identity.to_vec() {
            return Err(CoreError::UntrustedIdentity(remote.to_string()));
        }
    }

    // A re-delivery of a handshake we already completed belongs to the
    // existing state — no pre-key is consumed twice.
    if let Some(mut record) = load_record(store, remote)? {
        let base_key = Some(msg.handshake.base_key.clone());
        if record.current.alice_base_key == base_key
            || record.previous.iter().any(|s| s.alice_base_key == base_key)
        {
            let plaintext = decrypt_with_record(&mut record, &msg.message)?;
            save_record(store, remote, &record)?;
            return Ok(plaintext);
        }
    }

    // Fresh handshake: resolve the referenced pre-keys.
    let signed = store
        .signed_pre_key(msg.handshake.signed_pre_key_id)
        .ok_or(CoreError::InvalidKeyId(msg.handshake.signed_pre_key_id))?;
    let kyber = store
        .kyber_pre_key(msg.handshake.kyber_pre_key_id)
        .ok_or(CoreError::InvalidKeyId(msg.handshake.kyber_pre_key_id))?;
    let one_time = msg
        .handshake
        .pre_key_id
        .map(|id| store.pre_key(id).ok_or(CoreError::InvalidKeyId(id)))
        .transpose()?;

    let spk_secret = StaticSecret::from(signed.secret);
    let opk_secret = one_time.as_ref().map(|r| StaticSecret::from(r.secret));

    let shared = pqxdh::respond(
        identity,
        &spk_secret,
        opk_secret.as_ref(),
        &kyber.secret,
        &msg.handshake,
    )
    .map_err(map_handshake_err)?;

    let spk_pub = X25519Public::from(signed.public);
    let ratchet = RatchetState::init_responder(
        shared,
        &spk_secret,
        &spk_pub,
        config.max_skipped_message_keys,
    )
    .map_err(|e| CoreError::Internal(e.to_string()))?;

    let state = SessionState {
        ratchet,
        remote_registration_id: msg.handshake.registration_id,
        alice_base_key: Some(msg.handshake.base_key.clone()),
        pending: None,
    };

    // Decrypt the embedded message before anything is committed.
    let (state, plaintext) = try_decrypt(&state, &msg.message)?;

    let record = match load_record(store, remote)? {
        Some(mut record) => {
            record.promote_new(state);
            record
        }
        None => SessionRecord::new(state),
    };
    save_record(store, remote, &record)?;
    store.save_identity(remote, &sender_identity)?;

    // Only now is the one-time pre-key truly spent.
    if let Some(used) = one_time {
        prekeys::replenish_one_time_if_consumed(store, used.id)?;
    }

    debug!(peer = %remote, "session installed from PREKEY message");
    Ok(plaintext)
}
