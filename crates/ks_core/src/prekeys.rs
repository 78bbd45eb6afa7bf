//! Identity & pre-key lifecycle.
//!
//! Owns account creation and the three pre-key populations:
//! - one-time ECC pre-keys (consumed once, regenerated under the same id),
//! - the signed pre-key (rotated on a schedule, archived briefly),
//! - the Kyber pre-key (rotated on its own schedule; only the newest
//!   record survives a rotation).
//!
//! All scheduling state lives in the metadata bucket so a process restart
//! resumes the exact rotation timeline. Rotation here is infallible from
//! the caller's point of view — the lifecycle layer logs failures and
//! retries on the next outbound encrypt.

use rand::{rngs::OsRng, Rng};
use tracing::debug;
use uuid::Uuid;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use ks_crypto::identity::IdentityKeyPair;
use ks_crypto::kem::KemKeyPair;
use ks_crypto::pqxdh::{OneTimePreKeyPublic, PreKeyBundle};
use ks_store::keyholder::{
    SecretStore, SECRET_ACCOUNT_DEVICE_ID, SECRET_ACCOUNT_UUID, SECRET_IDENTITY_KEY_PAIR,
    SECRET_REGISTRATION_ID,
};
use ks_store::records::{
    KyberPreKeyRecord, LocalAddress, PreKeyMetadata, PreKeyRecord, SignedPreKeyRecord,
};
use ks_store::ProtocolStore;

use crate::config::CoreConfig;
use crate::error::CoreError;

/// Pre-key ids live in [1, 2^24).
const PRE_KEY_ID_MASK: u32 = 0x00FF_FFFF;

/// Registration ids live in [1, 16380].
const REGISTRATION_ID_MAX: u32 = 16380;

fn bump_id(id: u32) -> u32 {
    let next = (id + 1) & PRE_KEY_ID_MASK;
    if next == 0 {
        1
    } else {
        next
    }
}

// ── Record generation ────────────────────────────────────────────────────────

fn generate_one_time(id: u32) -> PreKeyRecord {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    PreKeyRecord {
        id,
        public: *public.as_bytes(),
        secret: secret.to_bytes(),
        used: false,
    }
}

fn generate_signed(identity: &IdentityKeyPair, id: u32, now_ms: i64) -> SignedPreKeyRecord {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    let signature = identity.sign(public.as_bytes());
    SignedPreKeyRecord {
        id,
        created_at_ms: now_ms,
        public: *public.as_bytes(),
        secret: secret.to_bytes(),
        signature,
    }
}

fn generate_kyber(identity: &IdentityKeyPair, id: u32, now_ms: i64) -> KyberPreKeyRecord {
    let pair = KemKeyPair::generate();
    let signature = identity.sign(&pair.public);
    KyberPreKeyRecord {
        id,
        created_at_ms: now_ms,
        public: pair.public.clone(),
        secret: pair.secret_bytes().to_vec(),
        signature,
    }
}

/// The newest Kyber record is the current one.
pub(crate) fn current_kyber(store: &ProtocolStore) -> Option<KyberPreKeyRecord> {
    store
        .kyber_pre_key_ids()
        .into_iter()
        .filter_map(|id| store.kyber_pre_key(id))
        .max_by_key(|r| (r.created_at_ms, r.id))
}

// ── Account initialization ───────────────────────────────────────────────────

/// Generate a fresh account: uuid, registration id, identity keypair, the
/// one-time batch, one active signed pre-key and one Kyber pre-key, and the
/// rotation schedule. Everything persists before this returns.
pub fn initialize_account(
    secrets: &dyn SecretStore,
    store: &ProtocolStore,
    config: &CoreConfig,
    now_ms: i64,
) -> Result<LocalAddress, CoreError> {
    let uuid = Uuid::new_v4().to_string();
    let registration_id: u32 = OsRng.gen_range(1..=REGISTRATION_ID_MAX);
    let device_id: u32 = 1;

    let identity = IdentityKeyPair::generate();
    secrets.set(SECRET_IDENTITY_KEY_PAIR, identity.secret_bytes())?;
    secrets.set(SECRET_REGISTRATION_ID, &registration_id.to_le_bytes())?;
    secrets.set(SECRET_ACCOUNT_DEVICE_ID, &device_id.to_le_bytes())?;

    for id in 1..=config.one_time_batch {
        store.put_pre_key(generate_one_time(id))?;
    }

    let signed_id = 1u32;
    store.put_signed_pre_key(generate_signed(&identity, signed_id, now_ms))?;

    let kyber_id = 2u32;
    store.put_kyber_pre_key(generate_kyber(&identity, kyber_id, now_ms))?;

    store.set_metadata(PreKeyMetadata {
        next_one_time_id: bump_id(config.one_time_batch),
        next_signed_id: 3,
        active_signed_id: signed_id,
        is_signed_registered: false,
        signed_failure_count: 0,
        next_signed_refresh_ms: now_ms + config.rotation_period_ms,
        old_signed_deletion_ms: now_ms + config.archive_age_ms,
        next_kyber_refresh_ms: now_ms + config.rotation_period_ms,
        old_kyber_deletion_ms: now_ms + config.archive_age_ms,
    })?;

    // The uuid is written last: its presence marks a fully created account.
    secrets.set(SECRET_ACCOUNT_UUID, uuid.as_bytes())?;

    debug!(%uuid, registration_id, "account initialized");
    Ok(LocalAddress::new(uuid, device_id))
}

// ── Rotation ─────────────────────────────────────────────────────────────────

/// Rotate the signed pre-key when its refresh deadline passed; purge
/// non-active records past the archive age. Returns whether a rotation
/// occurred.
pub fn refresh_signed_pre_key_if_due(
    store: &ProtocolStore,
    identity: &IdentityKeyPair,
    config: &CoreConfig,
    now_ms: i64,
) -> Result<bool, CoreError> {
    let Some(mut meta) = store.metadata() else {
        return Err(CoreError::NotInitialized);
    };

    // Archival first, against the pre-rotation deadline, so a freshly
    // rotated-out key survives a full archive window.
    if now_ms >= meta.old_signed_deletion_ms {
        store.retain_signed_pre_key(meta.active_signed_id)?;
        meta.old_signed_deletion_ms = now_ms + config.archive_age_ms;
    }

    let mut rotated = false;
    if now_ms >= meta.next_signed_refresh_ms {
        let id = meta.next_signed_id;
        store.put_signed_pre_key(generate_signed(identity, id, now_ms))?;
        meta.active_signed_id = id;
        meta.next_signed_id = bump_id(id);
        meta.next_signed_refresh_ms = now_ms + config.rotation_period_ms;
        meta.old_signed_deletion_ms = now_ms + config.archive_age_ms;
        meta.is_signed_registered = false;
        rotated = true;
        debug!(id, "rotated signed pre-key");
    }

    store.set_metadata(meta)?;
    Ok(rotated)
}

/// Rotate the Kyber pre-key on its independent schedule. Only the newest
/// record survives a rotation.
pub fn refresh_kyber_pre_key_if_due(
    store: &ProtocolStore,
    identity: &IdentityKeyPair,
    config: &CoreConfig,
    now_ms: i64,
) -> Result<bool, CoreError> {
    let Some(mut meta) = store.metadata() else {
        return Err(CoreError::NotInitialized);
    };

    let mut rotated = false;
    if now_ms >= meta.next_kyber_refresh_ms {
        let id = meta.next_signed_id; // signed and Kyber ids share one counter
        store.put_kyber_pre_key(generate_kyber(identity, id, now_ms))?;
        store.retain_kyber_pre_key(id)?;
        meta.next_signed_id = bump_id(id);
        meta.next_kyber_refresh_ms = now_ms + config.rotation_period_ms;
        meta.old_kyber_deletion_ms = now_ms + config.archive_age_ms;
        rotated = true;
        debug!(id, "rotated kyber pre-key");
    }

    store.set_metadata(meta)?;
    Ok(rotated)
}

/// Record a failed rotation attempt; the next encrypt retries.
pub fn note_signed_rotation_failure(store: &ProtocolStore) {
    if let Some(mut meta) = store.metadata() {
        meta.signed_failure_count += 1;
        let _ = store.set_metadata(meta);
    }
}

// ── One-time pre-key upkeep ──────────────────────────────────────────────────

/// Called after a PREKEY decrypt consumed one-time id `used_id`: drop the
/// spent record and provision a fresh key under the same slot, so the store
/// never runs empty.
pub fn replenish_one_time_if_consumed(
    store: &ProtocolStore,
    used_id: u32,
) -> Result<(), CoreError> {
    store.remove_pre_key(used_id)?;
    store.put_pre_key(generate_one_time(used_id))?;
    debug!(used_id, "replenished one-time pre-key");
    Ok(())
}

/// Smallest id whose record has not been handed out; synthesizes a new
/// record when every provisioned key is already in circulation.
pub fn get_unused_one_time_id(
    store: &ProtocolStore,
) -> Result<u32, CoreError> {
    if let Some(id) = store.smallest_unused_pre_key_id() {
        return Ok(id);
    }
    let Some(mut meta) = store.metadata() else {
        return Err(CoreError::NotInitialized);
    };
    let id = meta.next_one_time_id;
    meta.next_one_time_id = bump_id(id);
    store.put_pre_key(generate_one_time(id))?;
    store.set_metadata(meta)?;
    debug!(id, "synthesized one-time pre-key");
    Ok(id)
}

// ── Publishable bundle ───────────────────────────────────────────────────────

/// Assemble everything a peer needs to start a session with us. Hands out
/// one unused one-time pre-key and marks it as circulating.
pub fn build_publishable_bundle(
    store: &ProtocolStore,
    identity: &IdentityKeyPair,
    registration_id: u32,
    device_id: u32,
) -> Result<PreKeyBundle, CoreError> {
    let Some(mut meta) = store.metadata() else {
        return Err(CoreError::NotInitialized);
    };

    let signed = store
        .signed_pre_key(meta.active_signed_id)
        .ok_or_else(|| CoreError::Internal("active signed pre-key missing".into()))?;
    let kyber = current_kyber(store)
        .ok_or_else(|| CoreError::Internal("kyber pre-key missing".into()))?;

    let opk_id = get_unused_one_time_id(store)?;
    let opk = store
        .pre_key(opk_id)
        .ok_or_else(|| CoreError::Internal("one-time pre-key missing".into()))?;
    store.mark_pre_key_used(opk_id)?;

    meta.is_signed_registered = true;
    store.set_metadata(meta)?;

    Ok(PreKeyBundle {
        registration_id,
        device_id,
        identity_pub: identity.public.0.clone(),
        signed_pre_key_id: signed.id,
        signed_pre_key_pub: signed.public,
        signed_pre_key_sig: signed.signature.clone(),
        one_time_pre_key: Some(OneTimePreKeyPublic { id: opk.id, public: opk.public }),
        kyber_pre_key_id: kyber.id,
        kyber_pre_key_pub: kyber.public.clone(),
        kyber_pre_key_sig: kyber.signature.clone(),
    })
}
