//! ks_core — the Keyseal messaging core.
//!
//! One `Messenger` per process owns the whole state: the hardware secret
//! store, the sealed blob container, the pre-key lifecycle, and a Double
//! Ratchet session per peer. The embedding layer (keyboard UI, clipboard
//! plumbing, textual framings) talks to exactly three operations —
//! `initialize_or_reload`, `encrypt`, `decrypt` — plus contact management
//! and the safety-number fingerprint.
//!
//! # Modules
//! - `config`   — policy knobs (rotation periods, batch sizes, windows)
//! - `error`    — the boundary error taxonomy
//! - `prekeys`  — identity & pre-key manager (generation, rotation, bundles)
//! - `session`  — session engine (handshake processing, ratchet encrypt/decrypt)
//!
//! # Concurrency
//! Designed for single-threaded cooperative use from the host's main loop,
//! but every bucket is mutex-guarded and mutations write through to disk
//! inside the critical section, so a crash never splits the in-memory and
//! on-disk views.

pub mod config;
pub mod error;
pub mod prekeys;
pub mod session;

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use ks_crypto::fingerprint;
use ks_crypto::identity::IdentityKeyPair;
use ks_proto::codec::{classify, EnvelopeKind};
use ks_proto::envelope::{MessageEnvelope, PreKeyResponse};
use ks_proto::message::CiphertextKind;
use ks_store::keyholder::{
    SecretStore, SECRET_ACCOUNT_DEVICE_ID, SECRET_ACCOUNT_UUID, SECRET_IDENTITY_KEY_PAIR,
    SECRET_REGISTRATION_ID,
};
use ks_store::records::{Contact, LocalAddress, StorageMessage};
use ks_store::{BlobContainer, ProtocolStore};

pub use config::CoreConfig;
pub use error::CoreError;
pub use ks_store::records;

/// Millisecond clock, injectable so tests can drive rotation schedules.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

struct Inner {
    store: ProtocolStore,
    address: LocalAddress,
    registration_id: u32,
}

/// Process-wide messaging state. Created once, explicitly initialized, and
/// wiped only by factory reset.
pub struct Messenger {
    secrets: Arc<dyn SecretStore>,
    data_dir: PathBuf,
    config: CoreConfig,
    clock: Clock,
    inner: Mutex<Option<Inner>>,
}

impl Messenger {
    pub fn new(secrets: Arc<dyn SecretStore>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            secrets,
            data_dir: data_dir.into(),
            config: CoreConfig::default(),
            clock: Arc::new(|| chrono::Utc::now().timestamp_millis()),
            inner: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now_ms(&self) -> i64 {
        (self.clock)()
    }

    fn identity(&self) -> Result<IdentityKeyPair, CoreError> {
        let bytes = self
            .secrets
            .get(SECRET_IDENTITY_KEY_PAIR)?
            .ok_or(CoreError::NotInitialized)?;
        IdentityKeyPair::from_bytes(&bytes).map_err(|e| CoreError::Internal(e.to_string()))
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// First-run initialization or reload of an existing account.
    ///
    /// An account uuid in the secret store means a reload; a reload that
    /// comes back without its critical buckets (pre-keys, signed pre-keys,
    /// Kyber pre-keys) means the at-rest state is unusable — wipe and start
    /// a fresh account.
    pub fn initialize_or_reload(&self) -> Result<(), CoreError> {
        let master = self.secrets.load_or_create_master_key()?;
        let container =
            BlobContainer::open(&self.data_dir, master).map_err(CoreError::from)?;
        let store = ProtocolStore::open(container);
        let now = self.now_ms();

        let inner = match self.secrets.get(SECRET_ACCOUNT_UUID)? {
            Some(uuid_bytes) => {
                store.load()?;
                let identity_present =
                    self.secrets.get(SECRET_IDENTITY_KEY_PAIR)?.is_some();
                if store.critical_buckets_present() && identity_present {
                    let uuid = String::from_utf8(uuid_bytes)
                        .map_err(|_| CoreError::Internal("account uuid is not utf-8".into()))?;
                    let inner = Inner {
                        address: LocalAddress::new(uuid, read_u32(
                            self.secrets.as_ref(),
                            SECRET_ACCOUNT_DEVICE_ID,
                        )?),
                        registration_id: read_u32(
                            self.secrets.as_ref(),
                            SECRET_REGISTRATION_ID,
                        )?,
                        store,
                    };
                    debug!(address = %inner.address, "account reloaded");
                    inner
                } else {
                    error!("reload found corrupted state; wiping and reinitializing");
                    self.reinitialize(store, now)?
                }
            }
            None => self.first_run(store, now)?,
        };

        *self.inner.lock() = Some(inner);
        Ok(())
    }

    fn first_run(&self, store: ProtocolStore, now: i64) -> Result<Inner, CoreError> {
        let address =
            prekeys::initialize_account(self.secrets.as_ref(), &store, &self.config, now)?;
        let registration_id = read_u32(self.secrets.as_ref(), SECRET_REGISTRATION_ID)?;
        Ok(Inner { store, address, registration_id })
    }

    /// Corrupted-state recovery: purge blobs and secrets, mint a new master
    /// key, and create a fresh account.
    fn reinitialize(&self, store: ProtocolStore, now: i64) -> Result<Inner, CoreError> {
        store.wipe()?;
        self.secrets.wipe()?;
        let master = self.secrets.load_or_create_master_key()?;
        let container =
            BlobContainer::open(&self.data_dir, master).map_err(CoreError::from)?;
        let store = ProtocolStore::open(container);
        self.first_run(store, now)
    }

    /// Factory reset: purge all secrets and all sealed buckets. The core
    /// must be initialized again before use.
    pub fn wipe(&self) -> Result<(), CoreError> {
        if let Some(inner) = self.inner.lock().take() {
            inner.store.wipe()?;
        }
        self.secrets.wipe()?;
        Ok(())
    }

    fn with_inner<R>(&self, f: impl FnOnce(&Inner) -> Result<R, CoreError>) -> Result<R, CoreError> {
        let guard = self.inner.lock();
        match guard.as_ref() {
            Some(inner) => f(inner),
            None => Err(CoreError::NotInitialized),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }

    pub fn local_address(&self) -> Result<LocalAddress, CoreError> {
        self.with_inner(|inner| Ok(inner.address.clone()))
    }

    pub fn registration_id(&self) -> Result<u32, CoreError> {
        self.with_inner(|inner| Ok(inner.registration_id))
    }

    // ── Invitations ──────────────────────────────────────────────────────

    /// A pure-invite envelope: our publishable bundle and no ciphertext.
    pub fn build_invite_envelope(&self) -> Result<MessageEnvelope, CoreError> {
        let identity = self.identity()?;
        self.with_inner(|inner| {
            let bundle = prekeys::build_publishable_bundle(
                &inner.store,
                &identity,
                inner.registration_id,
                inner.address.device_id,
            )?;
            Ok(MessageEnvelope {
                signal_protocol_address_name: inner.address.uuid.clone(),
                device_id: inner.address.device_id,
                timestamp: self.now_ms(),
                ciphertext_message: None,
                ciphertext_type: None,
                pre_key_response: Some(PreKeyResponse::from_bundle(&bundle)),
            })
        })
    }

    // ── Messaging ────────────────────────────────────────────────────────

    /// Encrypt one message to a peer. Runs the rotation checks first; a
    /// signed-pre-key rotation piggybacks a fresh bundle onto the envelope.
    /// Rotation failures are logged and deferred, never fatal here.
    pub fn encrypt(
        &self,
        text: &str,
        contact: &LocalAddress,
    ) -> Result<MessageEnvelope, CoreError> {
        let identity = self.identity()?;
        let now = self.now_ms();
        self.with_inner(|inner| {
            let rotated = match prekeys::refresh_signed_pre_key_if_due(
                &inner.store,
                &identity,
                &self.config,
                now,
            ) {
                Ok(rotated) => rotated,
                Err(e) => {
                    warn!(%e, "signed pre-key rotation failed; will retry");
                    prekeys::note_signed_rotation_failure(&inner.store);
                    false
                }
            };
            if let Err(e) =
                prekeys::refresh_kyber_pre_key_if_due(&inner.store, &identity, &self.config, now)
            {
                warn!(%e, "kyber pre-key rotation failed; will retry");
            }

            let (bytes, kind) = session::encrypt_message(&inner.store, text.as_bytes(), contact)?;

            let pre_key_response = if rotated {
                match prekeys::build_publishable_bundle(
                    &inner.store,
                    &identity,
                    inner.registration_id,
                    inner.address.device_id,
                ) {
                    Ok(bundle) => Some(PreKeyResponse::from_bundle(&bundle)),
                    Err(e) => {
                        warn!(%e, "could not piggyback rotated bundle");
                        None
                    }
                }
            } else {
                None
            };

            inner.store.append_message(StorageMessage {
                peer: contact.clone(),
                sender: inner.address.clone(),
                recipient: contact.clone(),
                timestamp_ms: now,
                text: text.to_string(),
            })?;

            Ok(MessageEnvelope {
                signal_protocol_address_name: inner.address.uuid.clone(),
                device_id: inner.address.device_id,
                timestamp: now,
                ciphertext_message: Some(bytes),
                ciphertext_type: Some(kind.tag()),
                pre_key_response,
            })
        })
    }

    /// Consume one inbound envelope from `contact`.
    ///
    /// A piggybacked bundle is applied before the ciphertext is touched.
    /// Returns the decrypted text, or `None` for a pure invite.
    pub fn decrypt(
        &self,
        envelope: &MessageEnvelope,
        contact: &LocalAddress,
    ) -> Result<Option<String>, CoreError> {
        let identity = self.identity()?;
        self.with_inner(|inner| {
            let sender = LocalAddress::new(
                envelope.signal_protocol_address_name.clone(),
                envelope.device_id,
            );
            if sender.uuid == inner.address.uuid {
                return Err(CoreError::InvalidContact(
                    "envelope is addressed from this account".into(),
                ));
            }
            if &sender != contact {
                return Err(CoreError::InvalidContact(
                    "envelope sender does not match the contact".into(),
                ));
            }

            let kind = classify(envelope);
            if kind == EnvelopeKind::Invalid {
                return Err(CoreError::BadBundle("invalid envelope".into()));
            }

            if let Some(ref response) = envelope.pre_key_response {
                let bundle = response
                    .to_bundle()
                    .map_err(|e| CoreError::BadBundle(e.to_string()))?;
                session::process_incoming_bundle(
                    &inner.store,
                    &identity,
                    inner.registration_id,
                    &self.config,
                    &bundle,
                    &sender,
                )?;
            }

            let Some(ref ciphertext) = envelope.ciphertext_message else {
                return Ok(None);
            };
            // classify() already vetted the tag.
            let ctype = envelope
                .ciphertext_type
                .and_then(CiphertextKind::from_tag)
                .ok_or_else(|| CoreError::BadBundle("invalid envelope".into()))?;

            let plaintext = session::decrypt_message(
                &inner.store,
                &identity,
                &self.config,
                ciphertext,
                ctype,
                &sender,
            )?;
            let text = String::from_utf8(plaintext)
                .map_err(|_| CoreError::Internal("plaintext is not utf-8".into()))?;

            inner.store.append_message(StorageMessage {
                peer: sender.clone(),
                sender,
                recipient: inner.address.clone(),
                timestamp_ms: envelope.timestamp,
                text: text.clone(),
            })?;

            Ok(Some(text))
        })
    }

    // ── Contacts & history ───────────────────────────────────────────────

    pub fn add_contact(
        &self,
        first_name: &str,
        last_name: &str,
        address: LocalAddress,
    ) -> Result<(), CoreError> {
        self.with_inner(|inner| {
            if address.uuid.is_empty() {
                return Err(CoreError::InvalidContact("empty address".into()));
            }
            if address.uuid == inner.address.uuid {
                return Err(CoreError::InvalidContact("cannot add own account".into()));
            }
            let added = inner.store.add_contact(Contact {
                address,
                first_name: first_name.to_string(),
                last_name: last_name.to_string(),
                verified: false,
            })?;
            if added {
                Ok(())
            } else {
                Err(CoreError::DuplicateContact)
            }
        })
    }

    /// Remove a contact and everything attached to it: the session record,
    /// the trusted identity, and the local history.
    pub fn remove_contact(&self, address: &LocalAddress) -> Result<(), CoreError> {
        self.with_inner(|inner| {
            if !inner.store.remove_contact(address)? {
                return Err(CoreError::UnknownContact);
            }
            inner.store.remove_session(address)?;
            inner.store.remove_identity(address)?;
            inner.store.remove_messages_with(address)?;
            Ok(())
        })
    }

    pub fn verify_contact(&self, address: &LocalAddress) -> Result<(), CoreError> {
        self.with_inner(|inner| {
            if inner.store.set_contact_verified(address, true)? {
                Ok(())
            } else {
                Err(CoreError::UnknownContact)
            }
        })
    }

    pub fn contacts(&self) -> Result<Vec<Contact>, CoreError> {
        self.with_inner(|inner| Ok(inner.store.contacts()))
    }

    pub fn history(&self, peer: &LocalAddress) -> Result<Vec<StorageMessage>, CoreError> {
        self.with_inner(|inner| Ok(inner.store.messages_with(peer)))
    }

    pub fn has_session(&self, peer: &LocalAddress) -> Result<bool, CoreError> {
        self.with_inner(|inner| Ok(session::has_session(&inner.store, peer)))
    }

    // ── Fingerprint ──────────────────────────────────────────────────────

    /// The 60-digit safety number for a peer, or `None` while their
    /// identity is not yet known.
    pub fn fingerprint(&self, peer: &LocalAddress) -> Result<Option<String>, CoreError> {
        let identity = self.identity()?;
        self.with_inner(|inner| {
            let Some(remote_identity) = inner.store.get_identity(peer)? else {
                return Ok(None);
            };
            Ok(Some(fingerprint::displayable(
                inner.address.uuid.as_bytes(),
                &identity.public.0,
                peer.uuid.as_bytes(),
                &remote_identity,
                self.config.fingerprint_iterations,
            )))
        })
    }
}

fn read_u32(secrets: &dyn SecretStore, name: &str) -> Result<u32, CoreError> {
    let bytes = secrets
        .get(name)?
        .ok_or_else(|| CoreError::Internal(format!("secret {name} missing")))?;
    let arr: [u8; 4] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CoreError::Internal(format!("secret {name} has wrong length")))?;
    Ok(u32::from_le_bytes(arr))
}
