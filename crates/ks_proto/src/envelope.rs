//! The outer message envelope — the only record the transport ever sees.
//!
//! An envelope carries a handshake offer (`preKeyResponse`), a ciphertext,
//! or both (when a pre-key rotation rides along with a message). Field names
//! are part of the wire contract and never change; byte-valued fields are
//! base64url strings without padding.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use ks_crypto::pqxdh::{OneTimePreKeyPublic, PreKeyBundle};

use crate::codec::CodecError;

// ── base64 field helpers ─────────────────────────────────────────────────────

mod b64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        URL_SAFE_NO_PAD.decode(&s).map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => ser.serialize_some(&URL_SAFE_NO_PAD.encode(b)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        let opt: Option<String> = Option::deserialize(de)?;
        opt.map(|s| URL_SAFE_NO_PAD.decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// On-wire envelope. At least one of `pre_key_response` / `ciphertext_message`
/// is present in every valid envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MessageEnvelope {
    /// Sender's account UUID.
    pub signal_protocol_address_name: String,
    /// Sender's device id.
    pub device_id: u32,
    /// Sender-side timestamp, milliseconds since epoch.
    pub timestamp: i64,
    /// Encoded PREKEY or WHISPER body (see `message`).
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub ciphertext_message: Option<Vec<u8>>,
    /// 3 = PREKEY, 2 = WHISPER. Present iff `ciphertext_message` is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ciphertext_type: Option<i32>,
    /// Handshake offer: the sender's publishable pre-key bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_key_response: Option<PreKeyResponse>,
}

// ── Pre-key response (bundle on the wire) ────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PreKeyResponse {
    /// Ed25519 identity public key.
    #[serde(with = "b64")]
    pub identity_key: Vec<u8>,
    /// Exactly one device record in this system.
    pub devices: Vec<PreKeyResponseItem>,
    /// ML-KEM-1024 public key. Always present in bundles we emit.
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub kyber_pub_key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kyber_pre_key_id: Option<u32>,
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub kyber_signature: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PreKeyResponseItem {
    pub device_id: u32,
    pub registration_id: u32,
    pub signed_pre_key: SignedPreKeyWire,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_key: Option<PreKeyWire>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SignedPreKeyWire {
    pub key_id: u32,
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PreKeyWire {
    pub key_id: u32,
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
}

// ── Bundle conversion ────────────────────────────────────────────────────────

fn to_32(bytes: &[u8], what: &str) -> Result<[u8; 32], CodecError> {
    bytes
        .try_into()
        .map_err(|_| CodecError::Invalid(format!("{what} must be 32 bytes")))
}

impl PreKeyResponse {
    /// Wrap a publishable bundle for the wire.
    pub fn from_bundle(bundle: &PreKeyBundle) -> Self {
        Self {
            identity_key: bundle.identity_pub.clone(),
            devices: vec![PreKeyResponseItem {
                device_id: bundle.device_id,
                registration_id: bundle.registration_id,
                signed_pre_key: SignedPreKeyWire {
                    key_id: bundle.signed_pre_key_id,
                    public_key: bundle.signed_pre_key_pub.to_vec(),
                    signature: bundle.signed_pre_key_sig.clone(),
                },
                pre_key: bundle.one_time_pre_key.as_ref().map(|opk| PreKeyWire {
                    key_id: opk.id,
                    public_key: opk.public.to_vec(),
                }),
            }],
            kyber_pub_key: Some(bundle.kyber_pre_key_pub.clone()),
            kyber_pre_key_id: Some(bundle.kyber_pre_key_id),
            kyber_signature: Some(bundle.kyber_pre_key_sig.clone()),
        }
    }

    /// Reconstruct the bundle a peer published.
    ///
    /// Structural requirements: exactly one device record, 32-byte curve
    /// keys, and a complete Kyber triple — there is no classical-only
    /// bundle in this protocol.
    pub fn to_bundle(&self) -> Result<PreKeyBundle, CodecError> {
        let device = match self.devices.as_slice() {
            [device] => device,
            _ => {
                return Err(CodecError::Invalid(format!(
                    "expected exactly one device record, got {}",
                    self.devices.len()
                )))
            }
        };

        let kyber_pub = self
            .kyber_pub_key
            .clone()
            .ok_or_else(|| CodecError::Invalid("missing kyberPubKey".into()))?;
        let kyber_id = self
            .kyber_pre_key_id
            .ok_or_else(|| CodecError::Invalid("missing kyberPreKeyId".into()))?;
        let kyber_sig = self
            .kyber_signature
            .clone()
            .ok_or_else(|| CodecError::Invalid("missing kyberSignature".into()))?;

        Ok(PreKeyBundle {
            registration_id: device.registration_id,
            device_id: device.device_id,
            identity_pub: self.identity_key.clone(),
            signed_pre_key_id: device.signed_pre_key.key_id,
            signed_pre_key_pub: to_32(&device.signed_pre_key.public_key, "signedPreKey.publicKey")?,
            signed_pre_key_sig: device.signed_pre_key.signature.clone(),
            one_time_pre_key: device
                .pre_key
                .as_ref()
                .map(|pk| {
                    Ok::<_, CodecError>(OneTimePreKeyPublic {
                        id: pk.key_id,
                        public: to_32(&pk.public_key, "preKey.publicKey")?,
                    })
                })
                .transpose()?,
            kyber_pre_key_id: kyber_id,
            kyber_pre_key_pub: kyber_pub,
            kyber_pre_key_sig: kyber_sig,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response() -> PreKeyResponse {
        PreKeyResponse {
            identity_key: vec![1u8; 32],
            devices: vec![PreKeyResponseItem {
                device_id: 1,
                registration_id: 512,
                signed_pre_key: SignedPreKeyWire {
                    key_id: 10,
                    public_key: vec![2u8; 32],
                    signature: vec![3u8; 64],
                },
                pre_key: Some(PreKeyWire {
                    key_id: 1,
                    public_key: vec![4u8; 32],
                }),
            }],
            kyber_pub_key: Some(vec![5u8; 1568]),
            kyber_pre_key_id: Some(11),
            kyber_signature: Some(vec![6u8; 64]),
        }
    }

    #[test]
    fn bundle_conversion_roundtrip() {
        let response = sample_response();
        let bundle = response.to_bundle().unwrap();
        assert_eq!(bundle.signed_pre_key_id, 10);
        assert_eq!(bundle.kyber_pre_key_id, 11);
        assert_eq!(bundle.one_time_pre_key.as_ref().unwrap().id, 1);

        let back = PreKeyResponse::from_bundle(&bundle);
        assert_eq!(back, response);
    }

    #[test]
    fn bundle_requires_kyber_triple() {
        let mut response = sample_response();
        response.kyber_pub_key = None;
        assert!(response.to_bundle().is_err());

        let mut response = sample_response();
        response.kyber_signature = None;
        assert!(response.to_bundle().is_err());
    }

    #[test]
    fn bundle_requires_single_device() {
        let mut response = sample_response();
        response.devices.clear();
        assert!(response.to_bundle().is_err());

        let mut response = sample_response();
        let dup = response.devices[0].clone();
        response.devices.push(dup);
        assert!(response.to_bundle().is_err());
    }

    #[test]
    fn wire_names_are_stable() {
        let response = sample_response();
        let json = serde_json::to_string(&response).unwrap();
        for name in [
            "identityKey",
            "devices",
            "deviceId",
            "registrationId",
            "signedPreKey",
            "keyId",
            "publicKey",
            "signature",
            "preKey",
            "kyberPubKey",
            "kyberPreKeyId",
            "kyberSignature",
        ] {
            assert!(json.contains(name), "missing wire field {name}");
        }
    }
}
