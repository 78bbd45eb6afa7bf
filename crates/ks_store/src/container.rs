//! Sealed blob container: one AEAD-wrapped file per typed bucket.
//!
//! On-disk format per bucket file: `nonce (12) || ciphertext || tag (16)`,
//! sealed under the storage master key with the bucket name as associated
//! data (a blob moved between buckets fails authentication). Writes go to a
//! temporary sibling and rename into place so a crash leaves either the old
//! or the new blob, never a torn one.
//!
//! Reads that fail authentication fall back to a one-time legacy-plaintext
//! migration: if the raw bytes validate as the expected structured value the
//! blob is re-sealed in place; otherwise the bucket reads as absent.
//! Corruption is a recoverable condition here, not an error — the lifecycle
//! layer decides whether a missing critical bucket means re-initialization.

use std::fs;
use std::path::PathBuf;

use tracing::warn;
use zeroize::Zeroize;

use ks_crypto::aead;

use crate::error::StoreError;

pub struct BlobContainer {
    dir: PathBuf,
    master_key: [u8; 32],
}

impl Drop for BlobContainer {
    fn drop(&mut self) {
        self.master_key.zeroize();
    }
}

impl BlobContainer {
    /// Open (or create) the container directory.
    pub fn open(dir: impl Into<PathBuf>, master_key: [u8; 32]) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, master_key })
    }

    fn bucket_path(&self, bucket: &str) -> PathBuf {
        self.dir.join(format!("{bucket}.bin"))
    }

    /// Seal and persist a bucket value atomically.
    pub fn write(&self, bucket: &str, plaintext: &[u8]) -> Result<(), StoreError> {
        let sealed = aead::seal(&self.master_key, plaintext, bucket.as_bytes())?;
        let path = self.bucket_path(bucket);
        let tmp = self.dir.join(format!("{bucket}.bin.tmp"));
        fs::write(&tmp, &sealed)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Read and open a bucket value.
    ///
    /// `validate` recognizes the expected plaintext structure and gates the
    /// legacy-plaintext migration path. Returns `None` for a missing bucket
    /// and for a blob that neither decrypts nor validates.
    pub fn read(
        &self,
        bucket: &str,
        validate: impl Fn(&[u8]) -> bool,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.bucket_path(bucket);
        let raw = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match aead::open(&self.master_key, &raw, bucket.as_bytes()) {
            Ok(plaintext) => Ok(Some(plaintext.to_vec())),
            Err(_) if validate(&raw) => {
                // Pre-encryption layout: re-seal in place, keep serving.
                warn!(bucket, "migrating legacy plaintext bucket");
                self.write(bucket, &raw)?;
                Ok(Some(raw))
            }
            Err(_) => {
                warn!(bucket, "bucket failed authentication; treating as absent");
                Ok(None)
            }
        }
    }

    /// Delete every bucket file. Used by factory reset.
    pub fn wipe(&self) -> Result<(), StoreError> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.path().extension().map_or(false, |e| e == "bin" || e == "tmp") {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ks_crypto::aead::NONCE_LEN;

    fn container() -> (tempfile::TempDir, BlobContainer) {
        let dir = tempfile::tempdir().unwrap();
        let c = BlobContainer::open(dir.path(), [9u8; 32]).unwrap();
        (dir, c)
    }

    #[test]
    fn write_read_roundtrip() {
        let (_dir, c) = container();
        c.write("contacts", br#"{"v":1}"#).unwrap();
        let got = c.read("contacts", |_| false).unwrap().unwrap();
        assert_eq!(got, br#"{"v":1}"#);
    }

    #[test]
    fn files_start_with_unique_nonces() {
        let (dir, c) = container();
        c.write("a", b"same").unwrap();
        c.write("b", b"same").unwrap();
        let a = std::fs::read(dir.path().join("a.bin")).unwrap();
        let b = std::fs::read(dir.path().join("b.bin")).unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn flipped_byte_reads_as_absent() {
        let (dir, c) = container();
        c.write("sessions", b"state").unwrap();
        let path = dir.path().join("sessions.bin");
        let mut raw = std::fs::read(&path).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0x01;
        std::fs::write(&path, &raw).unwrap();

        assert!(c.read("sessions", |_| false).unwrap().is_none());
    }

    #[test]
    fn bucket_name_is_bound_as_aad() {
        let (dir, c) = container();
        c.write("prekeys", b"keys").unwrap();
        std::fs::rename(dir.path().join("prekeys.bin"), dir.path().join("messages.bin")).unwrap();
        assert!(c.read("messages", |_| false).unwrap().is_none());
    }

    #[test]
    fn legacy_plaintext_is_migrated_once() {
        let (dir, c) = container();
        let path = dir.path().join("metadata.bin");
        std::fs::write(&path, br#"{"legacy":true}"#).unwrap();

        let validate = |raw: &[u8]| serde_json::from_slice::<serde_json::Value>(raw).is_ok();
        let got = c.read("metadata", validate).unwrap().unwrap();
        assert_eq!(got, br#"{"legacy":true}"#);

        // Now sealed on disk: raw bytes are no longer the plaintext.
        let resealed = std::fs::read(&path).unwrap();
        assert_ne!(resealed, br#"{"legacy":true}"#.to_vec());
        let again = c.read("metadata", validate).unwrap().unwrap();
        assert_eq!(again, br#"{"legacy":true}"#);
    }

    #[test]
    fn wipe_removes_buckets() {
        let (_dir, c) = container();
        c.write("contacts", b"x").unwrap();
        c.wipe().unwrap();
        assert!(c.read("contacts", |_| false).unwrap().is_none());
    }

    #[test]
    fn wrong_master_key_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        {
            let c = BlobContainer::open(dir.path(), [1u8; 32]).unwrap();
            c.write("identities", b"trusted").unwrap();
        }
        let c2 = BlobContainer::open(dir.path(), [2u8; 32]).unwrap();
        assert!(c2.read("identities", |_| false).unwrap().is_none());
    }
}
