//! Numeric safety-number fingerprint.
//!
//! Both peers derive the same 60-digit string from the pair of long-term
//! identity keys, compare it out of band, and thereby authenticate the
//! session against man-in-the-middle substitution.
//!
//! Per side: SHA-512 is iterated over `version || identifier ||
//! identity_public`, re-feeding the public key each round (the iteration
//! count is the work factor against brute-forced near-collisions). The first
//! 30 bytes become six 5-digit groups; the two halves are sorted so the
//! result is independent of which peer computes it.

use sha2::{Digest, Sha512};

/// Fingerprint format version, mixed into the hash input.
const FINGERPRINT_VERSION: [u8; 2] = [0x00, 0x00];

/// Derive one 30-digit half from an identifier + identity public key.
fn half(identifier: &[u8], identity_public: &[u8], iterations: u32) -> String {
    let mut hasher = Sha512::new();
    hasher.update(FINGERPRINT_VERSION);
    hasher.update(identifier);
    hasher.update(identity_public);
    let mut digest = hasher.finalize();

    for _ in 1..iterations {
        let mut hasher = Sha512::new();
        hasher.update(digest);
        hasher.update(identity_public);
        digest = hasher.finalize();
    }

    // 30 bytes → 6 groups of 5 decimal digits
    let mut out = String::with_capacity(30);
    for chunk in digest[..30].chunks(5) {
        let mut value: u64 = 0;
        for &byte in chunk {
            value = (value << 8) | u64::from(byte);
        }
        out.push_str(&format!("{:05}", value % 100_000));
    }
    out
}

/// Produce the displayable fingerprint: 60 decimal digits (12 groups of 5).
///
/// Symmetric: swapping (local, remote) yields the identical string, so both
/// peers can read the same number aloud.
pub fn displayable(
    local_identifier: &[u8],
    local_identity_public: &[u8],
    remote_identifier: &[u8],
    remote_identity_public: &[u8],
    iterations: u32,
) -> String {
    let local = half(local_identifier, local_identity_public, iterations);
    let remote = half(remote_identifier, remote_identity_public, iterations);

    if local <= remote {
        format!("{local}{remote}")
    } else {
        format!("{remote}{local}")
    }
}

/// Group a 60-digit fingerprint into 12 space-separated blocks for display.
pub fn grouped(digits: &str) -> String {
    digits
        .as_bytes()
        .chunks(5)
        .map(|c| std::str::from_utf8(c).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITERATIONS: u32 = 5200;

    #[test]
    fn output_is_60_decimal_digits() {
        let fp = displayable(b"alice-uuid", &[1u8; 32], b"bob-uuid", &[2u8; 32], ITERATIONS);
        assert_eq!(fp.len(), 60);
        assert!(fp.bytes().all(|b| b.is_ascii_digit()));
        assert_eq!(grouped(&fp).split(' ').count(), 12);
    }

    /// Golden value, fixed forever: any change to the hash input layout,
    /// the iteration scheme, or the digit encoding shows up here.
    #[test]
    fn golden_fingerprint_is_stable() {
        let fp = displayable(b"alice-uuid", &[1u8; 32], b"bob-uuid", &[2u8; 32], ITERATIONS);
        assert_eq!(
            fp,
            "089243880433494501790383863818422159754516682518897296383776"
        );
    }

    #[test]
    fn symmetric_between_peers() {
        let ours = displayable(b"alice-uuid", &[1u8; 32], b"bob-uuid", &[2u8; 32], ITERATIONS);
        let theirs = displayable(b"bob-uuid", &[2u8; 32], b"alice-uuid", &[1u8; 32], ITERATIONS);
        assert_eq!(ours, theirs);
    }

    #[test]
    fn deterministic_across_calls() {
        let a = displayable(b"a", &[9u8; 32], b"b", &[8u8; 32], ITERATIONS);
        let b = displayable(b"a", &[9u8; 32], b"b", &[8u8; 32], ITERATIONS);
        assert_eq!(a, b);
    }

    #[test]
    fn sensitive_to_identity_key_change() {
        let honest = displayable(b"a", &[9u8; 32], b"b", &[8u8; 32], ITERATIONS);
        let mitm = displayable(b"a", &[9u8; 32], b"b", &[7u8; 32], ITERATIONS);
        assert_ne!(honest, mitm);
    }

    #[test]
    fn iteration_count_matters() {
        let fast = displayable(b"a", &[9u8; 32], b"b", &[8u8; 32], 2);
        let slow = displayable(b"a", &[9u8; 32], b"b", &[8u8; 32], 3);
        assert_ne!(fast, slow);
    }
}
