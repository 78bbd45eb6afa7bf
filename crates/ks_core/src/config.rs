//! Tunable policy knobs. Defaults match the shipped keyboard product;
//! tests shrink the windows to drive schedules with a virtual clock.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Interval between signed pre-key rotations; the Kyber pre-key rotates
    /// on its own schedule with the same period.
    pub rotation_period_ms: i64,
    /// Age after which non-active signed records are purged.
    pub archive_age_ms: i64,
    /// How many one-time pre-keys to keep provisioned. Small on purpose:
    /// there is no server replenishment in this system.
    pub one_time_batch: u32,
    /// Slow-hash rounds for the numeric fingerprint.
    pub fingerprint_iterations: u32,
    /// Bound on the out-of-order receive window.
    pub max_skipped_message_keys: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            rotation_period_ms: 172_800_000, // 2 days
            archive_age_ms: 172_800_000,     // 2 days
            one_time_batch: 2,
            fingerprint_iterations: 5200,
            max_skipped_message_keys: 2000,
        }
    }
}
