//! Default configuration values for collab-sync.
//!
//! The lock timings follow the values the document updater has always run
//! with: a 30s lease, a 10s wait budget and polling from 50ms up to 1s.

use super::settings::SyncSettings;

pub const DEFAULT_LOCK_LEASE_MS: u64 = 30_000;
pub const DEFAULT_LOCK_MAX_WAIT_MS: u64 = 10_000;
pub const DEFAULT_LOCK_POLL_MIN_MS: u64 = 50;
pub const DEFAULT_LOCK_POLL_MAX_MS: u64 = 1_000;
/// 7 MiB of content plus 64 KiB of op framing.
pub const DEFAULT_MAX_OP_SIZE_BYTES: usize = 7 * 1024 * 1024 + 64 * 1024;
pub const DEFAULT_FLUSH_DELAY_MS: u64 = 500;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 100;
pub const DEFAULT_RECENT_OPS_LEN: usize = 100;
pub const DEFAULT_VERSION_CONFLICT_RETRIES: u32 = 3;

/// Returns fully populated default settings.
pub fn default_settings() -> SyncSettings {
    SyncSettings {
        lock_lease_ms: Some(DEFAULT_LOCK_LEASE_MS),
        lock_max_wait_ms: Some(DEFAULT_LOCK_MAX_WAIT_MS),
        lock_poll_min_ms: Some(DEFAULT_LOCK_POLL_MIN_MS),
        lock_poll_max_ms: Some(DEFAULT_LOCK_POLL_MAX_MS),
        max_op_size_bytes: Some(DEFAULT_MAX_OP_SIZE_BYTES),
        flush_delay_ms: Some(DEFAULT_FLUSH_DELAY_MS),
        sweep_interval_ms: Some(DEFAULT_SWEEP_INTERVAL_MS),
        recent_ops_len: Some(DEFAULT_RECENT_OPS_LEN),
        version_conflict_retries: Some(DEFAULT_VERSION_CONFLICT_RETRIES),
    }
}
