use serde::{Deserialize, Serialize};

/// Tunables as they appear in a TOML file.
///
/// Every field is optional so partial files can be layered over the defaults
/// with [`super::merge_settings`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// Lock lease (expiry) in milliseconds
    pub lock_lease_ms: Option<u64>,
    /// How long an acquire may wait before `LockTimeout`
    pub lock_max_wait_ms: Option<u64>,
    /// First polling interval while the lock is held elsewhere
    pub lock_poll_min_ms: Option<u64>,
    /// Polling interval cap
    pub lock_poll_max_ms: Option<u64>,
    /// Maximum serialized size of one queued operation
    pub max_op_size_bytes: Option<usize>,
    /// Inactivity delay before a scheduled flush fires
    pub flush_delay_ms: Option<u64>,
    /// Pause between dispatcher sweeps of the pending list
    pub sweep_interval_ms: Option<u64>,
    /// Applied ops kept per document for duplicate detection
    pub recent_ops_len: Option<usize>,
    /// Internal retries on `VersionConflict` before giving up
    pub version_conflict_retries: Option<u32>,
}
