pub mod defaults;
pub mod settings;
pub mod user;

pub use settings::SyncSettings;
pub use user::user_config_path;

use std::path::Path;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};
use crate::lock::LockOptions;
use crate::updates::QueueOptions;
use defaults::default_settings;

/// Merge two SyncSettings, preferring values from `primary` over `fallback`
pub fn merge_settings(fallback: SyncSettings, primary: SyncSettings) -> SyncSettings {
    SyncSettings {
        lock_lease_ms: primary.lock_lease_ms.or(fallback.lock_lease_ms),
        lock_max_wait_ms: primary.lock_max_wait_ms.or(fallback.lock_max_wait_ms),
        lock_poll_min_ms: primary.lock_poll_min_ms.or(fallback.lock_poll_min_ms),
        lock_poll_max_ms: primary.lock_poll_max_ms.or(fallback.lock_poll_max_ms),
        max_op_size_bytes: primary.max_op_size_bytes.or(fallback.max_op_size_bytes),
        flush_delay_ms: primary.flush_delay_ms.or(fallback.flush_delay_ms),
        sweep_interval_ms: primary.sweep_interval_ms.or(fallback.sweep_interval_ms),
        recent_ops_len: primary.recent_ops_len.or(fallback.recent_ops_len),
        version_conflict_retries: primary
            .version_conflict_retries
            .or(fallback.version_conflict_retries),
    }
}

/// Parse a TOML settings file.
pub fn load_settings_file(path: &Path) -> SyncResult<SyncSettings> {
    let contents = std::fs::read_to_string(path)?;
    toml::from_str::<SyncSettings>(&contents)
        .map_err(|e| SyncError::config(format!("{}: {}", path.display(), e)))
}

/// Effective configuration: defaults, then the user file, then `explicit`.
///
/// A missing user file is ignored; a missing explicit file is an error.
pub fn load_config(explicit: Option<&Path>) -> SyncResult<SyncConfig> {
    let mut merged = default_settings();

    if let Some(user_path) = user_config_path().filter(|p| p.is_file()) {
        log::debug!(
            target: "collab_sync::config",
            "Loading user config from {}",
            user_path.display()
        );
        merged = merge_settings(merged, load_settings_file(&user_path)?);
    }

    if let Some(path) = explicit {
        merged = merge_settings(merged, load_settings_file(path)?);
    }

    SyncConfig::from_settings(&merged)
}

/// Validated, typed configuration handed to the components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub lock: LockOptions,
    pub queue: QueueOptions,
    pub flush_delay: Duration,
    pub sweep_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lock: LockOptions::default(),
            queue: QueueOptions::default(),
            flush_delay: Duration::from_millis(defaults::DEFAULT_FLUSH_DELAY_MS),
            sweep_interval: Duration::from_millis(defaults::DEFAULT_SWEEP_INTERVAL_MS),
        }
    }
}

impl SyncConfig {
    /// Resolve settings (missing fields fall back to defaults) and validate them.
    pub fn from_settings(settings: &SyncSettings) -> SyncResult<Self> {
        let settings = merge_settings(default_settings(), settings.clone());
        let ms = |value: Option<u64>| Duration::from_millis(value.unwrap_or_default());

        let config = Self {
            lock: LockOptions {
                lease: ms(settings.lock_lease_ms),
                max_wait: ms(settings.lock_max_wait_ms),
                poll_min: ms(settings.lock_poll_min_ms),
                poll_max: ms(settings.lock_poll_max_ms),
            },
            queue: QueueOptions {
                max_op_size: settings.max_op_size_bytes.unwrap_or_default(),
                recent_ops_len: settings.recent_ops_len.unwrap_or_default(),
                version_conflict_retries: settings.version_conflict_retries.unwrap_or_default(),
            },
            flush_delay: ms(settings.flush_delay_ms),
            sweep_interval: ms(settings.sweep_interval_ms),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.lock.lease.is_zero() {
            return Err(SyncError::config("lockLeaseMs must be greater than zero"));
        }
        if self.lock.poll_min.is_zero() {
            return Err(SyncError::config("lockPollMinMs must be greater than zero"));
        }
        if self.lock.poll_min > self.lock.poll_max {
            return Err(SyncError::config(format!(
                "lockPollMinMs ({:?}) exceeds lockPollMaxMs ({:?})",
                self.lock.poll_min, self.lock.poll_max
            )));
        }
        if self.queue.max_op_size == 0 {
            return Err(SyncError::config("maxOpSizeBytes must be greater than zero"));
        }
        if self.sweep_interval.is_zero() {
            return Err(SyncError::config("sweepIntervalMs must be greater than zero"));
        }
        Ok(())
    }

    /// Settings view of this config, for printing.
    pub fn to_settings(&self) -> SyncSettings {
        let ms = |d: Duration| Some(d.as_millis() as u64);
        SyncSettings {
            lock_lease_ms: ms(self.lock.lease),
            lock_max_wait_ms: ms(self.lock.max_wait),
            lock_poll_min_ms: ms(self.lock.poll_min),
            lock_poll_max_ms: ms(self.lock.poll_max),
            max_op_size_bytes: Some(self.queue.max_op_size),
            flush_delay_ms: ms(self.flush_delay),
            sweep_interval_ms: ms(self.sweep_interval),
            recent_ops_len: Some(self.queue.recent_ops_len),
            version_conflict_retries: Some(self.queue.version_conflict_retries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_matches_default_settings() {
        let config = SyncConfig::from_settings(&SyncSettings::default()).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.lock.lease, Duration::from_secs(30));
        assert_eq!(config.lock.max_wait, Duration::from_secs(10));
        assert_eq!(config.queue.max_op_size, 7 * 1024 * 1024 + 64 * 1024);
    }

    #[test]
    fn primary_settings_override_fallback() {
        let fallback = default_settings();
        let primary = SyncSettings {
            lock_lease_ms: Some(5_000),
            ..Default::default()
        };

        let merged = merge_settings(fallback, primary);

        assert_eq!(merged.lock_lease_ms, Some(5_000));
        assert_eq!(
            merged.lock_max_wait_ms,
            Some(defaults::DEFAULT_LOCK_MAX_WAIT_MS)
        );
    }

    #[test]
    fn partial_toml_file_layers_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "maxOpSizeBytes = 2048\nlockPollMaxMs = 200").unwrap();

        let settings = load_settings_file(file.path()).unwrap();
        let config = SyncConfig::from_settings(&settings).unwrap();

        assert_eq!(config.queue.max_op_size, 2048);
        assert_eq!(config.lock.poll_max, Duration::from_millis(200));
        assert_eq!(config.lock.poll_min, Duration::from_millis(50));
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "lockLeaseMs = \"soon\"").unwrap();

        let err = load_settings_file(file.path()).unwrap_err();
        assert!(matches!(err, SyncError::Config { .. }));
    }

    #[test]
    fn validation_rejects_inverted_poll_bounds() {
        let settings = SyncSettings {
            lock_poll_min_ms: Some(500),
            lock_poll_max_ms: Some(100),
            ..Default::default()
        };

        let err = SyncConfig::from_settings(&settings).unwrap_err();
        assert!(err.to_string().contains("lockPollMinMs"));
    }

    #[test]
    fn validation_rejects_zero_lease_and_size() {
        let zero_lease = SyncSettings {
            lock_lease_ms: Some(0),
            ..Default::default()
        };
        assert!(SyncConfig::from_settings(&zero_lease).is_err());

        let zero_size = SyncSettings {
            max_op_size_bytes: Some(0),
            ..Default::default()
        };
        assert!(SyncConfig::from_settings(&zero_size).is_err());
    }

    #[test]
    fn to_settings_round_trips_through_toml() {
        let config = SyncConfig::default();
        let text = toml::to_string_pretty(&config.to_settings()).unwrap();
        let parsed: SyncSettings = toml::from_str(&text).unwrap();

        assert_eq!(SyncConfig::from_settings(&parsed).unwrap(), config);
    }
}
