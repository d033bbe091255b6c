//! Sweep settings and their hot-swappable handle

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use vigil_common::ValidationError;

pub const DEFAULT_CONCURRENCY: usize = 1;
pub const DEFAULT_CONVICTION_THRESHOLD: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SLEEP: Duration = Duration::from_secs(5);
pub const DEFAULT_JITTER_MIN: Duration = Duration::from_secs(1);
pub const DEFAULT_JITTER_MAX: Duration = Duration::from_secs(5);
pub const DEFAULT_GRACE_MILLIS: i64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RectifierSettings {
    /// Shards this process sweeps
    pub shards: Vec<u32>,
    /// Accounts rectified at once
    pub concurrency: usize,
    /// Accounts idle for longer than this are not swept
    pub conviction_threshold: Duration,
    /// Pause between passes, before jitter
    pub sleep: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    /// Markers younger than this are left for the next pass
    pub grace_millis: i64,
}

impl RectifierSettings {
    pub fn new(shards: Vec<u32>) -> Self {
        Self {
            shards,
            concurrency: DEFAULT_CONCURRENCY,
            conviction_threshold: DEFAULT_CONVICTION_THRESHOLD,
            sleep: DEFAULT_SLEEP,
            jitter_min: DEFAULT_JITTER_MIN,
            jitter_max: DEFAULT_JITTER_MAX,
            grace_millis: DEFAULT_GRACE_MILLIS,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_conviction_threshold(mut self, threshold: Duration) -> Self {
        self.conviction_threshold = threshold;
        self
    }

    pub fn with_sleep(mut self, sleep: Duration, jitter_min: Duration, jitter_max: Duration) -> Self {
        self.sleep = sleep;
        self.jitter_min = jitter_min;
        self.jitter_max = jitter_max;
        self
    }

    pub fn with_grace_millis(mut self, grace_millis: i64) -> Self {
        self.grace_millis = grace_millis;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.concurrency == 0 {
            return Err(ValidationError::new("concurrency", "must be at least 1"));
        }
        if self.jitter_min > self.jitter_max {
            return Err(ValidationError::new(
                "jitter",
                "minimum jitter exceeds maximum",
            ));
        }
        if self.grace_millis < 0 {
            return Err(ValidationError::new("grace_millis", "must not be negative"));
        }
        Ok(())
    }
}

/// Shared settings that a reload can replace while the sweep runs.
///
/// A pass takes one snapshot at its start, so a swap applies from the next pass.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    current: Arc<RwLock<Arc<RectifierSettings>>>,
    version: Arc<AtomicU64>,
}

impl SettingsHandle {
    pub fn new(settings: RectifierSettings) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(settings))),
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn snapshot(&self) -> Arc<RectifierSettings> {
        self.current.read().clone()
    }

    pub fn replace(&self, settings: RectifierSettings) -> Result<u64, ValidationError> {
        settings.validate()?;
        *self.current.write() = Arc::new(settings);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(version, "Rectifier settings replaced");
        Ok(version)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = RectifierSettings::new(vec![1, 2]);
        assert_eq!(settings.concurrency, 1);
        assert_eq!(settings.conviction_threshold, Duration::from_secs(300));
        assert_eq!(settings.grace_millis, 5_000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_replace_bumps_version() {
        let handle = SettingsHandle::new(RectifierSettings::new(vec![0]));
        let before = handle.snapshot();

        let version = handle
            .replace(RectifierSettings::new(vec![3, 4]).with_concurrency(4))
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(handle.version(), 1);
        assert_eq!(handle.snapshot().shards, vec![3, 4]);
        assert_eq!(before.shards, vec![0]);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let handle = SettingsHandle::new(RectifierSettings::new(vec![0]));
        assert!(
            handle
                .replace(RectifierSettings::new(vec![0]).with_concurrency(0))
                .is_err()
        );
        assert_eq!(handle.version(), 0);
    }
}
