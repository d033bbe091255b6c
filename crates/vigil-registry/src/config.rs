//! Registry configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_common::DEFAULT_MAX_SHARDS;

use crate::background::DEFAULT_BACKGROUND_CAPACITY;

/// Static settings of a registry instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Size of the account shard space (default: 512)
    #[serde(default = "default_max_shards")]
    pub max_shards: u32,

    /// How long registration waits for the per-service lock (default: 30000ms)
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Grace applied by rectification run before reads (default: 0ms)
    #[serde(default)]
    pub inline_grace_millis: i64,

    /// Markers fetched per scan page during rectification (default: 300)
    #[serde(default = "default_rectify_batch_size")]
    pub rectify_batch_size: usize,

    /// Pending background writes kept before new ones are dropped (default: 10000)
    #[serde(default = "default_background_queue_capacity")]
    pub background_queue_capacity: usize,
}

fn default_max_shards() -> u32 {
    DEFAULT_MAX_SHARDS
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

fn default_rectify_batch_size() -> usize {
    300
}

fn default_background_queue_capacity() -> usize {
    DEFAULT_BACKGROUND_CAPACITY
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_shards: default_max_shards(),
            lock_timeout_ms: default_lock_timeout_ms(),
            inline_grace_millis: 0,
            rectify_batch_size: default_rectify_batch_size(),
            background_queue_capacity: default_background_queue_capacity(),
        }
    }
}

impl RegistryConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config: RegistryConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.max_shards, 512);
        assert_eq!(config.lock_timeout(), Duration::from_secs(30));
        assert_eq!(config.rectify_batch_size, 300);
        assert_eq!(config.inline_grace_millis, 0);
        assert_eq!(config.background_queue_capacity, 10_000);
    }

    #[test]
    fn test_partial_override() {
        let config: RegistryConfig =
            serde_yaml::from_str("max_shards: 16\nlock_timeout_ms: 500\nbackground_queue_capacity: 64\n")
                .unwrap();
        assert_eq!(config.max_shards, 16);
        assert_eq!(config.background_queue_capacity, 64);
        assert_eq!(config.lock_timeout(), Duration::from_millis(500));
    }
}
