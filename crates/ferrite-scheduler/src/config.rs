//! Scheduler configuration.

use serde::{Deserialize, Serialize};

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Running tasks whose heartbeat is silent this long are failed.
    #[serde(default = "default_zombie_timeout")]
    pub zombie_timeout_secs: u64,
    /// Running tasks older than this are failed even with live heartbeats.
    #[serde(default = "default_endless_timeout")]
    pub endless_timeout_secs: u64,
    /// Waiting/blocked jobs untouched this long are cancelled.
    #[serde(default = "default_abandoned_timeout")]
    pub abandoned_timeout_secs: u64,
    /// Interval between reaper sweeps.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
    /// Capacity of the task-credential cache.
    #[serde(default = "default_credential_cache_size")]
    pub credential_cache_size: usize,
}

fn default_zombie_timeout() -> u64 {
    10 * 60
}

fn default_endless_timeout() -> u64 {
    3 * 60 * 60
}

fn default_abandoned_timeout() -> u64 {
    24 * 60 * 60
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_credential_cache_size() -> usize {
    1024
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            zombie_timeout_secs: default_zombie_timeout(),
            endless_timeout_secs: default_endless_timeout(),
            abandoned_timeout_secs: default_abandoned_timeout(),
            reaper_interval_secs: default_reaper_interval(),
            credential_cache_size: default_credential_cache_size(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.zombie_timeout_secs, 600);
        assert_eq!(config.endless_timeout_secs, 10800);
        assert_eq!(config.abandoned_timeout_secs, 86400);
        assert!(config.credential_cache_size > 0);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config: SchedulerConfig = serde_yaml::from_str("zombie_timeout_secs: 30").unwrap();
        assert_eq!(config.zombie_timeout_secs, 30);
        assert_eq!(config.endless_timeout_secs, default_endless_timeout());
    }
}
