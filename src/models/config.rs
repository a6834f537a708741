use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default TTL for maintenance cleanup sweeps: 7 days.
pub const DEFAULT_MAX_AGE_MS: u64 = 7 * 86_400 * 1000;

/// Default TTL used by freshness checks when the caller supplies none.
pub const DEFAULT_FRESH_TTL_MS: u64 = 30_000;

/// Default LRU cap on the number of persisted entries.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Targets deeper than this are dropped by the scheduler.
pub const DEFAULT_MAX_PREFETCH_DEPTH: u32 = 6;

/// Processed-target stride between milestone status emissions.
pub const DEFAULT_STATUS_SAMPLE_INTERVAL: usize = 50;

/// Upper bound on directories a single scheduler run may touch.
pub const DEFAULT_MAX_PREFETCHED_DIRS: usize = 50_000;

/// Global clamp on concurrent scheduler tasks, across priorities.
pub const MAX_CONCURRENT_TASKS: usize = 24;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Every recognized cache and scheduler option.
///
/// Host applications typically persist this alongside their own settings;
/// `load_from` falls back to defaults when the file is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name of the durable KV database instance.
    pub db_name: String,
    /// Namespace for directory records inside the database.
    pub store_name: String,
    /// Number of parallel scheduler workers.
    pub worker_count: usize,
    /// TTL applied by `cleanup_old_entries`.
    pub max_age_ms: u64,
    /// LRU cap on persisted entries.
    pub max_entries: usize,
    /// Scheduler depth ceiling.
    pub max_prefetch_depth: u32,
    /// Milestone emission stride.
    pub status_sample_interval: usize,
    /// When false, the controller runs on the no-op backend.
    pub enable_caching: bool,
    /// Scheduler budget: maximum directories per run.
    pub max_prefetched_dirs: usize,
    /// Default freshness TTL for `is_directory_fresh`.
    pub fresh_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_name: "arbor-cache".to_string(),
            store_name: "directories".to_string(),
            worker_count: default_worker_count(),
            max_age_ms: DEFAULT_MAX_AGE_MS,
            max_entries: DEFAULT_MAX_ENTRIES,
            max_prefetch_depth: DEFAULT_MAX_PREFETCH_DEPTH,
            status_sample_interval: DEFAULT_STATUS_SAMPLE_INTERVAL,
            enable_caching: true,
            max_prefetched_dirs: DEFAULT_MAX_PREFETCHED_DIRS,
            fresh_ttl_ms: DEFAULT_FRESH_TTL_MS,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a config file, returning defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Writes the config as pretty-printed JSON.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Ephemeral preset for tests and cache-less embedding.
    pub fn in_memory() -> Self {
        Self {
            enable_caching: false,
            ..Self::default()
        }
    }
}

/// One worker per spare core, clamped to [1, 4].
pub fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus.saturating_sub(1).clamp(1, 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.max_age_ms, 7 * 86_400 * 1000);
        assert_eq!(config.max_prefetch_depth, 6);
        assert_eq!(config.status_sample_interval, 50);
        assert!(config.enable_caching);
        assert!(config.worker_count >= 1 && config.worker_count <= 4);
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, CacheConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache/config.json");

        let mut config = CacheConfig::default();
        config.max_entries = 123;
        config.worker_count = 2;
        config.save_to(&path).unwrap();

        let reloaded = CacheConfig::load_from(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.json");
        fs::write(&path, r#"{"max_entries": 7}"#).unwrap();

        let config = CacheConfig::load_from(&path).unwrap();
        assert_eq!(config.max_entries, 7);
        assert_eq!(config.max_age_ms, DEFAULT_MAX_AGE_MS);
    }
}
