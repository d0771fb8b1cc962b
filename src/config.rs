//! Index configuration
//!
//! Every tunable has a default, so an empty JSON object is a valid
//! configuration file. Values are validated once at load time.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, IndexResult};

/// Tunables for the index, the state-filter materializer and the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Hard cap on waiting for another party's filter build
    pub filter_wait_timeout_ms: u64,
    /// Sleep between checks while waiting for a filter
    pub filter_poll_interval_ms: u64,
    /// Sleep between retries of a busy store operation
    pub busy_retry_interval_ms: u64,
    /// Total time a busy store operation is retried before surfacing
    pub busy_timeout_ms: u64,
    /// Eviction runs after builds whose generation is a multiple of this
    pub evict_every_generations: u64,
    /// Number of most recently touched filters always kept
    pub evict_keep_recent: usize,
    /// Filters this many generations from the last kept one are kept
    pub evict_keep_generation_window: u64,
    /// Filters touched this many seconds before the last kept one are kept
    pub evict_keep_age_secs: u64,
    /// Depth cap of the nearest-ancestor search
    pub ancestor_search_depth: usize,
    /// Largest `in` list compiled inline; larger lists use a temp set
    pub inline_in_list_max: usize,
    /// Treat consistency-check mismatches as errors
    pub strict_consistency: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            filter_wait_timeout_ms: 90_000,
            filter_poll_interval_ms: 50,
            busy_retry_interval_ms: 100,
            busy_timeout_ms: 30_000,
            evict_every_generations: 16,
            evict_keep_recent: 16,
            evict_keep_generation_window: 2,
            evict_keep_age_secs: 60,
            ancestor_search_depth: 32,
            inline_in_list_max: 10,
            strict_consistency: false,
        }
    }
}

impl IndexConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> IndexResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            IndexError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;

        let config: IndexConfig = serde_json::from_str(&content)
            .map_err(|e| IndexError::Config(format!("Invalid config JSON: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make waits or eviction meaningless
    pub fn validate(&self) -> IndexResult<()> {
        let positive = [
            ("filter_wait_timeout_ms", self.filter_wait_timeout_ms),
            ("filter_poll_interval_ms", self.filter_poll_interval_ms),
            ("busy_retry_interval_ms", self.busy_retry_interval_ms),
            ("busy_timeout_ms", self.busy_timeout_ms),
            ("evict_every_generations", self.evict_every_generations),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(IndexError::Config(format!("{} must be > 0", name)));
            }
        }

        if self.evict_keep_recent == 0 {
            return Err(IndexError::Config("evict_keep_recent must be > 0".into()));
        }

        if self.ancestor_search_depth == 0 {
            return Err(IndexError::Config(
                "ancestor_search_depth must be > 0".into(),
            ));
        }

        Ok(())
    }

    pub fn filter_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.filter_wait_timeout_ms)
    }

    pub fn filter_poll_interval(&self) -> Duration {
        Duration::from_millis(self.filter_poll_interval_ms)
    }

    pub fn busy_retry_interval(&self) -> Duration {
        Duration::from_millis(self.busy_retry_interval_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn evict_keep_age(&self) -> Duration {
        Duration::from_secs(self.evict_keep_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = IndexConfig::default();
        assert_eq!(config.filter_wait_timeout(), Duration::from_secs(90));
        assert_eq!(config.filter_poll_interval(), Duration::from_millis(50));
        assert_eq!(config.busy_retry_interval(), Duration::from_millis(100));
        assert_eq!(config.busy_timeout(), Duration::from_secs(30));
        assert_eq!(config.evict_keep_recent, 16);
        assert_eq!(config.ancestor_search_depth, 32);
        assert_eq!(config.inline_in_list_max, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"filter_wait_timeout_ms": 500, "strict_consistency": true}}"#).unwrap();

        let config = IndexConfig::load(file.path()).unwrap();
        assert_eq!(config.filter_wait_timeout_ms, 500);
        assert!(config.strict_consistency);
        assert_eq!(config.evict_keep_recent, 16);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = IndexConfig {
            filter_poll_interval_ms: 0,
            ..IndexConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("filter_poll_interval_ms"));
    }

    #[test]
    fn test_invalid_json_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            IndexConfig::load(file.path()),
            Err(IndexError::Config(_))
        ));
    }
}
