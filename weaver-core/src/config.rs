use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Runtime parameters of a crawl.
///
/// Loaded from a JSON file. Any field left out of the file falls back to its
/// default; `seed_url` has no default and must be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub seed_url: String,
    pub max_depth: u32,
    pub max_crawls_per_node: u32,
    pub max_subdomains_per_root: usize,
    pub max_outbound_links: usize,
    pub concurrent_workers: usize,
    pub request_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub db_path: String,
    pub metrics_path: String,
    /// Seconds between periodic checkpoints, 0 disables them
    pub checkpoint_interval_secs: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            seed_url: String::new(),
            max_depth: 5,
            max_crawls_per_node: 3,
            max_subdomains_per_root: 3,
            max_outbound_links: 10,
            concurrent_workers: 3,
            request_timeout_ms: 5000,
            retry_attempts: 3,
            retry_delay_ms: 5000,
            db_path: "crawler.db".to_string(),
            metrics_path: "metrics.json".to_string(),
            checkpoint_interval_secs: 60,
        }
    }
}

impl CrawlConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: CrawlConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses the file without validating, for callers that layer
    /// overrides on top before calling [`CrawlConfig::validate`].
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.seed_url.trim().is_empty() {
            return Err(ConfigError::Invalid("seed_url is required".to_string()));
        }
        if self.max_depth < 1 {
            return Err(ConfigError::Invalid("max_depth must be >= 1".to_string()));
        }
        if self.max_crawls_per_node < 1 {
            return Err(ConfigError::Invalid(
                "max_crawls_per_node must be >= 1".to_string(),
            ));
        }
        if self.max_subdomains_per_root < 1 {
            return Err(ConfigError::Invalid(
                "max_subdomains_per_root must be >= 1".to_string(),
            ));
        }
        if self.max_outbound_links < 1 {
            return Err(ConfigError::Invalid(
                "max_outbound_links must be >= 1".to_string(),
            ));
        }
        if self.concurrent_workers < 1 {
            return Err(ConfigError::Invalid(
                "concurrent_workers must be >= 1".to_string(),
            ));
        }
        if self.request_timeout_ms < 1000 {
            return Err(ConfigError::Invalid(
                "request_timeout_ms must be >= 1000".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_interval_secs > 0).then(|| Duration::from_secs(self.checkpoint_interval_secs))
    }
}
