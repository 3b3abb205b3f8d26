//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/logship/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/logship/` (~/.config/logship/)
//! - Data: `$XDG_DATA_HOME/logship/` (~/.local/share/logship/)
//! - State/Logs: `$XDG_STATE_HOME/logship/` (~/.local/state/logship/)

use crate::error::{Error, Result};
use crate::types::Priority;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Shortest allowed batch timer
pub const MIN_BATCH_TIME_INTERVAL_SECS: u64 = 3;

/// Longest allowed batch timer (one day)
pub const MAX_BATCH_TIME_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Collector endpoint and retry policy
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Local queue database
    #[serde(default)]
    pub storage: StorageConfig,

    /// Channel units to create at startup
    #[serde(default)]
    pub groups: Vec<ChannelUnitConfiguration>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Collector endpoint configuration
///
/// The retry table is shared by every group. A call that keeps failing with
/// a retryable status waits `retry_intervals_secs[min(n - 1, len - 1)]`
/// before its `n`th retry and gives up after `max_retries` retries.
#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    /// Base URL of the collector (e.g., `https://in.logship.dev`)
    #[serde(default = "default_log_url")]
    pub log_url: String,

    /// Path appended to `log_url` for batch uploads
    #[serde(default = "default_api_path")]
    pub api_path: String,

    /// Application secret sent with every request
    pub app_secret: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Escalating backoff table; the last entry repeats
    #[serde(default = "default_retry_intervals")]
    pub retry_intervals_secs: Vec<u64>,

    /// Retries per call before the batch is discarded
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            log_url: default_log_url(),
            api_path: default_api_path(),
            app_secret: None,
            timeout_secs: default_timeout(),
            retry_intervals_secs: default_retry_intervals(),
            max_retries: default_max_retries(),
        }
    }
}

impl IngestionConfig {
    /// Retry table as durations
    pub fn retry_intervals(&self) -> Vec<Duration> {
        self.retry_intervals_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if reqwest::Url::parse(&self.log_url).is_err() {
            return Err(Error::Config(format!(
                "ingestion.log_url is not a valid URL: {}",
                self.log_url
            )));
        }
        if self.retry_intervals_secs.is_empty() {
            return Err(Error::Config(
                "ingestion.retry_intervals_secs must not be empty".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "ingestion.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_log_url() -> String {
    "https://in.logship.dev".to_string()
}

fn default_api_path() -> String {
    "/logs?api-version=1.0.0".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_retry_intervals() -> Vec<u64> {
    vec![10, 30, 60, 120]
}

fn default_max_retries() -> usize {
    4
}

/// Local queue database configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Override for the database path
    pub path: Option<PathBuf>,

    /// Capacity for groups that do not set their own
    #[serde(default = "default_storage_capacity")]
    pub default_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            default_capacity: default_storage_capacity(),
        }
    }
}

fn default_storage_capacity() -> usize {
    300
}

/// Per-group batching configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ChannelUnitConfiguration {
    /// Group name (e.g., "analytics", "crashes")
    pub group_id: String,

    /// Delivery priority
    #[serde(default)]
    pub priority: Priority,

    /// Logs per batch; reaching it flushes immediately
    #[serde(default = "default_batch_size_limit")]
    pub batch_size_limit: usize,

    /// Seconds to wait before flushing a partial batch
    #[serde(default = "default_batch_time_interval")]
    pub batch_time_interval_secs: u64,

    /// Maximum batches of this group in flight at once
    #[serde(default = "default_pending_batch_count_max")]
    pub pending_batch_count_max: usize,

    /// Maximum logs retained for this group
    #[serde(default = "default_storage_capacity")]
    pub storage_capacity: usize,
}

impl ChannelUnitConfiguration {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            priority: Priority::default(),
            batch_size_limit: default_batch_size_limit(),
            batch_time_interval_secs: default_batch_time_interval(),
            pending_batch_count_max: default_pending_batch_count_max(),
            storage_capacity: default_storage_capacity(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_batch_size_limit(mut self, limit: usize) -> Self {
        self.batch_size_limit = limit;
        self
    }

    pub fn with_batch_time_interval_secs(mut self, secs: u64) -> Self {
        self.batch_time_interval_secs = secs;
        self
    }

    pub fn with_pending_batch_count_max(mut self, max: usize) -> Self {
        self.pending_batch_count_max = max;
        self
    }

    pub fn with_storage_capacity(mut self, capacity: usize) -> Self {
        self.storage_capacity = capacity;
        self
    }

    /// Batch timer, clamped to 3 seconds..24 hours
    pub fn batch_time_interval(&self) -> Duration {
        Duration::from_secs(self.batch_time_interval_secs.clamp(
            MIN_BATCH_TIME_INTERVAL_SECS,
            MAX_BATCH_TIME_INTERVAL_SECS,
        ))
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() {
            return Err(Error::Config("group_id must not be empty".to_string()));
        }
        if self.batch_size_limit == 0 {
            return Err(Error::Config(format!(
                "groups.{}.batch_size_limit must be at least 1",
                self.group_id
            )));
        }
        if self.pending_batch_count_max == 0 {
            return Err(Error::Config(format!(
                "groups.{}.pending_batch_count_max must be at least 1",
                self.group_id
            )));
        }
        if self.storage_capacity < self.batch_size_limit {
            return Err(Error::Config(format!(
                "groups.{}.storage_capacity must be at least batch_size_limit",
                self.group_id
            )));
        }
        Ok(())
    }
}

fn default_batch_size_limit() -> usize {
    50
}

fn default_batch_time_interval() -> u64 {
    6
}

fn default_pending_batch_count_max() -> usize {
    3
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.ingestion.validate()?;
        let mut seen = std::collections::HashSet::new();
        for group in &self.groups {
            group.validate()?;
            if !seen.insert(group.group_id.as_str()) {
                return Err(Error::Config(format!(
                    "group {} is configured more than once",
                    group.group_id
                )));
            }
        }
        Ok(())
    }

    /// Database path: the storage override or the XDG default
    pub fn queue_path(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(Self::database_path)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/logship/config.toml` (~/.config/logship/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("logship").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/logship/` (~/.local/share/logship/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("logship")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/logship/` (~/.local/state/logship/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("logship")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/logship/queue.db` (~/.local/share/logship/queue.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("queue.db")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.groups.is_empty());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.ingestion.retry_intervals_secs, vec![10, 30, 60, 120]);
        assert_eq!(config.ingestion.max_retries, 4);
        assert_eq!(config.storage.default_capacity, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[logging]
level = "debug"

[ingestion]
log_url = "https://collector.example.com"
app_secret = "secret-123"
retry_intervals_secs = [1, 2]
max_retries = 2

[storage]
default_capacity = 100

[[groups]]
group_id = "analytics"
batch_size_limit = 10
batch_time_interval_secs = 1

[[groups]]
group_id = "crashes"
priority = "high"
pending_batch_count_max = 1
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.ingestion.app_secret.as_deref(), Some("secret-123"));
        assert_eq!(
            config.ingestion.retry_intervals(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert_eq!(config.storage.default_capacity, 100);

        assert_eq!(config.groups.len(), 2);
        let analytics = &config.groups[0];
        assert_eq!(analytics.batch_size_limit, 10);
        assert_eq!(analytics.priority, Priority::Default);
        // Below the minimum, clamped up
        assert_eq!(analytics.batch_time_interval(), Duration::from_secs(3));

        let crashes = &config.groups[1];
        assert_eq!(crashes.priority, Priority::High);
        assert_eq!(crashes.pending_batch_count_max, 1);
        assert_eq!(crashes.batch_size_limit, 50);
    }

    #[test]
    fn test_batch_time_interval_clamped_to_one_day() {
        let config = ChannelUnitConfiguration::new("g").with_batch_time_interval_secs(1_000_000);
        assert_eq!(config.batch_time_interval(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_group_validation() {
        assert!(ChannelUnitConfiguration::new("g").validate().is_ok());
        assert!(ChannelUnitConfiguration::new("  ").validate().is_err());
        assert!(ChannelUnitConfiguration::new("g")
            .with_batch_size_limit(0)
            .validate()
            .is_err());
        assert!(ChannelUnitConfiguration::new("g")
            .with_pending_batch_count_max(0)
            .validate()
            .is_err());
        assert!(ChannelUnitConfiguration::new("g")
            .with_batch_size_limit(10)
            .with_storage_capacity(5)
            .validate()
            .is_err());
    }

    #[test]
    fn test_duplicate_groups_rejected() {
        let toml = r#"
[[groups]]
group_id = "analytics"

[[groups]]
group_id = "analytics"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ingestion_validation() {
        let config = IngestionConfig {
            log_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = IngestionConfig {
            retry_intervals_secs: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_database_path_override() {
        let mut config = Config::default();
        assert!(config.queue_path().ends_with("queue.db"));

        config.storage.path = Some(PathBuf::from("/tmp/custom.db"));
        assert_eq!(config.queue_path(), PathBuf::from("/tmp/custom.db"));
    }
}
