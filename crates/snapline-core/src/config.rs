//! Configuration structures for snapline.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI
//! flags. Retention and catalog retry knobs can additionally be overridden
//! per table through table properties.

use crate::table::ConflictPolicies;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Table property keys understood by the engine.
pub mod properties {
    /// Snapshots older than this are expirable
    pub const MAX_SNAPSHOT_AGE_MS: &str = "history.expire.max-snapshot-age-ms";
    /// Number of most recent snapshots always kept
    pub const MIN_SNAPSHOTS_TO_KEEP: &str = "history.expire.min-snapshots-to-keep";
    /// Upper bound on snapshots expired by one retention pass
    pub const MAX_SNAPSHOTS_PER_PASS: &str = "history.expire.max-snapshots-per-pass";
    /// Whether catalog synchronization retries
    pub const CATALOG_SYNC_RETRY_ENABLED: &str = "catalog.sync.retry-enabled";
    /// Attempts per catalog synchronization
    pub const CATALOG_SYNC_MAX_ATTEMPTS: &str = "catalog.sync.max-attempts";
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Table configuration
    pub table: TableConfig,

    /// Commit configuration
    #[serde(default)]
    pub commit: CommitConfig,

    /// Conflict policy per commit kind
    #[serde(default)]
    pub conflict: ConflictPolicies,

    /// Snapshot retention configuration
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Catalog synchronization configuration
    #[serde(default)]
    pub catalog_sync: CatalogSyncConfig,

    /// Commit journal configuration
    #[serde(default)]
    pub transaction_log: TransactionLogConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Table location and naming.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableConfig {
    /// Table root: a local directory or `memory://<name>`
    pub location: String,

    /// Table name
    #[serde(default = "default_table_name")]
    pub name: String,

    /// Dataset path in the external catalog; defaults to the table name
    #[serde(default)]
    pub dataset_path: Option<String>,
}

impl TableConfig {
    /// Dataset path used for catalog synchronization.
    pub fn dataset_path(&self) -> &str {
        self.dataset_path.as_deref().unwrap_or(&self.name)
    }
}

/// Commit retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommitConfig {
    /// Retries after losing the metadata swap
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(default = "default_commit_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Maximum delay for exponential backoff (milliseconds)
    #[serde(default = "default_commit_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_cas_retries: default_max_cas_retries(),
            retry_base_delay_ms: default_commit_base_delay_ms(),
            retry_max_delay_ms: default_commit_max_delay_ms(),
        }
    }
}

/// Snapshot retention configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetentionConfig {
    /// Snapshots older than this are expirable (milliseconds)
    #[serde(default = "default_max_snapshot_age_ms")]
    pub max_snapshot_age_ms: u64,

    /// Number of most recent snapshots always kept
    #[serde(default = "default_min_snapshots_to_keep")]
    pub min_snapshots_to_keep: usize,

    /// Upper bound on snapshots expired by one pass
    #[serde(default = "default_max_snapshots_per_pass")]
    pub max_snapshots_to_expire_per_pass: usize,

    /// Run a retention pass after every published commit
    #[serde(default)]
    pub expire_after_commit: bool,

    /// Unreferenced files younger than this are never swept (milliseconds)
    #[serde(default = "default_orphan_older_than_ms")]
    pub orphan_older_than_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_snapshot_age_ms: default_max_snapshot_age_ms(),
            min_snapshots_to_keep: default_min_snapshots_to_keep(),
            max_snapshots_to_expire_per_pass: default_max_snapshots_per_pass(),
            expire_after_commit: false,
            orphan_older_than_ms: default_orphan_older_than_ms(),
        }
    }
}

impl RetentionConfig {
    /// Apply per-table overrides from table properties.
    pub fn with_table_properties(&self, props: &BTreeMap<String, String>) -> Self {
        let mut config = self.clone();
        if let Some(v) = parse_property(props, properties::MAX_SNAPSHOT_AGE_MS) {
            config.max_snapshot_age_ms = v;
        }
        if let Some(v) = parse_property(props, properties::MIN_SNAPSHOTS_TO_KEEP) {
            config.min_snapshots_to_keep = v;
        }
        if let Some(v) = parse_property(props, properties::MAX_SNAPSHOTS_PER_PASS) {
            config.max_snapshots_to_expire_per_pass = v;
        }
        config
    }
}

/// Catalog synchronization configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CatalogSyncConfig {
    /// Retry on tag mismatch and transport failures
    #[serde(default = "default_enabled")]
    pub retry_enabled: bool,

    /// Attempts per synchronization, including the first
    #[serde(default = "default_catalog_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(default = "default_catalog_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Maximum delay for exponential backoff (milliseconds)
    #[serde(default = "default_catalog_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for CatalogSyncConfig {
    fn default() -> Self {
        Self {
            retry_enabled: default_enabled(),
            max_attempts: default_catalog_max_attempts(),
            retry_base_delay_ms: default_catalog_base_delay_ms(),
            retry_max_delay_ms: default_catalog_max_delay_ms(),
        }
    }
}

impl CatalogSyncConfig {
    /// Apply per-table overrides from table properties.
    pub fn with_table_properties(&self, props: &BTreeMap<String, String>) -> Self {
        let mut config = self.clone();
        if let Some(v) = parse_property(props, properties::CATALOG_SYNC_RETRY_ENABLED) {
            config.retry_enabled = v;
        }
        if let Some(v) = parse_property(props, properties::CATALOG_SYNC_MAX_ATTEMPTS) {
            config.max_attempts = v;
        }
        config
    }
}

/// Commit journal configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransactionLogConfig {
    /// Write the journal
    #[serde(default)]
    pub enabled: bool,

    /// Directory for journal files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Checkpoint interval (number of entries)
    #[serde(default = "default_checkpoint_interval_entries")]
    pub checkpoint_interval_entries: usize,

    /// Maximum number of journal files to keep
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
}

impl Default for TransactionLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: default_log_dir(),
            checkpoint_interval_entries: default_checkpoint_interval_entries(),
            max_log_files: default_max_log_files(),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Filter directive for this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Plain text format (default)
    #[default]
    Text,
}

fn parse_property<T: std::str::FromStr>(props: &BTreeMap<String, String>, key: &str) -> Option<T> {
    let raw = props.get(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key = key, value = %raw, "Ignoring unparsable table property");
            None
        }
    }
}

// Default value functions

fn default_table_name() -> String {
    "default".to_string()
}
fn default_max_cas_retries() -> u32 {
    1
}
fn default_commit_base_delay_ms() -> u64 {
    50
}
fn default_commit_max_delay_ms() -> u64 {
    2000
}
fn default_max_snapshot_age_ms() -> u64 {
    5 * 24 * 60 * 60 * 1000 // 5 days
}
fn default_min_snapshots_to_keep() -> usize {
    1
}
fn default_max_snapshots_per_pass() -> usize {
    100
}
fn default_orphan_older_than_ms() -> u64 {
    3 * 24 * 60 * 60 * 1000 // 3 days
}
fn default_enabled() -> bool {
    true
}
fn default_catalog_max_attempts() -> u32 {
    3
}
fn default_catalog_base_delay_ms() -> u64 {
    100
}
fn default_catalog_max_delay_ms() -> u64 {
    5000
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("./snapline-journal")
}
fn default_checkpoint_interval_entries() -> usize {
    1000
}
fn default_max_log_files() -> usize {
    10
}

impl Config {
    /// Configuration for a table at `location` with every other setting
    /// defaulted.
    pub fn for_location(location: impl Into<String>) -> Self {
        Self {
            table: TableConfig {
                location: location.into(),
                name: default_table_name(),
                dataset_path: None,
            },
            commit: CommitConfig::default(),
            conflict: ConflictPolicies::default(),
            retention: RetentionConfig::default(),
            catalog_sync: CatalogSyncConfig::default(),
            transaction_log: TransactionLogConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.table.location.trim().is_empty() {
            return Err(crate::Error::Config("Table location is required".into()));
        }

        if self.table.name.trim().is_empty() {
            return Err(crate::Error::Config("Table name is required".into()));
        }

        if self.retention.min_snapshots_to_keep == 0 {
            return Err(crate::Error::Config(
                "retention.min_snapshots_to_keep must be at least 1".into(),
            ));
        }

        if self.retention.max_snapshots_to_expire_per_pass == 0 {
            return Err(crate::Error::Config(
                "retention.max_snapshots_to_expire_per_pass must be at least 1".into(),
            ));
        }

        if self.catalog_sync.max_attempts == 0 {
            return Err(crate::Error::Config(
                "catalog_sync.max_attempts must be at least 1".into(),
            ));
        }

        if self.commit.retry_base_delay_ms > self.commit.retry_max_delay_ms {
            tracing::warn!(
                base_delay_ms = self.commit.retry_base_delay_ms,
                max_delay_ms = self.commit.retry_max_delay_ms,
                "Commit retry base delay exceeds max delay; max delay wins"
            );
        }

        Ok(())
    }
}
