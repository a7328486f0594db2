//! WolfSync Configuration
//!
//! This module provides configuration structures for the replication
//! queues, member synchronization and the database members themselves.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::member::MemberSettings;

/// Main WolfSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfSyncConfig {
    /// Cluster-wide settings
    pub cluster: ClusterConfig,

    /// Per-member queue and worker tuning
    #[serde(default)]
    pub queue: QueueConfig,

    /// Member synchronization tuning
    #[serde(default)]
    pub sync: SyncConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Database members, in join order
    #[serde(default)]
    pub members: Vec<MemberConfig>,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster label, used in logs
    #[serde(default = "default_cluster_label")]
    pub label: String,

    /// Preferred template member (defaults to the first member that joins)
    #[serde(default)]
    pub template: Option<String>,

    /// Tables subject to replication and synchronization
    #[serde(default)]
    pub tracked_tables: Vec<String>,
}

/// Queue and worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of pending actions per member
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// How long a worker waits for an action before reporting an empty queue
    #[serde(default = "default_remove_timeout_ms")]
    pub remove_timeout_ms: u64,

    /// Pause between worker loop iterations
    #[serde(default = "default_worker_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long `stop` waits for the worker to confirm termination
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Member events buffered per subscriber before the oldest are dropped
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Interval between convergence polls
    #[serde(default = "default_sync_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on convergence polls before giving up
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Database member connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemberConfig {
    /// Unique member label
    pub label: String,

    /// MariaDB host
    pub host: String,

    /// MariaDB port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database user
    pub user: String,

    /// Database password
    #[serde(default)]
    pub password: String,

    /// Database name
    pub database: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl MemberConfig {
    /// Get database connection URL
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }

    /// Identity settings of this member
    pub fn settings(&self) -> MemberSettings {
        MemberSettings {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            database: self.database.clone(),
        }
    }
}

// Default value functions
fn default_cluster_label() -> String {
    "default".to_string()
}

fn default_queue_capacity() -> usize {
    100_000
}

fn default_remove_timeout_ms() -> u64 {
    1000
}

fn default_worker_poll_interval_ms() -> u64 {
    10
}

fn default_stop_timeout_ms() -> u64 {
    100
}

fn default_event_capacity() -> usize {
    4096
}

fn default_sync_poll_interval_ms() -> u64 {
    1000
}

fn default_max_rounds() -> usize {
    300
}

fn default_db_port() -> u16 {
    3306
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            label: default_cluster_label(),
            template: None,
            tracked_tables: Vec::new(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            remove_timeout_ms: default_remove_timeout_ms(),
            poll_interval_ms: default_worker_poll_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_sync_poll_interval_ms(),
            max_rounds: default_max_rounds(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl QueueConfig {
    pub fn remove_timeout(&self) -> Duration {
        Duration::from_millis(self.remove_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl WolfSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.members.is_empty() {
            return Err(crate::Error::Config("at least one [[members]] entry is required".into()));
        }

        let mut labels = HashSet::new();
        for member in &self.members {
            if member.label.is_empty() {
                return Err(crate::Error::Config("members.label cannot be empty".into()));
            }
            if member.host.is_empty() {
                return Err(crate::Error::Config(format!(
                    "members.host cannot be empty (member {})",
                    member.label
                )));
            }
            if member.database.is_empty() {
                return Err(crate::Error::Config(format!(
                    "members.database cannot be empty (member {})",
                    member.label
                )));
            }
            if !labels.insert(member.label.as_str()) {
                return Err(crate::Error::Config(format!(
                    "duplicate member label: {}",
                    member.label
                )));
            }
        }

        if let Some(template) = &self.cluster.template {
            if !labels.contains(template.as_str()) {
                return Err(crate::Error::Config(format!(
                    "cluster.template names unknown member: {}",
                    template
                )));
            }
        }

        if self.queue.capacity == 0 {
            return Err(crate::Error::Config("queue.capacity must be positive".into()));
        }
        if self.queue.event_capacity == 0 {
            return Err(crate::Error::Config("queue.event_capacity must be positive".into()));
        }

        if self.sync.max_rounds == 0 {
            return Err(crate::Error::Config("sync.max_rounds must be positive".into()));
        }

        Ok(())
    }

    /// Members ordered so the preferred template joins first
    pub fn join_order(&self) -> Vec<&MemberConfig> {
        let mut ordered: Vec<&MemberConfig> = self.members.iter().collect();
        if let Some(template) = &self.cluster.template {
            ordered.sort_by_key(|m| m.label != *template);
        }
        ordered
    }

    /// Write a sample configuration file
    pub fn write_sample(path: &PathBuf) -> crate::Result<()> {
        std::fs::write(path, SAMPLE_CONFIG)?;
        Ok(())
    }
}

/// Sample configuration written by `wolfsync init`
pub const SAMPLE_CONFIG: &str = r#"# WolfSync configuration

[cluster]
label = "main"
template = "db-1"
tracked_tables = ["users"]

[queue]
capacity = 100000
remove_timeout_ms = 1000
poll_interval_ms = 10
stop_timeout_ms = 100
event_capacity = 4096

[sync]
poll_interval_ms = 1000
max_rounds = 300

[api]
enabled = true
bind_address = "0.0.0.0:8090"

[logging]
level = "info"

[[members]]
label = "db-1"
host = "10.0.0.1"
user = "wolfsync"
password = "changeme"
database = "app"

[[members]]
label = "db-2"
host = "10.0.0.2"
user = "wolfsync"
password = "changeme"
database = "app"
"#;
