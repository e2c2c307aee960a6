//! Configuration for backup and restore runs.
//!
//! A [`BackupConfig`] is loaded from a JSON file and then adjusted from
//! `DB_BACKUP_*` environment variables. Every field has a default so a file
//! only needs to list what differs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default key prefix for uploaded dumps
pub const DEFAULT_REMOTE_PREFIX: &str = "databases";

/// Errors raised while loading or resolving configuration
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unknown database connection: {0}")]
    UnknownConnection(String),

    #[error("Unsupported database driver: {0}")]
    UnsupportedDriver(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing configuration: {0}")]
    Missing(String),
}

/// Supported database drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    /// MySQL or MariaDB
    Mysql,
    /// PostgreSQL
    #[serde(alias = "postgres")]
    Pgsql,
    /// SQLite database file
    Sqlite,
}

impl DatabaseDriver {
    /// Name as written in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseDriver::Mysql => "mysql",
            DatabaseDriver::Pgsql => "pgsql",
            DatabaseDriver::Sqlite => "sqlite",
        }
    }
}

impl std::str::FromStr for DatabaseDriver {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(DatabaseDriver::Mysql),
            "pgsql" | "postgres" | "postgresql" => Ok(DatabaseDriver::Pgsql),
            "sqlite" | "sqlite3" => Ok(DatabaseDriver::Sqlite),
            other => Err(ConfigError::UnsupportedDriver(other.to_string())),
        }
    }
}

/// Connection parameters for one named database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Selects the engine
    pub driver: DatabaseDriver,
    /// Server host, `localhost` by default
    #[serde(default = "default_host")]
    pub host: String,
    /// Driver default when absent
    #[serde(default)]
    pub port: Option<u16>,
    /// Database name, or the database file path for SQLite
    pub database: String,
    /// Login user
    #[serde(default)]
    pub username: String,
    /// Never serialized, so resolved configs can be attached to events
    #[serde(default, skip_serializing)]
    pub password: String,
    /// Per-connection webhook, overrides [`NotificationConfig::webhook`]
    #[serde(default, alias = "slackWebhookPath")]
    pub webhook: Option<String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

impl ConnectionConfig {
    /// Port, falling back to the driver default
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(match self.driver {
            DatabaseDriver::Mysql => 3306,
            DatabaseDriver::Pgsql => 5432,
            DatabaseDriver::Sqlite => 0,
        })
    }
}

/// Remote object store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Bucket used when `--upload-remote` is given without a value
    #[serde(default)]
    pub bucket: Option<String>,
    /// Key prefix, `databases` by default
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Region for the S3 client
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible stores (MinIO, LocalStack)
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Path-style bucket addressing
    #[serde(default)]
    pub force_path_style: bool,
}

fn default_prefix() -> String {
    DEFAULT_REMOTE_PREFIX.to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            prefix: default_prefix(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

/// Retention applied when a request does not specify its own
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionDefaults {
    /// Days to keep local dumps
    #[serde(default)]
    pub local_days: Option<i64>,
    /// Days to keep remote dumps
    #[serde(default)]
    pub remote_days: Option<i64>,
}

/// Notification settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Full webhook URL or a Slack `services/...` path
    #[serde(default)]
    pub webhook: Option<String>,
    /// Sender name shown in the channel
    #[serde(default = "default_username")]
    pub username: String,
}

fn default_username() -> String {
    "Database Backup".to_string()
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Connection used when no `--database` is given
    #[serde(default = "default_connection")]
    pub default_connection: String,
    /// Named connections
    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,
    /// Local dump directory
    #[serde(default = "default_dump_path")]
    pub dump_path: PathBuf,
    /// MySQL binary log directory
    #[serde(default = "default_binlog_path")]
    pub binlog_path: PathBuf,
    /// Object store settings
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Retention when a request gives none
    #[serde(default)]
    pub retention: RetentionDefaults,
    /// Webhook settings
    #[serde(default)]
    pub notification: NotificationConfig,
}

fn default_connection() -> String {
    "mysql".to_string()
}

fn default_dump_path() -> PathBuf {
    PathBuf::from("storage/dumps")
}

fn default_binlog_path() -> PathBuf {
    PathBuf::from("/var/lib/mysql")
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            default_connection: default_connection(),
            connections: HashMap::new(),
            dump_path: default_dump_path(),
            binlog_path: default_binlog_path(),
            remote: RemoteConfig::default(),
            retention: RetentionDefaults::default(),
            notification: NotificationConfig::default(),
        }
    }
}

impl BackupConfig {
    /// Load from a JSON file and apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json(&raw)?;
        config.apply_env()?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Parse from a JSON string without environment overrides
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Apply `DB_BACKUP_*` environment overrides
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = lookup("DB_BACKUP_CONNECTION") {
            self.default_connection = value;
        }
        if let Some(value) = lookup("DB_BACKUP_DUMP_PATH") {
            self.dump_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("DB_BACKUP_BINLOG_PATH") {
            self.binlog_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("DB_BACKUP_REMOTE_BUCKET") {
            self.remote.bucket = Some(value);
        }
        if let Some(value) = lookup("DB_BACKUP_REMOTE_PREFIX") {
            self.remote.prefix = value;
        }
        if let Some(value) = lookup("DB_BACKUP_REMOTE_ENDPOINT") {
            self.remote.endpoint_url = Some(value);
        }
        if let Some(value) = lookup("DB_BACKUP_WEBHOOK") {
            self.notification.webhook = Some(value);
        }
        if let Some(value) = lookup("DB_BACKUP_RETENTION_DAYS") {
            self.retention.local_days = Some(parse_days("DB_BACKUP_RETENTION_DAYS", &value)?);
        }
        if let Some(value) = lookup("DB_BACKUP_RETENTION_DAYS_REMOTE") {
            self.retention.remote_days =
                Some(parse_days("DB_BACKUP_RETENTION_DAYS_REMOTE", &value)?);
        }
        Ok(())
    }

    /// Resolve a connection by name, or the default connection
    pub fn connection(&self, name: Option<&str>) -> Result<&ConnectionConfig, ConfigError> {
        let name = name.unwrap_or(&self.default_connection);
        self.connections
            .get(name)
            .ok_or_else(|| ConfigError::UnknownConnection(name.to_string()))
    }

    /// Webhook for a connection, falling back to the global one
    pub fn webhook_for<'a>(&'a self, connection: &'a ConnectionConfig) -> Option<&'a str> {
        connection
            .webhook
            .as_deref()
            .or(self.notification.webhook.as_deref())
            .filter(|hook| !hook.is_empty())
    }
}

fn parse_days(key: &str, value: &str) -> Result<i64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
