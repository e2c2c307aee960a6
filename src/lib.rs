//! # db-backup
//!
//! Backup and restore orchestration for relational databases.
//!
//! ## Overview
//!
//! A backup run dumps a database through an engine-specific tool, optionally
//! compresses the dump into a verified archive, uploads it to a remote object
//! store, applies age-based retention on both tiers and finally emits a single
//! [`notify::BackupEvent`] describing the outcome. A restore run loads a dump
//! (local or downloaded), extracting it first when it is archived, and for
//! MySQL can replay the binary log chain recorded in the dump up to a target
//! time.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use db_backup::{BackupConfig, BackupManager, BackupRequest};
//! use db_backup::command::SystemCommandRunner;
//!
//! # async fn example() -> db_backup::Result<()> {
//! let config = BackupConfig::from_file("db-backup.json")?;
//! let manager = BackupManager::from_config(config, None, Arc::new(SystemCommandRunner::new()))?;
//!
//! let request = BackupRequest::new().archive(true).retention_days(14);
//! let report = manager.backup(&request).await;
//! assert!(report.outcome.is_success());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`backup`]: dump producer, archiver, retention and the orchestrating manager
//! - [`binlog`]: MySQL binary log chain discovery
//! - [`restore`]: plain and point-in-time restore
//! - [`engine`]: per-database dump/restore implementations
//! - [`storage`]: remote object storage
//! - [`notify`]: backup events and notifiers
//! - [`command`]: subprocess execution
//! - [`config`]: configuration model

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use std::path::PathBuf;
use thiserror::Error;

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Main error type for backup and restore operations
#[derive(Error, Debug)]
pub enum BackupError {
    /// The dump/restore tool exited unsuccessfully
    #[error("Engine failure: {0}")]
    EngineFailure(#[from] engine::EngineError),

    /// Creating, verifying or extracting an archive failed
    #[error("Archive failure: {0}")]
    ArchiveFailure(#[from] backup::ArchiveFailure),

    /// No binlog marker statement in the dump
    #[error("Bin log could not be determined from dump {0}")]
    LogCoordinatesNotFound(PathBuf),

    /// The starting binlog segment is not on disk
    #[error("Bin logs could not be found: {start} is missing from {directory}")]
    LogChainMissing {
        /// Binlog directory that was searched
        directory: PathBuf,
        /// Starting segment recorded in the dump
        start: String,
    },

    /// Upload, download, listing or deletion against the remote store failed
    #[error("Remote transfer failure: {0}")]
    RemoteTransferFailure(#[from] storage::RemoteError),

    /// Retention days must be positive
    #[error("Retention should be a positive number of days, got {0}")]
    RetentionInputInvalid(i64),

    /// The target artifact path is already taken
    #[error("Artifact already exists: {0}")]
    ArtifactExists(PathBuf),

    /// Point-in-time restore requested for an engine without log replay
    #[error("Log replay is not supported by the {0} engine")]
    LogReplayUnsupported(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Join error from blocking tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Backup pipeline: producer, archiver, retention and orchestration
pub mod backup;

/// Binary log chain discovery
pub mod binlog;

/// Subprocess execution
pub mod command;

/// Configuration model
pub mod config;

/// Database engines
pub mod engine;

/// Backup events and notifiers
pub mod notify;

/// Restore engine
pub mod restore;

/// Remote object storage
pub mod storage;

pub use backup::{BackupManager, BackupReport, BackupRequest, RestoreRequest};
pub use restore::RestoreReport;
pub use config::BackupConfig;
