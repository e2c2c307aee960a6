//! Database engines: per-driver dump and restore.
//!
//! Each driver implements [`DatabaseEngine`]. Engines that can replay a
//! transaction log on top of a restored dump also expose [`LogReplay`].

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

use crate::binlog::RecoveryPoint;
use crate::command::{CommandError, CommandRunner, CommandSpec};
use crate::config::{ConnectionConfig, DatabaseDriver};

mod mysql;
mod postgres;
mod sqlite;

pub use mysql::MySqlEngine;
pub use postgres::PostgresEngine;
pub use sqlite::SqliteEngine;

/// Format accepted by `mysqlbinlog --stop-datetime`
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Errors raised by engine tools
#[derive(Error, Debug)]
pub enum EngineError {
    /// The tool ran but exited unsuccessfully; message is its own error text
    #[error("{tool} failed: {message}")]
    ToolFailed {
        /// Program name
        tool: String,
        /// Stderr, else stdout, else the exit status
        message: String,
    },

    /// The tool could not be run at all
    #[error("{0}")]
    Command(#[from] CommandError),
}

/// Dump/restore capability for one database
#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    /// Driver this engine serves
    fn driver(&self) -> DatabaseDriver;

    /// Logical database name, used for artifact names
    fn database_name(&self) -> &str;

    /// Extension of plain dump files, without the dot
    fn file_extension(&self) -> &'static str;

    /// Write a dump to `destination`. `extra_options` are passed to the tool untouched.
    async fn dump(&self, destination: &Path, extra_options: Option<&str>) -> Result<(), EngineError>;

    /// Load a plain dump file
    async fn restore(&self, source: &Path) -> Result<(), EngineError>;

    /// Transaction-log replay, when the engine supports it
    fn log_replay(&self) -> Option<&dyn LogReplay> {
        None
    }
}

/// Point-in-time recovery on top of a restored dump
#[async_trait]
pub trait LogReplay: Send + Sync {
    /// Find the log chain a dump depends on and disable log writing in the dump
    async fn locate_chain(&self, dump_file: &Path) -> crate::Result<RecoveryPoint>;

    /// Apply the chain in order, starting at the recorded position and
    /// stopping at `target_time`
    async fn replay_chain(
        &self,
        point: &RecoveryPoint,
        target_time: NaiveDateTime,
    ) -> Result<(), EngineError>;
}

/// Build the engine for a connection
pub fn build_engine(
    connection: &ConnectionConfig,
    binlog_path: impl Into<PathBuf>,
    runner: Arc<dyn CommandRunner>,
) -> Arc<dyn DatabaseEngine> {
    match connection.driver {
        DatabaseDriver::Mysql => Arc::new(MySqlEngine::new(connection.clone(), binlog_path, runner)),
        DatabaseDriver::Pgsql => Arc::new(PostgresEngine::new(connection.clone(), runner)),
        DatabaseDriver::Sqlite => Arc::new(SqliteEngine::new(connection.clone(), runner)),
    }
}

/// Split operator-supplied tool options into arguments
pub(crate) fn split_options(extra_options: Option<&str>) -> Vec<String> {
    extra_options
        .map(|options| options.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Run a tool and map an unsuccessful exit to [`EngineError::ToolFailed`]
pub(crate) async fn run_tool(
    runner: &dyn CommandRunner,
    command: &CommandSpec,
) -> Result<(), EngineError> {
    let output = runner.run(command).await?;
    if output.is_success() {
        debug!(tool = %command.program, "tool finished");
        return Ok(());
    }

    let message = output.error_message();
    error!(tool = %command.program, error = %message, "tool failed");
    Err(EngineError::ToolFailed {
        tool: command.program.clone(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, RecordingCommandRunner};

    fn connection(driver: DatabaseDriver) -> ConnectionConfig {
        ConnectionConfig {
            driver,
            host: "db.internal".to_string(),
            port: None,
            database: "orders".to_string(),
            username: "backup".to_string(),
            password: String::new(),
            webhook: None,
        }
    }

    #[test]
    fn test_build_engine_selects_driver() {
        let runner = Arc::new(RecordingCommandRunner::new());
        for driver in [DatabaseDriver::Mysql, DatabaseDriver::Pgsql, DatabaseDriver::Sqlite] {
            let engine = build_engine(&connection(driver), "/var/lib/mysql", runner.clone());
            assert_eq!(engine.driver(), driver);
            assert_eq!(engine.file_extension(), "sql");
            assert_eq!(engine.log_replay().is_some(), driver == DatabaseDriver::Mysql);
        }
    }

    #[test]
    fn test_split_options() {
        assert_eq!(
            split_options(Some("--single-transaction  --quick")),
            vec!["--single-transaction", "--quick"]
        );
        assert!(split_options(None).is_empty());
    }

    #[tokio::test]
    async fn test_run_tool_surfaces_stderr() {
        let runner = RecordingCommandRunner::with_handler(|_| {
            CommandOutput::failure(2, "mysqldump: Got error: 1045: Access denied\n")
        });
        let err = run_tool(&runner, &CommandSpec::new("mysqldump")).await.unwrap_err();

        match err {
            EngineError::ToolFailed { tool, message } => {
                assert_eq!(tool, "mysqldump");
                assert_eq!(message, "mysqldump: Got error: 1045: Access denied");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
