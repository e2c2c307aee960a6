use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::{run_tool, split_options, DatabaseEngine, EngineError, LogReplay, DATETIME_FORMAT};
use crate::binlog::{LogLocator, RecoveryPoint};
use crate::command::{CommandRunner, CommandSpec};
use crate::config::{ConnectionConfig, DatabaseDriver};

/// MySQL / MariaDB via `mysqldump`, `mysql` and `mysqlbinlog`
pub struct MySqlEngine {
    connection: ConnectionConfig,
    locator: LogLocator,
    runner: Arc<dyn CommandRunner>,
}

impl MySqlEngine {
    /// Engine reading binlogs from `binlog_path`
    pub fn new(
        connection: ConnectionConfig,
        binlog_path: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            connection,
            locator: LogLocator::new(binlog_path),
            runner,
        }
    }

    /// Binary log directory searched for the chain
    pub fn binlog_path(&self) -> &Path {
        self.locator.log_directory()
    }

    fn with_credentials(&self, mut command: CommandSpec) -> CommandSpec {
        command = command
            .arg(format!("--user={}", self.connection.username))
            .arg(format!("--host={}", self.connection.host))
            .arg(format!("--port={}", self.connection.port_or_default()));
        if !self.connection.password.is_empty() {
            command = command.env("MYSQL_PWD", self.connection.password.clone());
        }
        command
    }

    fn client(&self) -> CommandSpec {
        self.with_credentials(CommandSpec::new("mysql"))
            .arg(self.connection.database.clone())
    }
}

#[async_trait]
impl DatabaseEngine for MySqlEngine {
    fn driver(&self) -> DatabaseDriver {
        DatabaseDriver::Mysql
    }

    fn database_name(&self) -> &str {
        &self.connection.database
    }

    fn file_extension(&self) -> &'static str {
        "sql"
    }

    async fn dump(&self, destination: &Path, extra_options: Option<&str>) -> Result<(), EngineError> {
        let command = self
            .with_credentials(CommandSpec::new("mysqldump"))
            .args(split_options(extra_options))
            .arg(format!("--result-file={}", destination.display()))
            .arg(self.connection.database.clone());

        run_tool(self.runner.as_ref(), &command).await
    }

    async fn restore(&self, source: &Path) -> Result<(), EngineError> {
        let command = self.client().stdin_file(source);
        run_tool(self.runner.as_ref(), &command).await
    }

    fn log_replay(&self) -> Option<&dyn LogReplay> {
        Some(self)
    }
}

#[async_trait]
impl LogReplay for MySqlEngine {
    async fn locate_chain(&self, dump_file: &Path) -> crate::Result<RecoveryPoint> {
        self.locator.locate_chain(dump_file).await
    }

    async fn replay_chain(
        &self,
        point: &RecoveryPoint,
        target_time: NaiveDateTime,
    ) -> Result<(), EngineError> {
        let command = CommandSpec::new("mysqlbinlog")
            .arg(format!("--start-position={}", point.start_position))
            .arg(format!("--stop-datetime={}", target_time.format(DATETIME_FORMAT)))
            .args(point.segments.iter().map(|segment| segment.path.display().to_string()))
            .pipe_to(self.client());

        run_tool(self.runner.as_ref(), &command).await?;

        info!(
            segments = point.segments.len(),
            start_position = point.start_position,
            target_time = %target_time,
            "bin logs replayed"
        );
        Ok(())
    }
}
