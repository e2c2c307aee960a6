use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use super::{run_tool, split_options, DatabaseEngine, EngineError};
use crate::command::{CommandRunner, CommandSpec};
use crate::config::{ConnectionConfig, DatabaseDriver};

/// PostgreSQL via `pg_dump` and `psql`
pub struct PostgresEngine {
    connection: ConnectionConfig,
    runner: Arc<dyn CommandRunner>,
}

impl PostgresEngine {
    /// Engine for `connection`, running tools through `runner`
    pub fn new(connection: ConnectionConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { connection, runner }
    }

    fn with_credentials(&self, mut command: CommandSpec) -> CommandSpec {
        command = command
            .arg(format!("--host={}", self.connection.host))
            .arg(format!("--port={}", self.connection.port_or_default()));
        if !self.connection.username.is_empty() {
            command = command.arg(format!("--username={}", self.connection.username));
        }
        if !self.connection.password.is_empty() {
            command = command.env("PGPASSWORD", self.connection.password.clone());
        }
        command
    }
}

#[async_trait]
impl DatabaseEngine for PostgresEngine {
    fn driver(&self) -> DatabaseDriver {
        DatabaseDriver::Pgsql
    }

    fn database_name(&self) -> &str {
        &self.connection.database
    }

    fn file_extension(&self) -> &'static str {
        "sql"
    }

    async fn dump(&self, destination: &Path, extra_options: Option<&str>) -> Result<(), EngineError> {
        let command = self
            .with_credentials(CommandSpec::new("pg_dump"))
            .args(split_options(extra_options))
            .arg(format!("--file={}", destination.display()))
            .arg(self.connection.database.clone());

        run_tool(self.runner.as_ref(), &command).await
    }

    async fn restore(&self, source: &Path) -> Result<(), EngineError> {
        let command = self
            .with_credentials(CommandSpec::new("psql"))
            .arg("--set=ON_ERROR_STOP=1")
            .arg(format!("--dbname={}", self.connection.database))
            .arg(format!("--file={}", source.display()));

        run_tool(self.runner.as_ref(), &command).await
    }
}
