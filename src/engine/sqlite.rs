use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use super::{run_tool, split_options, DatabaseEngine, EngineError};
use crate::command::{CommandRunner, CommandSpec};
use crate::config::{ConnectionConfig, DatabaseDriver};

/// SQLite via the `sqlite3` shell. `database` is the database file path.
pub struct SqliteEngine {
    connection: ConnectionConfig,
    runner: Arc<dyn CommandRunner>,
}

impl SqliteEngine {
    /// Engine for the database file named by `connection.database`
    pub fn new(connection: ConnectionConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { connection, runner }
    }
}

#[async_trait]
impl DatabaseEngine for SqliteEngine {
    fn driver(&self) -> DatabaseDriver {
        DatabaseDriver::Sqlite
    }

    /// File stem of the database path, so artifacts are not named after directories
    fn database_name(&self) -> &str {
        Path::new(&self.connection.database)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&self.connection.database)
    }

    fn file_extension(&self) -> &'static str {
        "sql"
    }

    async fn dump(&self, destination: &Path, extra_options: Option<&str>) -> Result<(), EngineError> {
        let command = CommandSpec::new("sqlite3")
            .args(split_options(extra_options))
            .arg(self.connection.database.clone())
            .arg(".dump")
            .stdout_file(destination);

        run_tool(self.runner.as_ref(), &command).await
    }

    async fn restore(&self, source: &Path) -> Result<(), EngineError> {
        let command = CommandSpec::new("sqlite3")
            .arg("-bail")
            .arg(self.connection.database.clone())
            .stdin_file(source);

        run_tool(self.runner.as_ref(), &command).await
    }
}
