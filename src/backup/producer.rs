//! Dump Producer - names the artifact and runs the engine's dump tool

use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{error, info};

use super::storage::LocalStore;
use super::types::ArtifactName;
use crate::engine::DatabaseEngine;
use crate::{BackupError, Result};

/// Produces plain dump files in the dump directory
pub struct DumpProducer {
    engine: Arc<dyn DatabaseEngine>,
    store: LocalStore,
}

impl DumpProducer {
    /// Producer writing `engine` dumps under `store`
    pub fn new(engine: Arc<dyn DatabaseEngine>, store: LocalStore) -> Self {
        Self { engine, store }
    }

    /// `<database>_<timestamp>.<ext>` for the given local time
    pub fn artifact_name(&self, timestamp: NaiveDateTime) -> String {
        ArtifactName::format(
            self.engine.database_name(),
            timestamp,
            self.engine.file_extension(),
        )
    }

    /// Generated name in the dump directory, or the custom file name.
    ///
    /// A relative custom name resolves against the current working directory.
    pub fn destination(&self, filename: Option<&Path>, timestamp: NaiveDateTime) -> Result<PathBuf> {
        match filename {
            Some(filename) if filename.is_absolute() => Ok(filename.to_path_buf()),
            Some(filename) => Ok(std::env::current_dir()?.join(filename)),
            None => Ok(self.store.directory().join(self.artifact_name(timestamp))),
        }
    }

    /// Dump into `destination`, which must not exist yet.
    ///
    /// On failure any partially written file is removed.
    pub async fn produce(&self, destination: &Path, extra_options: Option<&str>) -> Result<()> {
        if fs::try_exists(destination).await? {
            return Err(BackupError::ArtifactExists(destination.to_path_buf()));
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        info!(
            database = self.engine.database_name(),
            driver = self.engine.driver().as_str(),
            destination = %destination.display(),
            "starting dump"
        );

        if let Err(e) = self.engine.dump(destination, extra_options).await {
            error!(destination = %destination.display(), error = %e, "dump failed");
            let _ = fs::remove_file(destination).await;
            return Err(e.into());
        }

        info!(destination = %destination.display(), "dump written");
        Ok(())
    }
}
