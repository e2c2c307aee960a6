// Local dump directory

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;

use super::types::{BackupArtifact, StorageTier};
use crate::Result;

/// A regular file in the dump directory
#[derive(Debug, Clone)]
pub struct LocalFile {
    /// Full path
    pub path: PathBuf,
    /// Name within the directory
    pub file_name: String,
    /// Filesystem modification time
    pub modified: DateTime<Utc>,
    /// Length in bytes
    pub size_bytes: u64,
}

impl LocalFile {
    /// Case-insensitive extension match
    pub fn has_extension(&self, extensions: &[String]) -> bool {
        Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| extensions.iter().any(|wanted| wanted.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }
}

/// The directory dumps are written to
#[derive(Debug, Clone)]
pub struct LocalStore {
    directory: PathBuf,
}

impl LocalStore {
    /// Store rooted at `directory`, which need not exist yet
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// The dump directory
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Create the directory and its parents
    pub async fn ensure_directory_exists(&self) -> Result<()> {
        fs::create_dir_all(&self.directory).await?;
        Ok(())
    }

    /// Resolve a file name or relative path against the directory
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.directory.join(path)
        }
    }

    /// Regular files sorted by name; a missing directory is empty
    pub async fn list_files(&self) -> Result<Vec<LocalFile>> {
        let mut files = Vec::new();
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }
            files.push(LocalFile {
                path: entry.path(),
                file_name,
                modified: DateTime::<Utc>::from(metadata.modified()?),
                size_bytes: metadata.len(),
            });
        }

        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(files)
    }

    /// Dumps and archives with one of `extensions`
    pub async fn list_artifacts(&self, extensions: &[String]) -> Result<Vec<BackupArtifact>> {
        Ok(self
            .list_files()
            .await?
            .into_iter()
            .filter(|file| file.has_extension(extensions))
            .map(|file| {
                BackupArtifact::new(
                    StorageTier::Local,
                    file.path.display().to_string(),
                    file.file_name,
                    Some(file.modified),
                    file.size_bytes,
                )
            })
            .collect())
    }

    /// Delete one file
    pub async fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).await?;
        Ok(())
    }
}
