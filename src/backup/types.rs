//! Backup pipeline types - artifacts, retention policies and run reports

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::notify::{BackupEvent, BackupOutcome};
use crate::storage::RemoteError;
use crate::{BackupError, Result};

use super::archiver::ArchiveFailure;

/// Timestamp embedded in generated artifact names
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Where an artifact or retention sweep lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    /// The dump directory
    Local,
    /// An object store bucket
    Remote,
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageTier::Local => write!(f, "local"),
            StorageTier::Remote => write!(f, "remote"),
        }
    }
}

/// Parsed form of `<database>_<YYYY-MM-DD-HH-MM-SS>.<ext>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    /// Database name, which may itself contain underscores
    pub database: String,
    /// Timestamp from the name
    pub created_at: NaiveDateTime,
    /// Extension without the dot
    pub extension: String,
}

impl ArtifactName {
    /// Name for a new artifact
    pub fn format(database: &str, created_at: NaiveDateTime, extension: &str) -> String {
        format!("{}_{}.{}", database, created_at.format(TIMESTAMP_FORMAT), extension)
    }

    /// `None` for custom file names that do not follow the generated pattern
    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, extension) = file_name.rsplit_once('.')?;
        let (database, timestamp) = stem.rsplit_once('_')?;
        if database.is_empty() || extension.is_empty() {
            return None;
        }
        let created_at = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
        Some(Self {
            database: database.to_string(),
            created_at,
            extension: extension.to_string(),
        })
    }
}

/// A dump or archive, local or remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    /// Tier the artifact was listed from
    pub tier: StorageTier,
    /// Local path or remote object key
    pub location: String,
    /// Last path component
    pub file_name: String,
    /// Database and creation time, when the name follows the generated pattern
    pub database: Option<String>,
    /// See `database`
    pub created_at: Option<NaiveDateTime>,
    /// Modification time; remote listings may omit it
    pub modified: Option<DateTime<Utc>>,
    /// Size on disk or in the bucket
    pub size_bytes: u64,
}

impl BackupArtifact {
    /// Artifact record; the name is parsed for database and creation time
    pub fn new(
        tier: StorageTier,
        location: impl Into<String>,
        file_name: impl Into<String>,
        modified: Option<DateTime<Utc>>,
        size_bytes: u64,
    ) -> Self {
        let file_name = file_name.into();
        let parsed = ArtifactName::parse(&file_name);
        Self {
            tier,
            location: location.into(),
            database: parsed.as_ref().map(|name| name.database.clone()),
            created_at: parsed.map(|name| name.created_at),
            file_name,
            modified,
            size_bytes,
        }
    }

    /// Extension after the last dot, lowercased
    pub fn extension(&self) -> Option<String> {
        self.file_name
            .rsplit_once('.')
            .map(|(_, extension)| extension.to_ascii_lowercase())
    }
}

/// Age-based retention for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    tier: StorageTier,
    max_age_days: i64,
}

impl RetentionPolicy {
    /// Rejects zero and negative ages
    pub fn new(tier: StorageTier, max_age_days: i64) -> Result<Self> {
        if max_age_days <= 0 {
            return Err(BackupError::RetentionInputInvalid(max_age_days));
        }
        Ok(Self { tier, max_age_days })
    }

    /// Tier the policy applies to
    pub fn tier(&self) -> StorageTier {
        self.tier
    }

    /// Maximum age in days
    pub fn max_age_days(&self) -> i64 {
        self.max_age_days
    }

    /// `now` minus the maximum age.
    ///
    /// `None` when the age reaches past the representable time range, in
    /// which case nothing is old enough to expire.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        TimeDelta::try_days(self.max_age_days).and_then(|age| now.checked_sub_signed(age))
    }

    /// Strictly older than the cutoff
    pub fn is_expired(&self, modified: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.cutoff(now).is_some_and(|cutoff| modified < cutoff)
    }
}

/// Result of one retention sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Names or keys removed
    pub deleted: Vec<String>,
    /// Items that should have been deleted but could not be, with the reason
    pub failed: Vec<(String, String)>,
    /// Items kept, including undated remote objects
    pub retained: usize,
}

impl SweepReport {
    /// Number of deleted items
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }
}

/// Options for one backup invocation
#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    /// Custom artifact path instead of the generated name
    pub filename: Option<PathBuf>,
    /// Bucket to upload to
    pub upload_bucket: Option<String>,
    /// Key prefix; the configured default when absent
    pub remote_prefix: Option<String>,
    /// Local retention in days
    pub retention_days: Option<i64>,
    /// Remote retention in days, applied only after a successful upload
    pub remote_retention_days: Option<i64>,
    /// Compress the dump into a zip archive
    pub archive: bool,
    /// Remove the local artifact after a successful upload
    pub remote_only: bool,
    /// Extra arguments for the dump tool
    pub dump_options: Option<String>,
    /// Skip notification delivery
    pub disable_notify: bool,
}

impl BackupRequest {
    /// Plain dump with no upload or retention
    pub fn new() -> Self {
        Self::default()
    }

    /// Custom artifact path; relative paths resolve against the working directory
    pub fn filename(mut self, filename: impl Into<PathBuf>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Upload the artifact to `bucket`
    pub fn upload_to(mut self, bucket: impl Into<String>) -> Self {
        self.upload_bucket = Some(bucket.into());
        self
    }

    /// Key prefix for the upload
    pub fn remote_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.remote_prefix = Some(prefix.into());
        self
    }

    /// Delete local artifacts older than `days`
    pub fn retention_days(mut self, days: i64) -> Self {
        self.retention_days = Some(days);
        self
    }

    /// Delete remote objects older than `days`
    pub fn remote_retention_days(mut self, days: i64) -> Self {
        self.remote_retention_days = Some(days);
        self
    }

    /// Compress the dump before upload
    pub fn archive(mut self, archive: bool) -> Self {
        self.archive = archive;
        self
    }

    /// Remove the local artifact after a successful upload
    pub fn remote_only(mut self, remote_only: bool) -> Self {
        self.remote_only = remote_only;
        self
    }

    /// Whitespace-separated options appended to the dump command
    pub fn dump_options(mut self, options: impl Into<String>) -> Self {
        self.dump_options = Some(options.into());
        self
    }

    /// Skip notification delivery
    pub fn disable_notify(mut self, disable: bool) -> Self {
        self.disable_notify = disable;
        self
    }
}

/// What happened during a backup invocation
#[derive(Debug)]
pub struct BackupReport {
    /// Failure only when the dump failed
    pub outcome: BackupOutcome,
    /// Canonical artifact: the archive when archiving succeeded, else the dump
    pub artifact: Option<PathBuf>,
    /// Archiving result, when requested
    pub archive: Option<std::result::Result<PathBuf, ArchiveFailure>>,
    /// Object key on success
    pub upload: Option<std::result::Result<String, RemoteError>>,
    /// Remote sweep, run only after a successful upload
    pub remote_retention: Option<Result<SweepReport>>,
    /// Local sweep
    pub local_retention: Option<Result<SweepReport>>,
    /// The local artifact was removed after upload
    pub removed_local: bool,
    /// The event sent, or that would have been sent, to notifiers
    pub event: BackupEvent,
}

impl BackupReport {
    /// Object key of a successful upload
    pub fn uploaded_key(&self) -> Option<&str> {
        match &self.upload {
            Some(Ok(key)) => Some(key.as_str()),
            _ => None,
        }
    }
}

/// Options for one restore invocation
#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    /// File name in the dump directory, or object name/key when downloading
    pub dump: String,
    /// Download the dump from this bucket first
    pub remote_bucket: Option<String>,
    /// Key prefix for the download
    pub remote_prefix: Option<String>,
    /// Replay binary logs after loading the dump
    pub replay_logs: bool,
    /// Replay stop time; now when absent or unparseable
    pub target_time: Option<String>,
}

impl RestoreRequest {
    /// Restore of a local dump
    pub fn new(dump: impl Into<String>) -> Self {
        Self {
            dump: dump.into(),
            ..Self::default()
        }
    }

    /// Download from `bucket` before restoring
    pub fn download_from(mut self, bucket: impl Into<String>) -> Self {
        self.remote_bucket = Some(bucket.into());
        self
    }

    /// Key prefix for the download
    pub fn remote_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.remote_prefix = Some(prefix.into());
        self
    }

    /// Replay binary logs up to `target_time`, or now
    pub fn replay_logs(mut self, target_time: Option<String>) -> Self {
        self.replay_logs = true;
        self.target_time = target_time;
        self
    }
}

/// Retention results for a prune invocation
#[derive(Debug, Default)]
pub struct PruneReport {
    /// Local sweep, when local retention was requested
    pub local: Option<Result<SweepReport>>,
    /// Remote sweep, when remote retention and a bucket were given
    pub remote: Option<Result<SweepReport>>,
}
