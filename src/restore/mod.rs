//! Restore engine: plain restore and point-in-time recovery.
//!
//! Archived dumps are extracted before loading. With log replay the dump's
//! binlog chain is located before anything touches the database, so a dump
//! that cannot be rolled forward is never loaded.

use chrono::{DateTime, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::backup::Archiver;
use crate::binlog::RecoveryPoint;
use crate::engine::DatabaseEngine;
use crate::{BackupError, Result};

const TARGET_TIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Replay stop time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetTime {
    /// Local wall-clock time
    pub time: NaiveDateTime,
    /// The requested value was absent or unparseable and `time` is now
    pub fell_back: bool,
}

/// Parse a replay target in local time, falling back to now.
///
/// Accepts `YYYY-MM-DD HH:MM:SS`, the `T`-separated form, minutes precision,
/// and RFC 3339 (converted to local time).
pub fn parse_target_time(raw: Option<&str>) -> TargetTime {
    let now = || Local::now().naive_local();
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return TargetTime {
            time: now(),
            fell_back: true,
        };
    };

    let parsed = TARGET_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|time| time.with_timezone(&Local).naive_local())
        });

    match parsed {
        Some(time) => TargetTime {
            time,
            fell_back: false,
        },
        None => {
            warn!(target_time = raw, "could not parse target time, replaying up to now");
            TargetTime {
                time: now(),
                fell_back: true,
            }
        }
    }
}

/// What a restore did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// The dump as requested, possibly an archive
    pub source: PathBuf,
    /// The plain dump that was loaded
    pub dump_file: PathBuf,
    /// The source was an archive and was extracted first
    pub extracted: bool,
    /// Object key the dump was downloaded from
    pub downloaded_from: Option<String>,
    /// Log chain replayed, when log replay was requested
    pub recovery_point: Option<RecoveryPoint>,
    /// Replay stop time
    pub replayed_until: Option<NaiveDateTime>,
    /// The requested stop time was missing or unparseable
    pub target_time_fell_back: bool,
}

/// Loads dumps into a database through its engine
pub struct RestoreEngine {
    engine: Arc<dyn DatabaseEngine>,
    archiver: Arc<dyn Archiver>,
}

impl RestoreEngine {
    /// Engine extracting archives with `archiver`
    pub fn new(engine: Arc<dyn DatabaseEngine>, archiver: Arc<dyn Archiver>) -> Self {
        Self { engine, archiver }
    }

    /// Extract archives; plain dumps pass through
    async fn prepare(&self, source: &Path) -> Result<(PathBuf, bool)> {
        if !self.archiver.is_archive(source) {
            return Ok((source.to_path_buf(), false));
        }
        let dump = self
            .archiver
            .extract(source, self.engine.file_extension())
            .await?;
        Ok((dump, true))
    }

    /// Load a dump, extracting it first if it is archived
    pub async fn restore(&self, source: &Path) -> Result<RestoreReport> {
        let (dump_file, extracted) = self.prepare(source).await?;

        self.engine.restore(&dump_file).await?;
        info!(
            database = self.engine.database_name(),
            dump = %dump_file.display(),
            "restore finished"
        );

        Ok(RestoreReport {
            source: source.to_path_buf(),
            dump_file,
            extracted,
            downloaded_from: None,
            recovery_point: None,
            replayed_until: None,
            target_time_fell_back: false,
        })
    }

    /// Load a dump and replay its binlog chain up to `target_time`
    pub async fn restore_with_log_replay(
        &self,
        source: &Path,
        target_time: Option<&str>,
    ) -> Result<RestoreReport> {
        let replay = self
            .engine
            .log_replay()
            .ok_or_else(|| BackupError::LogReplayUnsupported(self.engine.driver().as_str().to_string()))?;
        let target = parse_target_time(target_time);

        let (dump_file, extracted) = self.prepare(source).await?;
        let point = replay.locate_chain(&dump_file).await?;

        self.engine.restore(&dump_file).await?;
        info!(dump = %dump_file.display(), "dump loaded, replaying bin logs");

        replay.replay_chain(&point, target.time).await?;

        Ok(RestoreReport {
            source: source.to_path_buf(),
            dump_file,
            extracted,
            downloaded_from: None,
            recovery_point: Some(point),
            replayed_until: Some(target.time),
            target_time_fell_back: target.fell_back,
        })
    }
}
