//! MySQL binary log chain discovery.
//!
//! A dump taken with `--master-data` records the binlog file and position it
//! is consistent with. [`LogLocator::locate_chain`] reads that marker, finds
//! the binlog segments from there on (rejecting a sequence with gaps) and
//! prepares the dump so that loading it does not write new binlog entries.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{BackupError, Result};

/// Maximum bytes read per line while scanning for the marker
pub const MAX_LINE_BYTES: u64 = 4096;

/// Statement prepended to a dump so replaying it skips the binlog
pub const DISABLE_BINLOG_STATEMENT: &str = "SET SESSION SQL_LOG_BIN=0;";

fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"CHANGE (?:MASTER|REPLICATION SOURCE) TO (?:MASTER|SOURCE)_LOG_FILE='([^']+)'(?:,\s*(?:MASTER|SOURCE)_LOG_POS=([0-9]+))?",
        )
        .expect("marker pattern is valid")
    })
}

/// Binlog coordinates recorded in a dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCoordinates {
    /// Segment file name, e.g. `mysql-bin.000042`
    pub file: String,
    /// Byte offset within `file`; zero when the marker omits it
    pub position: u64,
}

impl LogCoordinates {
    /// Parse a single dump line
    pub fn parse_line(line: &str) -> Option<Self> {
        let captures = marker_pattern().captures(line)?;
        let file = captures.get(1)?.as_str().to_string();
        let position = captures
            .get(2)
            .and_then(|pos| pos.as_str().parse().ok())
            .unwrap_or(0);
        Some(Self { file, position })
    }
}

/// Split `mysql-bin.000042` into (`mysql-bin`, 42)
pub fn parse_segment_name(name: &str) -> Option<(&str, u64)> {
    let (base, suffix) = name.rsplit_once('.')?;
    if base.is_empty() || suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((base, suffix.parse().ok()?))
}

/// One binlog file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSegment {
    /// Full path in the log directory
    pub path: PathBuf,
    /// Numeric suffix of the file name
    pub sequence: u64,
}

impl LogSegment {
    /// Segment at `path` with the given sequence number
    pub fn new(path: PathBuf, sequence: u64) -> Self {
        Self { path, sequence }
    }

    /// Segment file name, e.g. `mysql-bin.000042`
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A dump plus the log chain needed to roll it forward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPoint {
    /// Dump the chain was located for
    pub dump_file: PathBuf,
    /// Segment named by the dump's marker
    pub start_segment: String,
    /// Position within the first segment where replay starts
    pub start_position: u64,
    /// Contiguous segments, ascending by sequence, starting with `start_segment`
    pub segments: Vec<LogSegment>,
}

/// Keep the contiguous run that starts exactly at `start`.
///
/// Input may be unsorted and contain sequences below `start`. Returns an empty
/// chain when `start` itself is absent.
pub fn contiguous_chain(mut segments: Vec<LogSegment>, start: u64) -> Vec<LogSegment> {
    segments.retain(|segment| segment.sequence >= start);
    segments.sort_by_key(|segment| segment.sequence);
    segments.dedup_by_key(|segment| segment.sequence);

    let mut chain = Vec::with_capacity(segments.len());
    let mut expected = start;
    for segment in segments {
        if segment.sequence != expected {
            warn!(
                expected = expected,
                found = segment.sequence,
                "gap in binlog sequence"
            );
            break;
        }
        expected += 1;
        chain.push(segment);
    }
    chain
}

/// Locates binlog chains in a directory
#[derive(Debug, Clone)]
pub struct LogLocator {
    log_directory: PathBuf,
}

impl LogLocator {
    /// Locator over segments in `log_directory`
    pub fn new(log_directory: impl Into<PathBuf>) -> Self {
        Self {
            log_directory: log_directory.into(),
        }
    }

    /// Directory scanned for segments
    pub fn log_directory(&self) -> &Path {
        &self.log_directory
    }

    /// Read the binlog coordinates from a dump; stops at the first marker
    pub async fn read_coordinates(&self, dump_file: &Path) -> Result<LogCoordinates> {
        let file = fs::File::open(dump_file).await?;
        let mut reader = BufReader::new(file);
        let mut line = Vec::with_capacity(MAX_LINE_BYTES as usize);

        loop {
            line.clear();
            let read = (&mut reader).take(MAX_LINE_BYTES).read_until(b'\n', &mut line).await?;
            if read == 0 {
                break;
            }
            if let Some(coordinates) = LogCoordinates::parse_line(&String::from_utf8_lossy(&line)) {
                debug!(file = %coordinates.file, position = coordinates.position, "found binlog marker");
                return Ok(coordinates);
            }
        }

        Err(BackupError::LogCoordinatesNotFound(dump_file.to_path_buf()))
    }

    /// Every segment in the log directory sharing `base`, unsorted
    pub async fn list_segments(&self, base: &str) -> Result<Vec<LogSegment>> {
        let mut segments = Vec::new();
        let mut entries = match fs::read_dir(&self.log_directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(segments),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((segment_base, sequence)) = parse_segment_name(name) {
                if segment_base == base && entry.file_type().await?.is_file() {
                    segments.push(LogSegment::new(entry.path(), sequence));
                }
            }
        }
        Ok(segments)
    }

    /// Build the recovery point for a dump and disable binlog writes in it
    pub async fn locate_chain(&self, dump_file: &Path) -> Result<RecoveryPoint> {
        let coordinates = self.read_coordinates(dump_file).await?;

        let (base, start) = parse_segment_name(&coordinates.file).ok_or_else(|| {
            BackupError::LogChainMissing {
                directory: self.log_directory.clone(),
                start: coordinates.file.clone(),
            }
        })?;

        let segments = self.list_segments(base).await?;
        let available: BTreeSet<u64> = segments
            .iter()
            .map(|segment| segment.sequence)
            .filter(|sequence| *sequence >= start)
            .collect();

        let chain = contiguous_chain(segments, start);
        if chain.is_empty() {
            return Err(BackupError::LogChainMissing {
                directory: self.log_directory.clone(),
                start: coordinates.file,
            });
        }
        if chain.len() < available.len() {
            let width = coordinates.file.len() - base.len() - 1;
            let missing = start + chain.len() as u64;
            return Err(BackupError::LogChainMissing {
                directory: self.log_directory.clone(),
                start: format!("{}.{:0width$}", base, missing, width = width),
            });
        }

        disable_binlog_in_dump(dump_file).await?;

        info!(
            dump = %dump_file.display(),
            start_segment = %coordinates.file,
            start_position = coordinates.position,
            segments = chain.len(),
            "located binlog chain"
        );

        Ok(RecoveryPoint {
            dump_file: dump_file.to_path_buf(),
            start_segment: coordinates.file,
            start_position: coordinates.position,
            segments: chain,
        })
    }
}

/// Prepend [`DISABLE_BINLOG_STATEMENT`] to a dump.
///
/// Streams into a temp file beside the dump, then renames it over the
/// original. A dump that already starts with the statement is left alone.
pub async fn disable_binlog_in_dump(dump_file: &Path) -> Result<()> {
    let mut source = BufReader::new(fs::File::open(dump_file).await?);
    let mut first_line = Vec::new();
    (&mut source).take(MAX_LINE_BYTES).read_until(b'\n', &mut first_line).await?;
    if String::from_utf8_lossy(&first_line).trim() == DISABLE_BINLOG_STATEMENT {
        debug!(dump = %dump_file.display(), "binlog already disabled in dump");
        return Ok(());
    }

    let file_name = dump_file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dump".to_string());
    let temp_path = dump_file.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    let result: std::io::Result<()> = async {
        let mut temp = fs::File::create(&temp_path).await?;
        temp.write_all(DISABLE_BINLOG_STATEMENT.as_bytes()).await?;
        temp.write_all(b"\n").await?;
        temp.write_all(&first_line).await?;
        tokio::io::copy_buf(&mut source, &mut temp).await?;
        temp.sync_all().await?;
        drop(temp);
        fs::rename(&temp_path, dump_file).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    Ok(())
}
