//! Archiver - single-entry zip containers with post-write verification

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Extension of archived dumps
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Local file header signature every zip written here starts with
const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// Archive failures. Each variant is a distinct, reportable class.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArchiveFailure {
    /// The container could not be created or renamed into place
    #[error("could not create archive {path}: {message}")]
    Create {
        /// Archive path
        path: PathBuf,
        /// Underlying error text
        message: String,
    },

    /// The dump could not be read into the container
    #[error("could not add {path} to the archive: {message}")]
    Add {
        /// Dump being archived
        path: PathBuf,
        /// Underlying error text
        message: String,
    },

    /// The file is not a zip container
    #[error("{0} is not a valid archive")]
    NotAnArchive(PathBuf),

    /// The container structure or compressed stream is damaged
    #[error("consistency check failed: {0}")]
    ConsistencyCheckFailed(String),

    /// The entry's CRC or the content digest does not match
    #[error("checksum failed: expected {expected}, found {actual}")]
    ChecksumFailed {
        /// What the content should hash to
        expected: String,
        /// What was read back
        actual: String,
    },

    /// The entry could not be written out
    #[error("could not extract {path}: {message}")]
    Extract {
        /// Archive being extracted
        path: PathBuf,
        /// Underlying error text
        message: String,
    },
}

/// SHA-256 and length of uncompressed content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    /// Lowercase hex digest
    pub sha256: String,
    /// Byte count
    pub length: u64,
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{} ({} bytes)", self.sha256, self.length)
    }
}

/// Compresses a dump into a single-entry archive and extracts it again
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Extension of produced archives, without the dot
    fn extension(&self) -> &str;

    /// Archive `source` next to itself, verify it, then delete `source`.
    ///
    /// Returns the archive path. On failure the source is untouched and no
    /// partial archive remains.
    async fn archive(&self, source: &Path) -> Result<PathBuf, ArchiveFailure>;

    /// Extract the single entry of `archive` into the archive's directory.
    /// `fallback_extension` names the output when the entry name is unusable.
    async fn extract(&self, archive: &Path, fallback_extension: &str) -> Result<PathBuf, ArchiveFailure>;

    /// Whether `path` carries this archiver's extension
    fn is_archive(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(self.extension()))
            .unwrap_or(false)
    }
}

/// Zip archiver. The entry is deflated and keeps the dump's file name.
#[derive(Debug, Clone, Default)]
pub struct ZipArchiver;

impl ZipArchiver {
    /// Archiver with deflate compression
    pub fn new() -> Self {
        Self
    }

    /// Final archive path for a dump: the dump extension becomes `.zip`
    pub fn archive_path(source: &Path) -> PathBuf {
        source.with_extension(ARCHIVE_EXTENSION)
    }
}

#[async_trait]
impl Archiver for ZipArchiver {
    fn extension(&self) -> &str {
        ARCHIVE_EXTENSION
    }

    async fn archive(&self, source: &Path) -> Result<PathBuf, ArchiveFailure> {
        let source = source.to_path_buf();
        let source_for_task = source.clone();

        let archive_path = tokio::task::spawn_blocking(move || archive_blocking(&source_for_task))
            .await
            .map_err(|e| ArchiveFailure::Create {
                path: ZipArchiver::archive_path(&source),
                message: e.to_string(),
            })??;

        if let Err(e) = tokio::fs::remove_file(&source).await {
            warn!(source = %source.display(), error = %e, "archive verified but the dump could not be removed");
        }

        info!(archive = %archive_path.display(), "dump archived");
        Ok(archive_path)
    }

    async fn extract(&self, archive: &Path, fallback_extension: &str) -> Result<PathBuf, ArchiveFailure> {
        let archive = archive.to_path_buf();
        let fallback = archive.with_extension(fallback_extension);
        let archive_for_task = archive.clone();

        let extracted = tokio::task::spawn_blocking(move || extract_blocking(&archive_for_task, &fallback))
            .await
            .map_err(|e| ArchiveFailure::Extract {
                path: archive.clone(),
                message: e.to_string(),
            })??;

        info!(archive = %archive.display(), dump = %extracted.display(), "archive extracted");
        Ok(extracted)
    }
}

/// Hashes everything read through it
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    length: u64,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            length: 0,
        }
    }

    fn finish(self) -> ContentDigest {
        ContentDigest {
            sha256: format!("{:x}", self.hasher.finalize()),
            length: self.length,
        }
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.hasher.update(&buf[..read]);
        self.length += read as u64;
        Ok(read)
    }
}

/// Hidden in-flight sibling of `target`
pub(crate) fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.{}.partial", name, Uuid::new_v4()))
}

fn archive_blocking(source: &Path) -> Result<PathBuf, ArchiveFailure> {
    let archive_path = ZipArchiver::archive_path(source);
    if archive_path.exists() {
        return Err(ArchiveFailure::Create {
            path: archive_path,
            message: "file already exists".to_string(),
        });
    }

    let partial = partial_path(&archive_path);
    let result = write_archive(source, &partial)
        .and_then(|digest| verify_archive(&partial, &digest))
        .and_then(|()| {
            std::fs::rename(&partial, &archive_path).map_err(|e| ArchiveFailure::Create {
                path: archive_path.clone(),
                message: e.to_string(),
            })
        });

    if let Err(failure) = result {
        let _ = std::fs::remove_file(&partial);
        warn!(source = %source.display(), error = %failure, "archiving failed, dump kept");
        return Err(failure);
    }
    Ok(archive_path)
}

fn write_archive(source: &Path, partial: &Path) -> Result<ContentDigest, ArchiveFailure> {
    let add_error = |message: String| ArchiveFailure::Add {
        path: source.to_path_buf(),
        message,
    };

    let input = File::open(source).map_err(|e| add_error(e.to_string()))?;
    let output = File::create(partial).map_err(|e| ArchiveFailure::Create {
        path: partial.to_path_buf(),
        message: e.to_string(),
    })?;

    let entry_name = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    let mut writer = ZipWriter::new(BufWriter::new(output));
    writer
        .start_file(entry_name, options)
        .map_err(|e| add_error(e.to_string()))?;

    let mut reader = HashingReader::new(BufReader::new(input));
    io::copy(&mut reader, &mut writer).map_err(|e| add_error(e.to_string()))?;

    let buffered = writer.finish().map_err(|e| add_error(e.to_string()))?;
    let file = buffered
        .into_inner()
        .map_err(|e| add_error(e.error().to_string()))?;
    file.sync_all().map_err(|e| add_error(e.to_string()))?;

    let digest = reader.finish();
    debug!(source = %source.display(), digest = %digest, "archive written");
    Ok(digest)
}

/// Open a zip with exactly one entry
fn open_zip(path: &Path) -> Result<ZipArchive<BufReader<File>>, ArchiveFailure> {
    let mut file = File::open(path).map_err(|_| ArchiveFailure::NotAnArchive(path.to_path_buf()))?;
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() || magic != ZIP_MAGIC {
        return Err(ArchiveFailure::NotAnArchive(path.to_path_buf()));
    }
    drop(file);

    let file = File::open(path).map_err(|_| ArchiveFailure::NotAnArchive(path.to_path_buf()))?;
    let archive = ZipArchive::new(BufReader::new(file)).map_err(structure_failure)?;
    if archive.len() != 1 {
        return Err(ArchiveFailure::ConsistencyCheckFailed(format!(
            "expected one entry, found {}",
            archive.len()
        )));
    }
    Ok(archive)
}

fn structure_failure(error: ZipError) -> ArchiveFailure {
    ArchiveFailure::ConsistencyCheckFailed(error.to_string())
}

fn decode_failure(error: io::Error) -> ArchiveFailure {
    let message = error.to_string();
    // the zip reader reports a CRC-32 mismatch at end of entry with this wording
    if message.to_ascii_lowercase().contains("checksum") {
        ArchiveFailure::ChecksumFailed {
            expected: "entry CRC-32".to_string(),
            actual: message,
        }
    } else {
        ArchiveFailure::ConsistencyCheckFailed(message)
    }
}

/// Re-read an archive, checking the entry CRC and comparing its content against `expected`
pub fn verify_archive(path: &Path, expected: &ContentDigest) -> Result<(), ArchiveFailure> {
    let mut archive = open_zip(path)?;
    let entry = archive.by_index(0).map_err(structure_failure)?;
    let mut reader = HashingReader::new(entry);
    io::copy(&mut reader, &mut io::sink()).map_err(decode_failure)?;

    let actual = reader.finish();
    if &actual != expected {
        return Err(ArchiveFailure::ChecksumFailed {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Digest of a plain file, for comparing an extracted dump with its source
pub fn digest_file(path: &Path) -> io::Result<ContentDigest> {
    let mut reader = HashingReader::new(BufReader::new(File::open(path)?));
    io::copy(&mut reader, &mut io::sink())?;
    Ok(reader.finish())
}

/// Entry name reduced to its last component; hidden or empty names are ignored
fn entry_file_name(raw: &str) -> Option<String> {
    let name = Path::new(raw).file_name()?.to_str()?.to_string();
    if name.is_empty() || name.starts_with('.') {
        return None;
    }
    Some(name)
}

fn extract_blocking(archive_path: &Path, fallback: &Path) -> Result<PathBuf, ArchiveFailure> {
    let mut archive = open_zip(archive_path)?;
    let mut entry = archive.by_index(0).map_err(structure_failure)?;
    let target = match entry_file_name(entry.name()) {
        Some(name) => archive_path.with_file_name(name),
        None => fallback.to_path_buf(),
    };
    if target == archive_path {
        return Err(ArchiveFailure::Extract {
            path: archive_path.to_path_buf(),
            message: "archive entry would overwrite the archive".to_string(),
        });
    }

    let partial = partial_path(&target);
    let result = (|| -> Result<(), ArchiveFailure> {
        let extract_error = |message: String| ArchiveFailure::Extract {
            path: archive_path.to_path_buf(),
            message,
        };
        let mut output = BufWriter::new(File::create(&partial).map_err(|e| extract_error(e.to_string()))?);
        io::copy(&mut entry, &mut output).map_err(decode_failure)?;
        output.flush().map_err(|e| extract_error(e.to_string()))?;
        let file = output
            .into_inner()
            .map_err(|e| extract_error(e.error().to_string()))?;
        file.sync_all().map_err(|e| extract_error(e.to_string()))?;
        std::fs::rename(&partial, &target).map_err(|e| extract_error(e.to_string()))
    })();

    if let Err(failure) = result {
        let _ = std::fs::remove_file(&partial);
        return Err(failure);
    }
    Ok(target)
}
