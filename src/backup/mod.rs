// Backup pipeline - dump producer, archiver, retention and orchestration

pub mod archiver;
/// Orchestration of backup, restore, listing and pruning
pub mod manager;
pub mod producer;
pub mod retention;
/// The local dump directory
pub mod storage;
pub mod types;

pub use archiver::{
    digest_file, verify_archive, ArchiveFailure, Archiver, ContentDigest, ZipArchiver,
    ARCHIVE_EXTENSION,
};
pub use manager::BackupManager;
pub use producer::DumpProducer;
pub use retention::RetentionManager;
pub use storage::{LocalFile, LocalStore};
pub use types::{
    ArtifactName, BackupArtifact, BackupReport, BackupRequest, PruneReport, RestoreRequest,
    RetentionPolicy, StorageTier, SweepReport, TIMESTAMP_FORMAT,
};
