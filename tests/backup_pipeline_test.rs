// Integration tests for the backup pipeline: dump, archive, upload, retention, event

mod common;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::*;
use db_backup::backup::{ArchiveFailure, Archiver, BackupManager, BackupRequest};
use db_backup::command::{CommandOutput, RecordingCommandRunner};
use db_backup::notify::{BackupOutcome, Stage};
use db_backup::storage::{MemoryRemoteStorage, RemoteError};
use db_backup::BackupError;

const DUMP: &str = "CREATE TABLE orders (id INT);\nINSERT INTO orders VALUES (1);\n";

struct Fixture {
    _dir: tempfile::TempDir,
    dump_dir: PathBuf,
    runner: Arc<RecordingCommandRunner>,
    notifier: Arc<RecordingNotifier>,
}

impl Fixture {
    fn new(runner: Arc<RecordingCommandRunner>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let dump_dir = dir.path().join("dumps");
        Self {
            _dir: dir,
            dump_dir,
            runner,
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    fn manager(&self) -> BackupManager {
        let config = mysql_config(&self.dump_dir, Path::new("/var/lib/mysql"));
        BackupManager::from_config(config, None, self.runner.clone())
            .unwrap()
            .with_notifier(self.notifier.clone())
    }

    fn dump_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.dump_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }
}

/// Archiver whose verification always fails
struct ChecksumFailingArchiver;

#[async_trait]
impl Archiver for ChecksumFailingArchiver {
    fn extension(&self) -> &str {
        "zip"
    }

    async fn archive(&self, _source: &Path) -> Result<PathBuf, ArchiveFailure> {
        Err(ArchiveFailure::ChecksumFailed {
            expected: "abc".to_string(),
            actual: "def".to_string(),
        })
    }

    async fn extract(&self, archive: &Path, _fallback: &str) -> Result<PathBuf, ArchiveFailure> {
        Err(ArchiveFailure::NotAnArchive(archive.to_path_buf()))
    }
}

#[tokio::test]
async fn test_plain_backup_produces_named_dump_and_one_event() {
    let fixture = Fixture::new(dumping_runner(DUMP));
    let report = fixture.manager().backup(&BackupRequest::new()).await;

    assert!(report.outcome.is_success());
    let artifact = report.artifact.clone().unwrap();
    let name = artifact.file_name().unwrap().to_str().unwrap().to_string();
    assert!(name.starts_with("orders_"));
    assert!(name.ends_with(".sql"));
    assert_eq!(std::fs::read_to_string(&artifact).unwrap(), DUMP);

    let events = fixture.notifier.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, BackupOutcome::Success);
    assert_eq!(events[0].artifact_name, name);
    assert!(events[0].issues.is_empty());
    assert_eq!(events[0].config.connection.database, "orders");

    let dump = &fixture.runner.invocations()[0];
    assert_eq!(dump.program, "mysqldump");
    assert_eq!(dump.flag_value("--result-file"), Some(artifact.to_str().unwrap()));
}

#[tokio::test]
async fn test_dump_failure_is_reported_once_with_tool_message() {
    let runner = Arc::new(RecordingCommandRunner::with_handler(|_| {
        CommandOutput::failure(2, "mysqldump: Got error: 1045: Access denied for user 'backup'")
    }));
    let fixture = Fixture::new(runner);
    let storage = Arc::new(MemoryRemoteStorage::new());
    let manager = fixture.manager().with_remote_storage(storage.clone());

    let report = manager
        .backup(&BackupRequest::new().archive(true).upload_to("backups"))
        .await;

    match &report.outcome {
        BackupOutcome::Failure(reason) => assert!(reason.contains("Access denied")),
        BackupOutcome::Success => panic!("dump failure must fail the backup"),
    }
    assert!(report.artifact.is_none());
    assert!(report.archive.is_none());
    assert!(report.upload.is_none());
    assert!(storage.keys("backups").is_empty());

    let events = fixture.notifier.events();
    assert_eq!(events.len(), 1);
    assert!(!events[0].outcome.is_success());
    assert!(events[0].has_issue(Stage::Dump));
}

#[tokio::test]
async fn test_archived_backup_uploads_the_archive() {
    let fixture = Fixture::new(dumping_runner(DUMP));
    let storage = Arc::new(MemoryRemoteStorage::new());
    let manager = fixture.manager().with_remote_storage(storage.clone());

    let report = manager
        .backup(&BackupRequest::new().archive(true).upload_to("backups"))
        .await;

    assert!(report.outcome.is_success());
    let archive = report.artifact.clone().unwrap();
    assert_eq!(archive.extension().unwrap(), "zip");
    assert!(matches!(report.archive, Some(Ok(_))));

    // Only the archive remains locally
    let files = fixture.dump_files();
    assert_eq!(files.len(), 1);
    assert!(files[0].ends_with(".zip"));

    let key = report.uploaded_key().unwrap();
    assert_eq!(key, format!("databases/{}", files[0]));
    assert_eq!(
        storage.object("backups", key).unwrap().as_ref(),
        std::fs::read(&archive).unwrap().as_slice()
    );
}

#[tokio::test]
async fn test_archive_failure_keeps_dump_and_uploads_it() {
    let fixture = Fixture::new(dumping_runner(DUMP));
    let storage = Arc::new(MemoryRemoteStorage::new());
    let manager = fixture
        .manager()
        .with_archiver(Arc::new(ChecksumFailingArchiver))
        .with_remote_storage(storage.clone());

    let report = manager
        .backup(&BackupRequest::new().archive(true).upload_to("backups"))
        .await;

    assert!(report.outcome.is_success());
    assert!(matches!(
        report.archive,
        Some(Err(ArchiveFailure::ChecksumFailed { .. }))
    ));
    let artifact = report.artifact.clone().unwrap();
    assert_eq!(artifact.extension().unwrap(), "sql");
    assert!(artifact.exists());
    assert!(report.uploaded_key().unwrap().ends_with(".sql"));
    assert!(report.event.has_issue(Stage::Archive));
}

#[tokio::test]
async fn test_upload_failure_keeps_local_copy_even_when_remote_only() {
    let fixture = Fixture::new(dumping_runner(DUMP));
    let storage = Arc::new(FlakyRemoteStorage {
        fail_put: true,
        ..FlakyRemoteStorage::default()
    });
    let manager = fixture.manager().with_remote_storage(storage);

    let report = manager
        .backup(
            &BackupRequest::new()
                .upload_to("backups")
                .remote_only(true)
                .remote_retention_days(7),
        )
        .await;

    assert!(report.outcome.is_success());
    assert!(matches!(report.upload, Some(Err(RemoteError::Upload { .. }))));
    assert!(report.remote_retention.is_none());
    assert!(!report.removed_local);
    assert!(report.artifact.unwrap().exists());

    let events = fixture.notifier.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].outcome.is_success());
    assert!(events[0].has_issue(Stage::Upload));
}

#[tokio::test]
async fn test_remote_only_removes_local_copy_after_upload() {
    let fixture = Fixture::new(dumping_runner(DUMP));
    let storage = Arc::new(MemoryRemoteStorage::new());
    let manager = fixture.manager().with_remote_storage(storage.clone());

    let report = manager
        .backup(
            &BackupRequest::new()
                .upload_to("backups")
                .remote_prefix("nightly")
                .remote_only(true),
        )
        .await;

    assert!(report.removed_local);
    assert!(!report.artifact.clone().unwrap().exists());
    assert!(report.uploaded_key().unwrap().starts_with("nightly/orders_"));
    assert_eq!(storage.keys("backups").len(), 1);
    assert_eq!(report.event.config.remote_prefix, "nightly");
}

#[tokio::test]
async fn test_upload_without_remote_storage_is_a_degraded_success() {
    let fixture = Fixture::new(dumping_runner(DUMP));
    let report = fixture
        .manager()
        .backup(&BackupRequest::new().upload_to("backups"))
        .await;

    assert!(report.outcome.is_success());
    assert!(matches!(report.upload, Some(Err(RemoteError::NotConfigured))));
}

#[tokio::test]
async fn test_remote_retention_runs_after_upload() {
    let fixture = Fixture::new(dumping_runner(DUMP));
    let storage = Arc::new(MemoryRemoteStorage::new());
    storage.insert(
        "backups",
        "databases/orders_2020-01-01-00-00-00.sql",
        "old",
        Utc::now() - Duration::days(90),
    );
    let manager = fixture.manager().with_remote_storage(storage.clone());

    let report = manager
        .backup(
            &BackupRequest::new()
                .upload_to("backups")
                .remote_retention_days(30),
        )
        .await;

    let uploaded = report.uploaded_key().unwrap().to_string();
    let sweep = report.remote_retention.unwrap().unwrap();
    assert_eq!(sweep.deleted, vec!["databases/orders_2020-01-01-00-00-00.sql".to_string()]);
    assert_eq!(sweep.retained, 1);
    assert_eq!(storage.keys("backups"), vec![uploaded]);
}

#[tokio::test]
async fn test_invalid_retention_does_not_fail_backup() {
    let fixture = Fixture::new(dumping_runner(DUMP));
    let report = fixture
        .manager()
        .backup(&BackupRequest::new().retention_days(0))
        .await;

    assert!(report.outcome.is_success());
    assert!(matches!(
        report.local_retention,
        Some(Err(BackupError::RetentionInputInvalid(0)))
    ));
    assert!(report.event.has_issue(Stage::LocalRetention));
}

#[tokio::test]
async fn test_local_retention_keeps_the_new_dump() {
    let fixture = Fixture::new(dumping_runner(DUMP));
    std::fs::create_dir_all(&fixture.dump_dir).unwrap();
    let old = write_file(&fixture.dump_dir, "orders_2020-01-01-00-00-00.sql", "old");
    set_mtime(&old, Utc::now() - Duration::days(30));

    let report = fixture
        .manager()
        .backup(&BackupRequest::new().retention_days(7))
        .await;

    let sweep = report.local_retention.unwrap().unwrap();
    assert_eq!(sweep.deleted, vec!["orders_2020-01-01-00-00-00.sql".to_string()]);
    assert!(!old.exists());
    assert!(report.artifact.unwrap().exists());
}

#[tokio::test]
async fn test_existing_custom_filename_is_not_overwritten() {
    let fixture = Fixture::new(dumping_runner(DUMP));
    std::fs::create_dir_all(&fixture.dump_dir).unwrap();
    let taken = write_file(&fixture.dump_dir, "nightly.sql", "previous dump");

    let report = fixture
        .manager()
        .backup(&BackupRequest::new().filename(&taken))
        .await;

    assert!(!report.outcome.is_success());
    assert_eq!(std::fs::read_to_string(&taken).unwrap(), "previous dump");
    assert!(fixture.runner.invocations().is_empty());
}

#[tokio::test]
async fn test_custom_filename_outside_dump_directory() {
    let fixture = Fixture::new(dumping_runner(DUMP));
    let exports = tempfile::tempdir().unwrap();
    let target = exports.path().join("nested").join("nightly.sql");

    let report = fixture
        .manager()
        .backup(&BackupRequest::new().filename(&target).archive(true))
        .await;

    assert!(report.outcome.is_success());
    assert_eq!(report.artifact, Some(exports.path().join("nested").join("nightly.zip")));
    assert!(!target.exists());
    assert_eq!(report.event.artifact_name, "nightly.zip");
}

#[tokio::test]
async fn test_disable_notify_still_builds_event() {
    let fixture = Fixture::new(dumping_runner(DUMP));
    let report = fixture
        .manager()
        .backup(&BackupRequest::new().disable_notify(true))
        .await;

    assert!(report.outcome.is_success());
    assert!(fixture.notifier.events().is_empty());
    assert!(report.event.outcome.is_success());
}

#[tokio::test]
async fn test_notifier_failure_does_not_change_outcome() {
    let fixture = Fixture::new(dumping_runner(DUMP));
    let manager = fixture.manager().with_notifier(Arc::new(FailingNotifier));

    let report = manager.backup(&BackupRequest::new()).await;

    assert!(report.outcome.is_success());
    assert_eq!(fixture.notifier.events().len(), 1);
}

#[tokio::test]
async fn test_dump_options_reach_the_tool() {
    let fixture = Fixture::new(dumping_runner(DUMP));
    fixture
        .manager()
        .backup(&BackupRequest::new().dump_options("--single-transaction --quick"))
        .await;

    let dump = &fixture.runner.invocations()[0];
    assert!(dump.args.contains(&"--single-transaction".to_string()));
    assert!(dump.args.contains(&"--quick".to_string()));
    assert_eq!(dump.env, vec![("MYSQL_PWD".to_string(), "secret".to_string())]);
}
