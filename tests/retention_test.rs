// Integration tests for age-based retention on both tiers

mod common;

use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;

use common::*;
use db_backup::backup::{BackupManager, LocalStore, RetentionManager, RetentionPolicy, StorageTier};
use db_backup::storage::{MemoryRemoteStorage, RemoteError};
use db_backup::BackupError;

fn scenario_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()
}

fn extensions() -> Vec<String> {
    vec!["sql".to_string(), "zip".to_string()]
}

#[tokio::test]
async fn test_local_sweep_honours_age_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let dump = write_file(dir.path(), "orders_2024-01-01-10-00-00.sql", "dump");
    set_mtime(&dump, Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap());

    let retention = RetentionManager::new(LocalStore::new(dir.path()), extensions());

    // 30 days keeps a nine day old dump
    let month = RetentionPolicy::new(StorageTier::Local, 30).unwrap();
    let report = retention.sweep_local(month, scenario_now()).await.unwrap();
    assert!(report.deleted.is_empty());
    assert_eq!(report.retained, 1);
    assert!(dump.exists());

    // 7 days deletes it
    let week = RetentionPolicy::new(StorageTier::Local, 7).unwrap();
    let report = retention.sweep_local(week, scenario_now()).await.unwrap();
    assert_eq!(report.deleted, vec!["orders_2024-01-01-10-00-00.sql".to_string()]);
    assert!(!dump.exists());
}

#[tokio::test]
async fn test_local_sweep_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    for (name, age) in [("a.sql", 20), ("b.zip", 15), ("c.sql", 1)] {
        let path = write_file(dir.path(), name, "x");
        set_mtime(&path, scenario_now() - Duration::days(age));
    }

    let retention = RetentionManager::new(LocalStore::new(dir.path()), extensions());
    let policy = RetentionPolicy::new(StorageTier::Local, 7).unwrap();

    let first = retention.sweep_local(policy, scenario_now()).await.unwrap();
    assert_eq!(first.deleted, vec!["a.sql".to_string(), "b.zip".to_string()]);

    let second = retention.sweep_local(policy, scenario_now()).await.unwrap();
    assert!(second.deleted.is_empty());
    assert_eq!(second.retained, 1);
}

#[tokio::test]
async fn test_local_sweep_ignores_foreign_files() {
    let dir = tempfile::tempdir().unwrap();
    let notes = write_file(dir.path(), "README.txt", "keep");
    set_mtime(&notes, scenario_now() - Duration::days(365));

    let retention = RetentionManager::new(LocalStore::new(dir.path()), extensions());
    let policy = RetentionPolicy::new(StorageTier::Local, 1).unwrap();
    let report = retention.sweep_local(policy, scenario_now()).await.unwrap();

    assert!(report.deleted.is_empty());
    assert!(notes.exists());
}

#[tokio::test]
async fn test_remote_sweep_continues_past_failed_delete() {
    let now = scenario_now();
    let storage = FlakyRemoteStorage {
        fail_delete: vec!["databases/b.sql".to_string()],
        ..FlakyRemoteStorage::default()
    };
    storage.inner.insert("backups", "databases/a.sql", "a", now - Duration::days(20));
    storage.inner.insert("backups", "databases/b.sql", "b", now - Duration::days(20));
    storage.inner.insert("backups", "databases/c.sql", "c", now - Duration::days(20));
    storage.inner.insert("backups", "databases/d.sql", "d", now - Duration::days(2));

    let retention = RetentionManager::new(LocalStore::new("/unused"), extensions());
    let policy = RetentionPolicy::new(StorageTier::Remote, 7).unwrap();
    let report = retention
        .sweep_remote(&storage, "backups", "databases", policy, now)
        .await
        .unwrap();

    assert_eq!(
        report.deleted,
        vec!["databases/a.sql".to_string(), "databases/c.sql".to_string()]
    );
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "databases/b.sql");
    assert_eq!(report.retained, 1);
    assert_eq!(
        storage.inner.keys("backups"),
        vec!["databases/b.sql", "databases/d.sql"]
    );
}

#[tokio::test]
async fn test_remote_listing_failure_is_reported() {
    let storage = FlakyRemoteStorage {
        fail_list: true,
        ..FlakyRemoteStorage::default()
    };
    let retention = RetentionManager::new(LocalStore::new("/unused"), extensions());
    let policy = RetentionPolicy::new(StorageTier::Remote, 7).unwrap();

    let result = retention
        .sweep_remote(&storage, "backups", "databases", policy, scenario_now())
        .await;
    assert!(matches!(
        result,
        Err(BackupError::RemoteTransferFailure(RemoteError::List { .. }))
    ));
}

#[tokio::test]
async fn test_prune_rejects_non_positive_days_and_deletes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let dump = write_file(dir.path(), "orders.sql", "x");
    set_mtime(&dump, Utc::now() - Duration::days(400));

    let storage = Arc::new(MemoryRemoteStorage::new());
    storage.insert("backups", "databases/orders.sql", "x", Utc::now() - Duration::days(400));

    let manager = BackupManager::from_config(
        mysql_config(dir.path(), Path::new("/var/lib/mysql")),
        None,
        dumping_runner(""),
    )
    .unwrap()
    .with_remote_storage(storage.clone());

    let report = manager.prune(Some(0), Some(("backups", -1)), None).await;

    assert!(matches!(report.local, Some(Err(BackupError::RetentionInputInvalid(0)))));
    assert!(matches!(report.remote, Some(Err(BackupError::RetentionInputInvalid(-1)))));
    assert!(dump.exists());
    assert!(storage.contains("backups", "databases/orders.sql"));
}

#[tokio::test]
async fn test_prune_applies_both_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let old = write_file(dir.path(), "orders_2023-01-01-00-00-00.sql", "x");
    set_mtime(&old, Utc::now() - Duration::days(60));
    let fresh = write_file(dir.path(), "orders_2024-01-01-00-00-00.zip", "x");

    let storage = Arc::new(MemoryRemoteStorage::new());
    storage.insert("backups", "nightly/old.zip", "x", Utc::now() - Duration::days(60));
    storage.insert("backups", "nightly/new.zip", "x", Utc::now());

    let manager = BackupManager::from_config(
        mysql_config(dir.path(), Path::new("/var/lib/mysql")),
        None,
        dumping_runner(""),
    )
    .unwrap()
    .with_remote_storage(storage.clone());

    let report = manager
        .prune(Some(30), Some(("backups", 30)), Some("nightly"))
        .await;

    assert_eq!(report.local.unwrap().unwrap().deleted_count(), 1);
    assert_eq!(report.remote.unwrap().unwrap().deleted_count(), 1);
    assert!(!old.exists());
    assert!(fresh.exists());
    assert_eq!(storage.keys("backups"), vec!["nightly/new.zip"]);
}

#[tokio::test]
async fn test_prune_with_retention_beyond_time_range_keeps_everything() {
    let dir = tempfile::tempdir().unwrap();
    let dump = write_file(dir.path(), "orders_2020-01-01-00-00-00.sql", "x");
    set_mtime(&dump, Utc::now() - Duration::days(2000));

    let storage = Arc::new(MemoryRemoteStorage::new());
    storage.insert("backups", "databases/orders.sql", "x", Utc::now() - Duration::days(2000));

    let manager = BackupManager::from_config(
        mysql_config(dir.path(), Path::new("/var/lib/mysql")),
        None,
        dumping_runner(""),
    )
    .unwrap()
    .with_remote_storage(storage.clone());

    let report = manager
        .prune(Some(200_000_000), Some(("backups", i64::MAX)), None)
        .await;

    let local = report.local.unwrap().unwrap();
    assert!(local.deleted.is_empty());
    assert_eq!(local.retained, 1);
    let remote = report.remote.unwrap().unwrap();
    assert!(remote.deleted.is_empty());
    assert_eq!(remote.retained, 1);
    assert!(dump.exists());
    assert!(storage.contains("backups", "databases/orders.sql"));
}

#[tokio::test]
async fn test_remote_sweep_never_deletes_objects_without_a_time() {
    let now = scenario_now();
    let storage = MemoryRemoteStorage::new();
    storage.insert_undated("backups", "databases/orders_2019-01-01-00-00-00.sql", "x");
    storage.insert("backups", "databases/orders_2020-01-01-00-00-00.sql", "x", now - Duration::days(400));

    let retention = RetentionManager::new(LocalStore::new("/unused"), extensions());
    let policy = RetentionPolicy::new(StorageTier::Remote, 1).unwrap();
    let report = retention
        .sweep_remote(&storage, "backups", "databases", policy, now)
        .await
        .unwrap();

    assert_eq!(
        report.deleted,
        vec!["databases/orders_2020-01-01-00-00-00.sql".to_string()]
    );
    assert_eq!(report.retained, 1);
    assert!(storage.contains("backups", "databases/orders_2019-01-01-00-00-00.sql"));
}

#[tokio::test]
async fn test_manager_retention_covers_zip_archives() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_file(dir.path(), "orders_2023-01-01-00-00-00.zip", "x");
    set_mtime(&archive, Utc::now() - Duration::days(90));

    let manager = BackupManager::from_config(
        mysql_config(dir.path(), Path::new("/var/lib/mysql")),
        None,
        dumping_runner(""),
    )
    .unwrap();

    let report = manager.prune(Some(30), None, None).await;
    assert_eq!(
        report.local.unwrap().unwrap().deleted,
        vec!["orders_2023-01-01-00-00-00.zip".to_string()]
    );
    assert!(!archive.exists());
}
