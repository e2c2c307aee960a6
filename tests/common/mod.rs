// Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use db_backup::command::{CommandOutput, CommandSpec, RecordingCommandRunner};
use db_backup::config::{BackupConfig, ConnectionConfig, DatabaseDriver};
use db_backup::notify::{BackupEvent, Notifier, NotifyError};
use db_backup::storage::{MemoryRemoteStorage, RemoteError, RemoteObject, RemoteStorage};

pub const DUMP_WITH_MARKER: &str = "-- MySQL dump 10.13\n\
-- CHANGE MASTER TO MASTER_LOG_FILE='mysql-bin.000042', MASTER_LOG_POS=154;\n\
CREATE TABLE orders (id INT PRIMARY KEY);\n\
INSERT INTO orders VALUES (1),(2),(3);\n";

pub fn mysql_config(dump_dir: &Path, binlog_dir: &Path) -> BackupConfig {
    let mut config = BackupConfig::default();
    config.dump_path = dump_dir.to_path_buf();
    config.binlog_path = binlog_dir.to_path_buf();
    config.connections.insert(
        "mysql".to_string(),
        ConnectionConfig {
            driver: DatabaseDriver::Mysql,
            host: "127.0.0.1".to_string(),
            port: None,
            database: "orders".to_string(),
            username: "backup".to_string(),
            password: "secret".to_string(),
            webhook: None,
        },
    );
    config
}

/// File a dump command writes to
pub fn dump_target(spec: &CommandSpec) -> Option<PathBuf> {
    spec.flag_value("--result-file")
        .or_else(|| spec.flag_value("--file"))
        .map(PathBuf::from)
        .or_else(|| spec.stdout_file.clone())
}

/// Runner whose `mysqldump` writes `content` and whose other tools succeed
pub fn dumping_runner(content: &str) -> Arc<RecordingCommandRunner> {
    let content = content.to_string();
    Arc::new(RecordingCommandRunner::with_handler(move |spec| {
        if spec.program == "mysqldump" {
            if let Some(target) = dump_target(spec) {
                std::fs::write(target, &content).unwrap();
            }
        }
        CommandOutput::success()
    }))
}

pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

pub fn set_mtime(path: &Path, time: DateTime<Utc>) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::from(time)).unwrap();
}

/// Collects every event it is sent
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<BackupEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<BackupEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, event: &BackupEvent) -> Result<(), NotifyError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Always fails, to check that delivery errors do not change outcomes
pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    fn name(&self) -> &str {
        "failing"
    }

    async fn notify(&self, _event: &BackupEvent) -> Result<(), NotifyError> {
        Err(NotifyError::Status(500))
    }
}

/// In-memory store with switchable failures
#[derive(Default)]
pub struct FlakyRemoteStorage {
    pub inner: MemoryRemoteStorage,
    pub fail_put: bool,
    /// Write a truncated body to the target, then fail
    pub fail_get: bool,
    pub fail_list: bool,
    pub fail_delete: Vec<String>,
}

#[async_trait]
impl RemoteStorage for FlakyRemoteStorage {
    async fn put(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), RemoteError> {
        if self.fail_put {
            return Err(RemoteError::Upload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: "connection reset".to_string(),
            });
        }
        self.inner.put(bucket, key, local_path).await
    }

    async fn get(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), RemoteError> {
        if self.fail_get {
            std::fs::write(local_path, "CREATE TABLE ord").unwrap();
            return Err(RemoteError::Download {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: "connection reset".to_string(),
            });
        }
        self.inner.get(bucket, key, local_path).await
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObject>, RemoteError> {
        if self.fail_list {
            return Err(RemoteError::List {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
                message: "access denied".to_string(),
            });
        }
        self.inner.list(bucket, prefix).await
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), RemoteError> {
        if self.fail_delete.iter().any(|failing| failing == key) {
            return Err(RemoteError::Delete {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: "access denied".to_string(),
            });
        }
        self.inner.delete(bucket, key).await
    }
}
