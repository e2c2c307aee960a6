// Backup Manager - sequences dump, archive, upload, retention and notification

use chrono::{DateTime, Local, Utc};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{error, info, warn};

use super::archiver::{partial_path, Archiver, ZipArchiver};
use super::producer::DumpProducer;
use super::retention::RetentionManager;
use super::storage::LocalStore;
use super::types::{
    BackupArtifact, BackupReport, BackupRequest, PruneReport, RestoreRequest, RetentionPolicy,
    StorageTier, SweepReport,
};
use crate::command::CommandRunner;
use crate::config::{BackupConfig, ConfigError, ConnectionConfig};
use crate::engine::{build_engine, DatabaseEngine};
use crate::notify::{
    self, BackupEvent, BackupOutcome, Notifier, ResolvedConfig, Stage, StageIssue, WebhookNotifier,
};
use crate::restore::{RestoreEngine, RestoreReport};
use crate::storage::{list_prefix, object_key, RemoteError, RemoteStorage};
use crate::{BackupError, Result};

/// Runs backups and restores for one configured connection
pub struct BackupManager {
    config: BackupConfig,
    connection_name: String,
    connection: ConnectionConfig,
    engine: Arc<dyn DatabaseEngine>,
    archiver: Arc<dyn Archiver>,
    remote: Option<Arc<dyn RemoteStorage>>,
    notifiers: Vec<Arc<dyn Notifier>>,
    store: LocalStore,
}

impl BackupManager {
    /// Manager for `connection_name` (or the default connection) using `engine`
    pub fn new(
        config: BackupConfig,
        connection_name: Option<&str>,
        engine: Arc<dyn DatabaseEngine>,
    ) -> Result<Self> {
        let connection_name = connection_name
            .unwrap_or(&config.default_connection)
            .to_string();
        let connection = config.connection(Some(&connection_name))?.clone();
        let store = LocalStore::new(config.dump_path.clone());

        Ok(Self {
            config,
            connection_name,
            connection,
            engine,
            archiver: Arc::new(ZipArchiver::new()),
            remote: None,
            notifiers: Vec::new(),
            store,
        })
    }

    /// Build the engine from the connection's driver and register the
    /// configured webhook, if any
    pub fn from_config(
        config: BackupConfig,
        connection_name: Option<&str>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let connection = config.connection(connection_name)?.clone();
        let engine = build_engine(&connection, config.binlog_path.clone(), runner);
        let webhook = config.webhook_for(&connection).map(str::to_string);
        let username = config.notification.username.clone();

        let mut manager = Self::new(config, connection_name, engine)?;
        if let Some(hook) = webhook {
            manager = manager.with_notifier(Arc::new(WebhookNotifier::new(&hook, username)));
        }
        Ok(manager)
    }

    /// Replace the zip archiver
    pub fn with_archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = archiver;
        self
    }

    /// Store used for uploads, downloads, listings and remote retention
    pub fn with_remote_storage(mut self, storage: Arc<dyn RemoteStorage>) -> Self {
        self.remote = Some(storage);
        self
    }

    /// Add a notifier; events go to every registered notifier
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Loaded configuration
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Name of the selected connection
    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    /// Engine for the selected connection
    pub fn engine(&self) -> &Arc<dyn DatabaseEngine> {
        &self.engine
    }

    /// Extensions of artifacts this manager produces
    fn artifact_extensions(&self) -> Vec<String> {
        vec![
            self.engine.file_extension().to_string(),
            self.archiver.extension().to_string(),
        ]
    }

    fn retention(&self) -> RetentionManager {
        RetentionManager::new(self.store.clone(), self.artifact_extensions())
    }

    fn remote_storage(&self) -> std::result::Result<&Arc<dyn RemoteStorage>, RemoteError> {
        self.remote.as_ref().ok_or(RemoteError::NotConfigured)
    }

    fn prefix<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested.unwrap_or(&self.config.remote.prefix)
    }

    fn resolved_config(&self, remote_bucket: Option<&str>, remote_prefix: &str) -> ResolvedConfig {
        ResolvedConfig {
            connection_name: self.connection_name.clone(),
            connection: self.connection.clone(),
            dump_path: self.config.dump_path.clone(),
            remote_bucket: remote_bucket.map(str::to_string),
            remote_prefix: remote_prefix.to_string(),
        }
    }

    /// Run one backup.
    ///
    /// Only a failed dump fails the run. Archive, upload, retention and
    /// cleanup failures are recorded on the report and the event.
    pub async fn backup(&self, request: &BackupRequest) -> BackupReport {
        let now = Utc::now();
        let bucket = request.upload_bucket.as_deref();
        let prefix = self.prefix(request.remote_prefix.as_deref()).to_string();
        let resolved = self.resolved_config(bucket, &prefix);

        let producer = DumpProducer::new(self.engine.clone(), self.store.clone());
        let destination =
            match producer.destination(request.filename.as_deref(), Local::now().naive_local()) {
                Ok(destination) => destination,
                Err(e) => {
                    let requested = request.filename.clone().unwrap_or_default();
                    return self.dump_failed(e, &requested, resolved, request).await;
                }
            };

        if let Err(e) = producer
            .produce(&destination, request.dump_options.as_deref())
            .await
        {
            return self.dump_failed(e, &destination, resolved, request).await;
        }

        let mut issues = Vec::new();
        let mut artifact = destination.clone();

        let archive = if request.archive {
            let result = self.archiver.archive(&destination).await;
            match &result {
                Ok(path) => {
                    info!(archive = %path.display(), "archiving successful");
                    artifact = path.clone();
                }
                Err(failure) => {
                    warn!(dump = %destination.display(), error = %failure, "archiving failed, keeping plain dump");
                    issues.push(issue(Stage::Archive, failure));
                }
            }
            Some(result)
        } else {
            None
        };

        info!(artifact = %artifact.display(), "database backup was successful");

        let mut upload = None;
        let mut remote_retention = None;
        let mut removed_local = false;

        if let Some(bucket) = bucket {
            let result = self.upload(bucket, &prefix, &artifact).await;
            match &result {
                Ok(_) => {
                    if let Some(days) = request
                        .remote_retention_days
                        .or(self.config.retention.remote_days)
                    {
                        let sweep = self.sweep_remote(bucket, &prefix, days, now).await;
                        if let Err(e) = &sweep {
                            warn!(error = %e, "remote retention skipped");
                            issues.push(issue(Stage::RemoteRetention, e));
                        }
                        remote_retention = Some(sweep);
                    }

                    if request.remote_only {
                        match self.store.remove(&artifact).await {
                            Ok(()) => {
                                info!(artifact = %artifact.display(), "local copy removed after upload");
                                removed_local = true;
                            }
                            Err(e) => {
                                warn!(artifact = %artifact.display(), error = %e, "could not remove local copy");
                                issues.push(issue(Stage::RemoteOnlyCleanup, &e));
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(bucket = bucket, error = %e, "upload failed, local copy kept");
                    issues.push(issue(Stage::Upload, e));
                }
            }
            upload = Some(result);
        }

        let local_retention = match request.retention_days.or(self.config.retention.local_days) {
            Some(days) => {
                let sweep = self.sweep_local(days, now).await;
                if let Err(e) = &sweep {
                    warn!(error = %e, "local retention skipped");
                    issues.push(issue(Stage::LocalRetention, e));
                }
                Some(sweep)
            }
            None => None,
        };

        let event = self
            .emit(
                BackupOutcome::Success,
                &artifact,
                resolved,
                issues,
                request.disable_notify,
            )
            .await;

        BackupReport {
            outcome: event.outcome.clone(),
            artifact: Some(artifact),
            archive,
            upload,
            remote_retention,
            local_retention,
            removed_local,
            event,
        }
    }

    async fn dump_failed(
        &self,
        error: BackupError,
        destination: &Path,
        resolved: ResolvedConfig,
        request: &BackupRequest,
    ) -> BackupReport {
        let event = self
            .emit(
                BackupOutcome::Failure(error.to_string()),
                destination,
                resolved,
                vec![issue(Stage::Dump, &error)],
                request.disable_notify,
            )
            .await;
        BackupReport {
            outcome: event.outcome.clone(),
            artifact: None,
            archive: None,
            upload: None,
            remote_retention: None,
            local_retention: None,
            removed_local: false,
            event,
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        prefix: &str,
        artifact: &Path,
    ) -> std::result::Result<String, RemoteError> {
        let storage = self.remote_storage()?;
        let file_name = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let key = object_key(prefix, &file_name);

        info!(bucket = bucket, key = %key, "uploading backup");
        storage.put(bucket, &key, artifact).await?;
        info!(bucket = bucket, key = %key, "upload successful");
        Ok(key)
    }

    async fn sweep_local(&self, days: i64, now: DateTime<Utc>) -> Result<SweepReport> {
        let policy = RetentionPolicy::new(StorageTier::Local, days)?;
        self.retention().sweep_local(policy, now).await
    }

    async fn sweep_remote(
        &self,
        bucket: &str,
        prefix: &str,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<SweepReport> {
        let policy = RetentionPolicy::new(StorageTier::Remote, days)?;
        let storage = self.remote_storage()?;
        self.retention()
            .sweep_remote(storage.as_ref(), bucket, prefix, policy, now)
            .await
    }

    async fn emit(
        &self,
        outcome: BackupOutcome,
        artifact: &Path,
        config: ResolvedConfig,
        issues: Vec<StageIssue>,
        disable_notify: bool,
    ) -> BackupEvent {
        let name = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let event = BackupEvent::new(outcome, artifact.to_path_buf(), name, config, issues);

        match &event.outcome {
            BackupOutcome::Success => info!(
                connection = %event.config.connection_name,
                artifact = %event.artifact_name,
                issues = event.issues.len(),
                "{}",
                event.summary()
            ),
            BackupOutcome::Failure(reason) => error!(
                connection = %event.config.connection_name,
                reason = %reason,
                "{}",
                event.summary()
            ),
        }

        if !disable_notify {
            notify::dispatch(&self.notifiers, &event).await;
        }
        event
    }

    /// Restore a local or downloaded dump, optionally rolling it forward
    pub async fn restore(&self, request: &RestoreRequest) -> Result<RestoreReport> {
        let file_name = Path::new(&request.dump)
            .file_name()
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "dump".to_string(),
                value: request.dump.clone(),
            })?
            .to_os_string();

        let mut downloaded_from = None;
        let local_path = match &request.remote_bucket {
            Some(bucket) => {
                let storage = self.remote_storage()?;
                let key = if request.dump.contains('/') {
                    request.dump.clone()
                } else {
                    object_key(self.prefix(request.remote_prefix.as_deref()), &request.dump)
                };

                self.store.ensure_directory_exists().await?;
                let local_path = self.store.directory().join(&file_name);
                info!(bucket = %bucket, key = %key, "downloading dump");
                self.download(storage.as_ref(), bucket, &key, &local_path).await?;
                downloaded_from = Some(key);
                local_path
            }
            None => self.store.resolve(Path::new(&request.dump)),
        };

        if !fs::try_exists(&local_path).await? {
            return Err(BackupError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("dump {} not found", local_path.display()),
            )));
        }

        let restore = RestoreEngine::new(self.engine.clone(), self.archiver.clone());
        let mut report = if request.replay_logs {
            restore
                .restore_with_log_replay(&local_path, request.target_time.as_deref())
                .await?
        } else {
            restore.restore(&local_path).await?
        };
        report.downloaded_from = downloaded_from;
        Ok(report)
    }

    /// Download into a hidden sibling and rename over `local_path` once complete
    async fn download(
        &self,
        storage: &dyn RemoteStorage,
        bucket: &str,
        key: &str,
        local_path: &Path,
    ) -> Result<()> {
        let partial = partial_path(local_path);
        if let Err(e) = storage.get(bucket, key, &partial).await {
            let _ = fs::remove_file(&partial).await;
            warn!(bucket = bucket, key = key, error = %e, "download failed");
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&partial, local_path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Local dumps, then remote objects under the prefix when `remote_bucket` is set
    pub async fn list_dumps(
        &self,
        remote_bucket: Option<&str>,
        remote_prefix: Option<&str>,
    ) -> Result<Vec<BackupArtifact>> {
        let mut artifacts = self.store.list_artifacts(&self.artifact_extensions()).await?;

        if let Some(bucket) = remote_bucket {
            let prefix = list_prefix(self.prefix(remote_prefix));
            let objects = self.remote_storage()?.list(bucket, &prefix).await?;
            artifacts.extend(objects.into_iter().map(|object| {
                let file_name = object.file_name().to_string();
                BackupArtifact::new(
                    StorageTier::Remote,
                    object.key,
                    file_name,
                    object.last_modified,
                    object.size_bytes,
                )
            }));
        }
        Ok(artifacts)
    }

    /// Apply retention without taking a backup
    pub async fn prune(
        &self,
        local_days: Option<i64>,
        remote: Option<(&str, i64)>,
        remote_prefix: Option<&str>,
    ) -> PruneReport {
        let now = Utc::now();
        let mut report = PruneReport::default();

        if let Some(days) = local_days {
            report.local = Some(self.sweep_local(days, now).await);
        }
        if let Some((bucket, days)) = remote {
            let prefix = self.prefix(remote_prefix).to_string();
            report.remote = Some(self.sweep_remote(bucket, &prefix, days, now).await);
        }
        report
    }
}

fn issue(stage: Stage, error: &dyn std::fmt::Display) -> StageIssue {
    StageIssue {
        stage,
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RecordingCommandRunner;

    #[test]
    fn test_unknown_connection_is_rejected() {
        let config = BackupConfig::from_json(r#"{"connections": {}}"#).unwrap();
        let result = BackupManager::from_config(
            config,
            Some("missing"),
            Arc::new(RecordingCommandRunner::new()),
        );
        assert!(matches!(
            result,
            Err(BackupError::Config(ConfigError::UnknownConnection(_)))
        ));
    }

    #[test]
    fn test_from_config_uses_default_connection() {
        let config = BackupConfig::from_json(
            r#"{
                "default_connection": "reporting",
                "connections": {
                    "reporting": {"driver": "pgsql", "database": "reports", "username": "ro"}
                }
            }"#,
        )
        .unwrap();

        let manager =
            BackupManager::from_config(config, None, Arc::new(RecordingCommandRunner::new())).unwrap();
        assert_eq!(manager.connection_name(), "reporting");
        assert_eq!(manager.engine().database_name(), "reports");
    }
}
