//! Retention Manager - age-based deletion on the local and remote tiers

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::storage::LocalStore;
use super::types::{RetentionPolicy, StorageTier, SweepReport};
use crate::storage::{list_prefix, RemoteStorage};
use crate::{BackupError, Result};

/// Deletes artifacts older than a policy's cutoff.
///
/// Per-item failures are logged and recorded in the [`SweepReport`]; they
/// never abort the sweep.
pub struct RetentionManager {
    store: LocalStore,
    extensions: Vec<String>,
}

impl RetentionManager {
    /// Only files with one of `extensions` are eligible locally
    pub fn new(store: LocalStore, extensions: Vec<String>) -> Self {
        Self { store, extensions }
    }

    /// Sweep eligible files in the dump directory
    pub async fn sweep_local(&self, policy: RetentionPolicy, now: DateTime<Utc>) -> Result<SweepReport> {
        ensure_tier(policy, StorageTier::Local)?;
        let cutoff = policy.cutoff(now);
        let mut report = SweepReport::default();

        for file in self.store.list_files().await? {
            if !file.has_extension(&self.extensions) {
                continue;
            }
            if !policy.is_expired(file.modified, now) {
                report.retained += 1;
                continue;
            }
            match self.store.remove(&file.path).await {
                Ok(()) => {
                    debug!(file = %file.path.display(), "deleted expired local dump");
                    report.deleted.push(file.file_name);
                }
                Err(e) => {
                    warn!(file = %file.path.display(), error = %e, "could not delete expired local dump");
                    report.failed.push((file.file_name, e.to_string()));
                }
            }
        }

        info!(
            tier = "local",
            cutoff = ?cutoff,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            retained = report.retained,
            "retention sweep finished"
        );
        Ok(report)
    }

    /// Sweep objects under `<prefix>/` in `bucket`
    pub async fn sweep_remote(
        &self,
        storage: &dyn RemoteStorage,
        bucket: &str,
        prefix: &str,
        policy: RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<SweepReport> {
        ensure_tier(policy, StorageTier::Remote)?;
        let cutoff = policy.cutoff(now);
        let mut report = SweepReport::default();

        for object in storage.list(bucket, &list_prefix(prefix)).await? {
            let Some(last_modified) = object.last_modified else {
                debug!(bucket = bucket, key = %object.key, "object has no modification time, keeping it");
                report.retained += 1;
                continue;
            };
            if !policy.is_expired(last_modified, now) {
                report.retained += 1;
                continue;
            }
            match storage.delete(bucket, &object.key).await {
                Ok(()) => {
                    debug!(bucket = bucket, key = %object.key, "deleted expired remote dump");
                    report.deleted.push(object.key);
                }
                Err(e) => {
                    warn!(bucket = bucket, key = %object.key, error = %e, "could not delete expired remote dump");
                    report.failed.push((object.key, e.to_string()));
                }
            }
        }

        info!(
            tier = "remote",
            bucket = bucket,
            cutoff = ?cutoff,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            retained = report.retained,
            "retention sweep finished"
        );
        Ok(report)
    }
}

fn ensure_tier(policy: RetentionPolicy, expected: StorageTier) -> Result<()> {
    if policy.tier() != expected {
        return Err(BackupError::Config(crate::config::ConfigError::InvalidValue {
            key: "retention tier".to_string(),
            value: policy.tier().to_string(),
        }));
    }
    Ok(())
}
