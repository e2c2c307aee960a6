//! Backup events and notifiers.
//!
//! Every backup invocation ends with exactly one [`BackupEvent`]. Notifiers
//! receive it fire-and-forget: a delivery failure is logged and never changes
//! the backup outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ConnectionConfig;

const SLACK_HOOK_BASE: &str = "https://hooks.slack.com/services/";

/// Errors raised while delivering a notification
#[derive(Error, Debug)]
pub enum NotifyError {
    /// Transport failure
    #[error("Webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status
    #[error("Webhook returned status {0}")]
    Status(u16),
}

/// Final outcome of a backup invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum BackupOutcome {
    /// The dump was produced
    Success,
    /// The dump failed, with the reason
    Failure(String),
}

impl BackupOutcome {
    /// Whether the dump succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, BackupOutcome::Success)
    }
}

/// Pipeline stage of a backup run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Stage {
    Dump,
    Archive,
    Upload,
    RemoteRetention,
    LocalRetention,
    RemoteOnlyCleanup,
}

/// A stage that failed without failing the backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageIssue {
    /// Stage that failed
    pub stage: Stage,
    /// Error text
    pub message: String,
}

/// Configuration a run actually used; credentials are never included
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ResolvedConfig {
    pub connection_name: String,
    pub connection: ConnectionConfig,
    pub dump_path: PathBuf,
    pub remote_bucket: Option<String>,
    pub remote_prefix: String,
}

/// Immutable record emitted once per backup invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEvent {
    /// Success or failure of the run
    pub outcome: BackupOutcome,
    /// Canonical artifact, or the intended dump path on failure
    pub artifact_path: PathBuf,
    /// File name of `artifact_path`
    pub artifact_name: String,
    /// Configuration the run used
    pub config: ResolvedConfig,
    /// Optional stages that failed; empty on a clean run
    pub issues: Vec<StageIssue>,
    /// Creation time of the event
    pub emitted_at: DateTime<Utc>,
}

impl BackupEvent {
    /// Event stamped with the current time
    pub fn new(
        outcome: BackupOutcome,
        artifact_path: PathBuf,
        artifact_name: String,
        config: ResolvedConfig,
        issues: Vec<StageIssue>,
    ) -> Self {
        Self {
            outcome,
            artifact_path,
            artifact_name,
            config,
            issues,
            emitted_at: Utc::now(),
        }
    }

    /// Whether the stage reported an issue
    pub fn has_issue(&self, stage: Stage) -> bool {
        self.issues.iter().any(|issue| issue.stage == stage)
    }

    /// Human-readable one-line summary
    pub fn summary(&self) -> String {
        let connection = &self.config.connection;
        match self.outcome {
            BackupOutcome::Success if self.issues.is_empty() => format!(
                "A backup of the {} database at {} has been created: {}",
                connection.database, connection.host, self.artifact_name
            ),
            BackupOutcome::Success => format!(
                "A backup of the {} database at {} has been created: {} ({} stage(s) reported problems)",
                connection.database,
                connection.host,
                self.artifact_name,
                self.issues.len()
            ),
            BackupOutcome::Failure(ref reason) => format!(
                "The backup of the {} database at {} failed: {}",
                connection.database, connection.host, reason
            ),
        }
    }
}

/// Receives backup events
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Deliver one event
    async fn notify(&self, event: &BackupEvent) -> Result<(), NotifyError>;
}

/// Deliver an event to every notifier, logging failures
pub async fn dispatch(notifiers: &[Arc<dyn Notifier>], event: &BackupEvent) {
    for notifier in notifiers {
        match notifier.notify(event).await {
            Ok(()) => info!(notifier = notifier.name(), "notification sent"),
            Err(e) => warn!(notifier = notifier.name(), error = %e, "notification failed"),
        }
    }
}

/// Posts Slack-compatible `{text, username}` payloads to a webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    username: String,
}

impl WebhookNotifier {
    /// `hook` is a full URL or a Slack `services/...` path
    pub fn new(hook: &str, username: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: resolve_webhook_url(hook),
            username: username.into(),
        }
    }

    /// Resolved webhook URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// JSON body posted for `event`
    pub fn payload(&self, event: &BackupEvent) -> serde_json::Value {
        json!({
            "text": event.summary(),
            "username": self.username,
        })
    }
}

/// Expand a bare Slack hook path into a full URL
pub fn resolve_webhook_url(hook: &str) -> String {
    if hook.starts_with("http://") || hook.starts_with("https://") {
        hook.to_string()
    } else {
        format!("{}{}", SLACK_HOOK_BASE, hook.trim_start_matches('/'))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, event: &BackupEvent) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&self.payload(event))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}
