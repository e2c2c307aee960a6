//! db-backup - command-line entry point.
//!
//! - `db-backup backup` - dump, optionally archive and upload, apply retention
//! - `db-backup restore [DUMP]` - restore a dump, or list dumps when none is given
//! - `db-backup prune` - apply retention without taking a backup

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use db_backup::backup::{BackupManager, BackupRequest, RestoreRequest};
use db_backup::command::SystemCommandRunner;
use db_backup::config::BackupConfig;

/// Database backup and restore.
#[derive(Debug, Parser)]
#[command(name = "db-backup")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file.
    #[arg(long, env = "DB_BACKUP_CONFIG", default_value = "db-backup.json")]
    config: PathBuf,

    /// Named connection to use instead of the default.
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Dump the database.
    Backup(BackupArgs),
    /// Restore a dump, or list available dumps.
    Restore(RestoreArgs),
    /// Delete expired dumps.
    Prune(PruneArgs),
}

#[derive(Debug, Args)]
struct BackupArgs {
    /// Custom artifact path, relative to the working directory unless absolute.
    filename: Option<PathBuf>,

    /// Upload to remote storage; the bucket defaults to the configured one.
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    upload_remote: Option<String>,

    /// Remote key prefix.
    #[arg(long)]
    remote_path: Option<String>,

    /// Delete local dumps older than this many days.
    #[arg(long, allow_negative_numbers = true)]
    retention_days: Option<i64>,

    /// Delete remote dumps older than this many days.
    #[arg(long, allow_negative_numbers = true)]
    retention_days_remote: Option<i64>,

    /// Compress the dump into a verified archive.
    #[arg(long)]
    archive: bool,

    /// Remove the local copy after a successful upload.
    #[arg(long)]
    remote_only: bool,

    /// Extra options passed to the dump tool.
    #[arg(long, allow_hyphen_values = true)]
    dump_options: Option<String>,

    /// Do not send notifications.
    #[arg(long)]
    disable_notify: bool,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    /// Dump file name; lists dumps when omitted.
    dump: Option<String>,

    /// Download the dump from remote storage first.
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    restore_remote: Option<String>,

    /// Remote key prefix.
    #[arg(long)]
    remote_path: Option<String>,

    /// Replay binary logs after loading, up to the given time or now.
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    binlog: Option<String>,
}

#[derive(Debug, Args)]
struct PruneArgs {
    /// Delete local dumps older than this many days.
    #[arg(long, allow_negative_numbers = true)]
    retention_days: Option<i64>,

    /// Delete remote dumps older than this many days.
    #[arg(long, allow_negative_numbers = true)]
    retention_days_remote: Option<i64>,

    /// Bucket to prune; defaults to the configured one.
    #[arg(long)]
    bucket: Option<String>,

    /// Remote key prefix.
    #[arg(long)]
    remote_path: Option<String>,
}

/// Bucket from a flag that may be given without a value
fn resolve_bucket(flag: Option<&str>, config: &BackupConfig) -> Result<Option<String>> {
    match flag {
        None => Ok(None),
        Some("") => match &config.remote.bucket {
            Some(bucket) => Ok(Some(bucket.clone())),
            None => bail!("no bucket given and remote.bucket is not configured"),
        },
        Some(bucket) => Ok(Some(bucket.to_string())),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

#[cfg(feature = "s3")]
async fn attach_remote(manager: BackupManager, config: &BackupConfig) -> BackupManager {
    use db_backup::storage::{S3Config, S3RemoteStorage};

    let storage = S3RemoteStorage::new(S3Config::from(&config.remote)).await;
    manager.with_remote_storage(Arc::new(storage))
}

#[cfg(not(feature = "s3"))]
async fn attach_remote(manager: BackupManager, _config: &BackupConfig) -> BackupManager {
    tracing::warn!("built without the s3 feature, remote storage is unavailable");
    manager
}

async fn run(cli: Cli) -> Result<()> {
    let config = BackupConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let manager = BackupManager::from_config(
        config.clone(),
        cli.database.as_deref(),
        Arc::new(SystemCommandRunner::new()),
    )?;

    match cli.command {
        Commands::Backup(args) => {
            let bucket = resolve_bucket(args.upload_remote.as_deref(), &config)?;
            let manager = match bucket {
                Some(_) => attach_remote(manager, &config).await,
                None => manager,
            };

            let mut request = BackupRequest::new()
                .archive(args.archive)
                .remote_only(args.remote_only)
                .disable_notify(args.disable_notify);
            request.filename = args.filename;
            request.upload_bucket = bucket;
            request.remote_prefix = args.remote_path;
            request.retention_days = args.retention_days;
            request.remote_retention_days = args.retention_days_remote;
            request.dump_options = args.dump_options;

            let report = manager.backup(&request).await;
            println!("{}", report.event.summary());
            for issue in &report.event.issues {
                eprintln!("warning: {:?}: {}", issue.stage, issue.message);
            }
            if !report.outcome.is_success() {
                bail!("backup failed");
            }
        }
        Commands::Restore(args) => {
            let bucket = resolve_bucket(args.restore_remote.as_deref(), &config)?;
            let manager = match bucket {
                Some(_) => attach_remote(manager, &config).await,
                None => manager,
            };

            let Some(dump) = args.dump else {
                for artifact in manager.list_dumps(bucket.as_deref(), args.remote_path.as_deref()).await? {
                    println!(
                        "{:<7} {:>12}  {}  {}",
                        artifact.tier.to_string(),
                        artifact.size_bytes,
                        artifact
                            .modified
                            .map(|modified| modified.format("%Y-%m-%d %H:%M:%S").to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        artifact.location
                    );
                }
                return Ok(());
            };

            let mut request = RestoreRequest::new(dump);
            request.remote_bucket = bucket;
            request.remote_prefix = args.remote_path;
            if let Some(target) = args.binlog {
                request = request.replay_logs(non_empty(Some(target)));
            }

            let report = manager.restore(&request).await?;
            println!("restored {}", report.dump_file.display());
            if let Some(until) = report.replayed_until {
                println!("bin logs replayed until {}", until);
            }
        }
        Commands::Prune(args) => {
            let remote_days = args.retention_days_remote.or(config.retention.remote_days);
            let bucket = match remote_days {
                Some(_) => non_empty(args.bucket).or_else(|| config.remote.bucket.clone()),
                None => None,
            };
            let manager = match bucket {
                Some(_) => attach_remote(manager, &config).await,
                None => manager,
            };
            let local_days = args.retention_days.or(config.retention.local_days);
            if local_days.is_none() && bucket.is_none() {
                bail!("nothing to prune: give --retention-days or --retention-days-remote");
            }

            let remote = bucket.as_deref().zip(remote_days);
            let report = manager.prune(local_days, remote, args.remote_path.as_deref()).await;
            for (tier, sweep) in [("local", report.local), ("remote", report.remote)] {
                match sweep {
                    Some(Ok(sweep)) => println!(
                        "{}: deleted {}, failed {}, kept {}",
                        tier,
                        sweep.deleted.len(),
                        sweep.failed.len(),
                        sweep.retained
                    ),
                    Some(Err(e)) => eprintln!("{}: {}", tier, e),
                    None => {}
                }
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli))
}
