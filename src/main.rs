//! blobvault
//!
//! Mirrors blob store containers onto local disk, archives them to a
//! secondary store and restores them from there.
//!
//! # Commands
//!
//! - `sync` - One incremental synchronization pass
//! - `backup` - Sync, archive changed containers, apply retention
//! - `restore` - Upload an archived container back to a store
//! - `archives` - List archives in the vault
//! - `daemon` - Run `backup` on a fixed interval

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use blobvault::config::Config;
use blobvault::fs::{ContainerScope, Materializer, ObjectStore};
use blobvault::service::{BackupService, RestoreService};
use blobvault::sync::{CancelSignal, PassReport, StateStore, SyncEngine};

/// Incremental blob store backups.
#[derive(Parser)]
#[command(name = "blobvault")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the config file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Container to process, or ALL (overrides the config file)
    #[arg(global = true, long)]
    container: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one synchronization pass
    Sync,

    /// Sync, then archive and upload every changed container
    Backup,

    /// Restore containers from their archives
    Restore {
        /// Use the archive closest to this day (YYYY-MM-DD) instead of the latest
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },

    /// List archives in the vault
    Archives,

    /// Run backups on a fixed interval until interrupted
    Daemon {
        /// Seconds between runs (overrides the config file)
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(container) = &cli.container {
        config.sync.container = container.clone();
    }

    let filter = if let Ok(filter) = EnvFilter::try_from_default_env() {
        filter
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config.validate()?;

    let shutdown = CancelSignal::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing in-flight work");
                shutdown.cancel();
            }
        });
    }

    let ok = match cli.command {
        Commands::Sync => {
            let engine = build_engine(&config)?;
            let report = run_pass(&config, &shutdown, |cancel| {
                let engine = engine.clone();
                async move { engine.run_pass(&cancel).await }
            })
            .await;
            println!("{}", report.summary());
            report.is_success()
        }
        Commands::Backup => {
            let service = build_backup(&config)?;
            run_backup(&config, &service, &shutdown).await
        }
        Commands::Restore { date } => restore(&config, date, &shutdown).await?,
        Commands::Archives => list_archives(&config).await?,
        Commands::Daemon { interval } => {
            let interval = Duration::from_secs(interval.unwrap_or(config.daemon.interval_secs).max(1));
            daemon(&config, interval, &shutdown).await?;
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn build_engine(config: &Config) -> Result<SyncEngine> {
    let store: Arc<dyn ObjectStore> = Arc::new(config.source_store()?);
    std::fs::create_dir_all(&config.sync.backup_path).with_context(|| {
        format!(
            "Failed to create backup directory: {}",
            config.sync.backup_path.display()
        )
    })?;

    SyncEngine::new(
        store,
        Materializer::new(&config.sync.backup_path),
        StateStore::new(config.sync.state_path()),
        config.sync.engine_config(),
    )
}

fn build_backup(config: &Config) -> Result<BackupService> {
    let engine = build_engine(config)?;
    let vault = config.archive.vault(&config.retry_policy())?;
    Ok(BackupService::new(
        engine,
        vault,
        &config.archive.temp_dir,
        config.archive.retention_days,
    )
    .with_compression(config.compression_level()))
}

/// Run `pass` under a per-pass cancellation signal bounded by the configured deadline.
async fn run_pass<F, Fut, T>(config: &Config, shutdown: &CancelSignal, pass: F) -> T
where
    F: FnOnce(CancelSignal) -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let cancel = shutdown.child();
    let deadline = config
        .sync
        .pass_timeout()
        .map(|timeout| cancel.cancel_after(timeout));

    let result = pass(cancel).await;

    if let Some(deadline) = deadline {
        deadline.abort();
    }
    result
}

async fn run_backup(config: &Config, service: &BackupService, shutdown: &CancelSignal) -> bool {
    let report = run_pass(config, shutdown, |cancel| async move {
        service.run_once(&cancel).await
    })
    .await;

    println!("{}", report.pass.summary());
    for archive in &report.archived {
        println!(
            "  archived {} -> {} ({})",
            archive.container,
            archive.name,
            humansize::format_size(archive.size, humansize::BINARY)
        );
    }
    for (container, err) in &report.failures {
        println!("  archive of {} failed: {}", container, err);
    }
    report.is_success()
}

async fn restore(config: &Config, date: Option<NaiveDate>, shutdown: &CancelSignal) -> Result<bool> {
    let scope = config.sync.scope();
    let vault = config.archive.vault(&config.retry_policy())?;
    let containers: Vec<String> = match &scope {
        ContainerScope::Single(name) => vec![name.clone()],
        ContainerScope::All => {
            let mut names: Vec<String> = vault.list().await?.into_iter().map(|a| a.container).collect();
            names.sort();
            names.dedup();
            names
        }
    };
    let target: Arc<dyn ObjectStore> = Arc::new(config.restore_store(&containers)?);

    let service = RestoreService::new(vault, target, &config.restore.temp_dir)
        .replace_existing(config.restore.replace_existing)
        .with_upload_concurrency(config.restore.upload_concurrency);

    let report = service.restore(&scope, date, shutdown).await?;
    for stats in &report.restored {
        println!(
            "{}: {} files ({}) from {}{}",
            stats.container,
            stats.files,
            humansize::format_size(stats.bytes, humansize::BINARY),
            stats.archive,
            if stats.errors.is_empty() {
                String::new()
            } else {
                format!(", {} errors", stats.errors.len())
            }
        );
    }
    for (container, err) in &report.failures {
        println!("{}: failed: {}", container, err);
    }
    Ok(report.is_success())
}

async fn list_archives(config: &Config) -> Result<bool> {
    let vault = config.archive.vault(&config.retry_policy())?;
    let scope = config.sync.scope();

    let archives = match &scope {
        ContainerScope::Single(name) => vault.list_container(name).await?,
        ContainerScope::All => vault.list().await?,
    };
    if archives.is_empty() {
        println!("No archives found");
    }
    for archive in archives {
        println!(
            "{:<24} {}  {:>10}  {}",
            archive.container,
            archive.created_at.format("%Y-%m-%d %H:%M:%S"),
            humansize::format_size(archive.size, humansize::BINARY),
            archive.name
        );
    }
    Ok(true)
}

enum DaemonTask {
    Backup(BackupService),
    SyncOnly(SyncEngine),
}

async fn daemon(config: &Config, interval: Duration, shutdown: &CancelSignal) -> Result<()> {
    let task = if config.archive.store.is_some() {
        DaemonTask::Backup(build_backup(config)?)
    } else {
        warn!("No [archive] store configured, the daemon only synchronizes");
        DaemonTask::SyncOnly(build_engine(config)?)
    };

    info!("Daemon started, running every {:?}", interval);
    loop {
        let ok = match &task {
            DaemonTask::Backup(service) => run_backup(config, service, shutdown).await,
            DaemonTask::SyncOnly(engine) => {
                let report: PassReport = run_pass(config, shutdown, |cancel| {
                    let engine = engine.clone();
                    async move { engine.run_pass(&cancel).await }
                })
                .await;
                report.is_success()
            }
        };
        if !ok {
            error!("Run finished with errors, retrying at the next interval");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => break,
        }
    }
    info!("Daemon stopped");
    Ok(())
}
