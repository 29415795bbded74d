use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

use rollwheel::config::{Config, StoreBackend};
use rollwheel::export::ClickHouseConnection;
use rollwheel::migrate::{ClickHouseMigrator, Migrator};
use rollwheel::service::Service;

/// Multi-resolution rollup scheduler for sharded time-series storage.
#[derive(Parser)]
#[command(name = "rollwheel", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Manage the ClickHouse slot state schema and exit.
    Migrate {
        #[arg(value_enum, default_value = "up")]
        action: MigrateAction,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MigrateAction {
    Up,
    Down,
    Status,
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("rollwheel {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    // Initialize tracing. The flag wins over the config file.
    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    if cli.config.is_none() {
        tracing::warn!("no --config given, running with defaults and an in-memory store");
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting rollwheel",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Migrate { action }) => rt.block_on(migrate(cfg, action)),
        _ => rt.block_on(run(cfg)),
    }
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the service.
    let mut service = Service::new(cfg)?;
    service.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    service.stop().await?;

    tracing::info!("rollwheel stopped");

    Ok(())
}

async fn migrate(cfg: Config, action: MigrateAction) -> Result<()> {
    if cfg.store.backend != StoreBackend::ClickHouse {
        anyhow::bail!("migrate requires store.backend: clickhouse");
    }

    let ch_cfg = cfg.store.clickhouse;
    let mut connection = ClickHouseConnection::new(ch_cfg.clone());
    connection
        .start()
        .await
        .context("starting ClickHouse connection")?;

    let pool = connection
        .pool()
        .context("ClickHouse pool missing after start")?
        .clone();
    let migrator = ClickHouseMigrator::new(pool, ch_cfg.database, ch_cfg.table);

    let result = match action {
        MigrateAction::Up => migrator.up().await,
        MigrateAction::Down => migrator.down().await,
        MigrateAction::Status => migrator.status().await.map(|(version, dirty)| {
            println!("version: {version} dirty: {dirty}");
        }),
    };

    connection.stop().await?;
    result
}
