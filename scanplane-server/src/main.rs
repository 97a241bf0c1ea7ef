//! # Scanplane Server
//!
//! Scanner process for the Scanplane control plane.
//!
//! Every replica runs the same loop: each tick makes one non-blocking attempt
//! at the scanning lock, and only the winner plans and submits checks for the
//! pipelines' resources. Losers wait for the next tick. Check creation is
//! deduplicated in Postgres, so overlapping replicas never produce duplicate
//! active checks.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use scanplane_core::{
    DefaultCheckFactory, MIGRATOR, PostgresCheckStore, PostgresLockBackend,
    ScannerConfig, ScannerConfigSource, Scanner,
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "scanplane-server")]
#[command(
    about = "Periodic resource scanner with cluster-wide scheduling locks"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct RunArgs {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Scanner config file (TOML or JSON). Overrides SCANPLANE_CONFIG_PATH.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single scanning cycle and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Apply migrations before scanning
    #[arg(long, env = "SCANPLANE_MIGRATE", default_value_t = false)]
    migrate: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    "info,scanplane_core=debug,scanplane_server=debug,sqlx=warn"
                        .into()
                }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.run)?;

    if let Some(Command::Db(DbCommand::Migrate)) = cli.command {
        let pool = connect(&cli.run.database_url, &config).await?;
        run_migrations(&pool).await?;
        return Ok(());
    }

    run_scanner(cli.run, config).await
}

fn load_config(args: &RunArgs) -> anyhow::Result<ScannerConfig> {
    let (config, source) = match &args.config {
        Some(path) => (
            ScannerConfig::load_from_file(path)?,
            ScannerConfigSource::File(path.clone()),
        ),
        None => ScannerConfig::load_from_env()?,
    };
    config.validate().context("invalid scanner configuration")?;

    match source {
        ScannerConfigSource::Default => {
            info!("using default scanner configuration")
        }
        other => info!(source = ?other, "loaded scanner configuration"),
    }
    Ok(config)
}

async fn connect(
    database_url: &str,
    config: &ScannerConfig,
) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(config.database.acquire_timeout())
        .connect(database_url)
        .await
        .context("failed to connect to PostgreSQL")
}

async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("failed to apply database migrations")?;
    info!("database migrations applied");
    Ok(())
}

async fn run_scanner(
    args: RunArgs,
    config: ScannerConfig,
) -> anyhow::Result<()> {
    let pool = connect(&args.database_url, &config).await?;
    if args.migrate {
        run_migrations(&pool).await?;
    }

    let store = PostgresCheckStore::new_with_retry_limit(
        pool.clone(),
        config.insert_retry_limit,
    )
    .await
    .context("check store is not usable")?;
    let locks = PostgresLockBackend::new(pool);
    let factory = DefaultCheckFactory::new(Arc::new(store), Arc::new(locks));
    let scanner = Scanner::new(Arc::new(factory), config);

    if args.once {
        let summary = scanner.tick().await.context("scanning cycle failed")?;
        if summary.lock_held_elsewhere {
            info!("another scanner holds the lock; nothing scheduled");
        }
        scanner.report_stuck_checks().await?;
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown requested"),
                Err(err) => {
                    warn!(error = %err, "failed to listen for shutdown signal")
                }

            }
            shutdown.cancel();
        }
    });

    scanner.run(shutdown).await;
    Ok(())
}
