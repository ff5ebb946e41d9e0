use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobsync_store::{MemoryJobStore, PgJobStore};
use jobsync_sync::{SyncConfig, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobsync-cli")]
#[command(about = "Sync open job orders from the recruiting ERP into the local listing store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass.
    Sync {
        /// Write into a throwaway in-memory store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the operator HTTP endpoints.
    Serve,
    /// Run sync passes on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobsync=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("loading sync configuration")?;

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => run_once(&config, dry_run).await?,
        Commands::Migrate => {
            let store = PgJobStore::connect(&config.database_url, 1).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let pipeline = Arc::new(SyncPipeline::connect(&config).await?);
            jobsync_web::serve(&config, pipeline).await?;
        }
        Commands::Schedule => schedule(&config).await?,
    }

    Ok(())
}

async fn run_once(config: &SyncConfig, dry_run: bool) -> Result<()> {
    let pipeline = if dry_run {
        info!("dry run: writing to an in-memory store");
        SyncPipeline::with_store(config, Arc::new(MemoryJobStore::new()))?
    } else {
        SyncPipeline::connect(config).await?
    };

    let token = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current record");
            token.cancel();
        }
    });

    let report = pipeline.run_sync().await?;
    println!("sync finished: {}", report.summary_line());
    for failure in &report.failures {
        eprintln!("  {} {}", failure.external_id, failure.reason);
    }
    if !report.is_clean() {
        bail!(
            "sync run {} did not complete cleanly ({} failed)",
            report.run_id,
            report.counts.failed
        );
    }
    Ok(())
}

async fn schedule(config: &SyncConfig) -> Result<()> {
    let pipeline = Arc::new(SyncPipeline::connect(config).await?);
    let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
        bail!("scheduler is disabled; set JOBSYNC_SCHEDULER_ENABLED=true");
    };

    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler started");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    pipeline.cancellation_token().cancel();
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
