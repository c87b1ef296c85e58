use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobsync_adapters::{load_payload, TransformDispatcher};
use jobsync_storage::{JobStore, MemoryJobStore, PgJobStore};
use jobsync_sync::{build_scheduler, SyncConfig, SyncOrchestrator};
use jobsync_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobsync-cli")]
#[command(about = "Job offer sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync of every enabled provider.
    Sync {
        /// Use an in-process store instead of Postgres.
        #[arg(long)]
        memory: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the read API, with optional startup sync and cron schedule.
    Serve {
        #[arg(long)]
        memory: bool,
    },
    /// Normalize a saved provider payload and print the unified jobs.
    Transform { provider: String, path: PathBuf },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobsync=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn open_store(config: &SyncConfig, memory: bool) -> Result<Arc<dyn JobStore>> {
    if memory {
        return Ok(Arc::new(MemoryJobStore::new()));
    }
    let store = PgJobStore::connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")?;
    store.migrate().await.context("running migrations")?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { memory: false }) {
        Commands::Sync { memory } => {
            let store = open_store(&config, memory).await?;
            let orchestrator = SyncOrchestrator::from_config(&config, store)?;
            let summary = orchestrator.sync_all_providers().await;
            for outcome in &summary.outcomes {
                println!(
                    "{}: normalized={} saved={} updated={} deactivated={} errors={}{}",
                    outcome.provider,
                    outcome.normalized,
                    outcome.saved,
                    outcome.updated,
                    outcome.deactivated,
                    outcome.errors,
                    outcome
                        .error
                        .as_deref()
                        .map(|e| format!(" ({e})"))
                        .unwrap_or_default()
                );
            }
            println!("sync complete: run_id={}", summary.run_id);
        }
        Commands::Migrate => {
            let store = PgJobStore::connect(&config.database_url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve { memory } => {
            let store = open_store(&config, memory).await?;
            let orchestrator = Arc::new(SyncOrchestrator::from_config(&config, store.clone())?);

            if config.sync_on_startup {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    let summary = orchestrator.sync_all_providers().await;
                    info!(run_id = %summary.run_id, "startup sync finished");
                });
            }

            let scheduler = build_scheduler(&config, orchestrator).await?;
            match &scheduler {
                Some(sched) => {
                    sched.start().await.context("starting scheduler")?;
                    info!(cron = %config.sync_cron, "sync scheduler started");
                }
                None => warn!("sync scheduler disabled"),
            }

            jobsync_web::serve(AppState::new(store), config.web_port).await?;
        }
        Commands::Transform { provider, path } => {
            let payload = load_payload(&path)?;
            let jobs = TransformDispatcher::new().transform(&provider, payload)?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
    }

    Ok(())
}
