use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use grip_core::CancelFlag;
use grip_ingest::{DistrictRegistry, IngestionConfig, Orchestrator, RunScope};
use grip_storage::{MemoryRepository, PgRepository, ProjectRepository};
use grip_synth::generate_fallback;
use grip_web::AppState;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "grip")]
#[command(about = "Gujarat RERA ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass and exit.
    Ingest {
        /// Restrict the run to one city.
        #[arg(long)]
        city: Option<String>,
    },
    /// Serve the JSON API, optionally with scheduled ingestion runs.
    Serve {
        #[arg(long, env = "GRIP_WEB_PORT", default_value_t = 8000)]
        port: u16,
        #[arg(long)]
        with_scheduler: bool,
    },
    /// Generate and persist a synthetic dataset (for demos and local work).
    Generate {
        #[arg(long, env = "GRIP_SEED", default_value_t = 17)]
        seed: u64,
    },
    /// Create the Postgres schema.
    Migrate,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn ingestion_config_from_env() -> Result<IngestionConfig> {
    let mut config = IngestionConfig::default();
    if let Some(base_url) = env_var("GRIP_BASE_URL") {
        config.base_url = base_url;
    }
    if let Some(max_pages) = env_var("GRIP_MAX_PAGES") {
        config.max_pages = max_pages.parse().context("parsing GRIP_MAX_PAGES")?;
    }
    if let Some(min_viable) = env_var("GRIP_MIN_VIABLE_RECORDS") {
        config.min_viable_records = min_viable
            .parse()
            .context("parsing GRIP_MIN_VIABLE_RECORDS")?;
    }
    if let Some(seed) = env_var("GRIP_SEED") {
        config.seed = seed.parse().context("parsing GRIP_SEED")?;
    }
    if let Some(cooldown) = env_var("GRIP_RETRY_COOLDOWN_SECS") {
        config.retry_cooldown = Duration::from_secs(
            cooldown.parse().context("parsing GRIP_RETRY_COOLDOWN_SECS")?,
        );
    }
    config.archive_dir = env_var("GRIP_ARCHIVE_DIR").map(PathBuf::from);
    config.reports_dir = Some(
        env_var("GRIP_REPORTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./reports")),
    );
    if let Some(path) = env_var("GRIP_DISTRICTS_FILE") {
        config.registry = DistrictRegistry::load(&path)?;
    }
    Ok(config)
}

async fn repository_from_env() -> Result<Arc<dyn ProjectRepository>> {
    let database_url = env_var("GRIP_DATABASE_URL").or_else(|| env_var("DATABASE_URL"));
    match database_url {
        Some(url) => {
            let repository = PgRepository::connect(&url)
                .await
                .context("connecting to Postgres")?;
            repository.ensure_schema().await.context("ensuring schema")?;
            Ok(Arc::new(repository))
        }
        None => {
            warn!("no DATABASE_URL configured, using the in-memory repository");
            Ok(Arc::new(MemoryRepository::new()))
        }
    }
}

async fn build_scheduler(orchestrator: Arc<Orchestrator>) -> Result<JobScheduler> {
    let crons = [
        env_var("GRIP_CRON_1").unwrap_or_else(|| "0 0 6 * * *".to_string()),
        env_var("GRIP_CRON_2").unwrap_or_else(|| "0 0 18 * * *".to_string()),
    ];

    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    for cron in crons {
        let orchestrator = orchestrator.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                let run_id = orchestrator
                    .start_detached(RunScope::all(), CancelFlag::new())
                    .await;
                info!(%run_id, "scheduled ingestion run started");
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        scheduler.add(job).await.context("adding scheduler job")?;
    }
    Ok(scheduler)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest { city: None }) {
        Commands::Ingest { city } => {
            let config = ingestion_config_from_env()?;
            let repository = repository_from_env().await?;
            let orchestrator = Orchestrator::new(config, repository)?;
            let scope = match city {
                Some(city) => RunScope::city(city),
                None => RunScope::all(),
            };

            let cancel = CancelFlag::new();
            let watcher = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling run after the current page");
                    watcher.cancel();
                }
            });

            let summary = orchestrator.run(scope, cancel).await;
            println!(
                "ingestion {:?}: run_id={} strategy={} records={} inserted={} updated={} dropped={}",
                summary.state,
                summary.run_id,
                summary
                    .strategy_used
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                summary.record_count,
                summary.inserted,
                summary.updated,
                summary.dropped_records,
            );
        }
        Commands::Serve {
            port,
            with_scheduler,
        } => {
            let config = ingestion_config_from_env()?;
            let repository = repository_from_env().await?;
            let orchestrator = Arc::new(Orchestrator::new(config, repository)?);

            if with_scheduler {
                let scheduler = build_scheduler(orchestrator.clone()).await?;
                scheduler.start().await.context("starting scheduler")?;
            }

            grip_web::serve(AppState::new(orchestrator), port).await?;
        }
        Commands::Generate { seed } => {
            let config = ingestion_config_from_env()?;
            let repository = repository_from_env().await?;
            let records = generate_fallback(
                seed,
                chrono::Utc::now().date_naive(),
                &config.registry.city_weights,
            );
            let outcome = repository.upsert_batch(&records).await?;
            println!(
                "generated {} synthetic projects: inserted={} updated={}",
                records.len(),
                outcome.inserted,
                outcome.updated
            );
        }
        Commands::Migrate => {
            let url = env_var("GRIP_DATABASE_URL")
                .or_else(|| env_var("DATABASE_URL"))
                .context("migrate requires GRIP_DATABASE_URL or DATABASE_URL")?;
            let repository = PgRepository::connect(&url).await?;
            repository.ensure_schema().await?;
            println!("schema ready");
        }
    }

    Ok(())
}
