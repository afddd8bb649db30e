use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobboard_adapters::JobSource;
use jobboard_storage::{InMemoryJobStore, JobStore, PgJobStore};
use jobboard_sync::{maybe_build_scheduler, sync_registry, SyncConfig, SyncPipeline};
use jobboard_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobboard")]
#[command(about = "Greenhouse job sync and job board API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one Greenhouse board, or every enabled board in the registry.
    Sync {
        board: Option<String>,
        #[arg(long, conflicts_with = "board")]
        all: bool,
    },
    /// Fetch and normalize a board without writing anything.
    Preview { board: String },
    /// Run the HTTP API, plus the cron scheduler when enabled.
    Serve,
    /// Apply SQL migrations to DATABASE_URL.
    Migrate,
}

/// Owns the store for the life of the process.
enum StoreHandle {
    Postgres(Arc<PgJobStore>),
    Memory(Arc<InMemoryJobStore>),
}

impl StoreHandle {
    async fn open(config: &SyncConfig) -> Result<Self> {
        match &config.database_url {
            Some(url) => {
                let store = PgJobStore::connect(url)
                    .await
                    .context("connecting to DATABASE_URL")?;
                store.migrate().await.context("applying migrations")?;
                Ok(Self::Postgres(Arc::new(store)))
            }
            None => {
                warn!("DATABASE_URL not set; jobs are kept in memory only");
                Ok(Self::Memory(Arc::new(InMemoryJobStore::new())))
            }
        }
    }

    fn job_store(&self) -> Arc<dyn JobStore> {
        match self {
            Self::Postgres(store) => store.clone() as Arc<dyn JobStore>,
            Self::Memory(store) => store.clone() as Arc<dyn JobStore>,
        }
    }

    async fn close(&self) {
        if let Self::Postgres(store) = self {
            store.close().await;
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_pipeline(config: &SyncConfig, store: Arc<dyn JobStore>) -> Result<SyncPipeline> {
    let source: Arc<dyn JobSource> = Arc::new(config.greenhouse_source()?);
    Ok(SyncPipeline::new(source, store).with_deactivate_missing(config.deactivate_missing))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let command = cli.command.unwrap_or(Commands::Serve);

    if matches!(command, Commands::Migrate) && config.database_url.is_none() {
        bail!("DATABASE_URL must be set to run migrations");
    }

    let handle = StoreHandle::open(&config).await?;
    let result = run(command, &config, handle.job_store()).await;
    handle.close().await;
    result
}

async fn run(command: Commands, config: &SyncConfig, store: Arc<dyn JobStore>) -> Result<()> {
    let pipeline = build_pipeline(config, store)?;

    match command {
        Commands::Sync { board: Some(board), .. } => {
            let summary = pipeline.sync_board(&board).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Sync { board: None, all } => {
            if !all {
                bail!("pass a board token or --all");
            }
            let runs = sync_registry(&pipeline, &config.sources_file).await?;
            let mut failed = 0usize;
            for run in &runs {
                match &run.result {
                    Ok(summary) => println!("{}", serde_json::to_string_pretty(summary)?),
                    Err(err) => {
                        failed += 1;
                        eprintln!("{}: {err}", run.board);
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} boards failed to sync", runs.len());
            }
        }
        Commands::Preview { board } => {
            let preview = pipeline.preview_board(&board).await?;
            println!("{}", serde_json::to_string_pretty(&preview)?);
        }
        Commands::Serve => {
            let pipeline = Arc::new(pipeline);
            let mut scheduler = maybe_build_scheduler(config, pipeline.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "sync scheduler started");
            }

            let served = jobboard_web::serve(AppState::new(pipeline), config.web_port).await;

            if let Some(sched) = scheduler.as_mut() {
                if let Err(err) = sched.shutdown().await {
                    warn!(error = %err, "scheduler did not shut down cleanly");
                }
            }
            served?;
        }
        // Opening a Postgres store has already applied pending migrations.
        Commands::Migrate => println!("migrations applied"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sync_accepts_a_board_or_all_but_not_both() {
        let cli = Cli::try_parse_from(["jobboard", "sync", "acme"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Sync { board: Some(ref b), all: false }) if b == "acme"
        ));

        let cli = Cli::try_parse_from(["jobboard", "sync", "--all"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Sync { board: None, all: true })
        ));

        assert!(Cli::try_parse_from(["jobboard", "sync", "acme", "--all"]).is_err());
    }
}
