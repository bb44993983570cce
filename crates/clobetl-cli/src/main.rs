use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clobetl_core::new_id;
use clobetl_storage::{PayloadLoader, PgStore};
use clobetl_sync::{Collaborators, SyncConfig};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "clobetl-cli")]
#[command(about = "Staged album ETL command-line interface")]
struct Cli {
    /// Overrides CLOBETL_CHUNK_SIZE.
    #[arg(long, global = true)]
    chunk_size: Option<usize>,
    /// Overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Store a payload file under a new batch id.
    LoadBatch {
        #[arg(long)]
        file: PathBuf,
    },
    /// Parse a stored batch into the staging tables.
    LoadStage {
        #[arg(long)]
        batch_id: Uuid,
    },
    /// Reconcile a staged batch into the core tables.
    LoadCore {
        #[arg(long)]
        batch_id: Uuid,
    },
    /// Load, stage and reconcile a payload file.
    Run {
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(chunk_size) = cli.chunk_size {
        config.chunk_size = chunk_size.max(1);
    }
    if let Some(database_url) = cli.database_url {
        config.database_url = database_url;
    }

    match cli.command {
        Commands::Migrate => {
            let store = pg_store(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::LoadBatch { file } => {
            let payload = clobetl_sync::read_payload_file(&file).await?;
            let store = pg_store(&config).await?;
            let batch_id = new_id();
            let stored = store.load_payload(batch_id, &payload).await?;
            println!(
                "batch loaded: batch_id={} bytes={} sha256={}",
                stored.batch_id, stored.byte_size, stored.content_hash
            );
        }
        Commands::LoadStage { batch_id } => {
            let stores = Collaborators::from_store(pg_store(&config).await?);
            let summary = clobetl_sync::load_stage_step(&stores, batch_id, &config).await?;
            println!(
                "stage complete: batch_id={} rows={} albums={} songs={}",
                summary.batch_id, summary.rows_fetched, summary.albums_saved, summary.songs_saved
            );
        }
        Commands::LoadCore { batch_id } => {
            let stores = Collaborators::from_store(pg_store(&config).await?);
            let summary = clobetl_sync::load_core_step(&stores, batch_id, &config).await?;
            println!(
                "core complete: batch_id={} processed={} inserted={} updated={} errors={}",
                summary.batch_id,
                summary.processed,
                summary.totals.inserted,
                summary.totals.updated,
                summary.totals.errors
            );
        }
        Commands::Run { file } => {
            let summary = clobetl_sync::run_job_from_file(&file, &config).await?;
            println!(
                "job complete: batch_id={} albums={} inserted={} updated={} errors={}",
                summary.batch_id,
                summary.stage.albums_saved,
                summary.core.totals.inserted,
                summary.core.totals.updated,
                summary.core.totals.errors
            );
        }
    }

    Ok(())
}

async fn pg_store(config: &SyncConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to the ETL database")?;
    Ok(Arc::new(store))
}
