use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use deals_storage::{DealStore, MemoryStore, PgStore};
use deals_sync::{
    backfill_packages, build_enricher, build_http, build_ingestor, run_scheduler,
    sync_interval_from_minutes, BackfillOptions, BatchReport, SourceRegistry, SyncConfig,
};
use dotenv::dotenv;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "deals-cli")]
#[command(about = "App deal aggregator: ingest, enrich and browse deals")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion batch over the configured sources.
    Sync {
        /// Only ingest sources with this handle.
        #[arg(long)]
        only: Option<String>,
        /// Write into an in-memory store instead of Postgres.
        #[arg(long)]
        memory: bool,
    },
    /// Run a batch now and then on every interval until Ctrl-C.
    Schedule {
        /// Override the interval in minutes.
        #[arg(long)]
        interval_minutes: Option<u64>,
    },
    /// Enrich packages that are still missing store metadata.
    Backfill {
        #[arg(long, default_value_t = 25)]
        batch_size: usize,
        #[arg(long, default_value_t = 500)]
        pause_ms: u64,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the deals listing.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();
}

async fn connect(config: &SyncConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

fn print_batch(report: &BatchReport) {
    for source in &report.sources {
        match (&source.report, &source.error) {
            (Some(r), _) => println!(
                "{} {}: fetched={} written={} refreshed={} skipped={} enriched={} not_found={} enrich_failed={}",
                source.kind,
                source.handle,
                r.fetched,
                r.written,
                r.refreshed,
                r.skipped,
                r.enriched,
                r.enrich_not_found,
                r.enrich_failed
            ),
            (None, Some(err)) => println!("{} {}: failed: {}", source.kind, source.handle, err),
            (None, None) => println!("{} {}: no report", source.kind, source.handle),
        }
    }
    println!(
        "sync complete: run_id={} sources={} written={} failed={}",
        report.run_id,
        report.sources.len(),
        report.written(),
        report.failed_sources()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        only: None,
        memory: false,
    }) {
        Commands::Sync { only, memory } => {
            let registry = SourceRegistry::load_or_default(&config.sources_file).await?;
            let mut sources = registry.scheduled();
            if let Some(handle) = only.as_deref() {
                sources.retain(|s| s.handle.eq_ignore_ascii_case(handle));
                if sources.is_empty() {
                    bail!("no enabled source with handle {handle}");
                }
            }
            let store: Arc<dyn DealStore> = if memory {
                Arc::new(MemoryStore::new())
            } else {
                connect(&config).await?
            };
            let ingestor = build_ingestor(&config, store)?;
            let report = ingestor.run_batch(&sources).await;
            print_batch(&report);
        }
        Commands::Schedule { interval_minutes } => {
            info!(sources_file = %config.sources_file.display(), "starting scheduler");
            let registry = SourceRegistry::load_or_default(&config.sources_file).await?;
            let interval = interval_minutes
                .map(sync_interval_from_minutes)
                .unwrap_or(config.sync_interval);
            let store = connect(&config).await?;
            let ingestor = Arc::new(build_ingestor(&config, store)?);
            run_scheduler(ingestor, registry.scheduled(), interval).await?;
        }
        Commands::Backfill {
            batch_size,
            pause_ms,
        } => {
            let store = connect(&config).await?;
            let enricher = build_enricher(&config, build_http(&config)?);
            let report = backfill_packages(
                store,
                enricher,
                BackfillOptions {
                    batch_size,
                    pause: Duration::from_millis(pause_ms),
                    recheck_absent_after: config.enrich_ttl(),
                },
            )
            .await?;
            println!(
                "backfill complete: scanned={} updated={} not_found={} failed={} skipped={}",
                report.scanned, report.updated, report.not_found, report.failed, report.skipped
            );
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve { port } => {
            let store = connect(&config).await?;
            deals_web::serve(
                deals_web::AppState::new(store),
                port.unwrap_or(config.web_port),
            )
            .await?;
        }
    }

    Ok(())
}
