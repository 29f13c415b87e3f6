use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::ingest::Ingestor;
use crate::SourceConfig;

/// Repeating batch job. Ticks fire on schedule whether or not the previous batch
/// has finished; overlapping batches rely on idempotent upserts.
pub async fn build_scheduler(
    ingestor: Arc<Ingestor>,
    sources: Arc<Vec<SourceConfig>>,
    interval: Duration,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(interval, move |_uuid, _l| {
        let ingestor = ingestor.clone();
        let sources = sources.clone();
        Box::pin(async move {
            info!("scheduler tick");
            ingestor.run_batch(&sources).await;
        })
    })
    .with_context(|| format!("creating repeated sync job every {interval:?}"))?;
    sched.add(job).await.context("adding sync job")?;
    Ok(sched)
}

/// Run one batch right away, then every `interval` until Ctrl-C.
pub async fn run_scheduler(
    ingestor: Arc<Ingestor>,
    sources: Vec<SourceConfig>,
    interval: Duration,
) -> Result<()> {
    let sources = Arc::new(sources);
    info!(sources = sources.len(), ?interval, "scheduler starting");

    let startup = {
        let ingestor = ingestor.clone();
        let sources = sources.clone();
        tokio::spawn(async move {
            ingestor.run_batch(&sources).await;
        })
    };

    let mut sched = build_scheduler(ingestor, sources, interval).await?;
    sched.start().await.context("starting scheduler")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");
    startup.abort();
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
