//! Sweep packages that never received catalog metadata.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use deals_core::is_enrichable_package_uid;
use deals_sources::MetadataEnricher;
use deals_storage::{DealStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::CatalogResolver;
use crate::ingest::{enrich_and_store, EnrichOutcome};

#[derive(Debug, Clone, Copy)]
pub struct BackfillOptions {
    pub batch_size: usize,
    pub pause: Duration,
    /// Packages confirmed missing more recently than this are not looked up again.
    pub recheck_absent_after: chrono::Duration,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            batch_size: 25,
            pause: Duration::from_millis(500),
            recheck_absent_after: chrono::Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub scanned: usize,
    pub updated: usize,
    pub not_found: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Page through packages without metadata by ascending id and enrich each one.
/// Failed lookups and per-package storage errors are counted and left for a later
/// sweep; only a failing page query ends the sweep early.
pub async fn backfill_packages(
    store: Arc<dyn DealStore>,
    enricher: Arc<dyn MetadataEnricher>,
    options: BackfillOptions,
) -> Result<BackfillReport, StoreError> {
    let run_id = Uuid::new_v4();
    let span = info_span!("backfill", %run_id, batch_size = options.batch_size);
    sweep(store, enricher, options, run_id).instrument(span).await
}

async fn sweep(
    store: Arc<dyn DealStore>,
    enricher: Arc<dyn MetadataEnricher>,
    options: BackfillOptions,
    run_id: Uuid,
) -> Result<BackfillReport, StoreError> {
    let resolver = CatalogResolver::new(store.clone());
    let batch_size = options.batch_size.max(1);
    let mut report = BackfillReport::default();
    let mut after_id = 0;
    let absent_before = Utc::now() - options.recheck_absent_after;

    loop {
        let batch = store
            .packages_missing_metadata(after_id, batch_size, absent_before)
            .await?;
        let Some(last) = batch.last() else {
            break;
        };
        after_id = last.id;
        debug!(size = batch.len(), after_id, "processing backfill page");

        for package in &batch {
            report.scanned += 1;
            if !is_enrichable_package_uid(&package.package_uid) {
                report.skipped += 1;
                continue;
            }
            let outcome = enrich_and_store(
                store.as_ref(),
                &resolver,
                enricher.as_ref(),
                run_id,
                package.id,
                &package.package_uid,
            )
            .await;
            match outcome {
                Ok(EnrichOutcome::Enriched) => {
                    report.updated += 1;
                    debug!(package_id = package.id, package_uid = %package.package_uid, "package updated");
                }
                Ok(EnrichOutcome::NotFound) => report.not_found += 1,
                Ok(EnrichOutcome::Failed) => report.failed += 1,
                Ok(EnrichOutcome::NotAttempted) => report.skipped += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        package_id = package.id,
                        package_uid = %package.package_uid,
                        error = %err,
                        "storing package metadata failed"
                    );
                }
            }
        }

        if batch.len() < batch_size {
            break;
        }
        tokio::time::sleep(options.pause).await;
    }

    info!(
        scanned = report.scanned,
        updated = report.updated,
        not_found = report.not_found,
        failed = report.failed,
        "backfill complete"
    );
    Ok(report)
}
