//! Per-source ingestion: fetch, map, resolve catalog ids, enrich, upsert.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use deals_core::{
    is_enrichable_package_uid, platform_for_package_uid, DealRefs, NewPackage, RawRecord,
    SourceKind, FALLBACK_CATEGORY,
};
use deals_sources::enrich::PLAY_STORE_DETAILS_URL;
use deals_sources::{map_to_deal, Lookup, MapError, MetadataEnricher, SourceClient, SourceError};
use deals_storage::{DealStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::CatalogResolver;
use crate::SourceConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub fetched: usize,
    /// Newly inserted deal rows.
    pub written: usize,
    /// Existing rows whose heat/metadata were refreshed on a key match.
    pub refreshed: usize,
    pub skipped: usize,
    pub enriched: usize,
    pub enrich_not_found: usize,
    pub enrich_failed: usize,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no client registered for {0} sources")]
    NoClient(SourceKind),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
enum RecordError {
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnrichOutcome {
    NotAttempted,
    Enriched,
    NotFound,
    Failed,
}

struct RecordOutcome {
    inserted: bool,
    enrichment: EnrichOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub kind: SourceKind,
    pub handle: String,
    pub report: Option<IngestReport>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub sources: Vec<SourceOutcome>,
}

impl BatchReport {
    pub fn written(&self) -> usize {
        self.sources
            .iter()
            .filter_map(|s| s.report.as_ref())
            .map(|r| r.written)
            .sum()
    }

    pub fn failed_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.error.is_some()).count()
    }
}

/// Canonical store link for a package, falling back to the deal link.
fn store_url_for(package_uid: &str, deal_url: Option<&str>) -> Option<String> {
    if is_enrichable_package_uid(package_uid) {
        Some(format!("{PLAY_STORE_DETAILS_URL}?id={package_uid}"))
    } else {
        deal_url.map(ToString::to_string)
    }
}

/// Fetch metadata for one package and store it. A confirmed-absent package is
/// stamped so it is not looked up again until the TTL passes; failed lookups leave
/// no trace and are retried on the next sighting. Only storage failures are errors.
pub(crate) async fn enrich_and_store(
    store: &dyn DealStore,
    resolver: &CatalogResolver,
    enricher: &dyn MetadataEnricher,
    run_id: Uuid,
    package_id: i64,
    package_uid: &str,
) -> Result<EnrichOutcome, StoreError> {
    match enricher.fetch_metadata(run_id, package_uid).await {
        Ok(Lookup::Found(metadata)) => {
            store
                .update_package_metadata(package_id, &metadata, Utc::now())
                .await?;
            if let Some(category) = metadata.category() {
                let category_id = resolver.category(category).await?;
                store.set_package_category(package_id, category_id).await?;
            }
            Ok(EnrichOutcome::Enriched)
        }
        Ok(Lookup::NotFound) => {
            store.mark_package_not_found(package_id, Utc::now()).await?;
            Ok(EnrichOutcome::NotFound)
        }
        Err(err) => {
            warn!(package_uid, error = %err, "metadata lookup failed");
            Ok(EnrichOutcome::Failed)
        }
    }
}

pub struct Ingestor {
    store: Arc<dyn DealStore>,
    resolver: CatalogResolver,
    clients: BTreeMap<SourceKind, Arc<dyn SourceClient>>,
    enricher: Arc<dyn MetadataEnricher>,
    enrich_ttl: chrono::Duration,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn DealStore>,
        enricher: Arc<dyn MetadataEnricher>,
        enrich_ttl: chrono::Duration,
    ) -> Self {
        Self {
            resolver: CatalogResolver::new(store.clone()),
            store,
            clients: BTreeMap::new(),
            enricher,
            enrich_ttl,
        }
    }

    pub fn with_client(mut self, client: Arc<dyn SourceClient>) -> Self {
        self.clients.insert(client.kind(), client);
        self
    }

    pub async fn run_ingestion(&self, source: &SourceConfig) -> Result<IngestReport, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "ingest",
            %run_id,
            source = source.kind.as_str(),
            handle = %source.handle
        );
        self.ingest_source(run_id, source).instrument(span).await
    }

    /// Run every source in order. A failing source is logged and the batch moves on.
    pub async fn run_batch(&self, sources: &[SourceConfig]) -> BatchReport {
        let run_id = Uuid::new_v4();
        info!(%run_id, sources = sources.len(), "batch started");
        let mut report = BatchReport {
            run_id,
            sources: Vec::with_capacity(sources.len()),
        };

        for source in sources {
            let outcome = match self.run_ingestion(source).await {
                Ok(r) => SourceOutcome {
                    kind: source.kind,
                    handle: source.handle.clone(),
                    report: Some(r),
                    error: None,
                },
                Err(err) => {
                    warn!(source = source.kind.as_str(), handle = %source.handle, error = %err, "source ingestion failed");
                    SourceOutcome {
                        kind: source.kind,
                        handle: source.handle.clone(),
                        report: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            report.sources.push(outcome);
        }

        info!(
            %run_id,
            written = report.written(),
            failed_sources = report.failed_sources(),
            "batch finished"
        );
        report
    }

    async fn ingest_source(
        &self,
        run_id: Uuid,
        source: &SourceConfig,
    ) -> Result<IngestReport, IngestError> {
        let client = self
            .clients
            .get(&source.kind)
            .ok_or(IngestError::NoClient(source.kind))?;
        let records = client
            .fetch_raw(run_id, &source.handle, source.effective_limit())
            .await?;

        let data_source_id = self.resolver.data_source(source.kind).await?;
        let channel_id = self
            .resolver
            .channel(data_source_id, source.kind, &source.handle)
            .await?;

        let mut report = IngestReport {
            fetched: records.len(),
            ..Default::default()
        };
        for raw in &records {
            match self
                .ingest_record(run_id, data_source_id, channel_id, raw)
                .await
            {
                Ok(outcome) => {
                    if outcome.inserted {
                        report.written += 1;
                    } else {
                        report.refreshed += 1;
                    }
                    match outcome.enrichment {
                        EnrichOutcome::Enriched => report.enriched += 1,
                        EnrichOutcome::NotFound => report.enrich_not_found += 1,
                        EnrichOutcome::Failed => report.enrich_failed += 1,
                        EnrichOutcome::NotAttempted => {}
                    }
                }
                Err(err) => {
                    report.skipped += 1;
                    warn!(record = %raw.fallback_package_uid(), error = %err, "record skipped");
                }
            }
        }

        info!(
            fetched = report.fetched,
            written = report.written,
            refreshed = report.refreshed,
            skipped = report.skipped,
            enriched = report.enriched,
            enrich_not_found = report.enrich_not_found,
            enrich_failed = report.enrich_failed,
            "ingestion finished"
        );
        Ok(report)
    }

    async fn ingest_record(
        &self,
        run_id: Uuid,
        data_source_id: i64,
        channel_id: i64,
        raw: &RawRecord,
    ) -> Result<RecordOutcome, RecordError> {
        let draft = map_to_deal(raw)?;
        let package_uid = draft
            .package_uid
            .clone()
            .unwrap_or_else(|| raw.fallback_package_uid());

        let platform_id = self
            .resolver
            .platform(platform_for_package_uid(&package_uid))
            .await?;
        let category_id = self.resolver.category(FALLBACK_CATEGORY).await?;
        let name = if draft.title.trim().is_empty() {
            package_uid.clone()
        } else {
            draft.title.clone()
        };
        let package_id = self
            .resolver
            .package(NewPackage {
                package_uid: package_uid.clone(),
                name,
                category_id,
                platform_id,
                store_url: store_url_for(&package_uid, draft.url.as_deref()),
            })
            .await?;

        let enrichment = self.maybe_enrich(run_id, package_id, &package_uid).await?;

        let deal = draft.into_new_deal(DealRefs {
            channel_id,
            data_source_id,
            package_id: Some(package_id),
        });
        let upserted = self.store.upsert_deal(&deal).await?;
        Ok(RecordOutcome {
            inserted: upserted.inserted,
            enrichment,
        })
    }

    async fn maybe_enrich(
        &self,
        run_id: Uuid,
        package_id: i64,
        package_uid: &str,
    ) -> Result<EnrichOutcome, StoreError> {
        if !is_enrichable_package_uid(package_uid) {
            return Ok(EnrichOutcome::NotAttempted);
        }
        let Some(package) = self.store.package(package_id).await? else {
            return Ok(EnrichOutcome::NotAttempted);
        };
        if !package.needs_enrichment(Utc::now(), self.enrich_ttl) {
            return Ok(EnrichOutcome::NotAttempted);
        }
        enrich_and_store(
            self.store.as_ref(),
            &self.resolver,
            self.enricher.as_ref(),
            run_id,
            package_id,
            package_uid,
        )
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use deals_core::{AppMetadata, CatalogKind, ChannelMessage, RedditPost};
    use deals_sources::EnrichError;
    use deals_storage::MemoryStore;

    pub struct FakeClient {
        pub kind: SourceKind,
        pub records: HashMap<String, Vec<RawRecord>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeClient {
        pub fn new(kind: SourceKind) -> Self {
            Self {
                kind,
                records: HashMap::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn with_feed(mut self, handle: &str, records: Vec<RawRecord>) -> Self {
            self.records.insert(handle.to_string(), records);
            self
        }
    }

    #[async_trait]
    impl SourceClient for FakeClient {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        async fn fetch_raw(
            &self,
            _run_id: Uuid,
            handle: &str,
            limit: usize,
        ) -> Result<Vec<RawRecord>, SourceError> {
            self.calls.lock().unwrap().push(handle.to_string());
            match self.records.get(handle) {
                Some(records) => Ok(records.iter().take(limit).cloned().collect()),
                None => Err(SourceError::InvalidHandle(handle.to_string())),
            }
        }
    }

    pub enum FakeLookup {
        Found(&'static str),
        NotFound,
        Fail,
    }

    #[derive(Default)]
    pub struct FakeEnricher {
        pub responses: HashMap<String, FakeLookup>,
        pub calls: AtomicUsize,
    }

    impl FakeEnricher {
        pub fn with(mut self, package_uid: &str, lookup: FakeLookup) -> Self {
            self.responses.insert(package_uid.to_string(), lookup);
            self
        }
    }

    #[async_trait]
    impl MetadataEnricher for FakeEnricher {
        async fn fetch_metadata(&self, _run_id: Uuid, package_uid: &str) -> Result<Lookup, EnrichError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.responses.get(package_uid) {
                Some(FakeLookup::Found(genre)) => Ok(Lookup::Found(AppMetadata {
                    title: Some(format!("App {package_uid}")),
                    description: Some("desc".into()),
                    rating: Some(4.2),
                    installs: Some("1M+".into()),
                    icon_url: None,
                    genre: Some(genre.to_string()),
                    store_url: None,
                    raw: serde_json::json!({ "appId": package_uid }),
                })),
                Some(FakeLookup::NotFound) | None => Ok(Lookup::NotFound),
                Some(FakeLookup::Fail) => Err(EnrichError::Parse {
                    package_uid: package_uid.to_string(),
                    reason: "upstream returned garbage".into(),
                }),
            }
        }
    }

    pub fn reddit_post(id: &str, package: Option<&str>, created_utc: f64, ups: i64) -> RawRecord {
        RawRecord::Reddit(RedditPost {
            id: id.into(),
            title: format!("Deal {id}"),
            author: "tester".into(),
            permalink: format!("https://www.reddit.com/r/googleplaydeals/comments/{id}/"),
            url: package
                .map(|p| format!("https://play.google.com/store/apps/details?id={p}"))
                .or_else(|| Some(format!("https://www.reddit.com/comments/{id}"))),
            created_utc,
            ups,
            num_comments: 0,
            selftext: None,
        })
    }

    pub fn message(id: i64, date: i64, text: &str) -> RawRecord {
        RawRecord::Message(ChannelMessage {
            id,
            channel: "@PLAYSTOREDEAL".into(),
            date,
            text: text.into(),
            views: Some(1),
            forwards: None,
            button_url: None,
        })
    }

    fn ingestor(
        store: Arc<MemoryStore>,
        enricher: Arc<FakeEnricher>,
        clients: Vec<Arc<FakeClient>>,
    ) -> Ingestor {
        clients.into_iter().fold(
            Ingestor::new(store, enricher, chrono::Duration::hours(24)),
            |ing, client| ing.with_client(client),
        )
    }

    const T0: f64 = 1_772_366_400.0;

    #[tokio::test]
    async fn reingesting_unchanged_feed_adds_no_rows() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(FakeClient::new(SourceKind::Reddit).with_feed(
            "googleplaydeals",
            vec![
                reddit_post("a", Some("com.example.one"), T0, 10),
                reddit_post("b", None, T0 + 60.0, 3),
            ],
        ));
        let enricher = Arc::new(FakeEnricher::default());
        let ingestor = ingestor(store.clone(), enricher, vec![client]);
        let source = SourceConfig::new(SourceKind::Reddit, "googleplaydeals");

        let first = ingestor.run_ingestion(&source).await.unwrap();
        assert_eq!(first.written, 2);
        assert_eq!(store.count_deals().await.unwrap(), 2);

        let second = ingestor.run_ingestion(&source).await.unwrap();
        assert_eq!(second.written, 0);
        assert_eq!(second.refreshed, 2);
        assert_eq!(store.count_deals().await.unwrap(), 2);
        assert_eq!(store.catalog_count(CatalogKind::Package).await, 2);
        assert_eq!(store.catalog_count(CatalogKind::Channel).await, 1);
    }

    #[tokio::test]
    async fn one_malformed_record_does_not_sink_the_batch() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(FakeClient::new(SourceKind::Telegram).with_feed(
            "@PLAYSTOREDEAL",
            vec![
                message(1, 1_772_366_400, "first"),
                message(2, i64::MAX, "broken timestamp"),
                message(3, 1_772_366_460, ""),
            ],
        ));
        let ingestor = ingestor(store.clone(), Arc::new(FakeEnricher::default()), vec![client]);

        let report = ingestor
            .run_ingestion(&SourceConfig::new(SourceKind::Telegram, "@PLAYSTOREDEAL"))
            .await
            .unwrap();
        assert_eq!(report.fetched, 3);
        assert_eq!(report.written, 2);
        assert_eq!(report.skipped, 1);

        let deals = store.deals().await;
        assert!(deals.iter().all(|d| d.price_after.is_none() && d.price_before.is_none()));
        assert!(deals.iter().any(|d| d.title.is_empty()));
    }

    #[tokio::test]
    async fn messages_without_links_get_synthetic_web_packages() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(
            FakeClient::new(SourceKind::Telegram)
                .with_feed("@PLAYSTOREDEAL", vec![message(8999, 1_772_366_400, "")]),
        );
        let enricher = Arc::new(FakeEnricher::default());
        let ingestor = ingestor(store.clone(), enricher.clone(), vec![client]);

        ingestor
            .run_ingestion(&SourceConfig::new(SourceKind::Telegram, "@PLAYSTOREDEAL"))
            .await
            .unwrap();

        let package_id = store
            .find_catalog_id(CatalogKind::Package, "telegram:playstoredeal:8999")
            .await
            .unwrap()
            .unwrap();
        let package = store.package(package_id).await.unwrap().unwrap();
        assert_eq!(package.name, "telegram:playstoredeal:8999");
        let web = store
            .find_catalog_id(CatalogKind::Platform, "web")
            .await
            .unwrap();
        assert_eq!(package.platform_id, web);
        assert_eq!(enricher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn enrichment_outcomes_are_counted_and_deals_still_land() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(FakeClient::new(SourceKind::Reddit).with_feed(
            "androidapps",
            vec![
                reddit_post("found", Some("com.example.found"), T0, 1),
                reddit_post("gone", Some("com.example.gone"), T0 + 1.0, 1),
                reddit_post("flaky", Some("com.example.flaky"), T0 + 2.0, 1),
            ],
        ));
        let enricher = Arc::new(
            FakeEnricher::default()
                .with("com.example.found", FakeLookup::Found("Puzzle"))
                .with("com.example.gone", FakeLookup::NotFound)
                .with("com.example.flaky", FakeLookup::Fail),
        );
        let ingestor = ingestor(store.clone(), enricher, vec![client]);

        let report = ingestor
            .run_ingestion(&SourceConfig::new(SourceKind::Reddit, "androidapps"))
            .await
            .unwrap();
        assert_eq!(report.written, 3);
        assert_eq!(report.enriched, 1);
        assert_eq!(report.enrich_not_found, 1);
        assert_eq!(report.enrich_failed, 1);

        let gone_id = store
            .find_catalog_id(CatalogKind::Package, "com.example.gone")
            .await
            .unwrap()
            .unwrap();
        assert!(!store.package(gone_id).await.unwrap().unwrap().has_metadata());
    }

    #[tokio::test]
    async fn confirmed_absent_package_is_not_looked_up_again_within_ttl() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(FakeClient::new(SourceKind::Reddit).with_feed(
            "androidapps",
            vec![
                reddit_post("gone", Some("com.example.gone"), T0, 1),
                reddit_post("flaky", Some("com.example.flaky"), T0 + 1.0, 1),
            ],
        ));
        let enricher = Arc::new(
            FakeEnricher::default()
                .with("com.example.gone", FakeLookup::NotFound)
                .with("com.example.flaky", FakeLookup::Fail),
        );
        let ingestor = ingestor(store.clone(), enricher.clone(), vec![client]);
        let source = SourceConfig::new(SourceKind::Reddit, "androidapps");

        let mut not_found = 0;
        let mut failed = 0;
        for _ in 0..3 {
            let report = ingestor.run_ingestion(&source).await.unwrap();
            not_found += report.enrich_not_found;
            failed += report.enrich_failed;
        }

        // One lookup for the absent package, one per run for the flaky one.
        assert_eq!(not_found, 1);
        assert_eq!(failed, 3);
        assert_eq!(enricher.calls.load(Ordering::SeqCst), 4);

        let gone_id = store
            .find_catalog_id(CatalogKind::Package, "com.example.gone")
            .await
            .unwrap()
            .unwrap();
        let gone = store.package(gone_id).await.unwrap().unwrap();
        assert!(gone.not_found_at.is_some());
        assert!(!gone.has_metadata());
    }

    #[tokio::test]
    async fn enriched_genre_becomes_package_category() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(FakeClient::new(SourceKind::Reddit).with_feed(
            "googleplaydeals",
            vec![reddit_post("a", Some("com.example.puzzle"), T0, 1)],
        ));
        let enricher =
            Arc::new(FakeEnricher::default().with("com.example.puzzle", FakeLookup::Found("Puzzle")));
        let ingestor = ingestor(store.clone(), enricher.clone(), vec![client]);
        let source = SourceConfig::new(SourceKind::Reddit, "googleplaydeals");

        ingestor.run_ingestion(&source).await.unwrap();

        let package_id = store
            .find_catalog_id(CatalogKind::Package, "com.example.puzzle")
            .await
            .unwrap()
            .unwrap();
        let package = store.package(package_id).await.unwrap().unwrap();
        let puzzle = store.find_catalog_id(CatalogKind::Category, "Puzzle").await.unwrap();
        assert_eq!(package.category_id, puzzle);
        assert_eq!(package.name, "App com.example.puzzle");
        assert_eq!(package.installs.as_deref(), Some("1M+"));

        // Fresh metadata is not fetched again within the TTL.
        ingestor.run_ingestion(&source).await.unwrap();
        assert_eq!(enricher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_source_does_not_stop_the_batch() {
        let store = Arc::new(MemoryStore::new());
        let reddit = Arc::new(FakeClient::new(SourceKind::Reddit).with_feed(
            "googleplaydeals",
            vec![reddit_post("a", None, T0, 1)],
        ));
        let telegram = Arc::new(
            FakeClient::new(SourceKind::Telegram)
                .with_feed("@iosappdeals", vec![message(5, 1_772_366_400, "hello")]),
        );
        let ingestor = ingestor(
            store.clone(),
            Arc::new(FakeEnricher::default()),
            vec![reddit.clone(), telegram.clone()],
        );

        let sources = vec![
            SourceConfig::new(SourceKind::Reddit, "missing"),
            SourceConfig::new(SourceKind::Reddit, "googleplaydeals"),
            SourceConfig::new(SourceKind::Telegram, "@iosappdeals"),
        ];
        let report = ingestor.run_batch(&sources).await;

        assert_eq!(report.failed_sources(), 1);
        assert_eq!(report.written(), 2);
        assert!(report.sources[0].error.is_some());
        assert_eq!(store.count_deals().await.unwrap(), 2);
        assert_eq!(
            *reddit.calls.lock().unwrap(),
            vec!["missing".to_string(), "googleplaydeals".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_client_is_a_source_error() {
        let store = Arc::new(MemoryStore::new());
        let ingestor = ingestor(store, Arc::new(FakeEnricher::default()), vec![]);
        let err = ingestor
            .run_ingestion(&SourceConfig::new(SourceKind::Telegram, "@x"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::NoClient(SourceKind::Telegram)));
    }

    #[test]
    fn android_packages_link_to_the_store_page() {
        assert_eq!(
            store_url_for("com.example.app", Some("https://reddit.com/x")).as_deref(),
            Some("https://play.google.com/store/apps/details?id=com.example.app")
        );
        assert_eq!(
            store_url_for("ios-1", Some("https://apps.apple.com/app/id1")).as_deref(),
            Some("https://apps.apple.com/app/id1")
        );
        assert_eq!(store_url_for("reddit:a", None), None);
    }
}
