//! In-process [`DealStore`] used for dry runs and tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deals_core::{
    AppMetadata, CatalogEntry, CatalogKind, DealKey, DealListing, NewDeal, Package,
};
use tokio::sync::Mutex;

use crate::store::{DealStore, StoreError, UpsertedDeal};

#[derive(Debug, Default)]
struct MemoryState {
    next_id: HashMap<CatalogKind, i64>,
    next_deal_id: i64,
    catalog: HashMap<(CatalogKind, String), i64>,
    data_source_names: HashMap<i64, String>,
    channel_names: HashMap<i64, String>,
    packages: BTreeMap<i64, Package>,
    deals: BTreeMap<i64, NewDeal>,
    deal_index: HashMap<DealKey, i64>,
}

impl MemoryState {
    fn allocate(&mut self, kind: CatalogKind) -> i64 {
        let next = self.next_id.entry(kind).or_insert(0);
        *next += 1;
        *next
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn catalog_count(&self, kind: CatalogKind) -> usize {
        let state = self.state.lock().await;
        state.catalog.keys().filter(|(k, _)| *k == kind).count()
    }

    pub async fn deals(&self) -> Vec<NewDeal> {
        let state = self.state.lock().await;
        state.deals.values().cloned().collect()
    }
}

#[async_trait]
impl DealStore for MemoryStore {
    async fn find_catalog_id(&self, kind: CatalogKind, key: &str) -> Result<Option<i64>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.catalog.get(&(kind, key.to_string())).copied())
    }

    async fn insert_catalog(&self, entry: &CatalogEntry) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let kind = entry.kind();
        let key = (kind, entry.key().to_string());
        if state.catalog.contains_key(&key) {
            return Err(StoreError::UniqueViolation {
                kind,
                key: key.1,
            });
        }

        let id = state.allocate(kind);
        match entry {
            CatalogEntry::DataSource { name, .. } => {
                state.data_source_names.insert(id, name.clone());
            }
            CatalogEntry::Channel { channel_name, .. } => {
                state.channel_names.insert(id, channel_name.clone());
            }
            CatalogEntry::Package(pkg) => {
                state.packages.insert(
                    id,
                    Package {
                        id,
                        package_uid: pkg.package_uid.clone(),
                        name: pkg.name.clone(),
                        category_id: Some(pkg.category_id),
                        platform_id: Some(pkg.platform_id),
                        store_url: pkg.store_url.clone(),
                        description: None,
                        rating: None,
                        installs: None,
                        icon_url: None,
                        scraped_json: None,
                        updated_at: Some(Utc::now()),
                        not_found_at: None,
                    },
                );
            }
            CatalogEntry::Category { .. } | CatalogEntry::Platform { .. } => {}
        }
        state.catalog.insert(key, id);
        Ok(id)
    }

    async fn package(&self, id: i64) -> Result<Option<Package>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.packages.get(&id).cloned())
    }

    async fn update_package_metadata(
        &self,
        id: i64,
        metadata: &AppMetadata,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let pkg = state.packages.get_mut(&id).ok_or(StoreError::NotFound {
            kind: CatalogKind::Package,
            id,
        })?;

        if let Some(title) = &metadata.title {
            pkg.name = title.clone();
        }
        if metadata.description.is_some() {
            pkg.description = metadata.description.clone();
        }
        if metadata.rating.is_some() {
            pkg.rating = metadata.rating;
        }
        if metadata.store_url.is_some() {
            pkg.store_url = metadata.store_url.clone();
        }
        if metadata.icon_url.is_some() {
            pkg.icon_url = metadata.icon_url.clone();
        }
        if metadata.installs.is_some() {
            pkg.installs = metadata.installs.clone();
        }
        pkg.scraped_json = Some(metadata.raw.clone());
        pkg.updated_at = Some(updated_at);
        pkg.not_found_at = None;
        Ok(())
    }

    async fn set_package_category(&self, id: i64, category_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let pkg = state.packages.get_mut(&id).ok_or(StoreError::NotFound {
            kind: CatalogKind::Package,
            id,
        })?;
        pkg.category_id = Some(category_id);
        Ok(())
    }

    async fn mark_package_not_found(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let pkg = state.packages.get_mut(&id).ok_or(StoreError::NotFound {
            kind: CatalogKind::Package,
            id,
        })?;
        pkg.not_found_at = Some(at);
        Ok(())
    }

    async fn packages_missing_metadata(
        &self,
        after_id: i64,
        limit: usize,
        absent_before: DateTime<Utc>,
    ) -> Result<Vec<Package>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .packages
            .range(after_id + 1..)
            .map(|(_, pkg)| pkg)
            .filter(|pkg| !pkg.has_metadata())
            .filter(|pkg| pkg.not_found_at.map_or(true, |at| at < absent_before))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn upsert_deal(&self, deal: &NewDeal) -> Result<UpsertedDeal, StoreError> {
        let mut state = self.state.lock().await;
        let key = deal.dedup_key();
        if let Some(id) = state.deal_index.get(&key).copied() {
            if let Some(existing) = state.deals.get_mut(&id) {
                existing.score_at_scrape = deal.score_at_scrape;
                existing.metadata = deal.metadata.clone();
            }
            return Ok(UpsertedDeal { id, inserted: false });
        }

        state.next_deal_id += 1;
        let id = state.next_deal_id;
        state.deals.insert(id, deal.clone());
        state.deal_index.insert(key, id);
        Ok(UpsertedDeal { id, inserted: true })
    }

    async fn recent_deals(&self, limit: usize) -> Result<Vec<DealListing>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<DealListing> = state
            .deals
            .iter()
            .map(|(id, deal)| DealListing {
                id: *id,
                title: deal.title.clone(),
                description: deal.description.clone(),
                price_before: deal.price_before,
                price_after: deal.price_after,
                currency: deal.currency.clone(),
                discount_type: deal.discount_type.clone(),
                discount_value: deal.discount_value,
                url: deal.url.clone(),
                referral_code: deal.referral_code.clone(),
                score_at_scrape: deal.score_at_scrape,
                posted_utc: deal.posted_utc,
                expiry_date: deal.expiry_date,
                channel_id: deal.channel_id,
                data_source_id: deal.data_source_id,
                channel_name: state.channel_names.get(&deal.channel_id).cloned(),
                source_name: state.data_source_names.get(&deal.data_source_id).cloned(),
            })
            .collect();
        rows.sort_by(|a, b| b.posted_utc.cmp(&a.posted_utc).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn count_deals(&self) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.deals.len() as i64)
    }
}
