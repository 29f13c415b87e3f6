use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deals_core::{AppMetadata, CatalogEntry, CatalogKind, DealListing, NewDeal, Package};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated for {kind:?} key {key:?}")]
    UniqueViolation { kind: CatalogKind, key: String },
    #[error("{kind:?} id {id} not found")]
    NotFound { kind: CatalogKind, id: i64 },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Result of a deal upsert: the row id and whether a new row was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertedDeal {
    pub id: i64,
    pub inserted: bool,
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

/// Upsert/query boundary over the relational store.
///
/// Every write is keyed by a natural key, so concurrent batches may call into the
/// store without coordination: catalog inserts surface a uniqueness violation on a
/// lost race and deal upserts overwrite on key match.
#[async_trait]
pub trait DealStore: Send + Sync {
    async fn find_catalog_id(&self, kind: CatalogKind, key: &str) -> Result<Option<i64>, StoreError>;

    /// Insert a catalog row and return its id. Fails with
    /// [`StoreError::UniqueViolation`] when the key already exists.
    async fn insert_catalog(&self, entry: &CatalogEntry) -> Result<i64, StoreError>;

    async fn package(&self, id: i64) -> Result<Option<Package>, StoreError>;

    /// Overwrite enrichment fields that are present in `metadata`; absent ones keep
    /// their stored value.
    async fn update_package_metadata(
        &self,
        id: i64,
        metadata: &AppMetadata,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_package_category(&self, id: i64, category_id: i64) -> Result<(), StoreError>;

    /// Record that the catalog answered "no such package" at `at`.
    async fn mark_package_not_found(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Packages without stored metadata with `id > after_id`, ascending by id.
    /// Packages confirmed missing at or after `absent_before` are left out.
    async fn packages_missing_metadata(
        &self,
        after_id: i64,
        limit: usize,
        absent_before: DateTime<Utc>,
    ) -> Result<Vec<Package>, StoreError>;

    /// Insert or, on a dedup-key match, refresh the heat and metadata of an existing
    /// deal. Content fields of an existing row are left untouched.
    async fn upsert_deal(&self, deal: &NewDeal) -> Result<UpsertedDeal, StoreError>;

    /// Newest deals first, joined with channel and data source names.
    async fn recent_deals(&self, limit: usize) -> Result<Vec<DealListing>, StoreError>;

    async fn count_deals(&self) -> Result<i64, StoreError>;
}
