use std::sync::Arc;

use deals_core::{CatalogEntry, NewPackage, SourceKind};
use deals_storage::{DealStore, StoreError};
use tracing::debug;

/// Get-or-create resolution of catalog names to stable ids.
#[derive(Clone)]
pub struct CatalogResolver {
    store: Arc<dyn DealStore>,
}

impl CatalogResolver {
    pub fn new(store: Arc<dyn DealStore>) -> Self {
        Self { store }
    }

    /// Lookup, insert on miss, and retry the lookup once if a concurrent writer
    /// inserted the same key first.
    pub async fn get_or_create(&self, entry: &CatalogEntry) -> Result<i64, StoreError> {
        let kind = entry.kind();
        let key = entry.key();
        if let Some(id) = self.store.find_catalog_id(kind, key).await? {
            return Ok(id);
        }

        match self.store.insert_catalog(entry).await {
            Ok(id) => {
                debug!(?kind, key, id, "catalog entry created");
                Ok(id)
            }
            Err(err) if err.is_unique_violation() => {
                debug!(?kind, key, "lost insert race; re-reading");
                self.store.find_catalog_id(kind, key).await?.ok_or(err)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn data_source(&self, kind: SourceKind) -> Result<i64, StoreError> {
        self.get_or_create(&CatalogEntry::DataSource {
            name: kind.as_str().to_string(),
            base_url: kind.base_url().to_string(),
        })
        .await
    }

    pub async fn channel(
        &self,
        data_source_id: i64,
        kind: SourceKind,
        handle: &str,
    ) -> Result<i64, StoreError> {
        self.get_or_create(&CatalogEntry::Channel {
            data_source_id,
            channel_name: kind.channel_name(handle),
            base_route: kind.base_route(handle),
        })
        .await
    }

    pub async fn category(&self, name: &str) -> Result<i64, StoreError> {
        self.get_or_create(&CatalogEntry::Category {
            name: name.to_string(),
        })
        .await
    }

    pub async fn platform(&self, name: &str) -> Result<i64, StoreError> {
        self.get_or_create(&CatalogEntry::Platform {
            name: name.to_string(),
        })
        .await
    }

    pub async fn package(&self, package: NewPackage) -> Result<i64, StoreError> {
        self.get_or_create(&CatalogEntry::Package(package)).await
    }
}
