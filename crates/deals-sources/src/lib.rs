//! Source clients, field mappers and the app-catalog enricher.

use async_trait::async_trait;
use deals_core::{RawRecord, SourceKind};
use deals_storage::FetchError;
use thiserror::Error;
use uuid::Uuid;

pub mod enrich;
pub mod extract;
pub mod mapper;
pub mod reddit;
pub mod telegram;

pub use enrich::{EnrichError, Lookup, MetadataEnricher, PlayStoreEnricher};
pub use extract::{extract_package_uid, extract_package_uid_from};
pub use mapper::{map_to_deal, MapError};
pub use reddit::RedditClient;
pub use telegram::{TelegramClient, TelegramConfig};

pub const DEFAULT_REDDIT_LIMIT: usize = 25;
pub const DEFAULT_TELEGRAM_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid source handle {0:?}")]
    InvalidHandle(String),
}

/// Thin wrapper around one upstream feed. Implementations perform exactly one
/// listing request per call and never retry on their own.
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn fetch_raw(
        &self,
        run_id: Uuid,
        handle: &str,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError>;
}

pub(crate) fn normalize_handle(handle: &str, prefix: &str) -> Result<String, SourceError> {
    let trimmed = handle.trim();
    let stripped = trimmed.strip_prefix(prefix).unwrap_or(trimmed).trim();
    if stripped.is_empty() || stripped.contains('/') || stripped.contains(char::is_whitespace) {
        return Err(SourceError::InvalidHandle(handle.to_string()));
    }
    Ok(stripped.to_string())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_normalized_and_validated() {
        assert_eq!(normalize_handle("r/AppHookup", "r/").unwrap(), "AppHookup");
        assert_eq!(normalize_handle(" googleplaydeals ", "r/").unwrap(), "googleplaydeals");
        assert_eq!(normalize_handle("@PLAYSTOREDEAL", "@").unwrap(), "PLAYSTOREDEAL");
        assert!(matches!(
            normalize_handle("@", "@"),
            Err(SourceError::InvalidHandle(_))
        ));
        assert!(normalize_handle("a/b", "r/").is_err());
    }
}
