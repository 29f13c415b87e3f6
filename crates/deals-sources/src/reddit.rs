use std::sync::Arc;

use async_trait::async_trait;
use deals_core::{RawRecord, RedditPost, SourceKind};
use deals_storage::{FetchError, HttpFetcher};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::{normalize_handle, SourceClient, SourceError};

pub const REDDIT_BASE_URL: &str = "https://www.reddit.com";

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<ListingChild>,
}

#[derive(Debug, Deserialize)]
struct ListingChild {
    data: RedditPost,
}

/// Decode a `/new.json` listing body into posts with absolute permalinks.
pub fn parse_listing(body: &[u8]) -> Result<Vec<RedditPost>, serde_json::Error> {
    let listing: Listing = serde_json::from_slice(body)?;
    Ok(listing
        .data
        .children
        .into_iter()
        .map(|child| absolutize_permalink(child.data))
        .collect())
}

fn absolutize_permalink(mut post: RedditPost) -> RedditPost {
    if post.permalink.starts_with('/') {
        post.permalink = format!("{REDDIT_BASE_URL}{}", post.permalink);
    }
    post
}

#[derive(Debug, Clone)]
pub struct RedditClient {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl RedditClient {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            base_url: REDDIT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// `raw_json=1` stops Reddit from HTML-escaping `&`, `<` and `>` in strings.
    pub fn listing_url(&self, subreddit: &str, limit: usize) -> String {
        format!(
            "{}/r/{subreddit}/new.json?limit={limit}&raw_json=1",
            self.base_url
        )
    }
}

#[async_trait]
impl SourceClient for RedditClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Reddit
    }

    async fn fetch_raw(
        &self,
        run_id: Uuid,
        handle: &str,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let subreddit = normalize_handle(handle, "r/")?;
        let url = self.listing_url(&subreddit, limit);
        let resp = self
            .http
            .get_with_headers(run_id, "reddit", &url, HeaderMap::new())
            .await?;
        let posts = parse_listing(&resp.body).map_err(|source| FetchError::Decode {
            url: resp.final_url.clone(),
            source,
        })?;
        debug!(subreddit = %subreddit, posts = posts.len(), "reddit listing decoded");
        Ok(posts.into_iter().map(RawRecord::Reddit).collect())
    }
}
