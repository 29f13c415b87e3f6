//! App-catalog metadata lookup for Android package names.

use std::sync::Arc;

use async_trait::async_trait;
use deals_core::AppMetadata;
use deals_storage::{FetchError, HttpFetcher};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const PLAY_STORE_DETAILS_URL: &str = "https://play.google.com/store/apps/details";

static INSTALLS_BUCKET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d[\d,.]*\s*[KMB]?\+$").expect("installs pattern"));

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(AppMetadata),
    NotFound,
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unparsable catalog page for {package_uid}: {reason}")]
    Parse { package_uid: String, reason: String },
}

#[async_trait]
pub trait MetadataEnricher: Send + Sync {
    /// `Ok(NotFound)` means the catalog confirmed the package does not exist;
    /// any other failure is an `Err`.
    async fn fetch_metadata(&self, run_id: Uuid, package_uid: &str) -> Result<Lookup, EnrichError>;
}

#[derive(Debug, Clone)]
pub struct PlayStoreEnricher {
    http: Arc<HttpFetcher>,
    base_url: String,
    lang: String,
    country: String,
}

impl PlayStoreEnricher {
    pub fn new(http: Arc<HttpFetcher>, lang: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            http,
            base_url: PLAY_STORE_DETAILS_URL.to_string(),
            lang: lang.into(),
            country: country.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn details_url(&self, package_uid: &str) -> String {
        format!(
            "{}?id={package_uid}&hl={}&gl={}",
            self.base_url, self.lang, self.country
        )
    }
}

#[async_trait]
impl MetadataEnricher for PlayStoreEnricher {
    async fn fetch_metadata(&self, run_id: Uuid, package_uid: &str) -> Result<Lookup, EnrichError> {
        let url = self.details_url(package_uid);
        let resp = match self.http.get(run_id, "playstore", &url).await {
            Ok(resp) => resp,
            Err(err) if err.is_not_found() => {
                info!(package_uid, "app not found in play store (404)");
                return Ok(Lookup::NotFound);
            }
            Err(err) => return Err(err.into()),
        };
        let html = String::from_utf8_lossy(&resp.body);
        let canonical = format!("{}?id={package_uid}", self.base_url);
        parse_details_page(package_uid, &html, &canonical).map(Lookup::Found)
    }
}

fn selector(css: &str, package_uid: &str) -> Result<Selector, EnrichError> {
    Selector::parse(css).map_err(|e| EnrichError::Parse {
        package_uid: package_uid.to_string(),
        reason: e.to_string(),
    })
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn json_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str().and_then(text_or_none)
}

/// Ratings show up as either numbers or numeric strings.
fn json_number(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_f64()
        .or_else(|| cur.as_str().and_then(|s| s.trim().parse().ok()))
}

/// `GAME_PUZZLE` -> `Puzzle`, `PRODUCTIVITY` -> `Productivity`.
fn humanize_category(code: &str) -> String {
    let code = code.strip_prefix("GAME_").unwrap_or(code);
    code.split('_')
        .filter(|w| !w.is_empty())
        .map(|word| {
            let lower = word.to_ascii_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a Play Store details page: the schema.org JSON-LD block supplies the core
/// fields; genre and the install bucket come from the rendered markup.
pub fn parse_details_page(
    package_uid: &str,
    html: &str,
    canonical_url: &str,
) -> Result<AppMetadata, EnrichError> {
    let document = Html::parse_document(html);

    let ld_sel = selector(r#"script[type="application/ld+json"]"#, package_uid)?;
    let structured = document
        .select(&ld_sel)
        .filter_map(|node| serde_json::from_str::<JsonValue>(&node.text().collect::<String>()).ok())
        .find(|value| value.get("name").is_some())
        .ok_or_else(|| EnrichError::Parse {
            package_uid: package_uid.to_string(),
            reason: "no structured app data on page".into(),
        })?;

    let genre_sel = selector(r#"[itemprop="genre"]"#, package_uid)?;
    let genre = document
        .select(&genre_sel)
        .next()
        .and_then(|n| text_or_none(&n.text().collect::<String>()))
        .or_else(|| json_str(&structured, &["applicationCategory"]).map(|c| humanize_category(&c)));

    // Own text nodes only, so nested wrappers are not re-scanned per ancestor.
    let div_sel = selector("div, span", package_uid)?;
    let installs = document
        .select(&div_sel)
        .filter_map(|n| {
            let own: String = n
                .children()
                .filter_map(|child| child.value().as_text().map(|t| &*t.text))
                .collect();
            text_or_none(&own)
        })
        .find(|text| INSTALLS_BUCKET.is_match(text));

    let title = json_str(&structured, &["name"]);
    let description = json_str(&structured, &["description"]);
    let rating = json_number(&structured, &["aggregateRating", "ratingValue"]);
    let icon_url = json_str(&structured, &["image"]);
    let store_url = json_str(&structured, &["url"]).or_else(|| Some(canonical_url.to_string()));

    let mut raw = structured;
    if let Some(obj) = raw.as_object_mut() {
        obj.insert("appId".into(), JsonValue::from(package_uid));
        obj.insert("installs".into(), installs.clone().into());
        obj.insert("genre".into(), genre.clone().into());
    }

    Ok(AppMetadata {
        title,
        description,
        rating,
        installs,
        icon_url,
        genre,
        store_url,
        raw,
    })
}
