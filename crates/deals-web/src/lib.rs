//! Read-only deals listing: an askama HTML page and a small JSON API over the
//! most recent deals.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use deals_core::DealListing;
use deals_storage::DealStore;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Rows fetched per request; filtering and sorting happen on this window.
pub const READ_LIMIT: usize = 400;

/// Horizon for the "expiring" quick filter.
pub const EXPIRING_WINDOW_HOURS: i64 = 48;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DealStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn DealStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortKey {
    #[default]
    Newest,
    Hottest,
    BiggestDiscount,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuickFilter {
    #[default]
    All,
    Hot,
    Free,
    Expiring,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFilter {
    #[default]
    All,
    Reddit,
    Telegram,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DealQuery {
    #[serde(default)]
    pub sort: SortKey,
    #[serde(default)]
    pub filter: QuickFilter,
    #[serde(default)]
    pub source: SourceFilter,
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub min_score: Option<i64>,
}

/// The listing form submits `min_score=` when the field is left empty.
fn blank_as_none<'de, D>(de: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(de)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

impl DealQuery {
    fn matches(&self, deal: &DealListing, now: DateTime<Utc>, needle: Option<&str>) -> bool {
        let quick = match self.filter {
            QuickFilter::All => true,
            QuickFilter::Hot => deal.is_hot(),
            QuickFilter::Free => deal.is_free(),
            QuickFilter::Expiring => {
                deal.expires_within(now, Duration::hours(EXPIRING_WINDOW_HOURS))
            }
        };
        let source = match self.source {
            SourceFilter::All => true,
            SourceFilter::Telegram => deal.is_telegram(),
            SourceFilter::Reddit => !deal.is_telegram(),
        };
        let text = needle
            .map(|n| deal.title.to_lowercase().contains(n))
            .unwrap_or(true);
        let score = self
            .min_score
            .map(|min| deal.score_at_scrape >= min)
            .unwrap_or(true);
        quick && source && text && score
    }

    /// Filter then sort a newest-first window of deals.
    pub fn apply(&self, deals: Vec<DealListing>, now: DateTime<Utc>) -> Vec<DealListing> {
        let needle = self
            .q
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);
        let mut out: Vec<DealListing> = deals
            .into_iter()
            .filter(|d| self.matches(d, now, needle.as_deref()))
            .collect();
        sort_deals(&mut out, self.sort);
        out
    }
}

/// Stable sort; `Newest` keeps the store order.
pub fn sort_deals(deals: &mut [DealListing], key: SortKey) {
    match key {
        SortKey::Newest => {}
        SortKey::Hottest => deals.sort_by(|a, b| b.score_at_scrape.cmp(&a.score_at_scrape)),
        SortKey::BiggestDiscount => {
            deals.sort_by(|a, b| b.discount_fraction().total_cmp(&a.discount_fraction()))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DealStats {
    pub total: usize,
    pub hot: usize,
    pub free: usize,
    pub telegram: usize,
    pub reddit: usize,
    pub expiring: usize,
    pub latest_posted_utc: Option<DateTime<Utc>>,
}

impl DealStats {
    pub fn from_deals(deals: &[DealListing], now: DateTime<Utc>) -> Self {
        let telegram = deals.iter().filter(|d| d.is_telegram()).count();
        Self {
            total: deals.len(),
            hot: deals.iter().filter(|d| d.is_hot()).count(),
            free: deals.iter().filter(|d| d.is_free()).count(),
            telegram,
            reddit: deals.len() - telegram,
            expiring: deals
                .iter()
                .filter(|d| d.expires_within(now, Duration::hours(EXPIRING_WINDOW_HOURS)))
                .count(),
            latest_posted_utc: deals.iter().map(|d| d.posted_utc).max(),
        }
    }
}

struct DealRow {
    title: String,
    url: String,
    description: String,
    channel: String,
    source_label: &'static str,
    score: i64,
    price: String,
    discount: String,
    posted: String,
    is_hot: bool,
    is_free: bool,
}

fn format_price(value: f64, currency: Option<&str>) -> String {
    match currency {
        Some(cur) => format!("{value:.2} {cur}"),
        None => format!("{value:.2}"),
    }
}

impl DealRow {
    fn from_listing(deal: &DealListing) -> Self {
        let currency = deal.currency.as_deref();
        let price = match (deal.price_before, deal.price_after) {
            (Some(before), Some(after)) if after == 0.0 => {
                format!("Free (was {})", format_price(before, currency))
            }
            (_, Some(after)) if after == 0.0 => "Free".to_string(),
            (_, Some(after)) => format_price(after, currency),
            (_, None) => String::new(),
        };
        let fraction = deal.discount_fraction();
        let discount = if fraction > 0.0 {
            format!("-{:.0}%", fraction * 100.0)
        } else {
            String::new()
        };
        let title = if deal.title.is_empty() {
            "(untitled)".to_string()
        } else {
            deal.title.clone()
        };
        Self {
            title,
            url: deal.url.clone().unwrap_or_default(),
            description: deal.description.clone().unwrap_or_default(),
            channel: deal.channel_name.clone().unwrap_or_default(),
            source_label: if deal.is_telegram() { "Telegram" } else { "Reddit" },
            score: deal.score_at_scrape,
            price,
            discount,
            posted: deal.posted_utc.format("%Y-%m-%d %H:%M UTC").to_string(),
            is_hot: deal.is_hot(),
            is_free: deal.is_free(),
        }
    }
}

struct OptionLink {
    value: &'static str,
    label: &'static str,
    selected: bool,
}

fn option_links<T: PartialEq + Copy>(
    current: T,
    options: &[(T, &'static str, &'static str)],
) -> Vec<OptionLink> {
    options
        .iter()
        .map(|&(v, value, label)| OptionLink {
            value,
            label,
            selected: v == current,
        })
        .collect()
}

#[derive(Template)]
#[template(path = "deals.html")]
struct DealsTemplate {
    rows: Vec<DealRow>,
    stats: DealStats,
    shown: usize,
    sorts: Vec<OptionLink>,
    filters: Vec<OptionLink>,
    sources: Vec<OptionLink>,
    latest: String,
    q: String,
    min_score: String,
}

#[derive(Debug, Serialize)]
struct DealsResponse {
    count: usize,
    deals: Vec<DealListing>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/deals", get(deals_json_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "deals web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn load_recent(state: &AppState) -> anyhow::Result<Vec<DealListing>> {
    Ok(state.store.recent_deals(READ_LIMIT).await?)
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DealQuery>,
) -> Response {
    let deals = match load_recent(&state).await {
        Ok(deals) => deals,
        Err(err) => return server_error(err),
    };
    let now = Utc::now();
    let stats = DealStats::from_deals(&deals, now);
    let stats_latest = stats
        .latest_posted_utc
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_default();
    let rows: Vec<DealRow> = query
        .apply(deals, now)
        .iter()
        .map(DealRow::from_listing)
        .collect();

    render_html(DealsTemplate {
        shown: rows.len(),
        rows,
        stats,
        sorts: option_links(
            query.sort,
            &[
                (SortKey::Newest, "newest", "Newest"),
                (SortKey::Hottest, "hottest", "Hottest"),
                (SortKey::BiggestDiscount, "biggest-discount", "Biggest discount"),
            ],
        ),
        filters: option_links(
            query.filter,
            &[
                (QuickFilter::All, "all", "All"),
                (QuickFilter::Hot, "hot", "Hot"),
                (QuickFilter::Free, "free", "Free"),
                (QuickFilter::Expiring, "expiring", "Expiring soon"),
            ],
        ),
        sources: option_links(
            query.source,
            &[
                (SourceFilter::All, "all", "All sources"),
                (SourceFilter::Reddit, "reddit", "Reddit"),
                (SourceFilter::Telegram, "telegram", "Telegram"),
            ],
        ),
        latest: stats_latest,
        q: query.q.clone().unwrap_or_default(),
        min_score: query.min_score.map(|s| s.to_string()).unwrap_or_default(),
    })
}

async fn deals_json_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DealQuery>,
) -> Response {
    match load_recent(&state).await {
        Ok(deals) => {
            let deals = query.apply(deals, Utc::now());
            Json(DealsResponse {
                count: deals.len(),
                deals,
            })
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_recent(&state).await {
        Ok(deals) => Json(DealStats::from_deals(&deals, Utc::now())).into_response(),
        Err(err) => server_error(err),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
