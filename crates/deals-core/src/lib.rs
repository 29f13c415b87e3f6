//! Unified deal model shared by the source clients, storage and the listing view.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Score at or above which a deal counts as "hot".
pub const HOT_SCORE_THRESHOLD: i64 = 50;

/// Fallback category assigned to packages before enrichment finds a genre.
pub const FALLBACK_CATEGORY: &str = "misc";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Reddit,
    Telegram,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Reddit => "reddit",
            SourceKind::Telegram => "telegram",
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            SourceKind::Reddit => "https://reddit.com",
            SourceKind::Telegram => "https://t.me",
        }
    }

    /// Canonical channel name for a configured handle (`r/<sub>` or `@<channel>`).
    pub fn channel_name(&self, handle: &str) -> String {
        let handle = handle.trim();
        match self {
            SourceKind::Reddit => format!("r/{}", handle.trim_start_matches("r/")),
            SourceKind::Telegram => format!("@{}", handle.trim_start_matches('@')),
        }
    }

    pub fn base_route(&self, handle: &str) -> String {
        let handle = handle.trim();
        match self {
            SourceKind::Reddit => format!("/r/{}/new", handle.trim_start_matches("r/")),
            SourceKind::Telegram => format!("https://t.me/{}", handle.trim_start_matches('@')),
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One post from a subreddit listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RedditPost {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub created_utc: f64,
    #[serde(default)]
    pub ups: i64,
    #[serde(default)]
    pub num_comments: i64,
    #[serde(default)]
    pub selftext: Option<String>,
}

/// One message from a messaging channel, with the call-to-action link already resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChannelMessage {
    pub id: i64,
    pub channel: String,
    /// Epoch seconds.
    pub date: i64,
    pub text: String,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub button_url: Option<String>,
}

/// Source-native record as returned by a source client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "lowercase")]
pub enum RawRecord {
    Reddit(RedditPost),
    Message(ChannelMessage),
}

impl RawRecord {
    pub fn kind(&self) -> SourceKind {
        match self {
            RawRecord::Reddit(_) => SourceKind::Reddit,
            RawRecord::Message(_) => SourceKind::Telegram,
        }
    }

    /// Stable per-record package identifier used when no store identifier was extracted.
    pub fn fallback_package_uid(&self) -> String {
        match self {
            RawRecord::Reddit(post) => format!("reddit:{}", post.id),
            RawRecord::Message(msg) => format!(
                "telegram:{}:{}",
                msg.channel.trim_start_matches('@').to_ascii_lowercase(),
                msg.id
            ),
        }
    }
}

/// Mapper output: a deal with no storage references resolved yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealDraft {
    pub title: String,
    pub description: Option<String>,
    pub price_before: Option<f64>,
    pub price_after: Option<f64>,
    pub currency: Option<String>,
    pub discount_type: Option<String>,
    pub discount_value: Option<f64>,
    pub url: Option<String>,
    pub referral_code: Option<String>,
    pub score_at_scrape: i64,
    pub posted_utc: DateTime<Utc>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub package_uid: Option<String>,
    pub metadata: JsonValue,
}

impl DealDraft {
    pub fn into_new_deal(self, refs: DealRefs) -> NewDeal {
        NewDeal {
            title: self.title,
            description: self.description,
            price_before: self.price_before,
            price_after: self.price_after,
            currency: self.currency,
            discount_type: self.discount_type,
            discount_value: self.discount_value,
            url: self.url,
            referral_code: self.referral_code,
            score_at_scrape: self.score_at_scrape,
            posted_utc: self.posted_utc,
            expiry_date: self.expiry_date,
            channel_id: refs.channel_id,
            data_source_id: refs.data_source_id,
            package_id: refs.package_id,
            metadata: self.metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DealRefs {
    pub channel_id: i64,
    pub data_source_id: i64,
    pub package_id: Option<i64>,
}

/// Natural dedup key for deal upserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DealKey {
    pub channel_id: i64,
    pub package_id: Option<i64>,
    pub data_source_id: i64,
    pub posted_utc: DateTime<Utc>,
}

/// Deal row ready for upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeal {
    pub title: String,
    pub description: Option<String>,
    pub price_before: Option<f64>,
    pub price_after: Option<f64>,
    pub currency: Option<String>,
    pub discount_type: Option<String>,
    pub discount_value: Option<f64>,
    pub url: Option<String>,
    pub referral_code: Option<String>,
    pub score_at_scrape: i64,
    pub posted_utc: DateTime<Utc>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub channel_id: i64,
    pub data_source_id: i64,
    pub package_id: Option<i64>,
    pub metadata: JsonValue,
}

impl NewDeal {
    pub fn dedup_key(&self) -> DealKey {
        DealKey {
            channel_id: self.channel_id,
            package_id: self.package_id,
            data_source_id: self.data_source_id,
            posted_utc: self.posted_utc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatalogKind {
    DataSource,
    Channel,
    Category,
    Platform,
    Package,
}

impl CatalogKind {
    pub fn table(&self) -> &'static str {
        match self {
            CatalogKind::DataSource => "data_sources",
            CatalogKind::Channel => "channels",
            CatalogKind::Category => "categories",
            CatalogKind::Platform => "platforms",
            CatalogKind::Package => "packages",
        }
    }

    pub fn key_column(&self) -> &'static str {
        match self {
            CatalogKind::Channel => "channel_name",
            CatalogKind::Package => "package_uid",
            _ => "name",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPackage {
    pub package_uid: String,
    pub name: String,
    pub category_id: i64,
    pub platform_id: i64,
    pub store_url: Option<String>,
}

/// Get-or-create request: the unique key plus the fields used on first insert.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogEntry {
    DataSource {
        name: String,
        base_url: String,
    },
    Channel {
        data_source_id: i64,
        channel_name: String,
        base_route: String,
    },
    Category {
        name: String,
    },
    Platform {
        name: String,
    },
    Package(NewPackage),
}

impl CatalogEntry {
    pub fn kind(&self) -> CatalogKind {
        match self {
            CatalogEntry::DataSource { .. } => CatalogKind::DataSource,
            CatalogEntry::Channel { .. } => CatalogKind::Channel,
            CatalogEntry::Category { .. } => CatalogKind::Category,
            CatalogEntry::Platform { .. } => CatalogKind::Platform,
            CatalogEntry::Package(_) => CatalogKind::Package,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            CatalogEntry::DataSource { name, .. } => name,
            CatalogEntry::Channel { channel_name, .. } => channel_name,
            CatalogEntry::Category { name } => name,
            CatalogEntry::Platform { name } => name,
            CatalogEntry::Package(pkg) => &pkg.package_uid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub id: i64,
    pub package_uid: String,
    pub name: String,
    pub category_id: Option<i64>,
    pub platform_id: Option<i64>,
    pub store_url: Option<String>,
    pub description: Option<String>,
    pub rating: Option<f64>,
    pub installs: Option<String>,
    pub icon_url: Option<String>,
    pub scraped_json: Option<JsonValue>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Last time the catalog confirmed the package does not exist.
    pub not_found_at: Option<DateTime<Utc>>,
}

impl Package {
    pub fn has_metadata(&self) -> bool {
        self.scraped_json.is_some()
    }

    /// Metadata is older than `ttl`, or absent and not confirmed missing within `ttl`.
    pub fn needs_enrichment(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let checked_at = if self.has_metadata() {
            self.updated_at
        } else {
            self.not_found_at
        };
        match checked_at {
            Some(at) => now - at >= ttl,
            None => true,
        }
    }
}

/// Normalized app-catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub rating: Option<f64>,
    pub installs: Option<String>,
    pub icon_url: Option<String>,
    pub genre: Option<String>,
    pub store_url: Option<String>,
    pub raw: JsonValue,
}

impl AppMetadata {
    /// The catalog genre doubles as the package category.
    pub fn category(&self) -> Option<&str> {
        self.genre.as_deref().map(str::trim).filter(|g| !g.is_empty())
    }
}

/// `ios-<digits>` identifiers come from the App Store; identifiers containing `:` are
/// synthetic fallbacks; anything else is treated as an Android package name.
pub fn platform_for_package_uid(package_uid: &str) -> &'static str {
    if package_uid.starts_with("ios-") {
        "ios"
    } else if package_uid.contains(':') {
        "web"
    } else {
        "android"
    }
}

/// Only Android package names can be looked up in the Play Store catalog.
pub fn is_enrichable_package_uid(package_uid: &str) -> bool {
    platform_for_package_uid(package_uid) == "android" && package_uid.contains('.')
}

/// Deal row joined with its channel and data source names, as consumed by the listing view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealListing {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub price_before: Option<f64>,
    pub price_after: Option<f64>,
    pub currency: Option<String>,
    pub discount_type: Option<String>,
    pub discount_value: Option<f64>,
    pub url: Option<String>,
    pub referral_code: Option<String>,
    pub score_at_scrape: i64,
    pub posted_utc: DateTime<Utc>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub channel_id: i64,
    pub data_source_id: i64,
    pub channel_name: Option<String>,
    pub source_name: Option<String>,
}

impl DealListing {
    /// Source label heuristic: messaging channels are named `@handle`.
    pub fn is_telegram(&self) -> bool {
        let source = self.source_name.as_deref().unwrap_or_default().to_ascii_lowercase();
        let channel = self.channel_name.as_deref().unwrap_or_default();
        source.contains("telegram") || channel.starts_with('@')
    }

    pub fn is_hot(&self) -> bool {
        self.score_at_scrape >= HOT_SCORE_THRESHOLD
    }

    /// `price_after == 0` means free; a missing price means unknown.
    pub fn is_free(&self) -> bool {
        self.price_after == Some(0.0)
    }

    /// Fractional discount in `[0, 1]`; 0 when pricing is missing or not a reduction.
    pub fn discount_fraction(&self) -> f64 {
        match (self.price_before, self.price_after) {
            (Some(before), Some(after)) if before > 0.0 => {
                let diff = before - after;
                if diff <= 0.0 {
                    0.0
                } else {
                    diff / before
                }
            }
            _ => 0.0,
        }
    }

    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.expiry_date {
            Some(expiry) => expiry >= now && expiry - now <= window,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn listing() -> DealListing {
        DealListing {
            id: 1,
            title: "Deal".into(),
            description: None,
            price_before: None,
            price_after: None,
            currency: None,
            discount_type: None,
            discount_value: None,
            url: None,
            referral_code: None,
            score_at_scrape: 0,
            posted_utc: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            expiry_date: None,
            channel_id: 1,
            data_source_id: 1,
            channel_name: Some("r/googleplaydeals".into()),
            source_name: Some("reddit".into()),
        }
    }

    #[test]
    fn channel_names_are_normalized_per_source() {
        assert_eq!(SourceKind::Reddit.channel_name("googleplaydeals"), "r/googleplaydeals");
        assert_eq!(SourceKind::Reddit.channel_name("r/AppHookup"), "r/AppHookup");
        assert_eq!(SourceKind::Reddit.base_route("AppHookup"), "/r/AppHookup/new");
        assert_eq!(SourceKind::Telegram.channel_name("PLAYSTOREDEAL"), "@PLAYSTOREDEAL");
        assert_eq!(SourceKind::Telegram.channel_name("@PLAYSTOREDEAL"), "@PLAYSTOREDEAL");
        assert_eq!(
            SourceKind::Telegram.base_route("@PLAYSTOREDEAL"),
            "https://t.me/PLAYSTOREDEAL"
        );
    }

    #[test]
    fn fallback_uids_are_stable_and_synthetic() {
        let post = RawRecord::Reddit(RedditPost {
            id: "1abcde".into(),
            ..Default::default()
        });
        let msg = RawRecord::Message(ChannelMessage {
            id: 42,
            channel: "@IosAppDeals".into(),
            ..Default::default()
        });
        assert_eq!(post.fallback_package_uid(), "reddit:1abcde");
        assert_eq!(msg.fallback_package_uid(), "telegram:iosappdeals:42");
        assert_eq!(platform_for_package_uid(&post.fallback_package_uid()), "web");
        assert!(!is_enrichable_package_uid(&msg.fallback_package_uid()));
    }

    #[test]
    fn platform_is_derived_from_identifier_shape() {
        assert_eq!(platform_for_package_uid("com.example.app"), "android");
        assert_eq!(platform_for_package_uid("ios-123456789"), "ios");
        assert!(is_enrichable_package_uid("com.example.app"));
        assert!(!is_enrichable_package_uid("ios-123456789"));
        assert!(!is_enrichable_package_uid("nodots"));
    }

    #[test]
    fn enrichment_staleness_respects_ttl() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let mut pkg = Package {
            id: 1,
            package_uid: "com.example.app".into(),
            name: "Example".into(),
            category_id: None,
            platform_id: None,
            store_url: None,
            description: None,
            rating: None,
            installs: None,
            icon_url: None,
            scraped_json: None,
            updated_at: Some(now),
            not_found_at: None,
        };
        assert!(pkg.needs_enrichment(now, Duration::hours(24)));

        pkg.scraped_json = Some(serde_json::json!({"name": "Example"}));
        assert!(!pkg.needs_enrichment(now, Duration::hours(24)));
        assert!(pkg.needs_enrichment(now + Duration::hours(25), Duration::hours(24)));
    }

    #[test]
    fn confirmed_absent_package_waits_for_ttl() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let pkg = Package {
            id: 1,
            package_uid: "com.example.gone".into(),
            name: "Gone".into(),
            category_id: None,
            platform_id: None,
            store_url: None,
            description: None,
            rating: None,
            installs: None,
            icon_url: None,
            scraped_json: None,
            updated_at: Some(now),
            not_found_at: Some(now),
        };
        assert!(!pkg.has_metadata());
        assert!(!pkg.needs_enrichment(now + Duration::hours(1), Duration::hours(24)));
        assert!(pkg.needs_enrichment(now + Duration::hours(24), Duration::hours(24)));
    }

    #[test]
    fn free_is_distinct_from_unknown_price() {
        let mut deal = listing();
        assert!(!deal.is_free());
        deal.price_after = Some(0.0);
        assert!(deal.is_free());
    }

    #[test]
    fn discount_fraction_ignores_missing_and_increases() {
        let mut deal = listing();
        assert_eq!(deal.discount_fraction(), 0.0);
        deal.price_before = Some(4.0);
        deal.price_after = Some(1.0);
        assert!((deal.discount_fraction() - 0.75).abs() < f64::EPSILON);
        deal.price_after = Some(5.0);
        assert_eq!(deal.discount_fraction(), 0.0);
    }

    #[test]
    fn telegram_label_uses_source_name_or_channel_prefix() {
        let mut deal = listing();
        assert!(!deal.is_telegram());
        deal.channel_name = Some("@PLAYSTOREDEAL".into());
        assert!(deal.is_telegram());
        deal.channel_name = Some("deals".into());
        deal.source_name = Some("Telegram".into());
        assert!(deal.is_telegram());
    }

    #[test]
    fn expiring_window_excludes_past_and_far_future() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let mut deal = listing();
        assert!(!deal.expires_within(now, Duration::hours(48)));
        deal.expiry_date = Some(now + Duration::hours(47));
        assert!(deal.expires_within(now, Duration::hours(48)));
        deal.expiry_date = Some(now - Duration::hours(1));
        assert!(!deal.expires_within(now, Duration::hours(48)));
        deal.expiry_date = Some(now + Duration::hours(72));
        assert!(!deal.expires_within(now, Duration::hours(48)));
    }
}
