//! Pure translation of source-native records into [`DealDraft`]s.

use chrono::{DateTime, Utc};
use deals_core::{ChannelMessage, DealDraft, RawRecord, RedditPost};
use serde_json::json;
use thiserror::Error;

use crate::extract::extract_package_uid_from;

/// Messaging titles are the first body line, capped at this many characters.
pub const MAX_TITLE_CHARS: usize = 120;

#[derive(Debug, Error, PartialEq)]
pub enum MapError {
    #[error("{record}: timestamp {value} is not representable")]
    InvalidTimestamp { record: String, value: String },
}

pub fn map_to_deal(raw: &RawRecord) -> Result<DealDraft, MapError> {
    match raw {
        RawRecord::Reddit(post) => map_reddit_post(post),
        RawRecord::Message(msg) => map_channel_message(msg),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn map_reddit_post(post: &RedditPost) -> Result<DealDraft, MapError> {
    let posted_utc = epoch_f64_to_utc(post.created_utc).ok_or_else(|| MapError::InvalidTimestamp {
        record: format!("reddit post {}", post.id),
        value: post.created_utc.to_string(),
    })?;
    let description = non_empty(post.selftext.as_deref());
    let url = non_empty(post.url.as_deref());
    let package_uid = extract_package_uid_from([url.as_deref(), description.as_deref()]);

    Ok(DealDraft {
        title: post.title.trim().to_string(),
        description,
        price_before: None,
        price_after: None,
        currency: None,
        discount_type: None,
        discount_value: None,
        url,
        referral_code: None,
        score_at_scrape: post.ups,
        posted_utc,
        expiry_date: None,
        package_uid,
        metadata: json!({
            "reddit_post_id": post.id,
            "author": post.author,
            "num_comments": post.num_comments,
            "permalink": post.permalink,
        }),
    })
}

fn map_channel_message(msg: &ChannelMessage) -> Result<DealDraft, MapError> {
    let posted_utc =
        DateTime::<Utc>::from_timestamp(msg.date, 0).ok_or_else(|| MapError::InvalidTimestamp {
            record: format!("{} message {}", msg.channel, msg.id),
            value: msg.date.to_string(),
        })?;
    let title = msg
        .text
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect::<String>();
    let description = non_empty(Some(&msg.text));
    let url = non_empty(msg.button_url.as_deref());
    let package_uid = extract_package_uid_from([url.as_deref(), description.as_deref()]);

    Ok(DealDraft {
        title,
        description,
        price_before: None,
        price_after: None,
        currency: None,
        discount_type: None,
        discount_value: None,
        url,
        referral_code: None,
        score_at_scrape: 0,
        posted_utc,
        expiry_date: None,
        package_uid,
        metadata: json!({
            "telegram_msg_id": msg.id,
            "views": msg.views,
            "forwards": msg.forwards,
            "channel": msg.channel,
        }),
    })
}

fn epoch_f64_to_utc(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs < 0.0 || secs > i64::MAX as f64 {
        return None;
    }
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1_000_000_000.0) as u32;
    DateTime::<Utc>::from_timestamp(whole, nanos)
}
