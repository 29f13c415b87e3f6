//! Messaging-channel client speaking JSON to a session-holding gateway.
//!
//! The gateway owns the MTProto connection; this process only forwards the
//! pre-provisioned session string and API credentials. Interactive login is never
//! attempted.

use std::sync::Arc;

use async_trait::async_trait;
use deals_core::{ChannelMessage, RawRecord, SourceKind};
use deals_storage::{FetchError, HttpFetcher};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{normalize_handle, SourceClient, SourceError};

#[derive(Debug, Clone, Default)]
pub struct TelegramConfig {
    pub gateway_url: String,
    pub api_id: Option<String>,
    pub api_hash: Option<String>,
    pub session: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: i64,
    date: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    views: Option<i64>,
    #[serde(default)]
    forwards: Option<i64>,
    #[serde(default)]
    reply_markup: Option<ReplyMarkup>,
}

#[derive(Debug, Deserialize)]
struct ReplyMarkup {
    #[serde(default)]
    rows: Vec<ButtonRow>,
}

#[derive(Debug, Deserialize)]
struct ButtonRow {
    #[serde(default)]
    buttons: Vec<Button>,
}

#[derive(Debug, Deserialize)]
struct Button {
    #[serde(default)]
    url: Option<String>,
}

impl WireMessage {
    fn into_channel_message(self, channel: &str) -> ChannelMessage {
        // Only the first button of the first row carries the deal link.
        let button_url = self
            .reply_markup
            .and_then(|markup| markup.rows.into_iter().next())
            .and_then(|row| row.buttons.into_iter().next())
            .and_then(|button| button.url);
        ChannelMessage {
            id: self.id,
            channel: channel.to_string(),
            date: self.date,
            text: self.message.unwrap_or_default(),
            views: self.views,
            forwards: self.forwards,
            button_url,
        }
    }
}

/// Decode a gateway message page for `channel` (already in `@handle` form).
pub fn parse_messages(channel: &str, body: &[u8]) -> Result<Vec<ChannelMessage>, serde_json::Error> {
    let resp: MessagesResponse = serde_json::from_slice(body)?;
    Ok(resp
        .messages
        .into_iter()
        .map(|m| m.into_channel_message(channel))
        .collect())
}

#[derive(Debug)]
pub struct TelegramClient {
    http: Arc<HttpFetcher>,
    config: TelegramConfig,
    session_checked: OnceCell<()>,
}

impl TelegramClient {
    pub fn new(http: Arc<HttpFetcher>, config: TelegramConfig) -> Self {
        Self {
            http,
            config,
            session_checked: OnceCell::new(),
        }
    }

    fn gateway(&self) -> &str {
        self.config.gateway_url.trim_end_matches('/')
    }

    pub fn messages_url(&self, channel: &str, limit: usize) -> String {
        format!("{}/channels/{channel}/messages?limit={limit}", self.gateway())
    }

    fn auth_headers(&self) -> Result<HeaderMap, SourceError> {
        let session = self
            .config
            .session
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| SourceError::Auth("TELEGRAM_SESSION is not set".into()))?;
        let api_id = self
            .config
            .api_id
            .as_deref()
            .ok_or_else(|| SourceError::Auth("TELEGRAM_API_ID is not set".into()))?;
        let api_hash = self
            .config
            .api_hash
            .as_deref()
            .ok_or_else(|| SourceError::Auth("TELEGRAM_API_HASH is not set".into()))?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {session}"))?);
        headers.insert(HeaderName::from_static("x-api-id"), header_value(api_id)?);
        headers.insert(HeaderName::from_static("x-api-hash"), header_value(api_hash)?);
        Ok(headers)
    }

    /// Validates the stored session against the gateway once per process.
    async fn ensure_session(&self, run_id: Uuid) -> Result<(), SourceError> {
        self.session_checked
            .get_or_try_init(|| async {
                let headers = self.auth_headers()?;
                let url = format!("{}/session", self.gateway());
                match self
                    .http
                    .get_with_headers(run_id, "telegram", &url, headers)
                    .await
                {
                    Ok(_) => {
                        info!("telegram session accepted by gateway");
                        Ok(())
                    }
                    Err(FetchError::HttpStatus { status: 401 | 403, .. }) => Err(
                        SourceError::Auth("gateway rejected the stored session".into()),
                    ),
                    Err(err) => Err(SourceError::Fetch(err)),
                }
            })
            .await
            .map(|_| ())
    }
}

fn header_value(value: &str) -> Result<HeaderValue, SourceError> {
    HeaderValue::from_str(value)
        .map_err(|_| SourceError::Auth("credential contains invalid header characters".into()))
}

#[async_trait]
impl SourceClient for TelegramClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Telegram
    }

    async fn fetch_raw(
        &self,
        run_id: Uuid,
        handle: &str,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let channel = normalize_handle(handle, "@")?;
        self.ensure_session(run_id).await?;

        let url = self.messages_url(&channel, limit);
        let resp = self
            .http
            .get_with_headers(run_id, "telegram", &url, self.auth_headers()?)
            .await?;
        let messages = parse_messages(&format!("@{channel}"), &resp.body).map_err(|source| {
            FetchError::Decode {
                url: resp.final_url.clone(),
                source,
            }
        })?;
        debug!(channel = %channel, messages = messages.len(), "telegram page decoded");
        Ok(messages.into_iter().map(RawRecord::Message).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::read_fixture;
    use deals_storage::HttpClientConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal gateway on a loopback port; returns its base URL and the `/session` hit count.
    async fn spawn_gateway(session_status: u16) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let session_hits = Arc::new(AtomicUsize::new(0));
        let hits = session_hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let hits = hits.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]).to_string();
                    let path = request.split_whitespace().nth(1).unwrap_or("");
                    let (status, body) = if path == "/session" {
                        hits.fetch_add(1, Ordering::SeqCst);
                        (session_status, "{}")
                    } else {
                        (200, r#"{"messages":[{"id":7,"date":1700000000,"message":"free app"}]}"#)
                    };
                    let response = format!(
                        "HTTP/1.1 {status} OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        (format!("http://{addr}"), session_hits)
    }

    fn credentials(gateway_url: String) -> TelegramConfig {
        TelegramConfig {
            gateway_url,
            api_id: Some("1".into()),
            api_hash: Some("hash".into()),
            session: Some("stored-session".into()),
        }
    }

    fn client(config: TelegramConfig) -> TelegramClient {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        TelegramClient::new(http, config)
    }

    #[test]
    fn message_fixture_decodes_with_first_button_link() {
        let msgs =
            parse_messages("@PLAYSTOREDEAL", &read_fixture("telegram/playstoredeal_messages.json"))
                .unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].id, 9001);
        assert_eq!(msgs[0].channel, "@PLAYSTOREDEAL");
        assert_eq!(msgs[0].views, Some(1520));
        assert_eq!(
            msgs[0].button_url.as_deref(),
            Some("https://play.google.com/store/apps/details?id=com.example.notes")
        );
        assert_eq!(msgs[1].button_url, None);
        assert_eq!(msgs[2].text, "");
    }

    #[tokio::test]
    async fn missing_session_is_an_auth_error_without_network() {
        let client = client(TelegramConfig {
            gateway_url: "http://127.0.0.1:9".into(),
            api_id: Some("1".into()),
            api_hash: Some("hash".into()),
            session: None,
        });
        let err = client
            .fetch_raw(Uuid::new_v4(), "@PLAYSTOREDEAL", 50)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Auth(_)));
    }

    #[tokio::test]
    async fn session_is_checked_once_across_fetches() {
        let (url, session_hits) = spawn_gateway(200).await;
        let client = client(credentials(url));

        for handle in ["@PLAYSTOREDEAL", "@iosappdeals", "PLAYSTOREDEAL"] {
            let records = client.fetch_raw(Uuid::new_v4(), handle, 10).await.unwrap();
            assert_eq!(records.len(), 1);
        }
        assert_eq!(session_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_session_is_an_auth_error_and_not_cached() {
        let (url, session_hits) = spawn_gateway(401).await;
        let client = client(credentials(url));

        for _ in 0..2 {
            let err = client
                .fetch_raw(Uuid::new_v4(), "@PLAYSTOREDEAL", 10)
                .await
                .unwrap_err();
            assert!(matches!(err, SourceError::Auth(_)));
        }
        assert_eq!(session_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn messages_url_strips_trailing_slash() {
        let client = client(TelegramConfig {
            gateway_url: "http://gateway.local/".into(),
            ..Default::default()
        });
        assert_eq!(
            client.messages_url("iosappdeals", 50),
            "http://gateway.local/channels/iosappdeals/messages?limit=50"
        );
    }
}
