//! Outbound HTTP shared by the source clients and the catalog enricher.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// One attempt; failures go straight back to the caller.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }

    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::none()
        }
    }

    /// Doubling delay before retry `attempt` (0-based), capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 8,
            retry: RetryPolicy::none(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::Decode { .. } => None,
        }
    }

    /// Rate limiting, server errors, timeouts and refused connections.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            FetchError::Request(err) => err.is_timeout() || err.is_connect(),
            FetchError::Decode { .. } => false,
        }
    }
}

/// Process-scoped client. Construct once at startup and share behind an `Arc`.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            retry: config.retry,
        })
    }

    pub async fn get(
        &self,
        run_id: Uuid,
        target: &str,
        url: &str,
    ) -> Result<FetchResponse, FetchError> {
        self.get_with_headers(run_id, target, url, HeaderMap::new())
            .await
    }

    /// GET `url`; non-2xx responses become `FetchError::HttpStatus`.
    pub async fn get_with_headers(
        &self,
        run_id: Uuid,
        target: &str,
        url: &str,
        headers: HeaderMap,
    ) -> Result<FetchResponse, FetchError> {
        let _permit = self.in_flight.acquire().await.ok();
        let span = info_span!("http_get", %run_id, target, url);
        async {
            let mut attempt = 0;
            loop {
                match self.send_once(url, &headers).await {
                    Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                        let delay = self.retry.delay(attempt);
                        warn!(attempt, ?delay, error = %err, "transient fetch failure, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    outcome => return outcome,
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn send_once(&self, url: &str, headers: &HeaderMap) -> Result<FetchResponse, FetchError> {
        let resp = self.client.get(url).headers(headers.clone()).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
        Ok(FetchResponse {
            status,
            final_url,
            body,
        })
    }
}
