use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

/// Whether a failed catalog request is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl RetryDisposition {
    /// 5xx and 429 are transient; every other non-success status is final.
    pub fn for_status(status: StatusCode) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => Self::Retryable,
            status if status.is_server_error() => Self::Retryable,
            _ => Self::NonRetryable,
        }
    }

    pub fn for_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }
}

/// Doubling delay between retries, starting at `base_delay` and capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_before_retry(&self, retry: usize) -> Duration {
        let multiplier = u32::try_from(retry)
            .ok()
            .and_then(|retry| 2u32.checked_pow(retry))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Sent as `Content-Type` on every request; the catalog API expects JSON.
    pub content_type: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            content_type: Some("application/json".to_string()),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        if let Some(content_type) = &config.content_type {
            let mut headers = HeaderMap::new();
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_str(content_type)
                    .with_context(|| format!("invalid content type {content_type:?}"))?,
            );
            builder = builder.default_headers(headers);
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url`, retrying timeouts, connect failures, 5xx and 429 with capped backoff.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0;
        loop {
            let (disposition, err) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => (
                    RetryDisposition::for_status(resp.status()),
                    FetchError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: resp.url().to_string(),
                    },
                ),
                Err(err) => (RetryDisposition::for_error(&err), FetchError::Request(err)),
            };

            if disposition == RetryDisposition::NonRetryable || retry >= self.backoff.max_retries {
                return Err(err);
            }
            warn!(error = %err, retry, "retrying catalog request");
            tokio::time::sleep(self.backoff.delay_before_retry(retry)).await;
            retry += 1;
        }
    }
}
