//! HTTP Fetcher for Feed Harvester
//!
//! This module provides functionality for:
//! 1. Streaming a response body to a file without buffering it in memory
//! 2. Rejecting unsupported content types and oversized bodies
//! 3. Classifying failures as transient or permanent for the retry policy
//! 4. Reading `Retry-After` from rate limited responses

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use reqwest::{header, Client, StatusCode};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::harvest::retry::FailureType;

/// Error types for a single fetch attempt
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Body stream error: {0}")]
    Stream(String),

    #[error("HTTP error: {0}")]
    Status(u16),

    #[error("Rate limited by server")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Unsupported content type: {0}")]
    ContentType(String),

    #[error("Response exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("Destination already exists: {0}")]
    DestinationExists(PathBuf),

    #[error("Invalid request: {0}")]
    Request(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Cancelled before dispatch")]
    Cancelled,
}

impl FetchError {
    pub fn failure_type(&self) -> FailureType {
        match self {
            FetchError::Timeout(_)
            | FetchError::Connect(_)
            | FetchError::Stream(_)
            | FetchError::RateLimited { .. } => FailureType::Transient,
            FetchError::Status(code) if *code >= 500 || *code == 408 => FailureType::Transient,
            _ => FailureType::Permanent,
        }
    }

    fn from_reqwest(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            FetchError::Timeout(timeout)
        } else if e.is_builder() {
            FetchError::Request(e.to_string())
        } else if e.is_body() || e.is_decode() {
            FetchError::Stream(e.to_string())
        } else {
            FetchError::Connect(e.to_string())
        }
    }
}

/// Result type for fetches
pub type FetchResult<T> = Result<T, FetchError>;

/// What a response must satisfy to be written to disk
#[derive(Debug, Clone)]
pub struct FetchLimits {
    pub max_bytes: u64,
    /// Accepted content type prefixes; empty accepts anything.
    pub allowed_content_types: Vec<String>,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            max_bytes: 50 * 1024 * 1024,
            allowed_content_types: vec!["image/".to_string(), "video/".to_string()],
        }
    }
}

impl FetchLimits {
    fn allows(&self, content_type: &str) -> bool {
        self.allowed_content_types.is_empty()
            || self
                .allowed_content_types
                .iter()
                .any(|prefix| content_type.starts_with(prefix.as_str()))
    }
}

/// One attempt at writing `url` to `dest`
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Returns the number of bytes written.
    async fn fetch_to(&self, url: &str, dest: &Path, limits: &FetchLimits) -> FetchResult<u64>;
}

/// Fetcher settings
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_idle_per_host: usize,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("feed_harvester/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_idle_per_host: 10,
        }
    }
}

/// [`Fetcher`] over a pooled `reqwest` client
pub struct HttpFetcher {
    client: Client,
    request_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpFetcherConfig) -> FetchResult<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .gzip(true)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| FetchError::Request(e.to_string()))?;

        info!(
            "Initialized HTTP client ({}s connect, {}s request timeout)",
            config.connect_timeout.as_secs(),
            config.request_timeout.as_secs()
        );

        Ok(Self {
            client,
            request_timeout: config.request_timeout,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_to(&self, url: &str, dest: &Path, limits: &FetchLimits) -> FetchResult<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(e, self.request_timeout))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|h| h.to_str().ok())
                .and_then(|v| parse_retry_after(v, Utc::now()));
            warn!("Rate limit exceeded, retry after {:?}", retry_after);
            return Err(FetchError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if let Some(content_type) = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
        {
            if !limits.allows(content_type) {
                return Err(FetchError::ContentType(content_type.to_string()));
            }
        }

        if let Some(length) = response.content_length() {
            if length > limits.max_bytes {
                return Err(FetchError::TooLarge { limit: limits.max_bytes });
            }
        }

        let mut file = File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::from_reqwest(e, self.request_timeout))?;
            written += chunk.len() as u64;
            if written > limits.max_bytes {
                return Err(FetchError::TooLarge { limit: limits.max_bytes });
            }
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        debug!("Fetched {} bytes from {}", written, url);
        Ok(written)
    }
}

/// Parse a `Retry-After` value given as seconds or as an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn serve(route: &str, response: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(response)
            .mount(&server)
            .await;
        server
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpFetcherConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_image_is_streamed_to_disk() {
        let body = vec![7u8; 4096];
        let server = serve("/a.jpg", ResponseTemplate::new(200).set_body_raw(body.clone(), "image/jpeg")).await;
        let dir = tempdir().unwrap();
        let dest = dir.path().join("a.jpg.part");

        let written = fetcher()
            .fetch_to(&format!("{}/a.jpg", server.uri()), &dest, &FetchLimits::default())
            .await
            .unwrap();

        assert_eq!(written, 4096);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn test_not_found_is_permanent() {
        let server = serve("/gone.jpg", ResponseTemplate::new(404)).await;
        let dir = tempdir().unwrap();

        let err = fetcher()
            .fetch_to(&format!("{}/gone.jpg", server.uri()), &dir.path().join("x"), &FetchLimits::default())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Status(404)));
        assert_eq!(err.failure_type(), FailureType::Permanent);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = serve("/busy.jpg", ResponseTemplate::new(503)).await;
        let dir = tempdir().unwrap();

        let err = fetcher()
            .fetch_to(&format!("{}/busy.jpg", server.uri()), &dir.path().join("x"), &FetchLimits::default())
            .await
            .unwrap_err();

        assert_eq!(err.failure_type(), FailureType::Transient);
    }

    #[tokio::test]
    async fn test_html_is_rejected() {
        let server = serve(
            "/login",
            ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"),
        )
        .await;
        let dir = tempdir().unwrap();
        let dest = dir.path().join("x");

        let err = fetcher()
            .fetch_to(&format!("{}/login", server.uri()), &dest, &FetchLimits::default())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::ContentType(_)));
        assert_eq!(err.failure_type(), FailureType::Permanent);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let server = serve(
            "/big.jpg",
            ResponseTemplate::new(200).set_body_raw(vec![0u8; 2048], "image/jpeg"),
        )
        .await;
        let dir = tempdir().unwrap();
        let limits = FetchLimits {
            max_bytes: 1024,
            ..FetchLimits::default()
        };

        let err = fetcher()
            .fetch_to(&format!("{}/big.jpg", server.uri()), &dir.path().join("x"), &limits)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::TooLarge { limit: 1024 }));
    }

    #[tokio::test]
    async fn test_rate_limit_reads_retry_after() {
        let server = serve(
            "/slow.jpg",
            ResponseTemplate::new(429).insert_header("retry-after", "7"),
        )
        .await;
        let dir = tempdir().unwrap();

        let err = fetcher()
            .fetch_to(&format!("{}/slow.jpg", server.uri()), &dir.path().join("x"), &FetchLimits::default())
            .await
            .unwrap_err();

        match err {
            FetchError::RateLimited { retry_after } => assert_eq!(retry_after, Some(Duration::from_secs(7))),
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_retry_after_accepts_http_dates() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }
}
