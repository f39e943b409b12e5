// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Page and image fetching
//!
//! Pages go through a [`PageRenderer`]; images are fetched with a direct GET
//! carrying browser-like headers. Every transport failure is classified into
//! a typed [`FetchError`] here, so retry decisions never look at messages.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER};
use reqwest::Client;
use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::config::FetchConfig;
use super::rate_limiter::FetchRateLimiter;
use super::renderer::{HttpRenderer, PageRenderer};
use super::url_normalizer::is_safe_url;

/// Fetch failure, classified at the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("HTTP {status} for: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("TLS failure for: {0}")]
    Tls(String),

    #[error("DNS resolution failed for: {0}")]
    Dns(String),

    #[error("Connection refused by: {0}")]
    ConnectionRefused(String),

    #[error("Timeout fetching: {0}")]
    Timeout(String),

    #[error("Connection reset while fetching: {0}")]
    ConnectionReset(String),

    #[error("Too many redirects for: {0}")]
    TooManyRedirects(String),

    #[error("Incomplete read from: {0}")]
    IncompleteRead(String),

    #[error("Unsafe URL blocked: {0}")]
    UnsafeUrl(String),

    #[error("Render failed for {url}: {message}")]
    Render { url: String, message: String },

    #[error("Body of {size} bytes exceeds limit for: {url}")]
    TooLarge { url: String, size: usize },

    #[error("Fetch error for {url}: {message}")]
    Other { url: String, message: String },
}

impl FetchError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout(_)
            | FetchError::ConnectionReset(_)
            | FetchError::TooManyRedirects(_)
            | FetchError::IncompleteRead(_)
            | FetchError::Render { .. } => true,
            FetchError::HttpStatus { status, .. } => {
                matches!(status, 408 | 425 | 429) || (500..600).contains(status)
            }
            FetchError::Tls(_)
            | FetchError::Dns(_)
            | FetchError::ConnectionRefused(_)
            | FetchError::UnsafeUrl(_)
            | FetchError::TooLarge { .. }
            | FetchError::Other { .. } => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            FetchError::HttpStatus { .. } => "HTTP_STATUS",
            FetchError::Tls(_) => "TLS",
            FetchError::Dns(_) => "DNS",
            FetchError::ConnectionRefused(_) => "CONNECTION_REFUSED",
            FetchError::Timeout(_) => "TIMEOUT",
            FetchError::ConnectionReset(_) => "CONNECTION_RESET",
            FetchError::TooManyRedirects(_) => "TOO_MANY_REDIRECTS",
            FetchError::IncompleteRead(_) => "INCOMPLETE_READ",
            FetchError::UnsafeUrl(_) => "UNSAFE_URL",
            FetchError::Render { .. } => "RENDER",
            FetchError::TooLarge { .. } => "TOO_LARGE",
            FetchError::Other { .. } => "OTHER",
        }
    }

    /// Classify a reqwest failure
    pub fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        let url = url.to_string();
        if err.is_timeout() {
            return FetchError::Timeout(url);
        }
        if err.is_redirect() {
            return FetchError::TooManyRedirects(url);
        }
        if let Some(status) = err.status() {
            return FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            };
        }
        if let Some(kind) = io_error_kind(err) {
            match kind {
                io::ErrorKind::ConnectionRefused => return FetchError::ConnectionRefused(url),
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe => return FetchError::ConnectionReset(url),
                io::ErrorKind::UnexpectedEof => return FetchError::IncompleteRead(url),
                io::ErrorKind::TimedOut => return FetchError::Timeout(url),
                io::ErrorKind::InvalidData => return FetchError::Tls(url),
                _ => {}
            }
        }
        if err.is_connect() {
            // A connect failure with no socket-level cause is a resolver failure.
            return FetchError::Dns(url);
        }
        if err.is_body() || err.is_decode() {
            return FetchError::IncompleteRead(url);
        }
        FetchError::Other {
            url,
            message: err.to_string(),
        }
    }
}

/// First `io::ErrorKind` found walking the source chain
fn io_error_kind(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        current = e.source();
    }
    None
}

/// Rendered HTML of one page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    /// URL after redirects
    pub final_url: String,
    pub html: String,
}

/// Network seam of the crawler; one call is exactly one attempt
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<RenderedPage, FetchError>;

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Production fetcher: pluggable renderer for pages, reqwest for images
pub struct HttpFetcher {
    client: Client,
    renderer: Arc<dyn PageRenderer>,
    config: FetchConfig,
    rate_limiter: FetchRateLimiter,
}

impl HttpFetcher {
    /// Create a fetcher that renders pages with a plain GET
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = build_client(&config, Duration::from_secs(config.image_timeout_secs))?;
        let renderer: Arc<dyn PageRenderer> = Arc::new(HttpRenderer::new(&config)?);
        let rate_limiter = FetchRateLimiter::new(config.requests_per_second);

        Ok(Self {
            client,
            renderer,
            config,
            rate_limiter,
        })
    }

    /// Replace the page renderer (e.g. with the headless browser renderer)
    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn renderer_name(&self) -> &'static str {
        self.renderer.name()
    }

    /// Shut down the page renderer (closes the headless browser, if any)
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.renderer.shutdown().await
    }

    fn image_headers(&self, url: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("image/avif,image/webp,image/apng,image/*,*/*;q=0.8"),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9,zh-CN;q=0.8"),
        );
        if let Some(referer) = self.config.referer_for(url) {
            if let Ok(value) = HeaderValue::from_str(referer) {
                headers.insert(REFERER, value);
            }
        }
        headers
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<RenderedPage, FetchError> {
        if !is_safe_url(url) {
            return Err(FetchError::UnsafeUrl(url.to_string()));
        }
        self.rate_limiter.wait().await;
        debug!("Rendering page via {}: {}", self.renderer.name(), url);
        self.renderer.render(url).await
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if !is_safe_url(url) {
            return Err(FetchError::UnsafeUrl(url.to_string()));
        }
        self.rate_limiter.wait().await;

        let response = self
            .client
            .get(url)
            .headers(self.image_headers(url))
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let limit = self.config.max_image_bytes;
        if let Some(len) = response.content_length() {
            if len as usize > limit {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    size: len as usize,
                });
            }
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::from_reqwest(url, &e))?;
            body.extend_from_slice(&chunk);
            if body.len() > limit {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    size: body.len(),
                });
            }
        }

        debug!("Fetched {} bytes from: {}", body.len(), url);
        Ok(body)
    }
}

pub(crate) fn build_client(config: &FetchConfig, timeout: Duration) -> Result<Client, FetchError> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .user_agent(config.user_agent.clone())
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| FetchError::Other {
            url: String::new(),
            message: format!("failed to build HTTP client: {}", e),
        })
}
