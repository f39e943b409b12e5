// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Embedding client
//!
//! Turns text or image references into vectors through an external
//! provider. Requests are batched up to the provider limit; a failed or
//! short batch falls back to one call per item. Items that still fail come
//! back as `None` and are never replaced by zero vectors.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// One embedding input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedItem {
    Text(String),
    ImageUrl(String),
}

impl EmbedItem {
    pub fn text(text: impl Into<String>) -> Self {
        EmbedItem::Text(text.into())
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        EmbedItem::ImageUrl(url.into())
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("Embedding request failed: {0}")]
    Request(String),

    #[error("Embedding service returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Malformed embedding response: {0}")]
    InvalidResponse(String),

    #[error("Embedding client misconfigured: {0}")]
    Config(String),
}

impl EmbeddingError {
    pub fn error_code(&self) -> &'static str {
        match self {
            EmbeddingError::Request(_) => "EMBEDDING_REQUEST",
            EmbeddingError::HttpStatus { .. } => "EMBEDDING_HTTP_STATUS",
            EmbeddingError::InvalidResponse(_) => "EMBEDDING_INVALID_RESPONSE",
            EmbeddingError::Config(_) => "EMBEDDING_CONFIG",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            EmbeddingError::Request(_) => true,
            EmbeddingError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            EmbeddingError::InvalidResponse(_) | EmbeddingError::Config(_) => false,
        }
    }
}

/// External embedding service
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// One vector per input, in input order
    async fn embed_batch(&self, items: &[EmbedItem]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    fn max_batch_size(&self) -> usize {
        30
    }

    fn name(&self) -> &str;
}

/// Batching front-end over an [`EmbeddingProvider`]
#[derive(Clone)]
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
}

impl EmbeddingClient {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        let batch_size = provider.max_batch_size().max(1);
        Self {
            provider,
            batch_size,
        }
    }

    /// Cap batches below the provider limit
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, self.provider.max_batch_size().max(1));
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Embed every item; failures are `None` at the same position
    pub async fn embed(&self, items: &[EmbedItem]) -> Vec<Option<Vec<f32>>> {
        let mut results = Vec::with_capacity(items.len());

        for chunk in items.chunks(self.batch_size) {
            match self.provider.embed_batch(chunk).await {
                Ok(vectors) if vectors.len() == chunk.len() => {
                    for (item, vector) in chunk.iter().zip(vectors) {
                        if is_valid_vector(&vector) {
                            results.push(Some(vector));
                        } else {
                            debug!("Invalid vector in batch, retrying item alone");
                            results.push(self.embed_one(item).await);
                        }
                    }
                }
                Ok(vectors) => {
                    warn!(
                        "{} returned {} vectors for {} items, falling back to single calls",
                        self.provider.name(),
                        vectors.len(),
                        chunk.len()
                    );
                    for item in chunk {
                        results.push(self.embed_one(item).await);
                    }
                }
                Err(e) => {
                    warn!(
                        "Batch of {} failed on {} ({}), falling back to single calls",
                        chunk.len(),
                        self.provider.name(),
                        e
                    );
                    for item in chunk {
                        results.push(self.embed_one(item).await);
                    }
                }
            }
        }

        let failed = results.iter().filter(|r| r.is_none()).count();
        if failed > 0 {
            warn!("{} of {} items could not be embedded", failed, items.len());
        }
        results
    }

    /// Embed a single item with one provider call
    pub async fn embed_one(&self, item: &EmbedItem) -> Option<Vec<f32>> {
        match self.provider.embed_batch(std::slice::from_ref(item)).await {
            Ok(mut vectors) if vectors.len() == 1 => {
                let vector = vectors.remove(0);
                is_valid_vector(&vector).then_some(vector)
            }
            Ok(vectors) => {
                debug!("Single-item call returned {} vectors", vectors.len());
                None
            }
            Err(e) => {
                debug!("Single-item embedding failed: {}", e);
                None
            }
        }
    }
}

/// Non-empty, finite and not all zeros
pub fn is_valid_vector(vector: &[f32]) -> bool {
    !vector.is_empty() && vector.iter().all(|x| x.is_finite()) && vector.iter().any(|x| *x != 0.0)
}

/// Configuration for the HTTP embedding provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Full URL of the embeddings endpoint
    pub endpoint: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Maximum items per request (default: 30)
    pub batch_size: usize,
    /// Requested output dimension, if the model supports truncation
    pub dimensions: Option<usize>,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/v1/embeddings".to_string(),
            model: "multimodal-embedding-v1".to_string(),
            api_key: None,
            batch_size: 30,
            dimensions: None,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint: env::var("EMBEDDING_ENDPOINT").unwrap_or(defaults.endpoint),
            model: env::var("EMBEDDING_MODEL").unwrap_or(defaults.model),
            api_key: env::var("EMBEDDING_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            batch_size: env::var("EMBEDDING_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
            dimensions: env::var("EMBEDDING_DIMENSIONS")
                .ok()
                .and_then(|v| v.parse().ok()),
            timeout_secs: defaults.timeout_secs,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint.trim().is_empty() {
            return Err("embedding endpoint must be set".to_string());
        }
        if self.model.trim().is_empty() {
            return Err("embedding model must be set".to_string());
        }
        if self.batch_size == 0 {
            return Err("embedding batch_size must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum RequestInput<'a> {
    Text { text: &'a str },
    Image { image: &'a str },
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<RequestInput<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Multimodal embeddings over an OpenAI-style JSON API
pub struct HttpEmbeddingProvider {
    client: Client,
    config: EmbeddingConfig,
}

impl HttpEmbeddingProvider {
    pub fn new(config: EmbeddingConfig) -> Result<Self, EmbeddingError> {
        config.validate().map_err(EmbeddingError::Config)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &config.api_key {
            let auth = HeaderValue::from_str(&format!("Bearer {}", key.trim()))
                .map_err(|_| EmbeddingError::Config("invalid API key".to_string()))?;
            headers.insert(AUTHORIZATION, auth);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| EmbeddingError::Config(e.to_string()))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_batch(&self, items: &[EmbedItem]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.config.model,
            input: items
                .iter()
                .map(|item| match item {
                    EmbedItem::Text(text) => RequestInput::Text { text },
                    EmbedItem::ImageUrl(url) => RequestInput::Image { image: url },
                })
                .collect(),
            dimensions: self.config.dimensions,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbeddingError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(EmbeddingError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
        parsed.data.sort_by_key(|entry| entry.index);

        debug!("Embedded {} items with {}", parsed.data.len(), self.config.model);
        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }

    fn max_batch_size(&self) -> usize {
        self.config.batch_size
    }

    fn name(&self) -> &str {
        "http"
    }
}
