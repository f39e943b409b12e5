// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! CDN rehosting for hotlink-protected images

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::debug;

use super::image_utils::{detect_format, format_to_mime};

/// Copies an image to stable public storage and returns the new URL
#[async_trait]
pub trait ImageRehoster: Send + Sync {
    async fn rehost(&self, url: &str, bytes: &[u8]) -> Result<String>;
}

/// Keeps the original URL
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughRehoster;

#[async_trait]
impl ImageRehoster for PassthroughRehoster {
    async fn rehost(&self, url: &str, _bytes: &[u8]) -> Result<String> {
        Ok(url.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RehostConfig {
    /// Upload endpoint; rehosting is disabled when unset
    pub endpoint: Option<String>,
}

impl RehostConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: env::var("REHOST_ENDPOINT").ok().filter(|e| !e.trim().is_empty()),
        }
    }
}

#[derive(Deserialize)]
struct UploadResponse {
    url: String,
}

/// Uploads raw bytes with `POST <endpoint>?source=<url>`
pub struct HttpRehoster {
    client: Client,
    endpoint: String,
}

impl HttpRehoster {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ImageRehoster for HttpRehoster {
    async fn rehost(&self, url: &str, bytes: &[u8]) -> Result<String> {
        let mime = detect_format(bytes)
            .map(format_to_mime)
            .unwrap_or("application/octet-stream");

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("source", url)])
            .header(reqwest::header::CONTENT_TYPE, mime)
            .body(bytes.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("rehost upload failed with HTTP {}", response.status()));
        }

        let uploaded: UploadResponse = response.json().await?;
        if !uploaded.url.starts_with("http") {
            return Err(anyhow!("rehost service returned non-URL {:?}", uploaded.url));
        }
        debug!("Rehosted {} -> {}", url, uploaded.url);
        Ok(uploaded.url)
    }
}
