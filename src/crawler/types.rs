// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Core types for page and image harvesting

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

use crate::vector::IndexError;

/// How accepted images are processed after the quality filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestMode {
    /// Describe each image with the multimodal service and index the description
    Multimodal,
    /// Collect image URLs now and embed them directly in a later batch step
    DirectEmbedding,
    /// Keep accepted image bytes in local storage, no embedding
    None,
}

impl HarvestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarvestMode::Multimodal => "multimodal",
            HarvestMode::DirectEmbedding => "direct-embedding",
            HarvestMode::None => "none",
        }
    }
}

impl FromStr for HarvestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "multimodal" => Ok(HarvestMode::Multimodal),
            "direct-embedding" | "direct_embedding" | "deferred" => Ok(HarvestMode::DirectEmbedding),
            "none" | "local" => Ok(HarvestMode::None),
            other => Err(format!("unknown harvest mode: {}", other)),
        }
    }
}

/// A single page to harvest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestTarget {
    pub url: String,
    pub theme: String,
    pub mode: HarvestMode,
}

impl HarvestTarget {
    pub fn new(url: impl Into<String>, theme: impl Into<String>, mode: HarvestMode) -> Self {
        Self {
            url: url.into(),
            theme: theme.into(),
            mode,
        }
    }
}

/// How a deferred image will be embedded in the consolidated batch step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingMethod {
    /// The embedding service receives the image URL itself
    ImageUrl,
}

/// What became of an accepted image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageOutcome {
    /// Bytes were written to content-addressed local storage
    Local { path: PathBuf },
    /// URL collected for a later batch embedding step
    Deferred {
        url: String,
        embedding_method: EmbeddingMethod,
    },
    /// Multimodal description attached; `url` is the stable (rehosted) URL
    Described {
        url: String,
        description: String,
        is_related: bool,
    },
}

impl ImageOutcome {
    /// URL the image is reachable at, if it has one
    pub fn url(&self) -> Option<&str> {
        match self {
            ImageOutcome::Local { .. } => None,
            ImageOutcome::Deferred { url, .. } | ImageOutcome::Described { url, .. } => Some(url),
        }
    }
}

/// Harvest output for one input URL
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult {
    /// URL after redirects
    pub final_url: String,
    /// URL as supplied by the caller
    pub original_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub extracted_text: String,
    pub image_references: Vec<ImageOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PageResult {
    pub fn failed(original_url: &str, error: impl Into<String>) -> Self {
        Self {
            final_url: original_url.to_string(),
            original_url: original_url.to_string(),
            title: None,
            extracted_text: String::new(),
            image_references: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Run-level counters, updated concurrently by harvest tasks
#[derive(Debug, Default)]
pub struct HarvestStats {
    pub pages_ok: AtomicUsize,
    pub pages_failed: AtomicUsize,
    pub pages_timed_out: AtomicUsize,
    pub pages_from_cache: AtomicUsize,
    pub images_discovered: AtomicUsize,
    pub images_unresolvable: AtomicUsize,
    pub images_prefiltered: AtomicUsize,
    pub images_deduplicated: AtomicUsize,
    pub images_skipped_known_failure: AtomicUsize,
    pub images_fetch_failed: AtomicUsize,
    pub images_quality_rejected: AtomicUsize,
    pub images_describe_failed: AtomicUsize,
    pub images_storage_failed: AtomicUsize,
    pub images_discarded_by_describer: AtomicUsize,
    pub images_accepted: AtomicUsize,
    pub images_indexed: AtomicUsize,
    pub embeddings_failed: AtomicUsize,
}

impl HarvestStats {
    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HarvestStatsSnapshot {
        let get = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        HarvestStatsSnapshot {
            pages_ok: get(&self.pages_ok),
            pages_failed: get(&self.pages_failed),
            pages_timed_out: get(&self.pages_timed_out),
            pages_from_cache: get(&self.pages_from_cache),
            images_discovered: get(&self.images_discovered),
            images_unresolvable: get(&self.images_unresolvable),
            images_prefiltered: get(&self.images_prefiltered),
            images_deduplicated: get(&self.images_deduplicated),
            images_skipped_known_failure: get(&self.images_skipped_known_failure),
            images_fetch_failed: get(&self.images_fetch_failed),
            images_quality_rejected: get(&self.images_quality_rejected),
            images_describe_failed: get(&self.images_describe_failed),
            images_storage_failed: get(&self.images_storage_failed),
            images_discarded_by_describer: get(&self.images_discarded_by_describer),
            images_accepted: get(&self.images_accepted),
            images_indexed: get(&self.images_indexed),
            embeddings_failed: get(&self.embeddings_failed),
        }
    }
}

/// Point-in-time copy of [`HarvestStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestStatsSnapshot {
    pub pages_ok: usize,
    pub pages_failed: usize,
    pub pages_timed_out: usize,
    pub pages_from_cache: usize,
    pub images_discovered: usize,
    pub images_unresolvable: usize,
    pub images_prefiltered: usize,
    pub images_deduplicated: usize,
    pub images_skipped_known_failure: usize,
    pub images_fetch_failed: usize,
    pub images_quality_rejected: usize,
    pub images_describe_failed: usize,
    pub images_storage_failed: usize,
    pub images_discarded_by_describer: usize,
    pub images_accepted: usize,
    pub images_indexed: usize,
    pub embeddings_failed: usize,
}

impl HarvestStatsSnapshot {
    /// Images dropped by policy (prefilter, quality filter, describer)
    pub fn skipped(&self) -> usize {
        self.images_unresolvable
            + self.images_prefiltered
            + self.images_quality_rejected
            + self.images_discarded_by_describer
            + self.images_skipped_known_failure
    }

    /// Images or pages lost to errors
    pub fn failed(&self) -> usize {
        self.pages_failed
            + self.pages_timed_out
            + self.images_fetch_failed
            + self.images_describe_failed
            + self.images_storage_failed
            + self.embeddings_failed
    }
}

/// Best-effort result of one harvest run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestReport {
    /// One entry per input URL, in input order
    pub pages: Vec<PageResult>,
    pub stats: HarvestStatsSnapshot,
}

/// Result of the consolidated embedding step for deferred images
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredIndexReport {
    pub requested: usize,
    pub already_indexed: usize,
    pub indexed: usize,
    pub failed: usize,
}

/// Orchestrator-level failures; everything below this is absorbed into stats
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("No valid URLs supplied ({supplied} given)")]
    NoValidUrls { supplied: usize },

    #[error("Invalid harvester configuration: {0}")]
    InvalidConfig(String),

    #[error("Vector index error: {0}")]
    Index(#[from] IndexError),
}

impl HarvestError {
    pub fn error_code(&self) -> &'static str {
        match self {
            HarvestError::NoValidUrls { .. } => "NO_VALID_URLS",
            HarvestError::InvalidConfig(_) => "INVALID_CONFIG",
            HarvestError::Index(_) => "INDEX_ERROR",
        }
    }
}
