// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Page and image harvesting
//!
//! Data flow for one page:
//! fetch (cached) -> text + image candidates -> normalize -> prefilter ->
//! store lookup -> image fetch -> quality filter -> mode sink
//! (local file, deferred URL, or description + index).

pub mod config;
pub mod extractor;
pub mod fetcher;
pub mod orchestrator;
pub mod page_cache;
pub mod prefilter;
pub mod quality;
pub mod rate_limiter;
pub mod renderer;
pub mod retry;
pub mod store;
pub mod types;
pub mod url_normalizer;

pub use config::FetchConfig;
pub use extractor::{extract_image_candidates, extract_main_content, extract_title, CandidateSource, ImageCandidate};
pub use fetcher::{FetchError, Fetcher, HttpFetcher, RenderedPage};
pub use orchestrator::{Harvester, ProgressCallback};
pub use page_cache::{PageCache, PageCacheMetrics};
pub use prefilter::{Prefilter, PrefilterConfig, PrefilterReason};
pub use quality::{ImageQualityFilter, QualityRejection, QualityThresholds, QualityVerdict};
pub use rate_limiter::FetchRateLimiter;
#[cfg(feature = "headless")]
pub use renderer::ChromiumRenderer;
pub use renderer::{HttpRenderer, PageRenderer};
pub use retry::RetryPolicy;
pub use store::{ContentHashEntry, ContentLocation, ContentStore, FailureKind, RecordOutcome, StoreError, StoreStats};
pub use types::{
    DeferredIndexReport, EmbeddingMethod, HarvestError, HarvestMode, HarvestReport, HarvestStats,
    HarvestStatsSnapshot, HarvestTarget, ImageOutcome, PageResult,
};
pub use url_normalizer::{canonical_identity, is_safe_url, normalize_image_url};
