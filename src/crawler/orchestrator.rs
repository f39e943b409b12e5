// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Harvest orchestration
//!
//! One task per input URL, at most `max_concurrent_pages` running at once.
//! Each task renders its page, extracts text and image candidates, and runs
//! every candidate through normalizer, prefilter, store, fetch, quality
//! filter and the mode-specific sink. A task that exceeds
//! `task_timeout_secs` is dropped and reported as a timeout; it is not
//! retried.

use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use super::config::FetchConfig;
use super::extractor::{extract_image_candidates, extract_main_content, extract_title};
use super::fetcher::{Fetcher, RenderedPage};
use super::page_cache::{PageCache, PageCacheMetrics};
use super::prefilter::Prefilter;
use super::quality::{ImageQualityFilter, QualityThresholds};
use super::store::{ContentHashEntry, ContentLocation, ContentStore, FailureKind, RecordOutcome};
use super::types::{
    DeferredIndexReport, HarvestError, HarvestMode, HarvestReport, HarvestStats, HarvestTarget,
    ImageOutcome, PageResult,
};
use super::url_normalizer::normalize_image_url;
use crate::vector::{
    EmbedItem, EmbeddingClient, IndexHandle, IndexRegistry, IndexScope, VectorIndex, VectorPayload,
};
use crate::vision::image_utils::format_to_extension;
use crate::vision::{ImageDescriber, ImageRehoster, PassthroughRehoster};

/// Called with `(completed, total)` once per finished task
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// State shared by the tasks of one harvest run
struct RunContext {
    theme: String,
    mode: HarvestMode,
    scope: IndexScope,
    quality: ImageQualityFilter,
    index: IndexHandle,
    stats: HarvestStats,
}

/// An accepted image and the payload it resolved to
struct AcceptedImage {
    outcome: ImageOutcome,
    content_hash: String,
}

pub struct Harvester {
    config: FetchConfig,
    fetcher: Arc<dyn Fetcher>,
    embeddings: Arc<EmbeddingClient>,
    registry: Arc<IndexRegistry>,
    describer: Option<Arc<dyn ImageDescriber>>,
    rehoster: Arc<dyn ImageRehoster>,
    store: Arc<ContentStore>,
    prefilter: Prefilter,
    quality: Option<QualityThresholds>,
    page_cache: PageCache,
    inflight: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Harvester {
    pub fn new(
        config: FetchConfig,
        fetcher: Arc<dyn Fetcher>,
        embeddings: Arc<EmbeddingClient>,
        registry: Arc<IndexRegistry>,
    ) -> Self {
        let page_cache = PageCache::new(
            config.max_page_cache_entries,
            Duration::from_secs(config.page_cache_ttl_secs),
        );
        Self {
            config,
            fetcher,
            embeddings,
            registry,
            describer: None,
            rehoster: Arc::new(PassthroughRehoster),
            store: Arc::new(ContentStore::new()),
            prefilter: Prefilter::default(),
            quality: None,
            page_cache,
            inflight: StdMutex::new(HashMap::new()),
        }
    }

    /// Required for [`HarvestMode::Multimodal`]
    pub fn with_describer(mut self, describer: Arc<dyn ImageDescriber>) -> Self {
        self.describer = Some(describer);
        self
    }

    pub fn with_rehoster(mut self, rehoster: Arc<dyn ImageRehoster>) -> Self {
        self.rehoster = rehoster;
        self
    }

    /// Share a content store across harvesters or runs
    pub fn with_store(mut self, store: Arc<ContentStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_prefilter(mut self, prefilter: Prefilter) -> Self {
        self.prefilter = prefilter;
        self
    }

    /// Fixed quality thresholds; otherwise they follow the harvest mode
    pub fn with_quality(mut self, thresholds: QualityThresholds) -> Self {
        self.quality = Some(thresholds);
        self
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<IndexRegistry> {
        &self.registry
    }

    pub fn page_cache_metrics(&self) -> PageCacheMetrics {
        self.page_cache.metrics()
    }

    /// Harvest `urls` for `theme`
    ///
    /// Returns one [`PageResult`] per input URL, in input order. Only a
    /// misconfiguration or an input without a single usable URL is an error;
    /// everything else ends up in the per-page error or the run stats.
    pub async fn harvest(
        self: &Arc<Self>,
        urls: &[String],
        theme: &str,
        mode: HarvestMode,
        scope: &IndexScope,
        progress: Option<ProgressCallback>,
    ) -> Result<HarvestReport, HarvestError> {
        self.check_mode(mode)?;

        let mut slots: Vec<Option<PageResult>> = vec![None; urls.len()];
        let mut targets = Vec::new();
        let mut invalid = 0;
        for (idx, raw) in urls.iter().enumerate() {
            match parse_page_url(raw) {
                Some(url) => targets.push((idx, HarvestTarget::new(url, theme, mode))),
                None => {
                    debug!("Skipping invalid page URL: {:?}", raw);
                    slots[idx] = Some(PageResult::failed(raw, "invalid page URL"));
                    invalid += 1;
                }
            }
        }
        if targets.is_empty() {
            return Err(HarvestError::NoValidUrls {
                supplied: urls.len(),
            });
        }

        let run = Arc::new(RunContext {
            theme: theme.to_string(),
            mode,
            scope: scope.clone(),
            quality: ImageQualityFilter::new(
                self.quality
                    .clone()
                    .unwrap_or_else(|| QualityThresholds::for_mode(mode)),
            ),
            index: self.registry.open(scope).await,
            stats: HarvestStats::default(),
        });
        HarvestStats::add(&run.stats.pages_failed, invalid);

        let total = targets.len();
        info!(
            "Harvesting {} pages for theme {:?} in {} mode (scope {})",
            total,
            theme,
            mode.as_str(),
            scope
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_pages.max(1)));
        let task_timeout = Duration::from_secs(self.config.task_timeout_secs);
        let mut tasks = JoinSet::new();

        for (idx, target) in targets {
            let this = Arc::clone(self);
            let run = Arc::clone(&run);
            let semaphore = Arc::clone(&semaphore);

            tasks.spawn(async move {
                // The timeout covers the work only, not the wait for a slot
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (idx, PageResult::failed(&target.url, "harvest cancelled")),
                };

                match timeout(task_timeout, this.process_target(&target, &run)).await {
                    Ok(result) => (idx, result),
                    Err(_) => {
                        warn!("Task for {} timed out after {:?}", target.url, task_timeout);
                        HarvestStats::incr(&run.stats.pages_timed_out);
                        (
                            idx,
                            PageResult::failed(
                                &target.url,
                                format!("timed out after {}s", task_timeout.as_secs()),
                            ),
                        )
                    }
                }
            });
        }

        let mut completed = 0;
        while let Some(joined) = tasks.join_next().await {
            completed += 1;
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(e) => warn!("Harvest task aborted: {}", e),
            }
            if let Some(callback) = &progress {
                callback(completed, total);
            }
        }

        let pages: Vec<PageResult> = slots
            .into_iter()
            .zip(urls)
            .map(|(slot, url)| {
                slot.unwrap_or_else(|| {
                    HarvestStats::incr(&run.stats.pages_failed);
                    PageResult::failed(url, "task panicked")
                })
            })
            .collect();

        if mode == HarvestMode::Multimodal {
            if let Err(e) = self.registry.persist(scope).await {
                warn!("Failed to persist index for {}: {}", scope, e);
            }
        }

        let stats = run.stats.snapshot();
        info!(
            "Harvest done: {} ok, {} failed, {} images accepted, {} deduplicated, {} skipped",
            stats.pages_ok,
            stats.pages_failed + stats.pages_timed_out,
            stats.images_accepted,
            stats.images_deduplicated,
            stats.skipped()
        );

        Ok(HarvestReport { pages, stats })
    }

    fn check_mode(&self, mode: HarvestMode) -> Result<(), HarvestError> {
        match mode {
            HarvestMode::Multimodal if self.describer.is_none() => Err(HarvestError::InvalidConfig(
                "multimodal mode requires an image describer".to_string(),
            )),
            HarvestMode::None if self.config.storage_dir.is_none() => Err(
                HarvestError::InvalidConfig("mode none requires storage_dir".to_string()),
            ),
            _ => Ok(()),
        }
    }

    async fn process_target(&self, target: &HarvestTarget, run: &RunContext) -> PageResult {
        let page = match self.load_page(&target.url, run).await {
            Ok(page) => page,
            Err(message) => {
                HarvestStats::incr(&run.stats.pages_failed);
                return PageResult::failed(&target.url, message);
            }
        };

        let extracted_text = extract_main_content(&page.html, self.config.max_chars_per_page);
        let title = extract_title(&page.html);
        let candidates = extract_image_candidates(&page.html);
        HarvestStats::add(&run.stats.images_discovered, candidates.len());

        let mut seen = HashSet::new();
        let mut image_urls = Vec::new();
        for candidate in candidates {
            let url = normalize_image_url(&candidate.raw, &page.final_url);
            if url.is_empty() {
                HarvestStats::incr(&run.stats.images_unresolvable);
                continue;
            }
            if !seen.insert(url.clone()) {
                continue;
            }
            if let Some(reason) = self.prefilter.check(&url) {
                debug!("Prefilter rejected {}: {}", url, reason);
                HarvestStats::incr(&run.stats.images_prefiltered);
                continue;
            }
            image_urls.push(url);
        }

        let accepted: Vec<AcceptedImage> = stream::iter(image_urls)
            .map(|url| self.process_image(url, run))
            .buffered(self.config.image_concurrency_per_page.max(1))
            .filter_map(|image| async move { image })
            .collect()
            .await;

        let mut image_references: Vec<ImageOutcome> = Vec::with_capacity(accepted.len());
        let mut to_index = Vec::new();
        for image in accepted {
            if image_references.contains(&image.outcome) {
                continue;
            }
            if let ImageOutcome::Described {
                url,
                description,
                is_related: true,
            } = &image.outcome
            {
                let mut payload = VectorPayload::new(url.clone())
                    .with_description(description.clone())
                    .with_page_url(page.final_url.clone());
                payload.content_hash = Some(image.content_hash.clone());
                payload.theme = Some(run.theme.clone());
                payload.article_id = run.scope.article.clone();
                to_index.push((description.clone(), payload));
            }
            image_references.push(image.outcome);
        }

        if run.mode == HarvestMode::Multimodal && !to_index.is_empty() {
            self.index_described(to_index, run).await;
        }

        HarvestStats::incr(&run.stats.pages_ok);
        debug!(
            "Page {} done: {} chars, {} images",
            page.final_url,
            extracted_text.len(),
            image_references.len()
        );

        PageResult {
            final_url: page.final_url,
            original_url: target.url.clone(),
            title,
            extracted_text,
            image_references,
            error: None,
        }
    }

    async fn load_page(&self, url: &str, run: &RunContext) -> Result<RenderedPage, String> {
        if let Some(page) = self.page_cache.get(url) {
            debug!("Page cache hit for {}", url);
            HarvestStats::incr(&run.stats.pages_from_cache);
            return Ok(page);
        }

        if let Some(kind) = self.store.failure(url) {
            debug!("Skipping page {} (known {:?})", url, kind);
            return Err(format!("known failure ({:?})", kind));
        }

        let policy = self.config.retry_policy_for(url);
        match policy.run(url, || self.fetcher.fetch_page(url)).await {
            Ok(page) => {
                self.page_cache.insert(url, page.clone());
                Ok(page)
            }
            Err(e) => {
                warn!("Failed to fetch page {}: {}", url, e);
                if !self.config.never_cache_failure(url) {
                    self.store.mark_failed(url, FailureKind::FetchFailed);
                }
                Err(e.to_string())
            }
        }
    }

    /// Single-flight slot for one key (normalized URL or content hash)
    fn inflight_slot(&self, key: &str) -> InflightSlot<'_> {
        let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        let lock = Arc::clone(inflight.entry(key.to_string()).or_default());
        InflightSlot {
            map: &self.inflight,
            key: key.to_string(),
            lock,
        }
    }

    /// Keys currently held by single-flight slots
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Resolve `url` from the store, without any network call
    fn resolve_known(&self, url: &str, run: &RunContext) -> Option<Option<AcceptedImage>> {
        if let Some(entry) = self.store.lookup_entry(url) {
            HarvestStats::incr(&run.stats.images_deduplicated);
            return Some(Some(AcceptedImage {
                outcome: entry.outcome(),
                content_hash: entry.content_hash,
            }));
        }
        if let Some(kind) = self.store.failure(url) {
            debug!("Skipping {} (known {:?})", url, kind);
            HarvestStats::incr(&run.stats.images_skipped_known_failure);
            return Some(None);
        }
        None
    }

    async fn process_image(&self, url: String, run: &RunContext) -> Option<AcceptedImage> {
        if let Some(known) = self.resolve_known(&url, run) {
            return known;
        }

        let slot = self.inflight_slot(&url);
        let _guard = slot.lock.lock().await;
        match self.resolve_known(&url, run) {
            Some(known) => known,
            None => self.fetch_and_accept(&url, run).await,
        }
    }

    async fn fetch_and_accept(&self, url: &str, run: &RunContext) -> Option<AcceptedImage> {
        let policy = self.config.retry_policy_for(url);
        let bytes = match policy.run(url, || self.fetcher.fetch_image(url)).await {
            Ok(bytes) => bytes,
            Err(e) => {
                HarvestStats::incr(&run.stats.images_fetch_failed);
                if self.config.never_cache_failure(url) {
                    debug!("Image fetch failed for {} ({}), not remembered", url, e);
                } else {
                    debug!("Image fetch failed for {}: {}", url, e);
                    self.store.mark_failed(url, FailureKind::FetchFailed);
                }
                return None;
            }
        };

        let verdict = run.quality.inspect(&bytes);
        if verdict.rejected {
            if let Some(reason) = &verdict.reason {
                debug!("Quality filter rejected {}: {}", url, reason);
            }
            HarvestStats::incr(&run.stats.images_quality_rejected);
            self.store.mark_failed(url, FailureKind::Filtered);
            return None;
        }

        let hash = hex::encode(Sha256::digest(&bytes));
        let hash_key = format!("sha256:{}", hash);
        let slot = self.inflight_slot(&hash_key);
        let _guard = slot.lock.lock().await;
        match self.store.alias(url, &hash) {
            Some(entry) => {
                debug!("{} has the same bytes as {:?}", url, entry.location);
                HarvestStats::incr(&run.stats.images_deduplicated);
                Some(AcceptedImage {
                    outcome: entry.outcome(),
                    content_hash: hash.clone(),
                })
            }
            None => self.accept_new(url, &bytes, &hash, verdict.format, run).await,
        }
    }

    /// First sighting of a payload: hand it to the mode sink and record it
    async fn accept_new(
        &self,
        url: &str,
        bytes: &[u8],
        hash: &str,
        format: Option<image::ImageFormat>,
        run: &RunContext,
    ) -> Option<AcceptedImage> {
        let entry = match run.mode {
            HarvestMode::None => {
                let path = self.write_local(bytes, hash, format).await.map_err(|e| {
                    warn!("Failed to store {} locally: {}", url, e);
                    HarvestStats::incr(&run.stats.images_storage_failed);
                });
                ContentHashEntry::new(hash, ContentLocation::Path(path.ok()?))
            }
            HarvestMode::DirectEmbedding => {
                ContentHashEntry::new(hash, ContentLocation::Url(url.to_string()))
            }
            HarvestMode::Multimodal => {
                let describer = self.describer.as_ref()?;
                let description = match describer.describe(url, bytes, &run.theme).await {
                    Ok(description) => description,
                    Err(e) => {
                        warn!("Description failed for {}: {}", url, e);
                        HarvestStats::incr(&run.stats.images_describe_failed);
                        return None;
                    }
                };
                if description.is_deleted {
                    debug!("Describer discarded {}", url);
                    HarvestStats::incr(&run.stats.images_discarded_by_describer);
                    self.store.mark_failed(url, FailureKind::Filtered);
                    return None;
                }

                let stable_url = match self.rehoster.rehost(url, bytes).await {
                    Ok(stable) => stable,
                    Err(e) => {
                        warn!("Rehost failed for {}, keeping original URL: {}", url, e);
                        url.to_string()
                    }
                };
                ContentHashEntry::new(hash, ContentLocation::Url(stable_url))
                    .with_description(description.description, description.is_related)
            }
        };

        let outcome = match self.store.record_entry(url, entry.clone()) {
            RecordOutcome::Inserted => {
                HarvestStats::incr(&run.stats.images_accepted);
                entry.outcome()
            }
            RecordOutcome::Aliased { existing } => {
                HarvestStats::incr(&run.stats.images_deduplicated);
                existing.outcome()
            }
        };
        Some(AcceptedImage {
            outcome,
            content_hash: hash.to_string(),
        })
    }

    async fn write_local(
        &self,
        bytes: &[u8],
        hash: &str,
        format: Option<image::ImageFormat>,
    ) -> std::io::Result<PathBuf> {
        let root = self.config.storage_dir.as_ref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "storage_dir not configured")
        })?;
        let ext = format.map(format_to_extension).unwrap_or("bin");
        let dir = root.join(&hash[..2]);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.{}", hash, ext));
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::write(&path, bytes).await?;
        }
        Ok(path)
    }

    /// Embed descriptions and add the vectors to the run's index
    async fn index_described(&self, items: Vec<(String, VectorPayload)>, run: &RunContext) {
        let items: Vec<_> = {
            let index = run.index.read().await;
            items
                .into_iter()
                .filter(|(_, payload)| !index.contains_url(&payload.image_url))
                .collect()
        };
        if items.is_empty() {
            return;
        }

        let inputs: Vec<EmbedItem> = items.iter().map(|(text, _)| EmbedItem::text(text.clone())).collect();
        let vectors = self.embeddings.embed(&inputs).await;

        let mut batch_vectors = Vec::new();
        let mut batch_payloads = Vec::new();
        for ((_, payload), vector) in items.into_iter().zip(vectors) {
            match vector {
                Some(vector) => {
                    batch_vectors.push(vector);
                    batch_payloads.push(payload);
                }
                None => HarvestStats::incr(&run.stats.embeddings_failed),
            }
        }

        let mut index = run.index.write().await;
        let (vectors, payloads, mismatched) = insertable(&index, batch_vectors, batch_payloads);
        HarvestStats::add(&run.stats.embeddings_failed, mismatched);
        match index.add_batch(vectors, payloads) {
            Ok(added) => HarvestStats::add(&run.stats.images_indexed, added),
            Err(e) => {
                warn!("Failed to index descriptions in {}: {}", run.scope, e);
            }
        }
    }

    /// Embed every deferred image URL in `pages` in one batched step
    ///
    /// Images already in the scope's index are skipped, so calling this twice
    /// over the same pages indexes nothing the second time.
    pub async fn index_deferred(
        &self,
        scope: &IndexScope,
        pages: &[PageResult],
    ) -> Result<DeferredIndexReport, HarvestError> {
        let mut seen = HashSet::new();
        let mut deferred = Vec::new();
        for page in pages {
            for outcome in &page.image_references {
                if let ImageOutcome::Deferred { url, .. } = outcome {
                    if seen.insert(url.clone()) {
                        deferred.push((url.clone(), page.final_url.clone()));
                    }
                }
            }
        }

        let mut report = DeferredIndexReport {
            requested: deferred.len(),
            ..Default::default()
        };
        if deferred.is_empty() {
            return Ok(report);
        }

        let handle = self.registry.open(scope).await;
        let pending: Vec<_> = {
            let index = handle.read().await;
            deferred
                .into_iter()
                .filter(|(url, _)| !index.contains_url(url))
                .collect()
        };
        report.already_indexed = report.requested - pending.len();

        let inputs: Vec<EmbedItem> = pending
            .iter()
            .map(|(url, _)| EmbedItem::image_url(url.clone()))
            .collect();
        let vectors = self.embeddings.embed(&inputs).await;

        let mut batch_vectors = Vec::new();
        let mut batch_payloads = Vec::new();
        for ((url, page_url), vector) in pending.into_iter().zip(vectors) {
            let Some(vector) = vector else {
                report.failed += 1;
                continue;
            };
            let mut payload = VectorPayload::new(url.clone()).with_page_url(page_url);
            payload.content_hash = self.store.lookup_entry(&url).map(|e| e.content_hash);
            payload.article_id = scope.article.clone();
            batch_vectors.push(vector);
            batch_payloads.push(payload);
        }

        {
            let mut index = handle.write().await;
            let (vectors, payloads, mismatched) = insertable(&index, batch_vectors, batch_payloads);
            report.failed += mismatched;
            report.indexed = index.add_batch(vectors, payloads)?;
        }
        self.registry.persist(scope).await?;

        info!(
            "Deferred indexing for {}: {} requested, {} indexed, {} failed, {} already present",
            scope, report.requested, report.indexed, report.failed, report.already_indexed
        );
        Ok(report)
    }
}

/// Claim on a single-flight map entry
///
/// The last claim dropped removes the entry, including claims dropped by a
/// task abandoned on timeout while waiting on or holding the lock.
struct InflightSlot<'a> {
    map: &'a StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        let mut inflight = self.map.lock().unwrap_or_else(|p| p.into_inner());
        // Clones are only taken under the map lock, so the count is stable here
        let last = matches!(inflight.get(&self.key), Some(entry) if Arc::ptr_eq(entry, &self.lock))
            && Arc::strong_count(&self.lock) <= 2;
        if last {
            inflight.remove(&self.key);
        }
    }
}

/// Pairs safe to add to `index` in one batch
///
/// Skips image URLs already indexed and drops vectors whose length differs
/// from the index dimension (or from the first kept vector when the index is
/// still empty). Returns the number dropped for a length mismatch.
fn insertable(
    index: &VectorIndex,
    vectors: Vec<Vec<f32>>,
    payloads: Vec<VectorPayload>,
) -> (Vec<Vec<f32>>, Vec<VectorPayload>, usize) {
    let mut dimension = index.dimension();
    let mut mismatched = 0;
    let mut kept_vectors = Vec::with_capacity(vectors.len());
    let mut kept_payloads = Vec::with_capacity(payloads.len());

    for (vector, payload) in vectors.into_iter().zip(payloads) {
        if index.contains_url(&payload.image_url) {
            continue;
        }
        let expected = *dimension.get_or_insert(vector.len());
        if vector.len() != expected {
            warn!(
                "Dropping embedding for {}: dimension {} != {}",
                payload.image_url,
                vector.len(),
                expected
            );
            mismatched += 1;
            continue;
        }
        kept_vectors.push(vector);
        kept_payloads.push(payload);
    }
    (kept_vectors, kept_payloads, mismatched)
}

/// Absolute http(s) page URL, or `None`
fn parse_page_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let parsed = Url::parse(trimmed).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return None;
    }
    Some(trimmed.to_string())
}
