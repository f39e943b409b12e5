// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Rendered page cache
//!
//! LRU cache of rendered HTML keyed by normalized page URL, with TTL
//! expiration. A repeated harvest over the same URLs is served from here and
//! issues no new page fetches.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::fetcher::RenderedPage;

/// Cache metrics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageCacheMetrics {
    pub hits: usize,
    pub misses: usize,
    /// LRU and TTL evictions
    pub evictions: usize,
}

impl PageCacheMetrics {
    /// Calculate hit rate (hits / total requests)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CachedPage {
    page: RenderedPage,
    inserted_at: Instant,
}

struct Inner {
    cache: LruCache<String, CachedPage>,
    metrics: PageCacheMetrics,
}

pub struct PageCache {
    inner: Mutex<Inner>,
    ttl: Duration,
}

impl PageCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                cache: LruCache::new(capacity),
                metrics: PageCacheMetrics::default(),
            }),
            ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cached page if present and not expired
    pub fn get(&self, url: &str) -> Option<RenderedPage> {
        let key = Self::normalize_url(url);
        let mut guard = self.lock();
        let inner = &mut *guard;

        let expired = match inner.cache.get(&key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                inner.metrics.hits += 1;
                return Some(entry.page.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.cache.pop(&key);
            inner.metrics.evictions += 1;
        }
        inner.metrics.misses += 1;
        None
    }

    pub fn insert(&self, url: &str, page: RenderedPage) {
        let key = Self::normalize_url(url);
        let mut inner = self.lock();
        let evicted = inner.cache.push(
            key.clone(),
            CachedPage {
                page,
                inserted_at: Instant::now(),
            },
        );
        if matches!(evicted, Some((old_key, _)) if old_key != key) {
            inner.metrics.evictions += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().cache.clear();
    }

    pub fn metrics(&self) -> PageCacheMetrics {
        self.lock().metrics.clone()
    }

    /// Normalize URL for cache key (lowercase, no fragment, no trailing slash)
    fn normalize_url(url: &str) -> String {
        let without_fragment = url.split('#').next().unwrap_or(url);
        without_fragment
            .trim()
            .to_lowercase()
            .trim_end_matches('/')
            .to_string()
    }
}
