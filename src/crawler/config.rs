// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Configuration for page and image fetching
//!
//! Defines concurrency ceilings, timeouts, retry budgets, domain lists and
//! caching for the crawler.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use super::retry::RetryPolicy;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Configuration for the crawler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Maximum pages processed at once (default: 8)
    pub max_concurrent_pages: usize,
    /// Images fetched in parallel within one page (default: 4)
    pub image_concurrency_per_page: usize,
    /// Wall-clock budget for one page task, images included (default: 90)
    pub task_timeout_secs: u64,
    /// Timeout for a single page request or render (default: 30)
    pub page_timeout_secs: u64,
    /// Timeout for a single image request (default: 15)
    pub image_timeout_secs: u64,
    /// Retries after the first attempt (default: 2)
    pub max_retries: u32,
    /// Retries used for domains on the high-failure list (default: 1)
    pub reduced_retries: u32,
    /// Domains that fail often enough to deserve a smaller retry budget
    pub high_failure_domains: Vec<String>,
    /// Domains whose failures are never remembered in the content store
    pub never_cache_failure_domains: Vec<String>,
    /// Referer header sent to anti-hotlink image hosts
    pub referer_overrides: HashMap<String, String>,
    /// Largest image body accepted, in bytes (default: 10 MiB)
    pub max_image_bytes: usize,
    /// Maximum characters of extracted page text (default: 20000)
    pub max_chars_per_page: usize,
    /// Scroll the rendered page to trigger lazy-loaded images
    pub scroll_for_lazy_load: bool,
    /// Time allowed for layout to settle after navigation, in ms (default: 1500)
    pub settle_millis: u64,
    /// Outbound request rate across all tasks (default: 20/s)
    pub requests_per_second: u32,
    /// Rendered page cache TTL in seconds (default: 1800 = 30 minutes)
    pub page_cache_ttl_secs: u64,
    /// Maximum rendered pages kept in the cache (default: 500)
    pub max_page_cache_entries: usize,
    pub retry: RetryPolicy,
    pub user_agent: String,
    /// Local storage for accepted images in mode `none`
    pub storage_dir: Option<PathBuf>,
}

impl FetchConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_retries = env::var("HARVEST_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_retries)
            .min(3);

        Self {
            max_concurrent_pages: env::var("HARVEST_MAX_CONCURRENT_PAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_concurrent_pages),
            image_concurrency_per_page: env::var("HARVEST_IMAGE_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.image_concurrency_per_page),
            task_timeout_secs: env::var("HARVEST_TASK_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.task_timeout_secs),
            page_timeout_secs: env::var("HARVEST_PAGE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.page_timeout_secs),
            max_retries,
            reduced_retries: defaults.reduced_retries.min(max_retries),
            scroll_for_lazy_load: env::var("HARVEST_SCROLL_LAZY_LOAD")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(defaults.scroll_for_lazy_load),
            requests_per_second: env::var("HARVEST_REQUESTS_PER_SECOND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.requests_per_second),
            storage_dir: env::var("HARVEST_STORAGE_DIR").ok().map(PathBuf::from),
            retry: defaults.retry.clone().with_max_retries(max_retries),
            ..defaults
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_pages == 0 {
            return Err("max_concurrent_pages must be at least 1".to_string());
        }
        if self.image_concurrency_per_page == 0 {
            return Err("image_concurrency_per_page must be at least 1".to_string());
        }
        if self.task_timeout_secs == 0 {
            return Err("task_timeout_secs must be at least 1".to_string());
        }
        if self.page_timeout_secs == 0 || self.image_timeout_secs == 0 {
            return Err("fetch timeouts must be at least 1 second".to_string());
        }
        if self.reduced_retries > self.max_retries {
            return Err("reduced_retries cannot exceed max_retries".to_string());
        }
        if self.max_chars_per_page < 100 {
            return Err("max_chars_per_page must be at least 100".to_string());
        }
        if self.max_image_bytes == 0 {
            return Err("max_image_bytes must be positive".to_string());
        }
        Ok(())
    }

    /// Retry budget for `url`, reduced for known high-failure domains
    pub fn retries_for(&self, url: &str) -> u32 {
        if host_matches(url, &self.high_failure_domains) {
            self.reduced_retries
        } else {
            self.max_retries
        }
    }

    /// Retry policy for `url` with the per-domain budget applied
    pub fn retry_policy_for(&self, url: &str) -> RetryPolicy {
        self.retry.clone().with_max_retries(self.retries_for(url))
    }

    /// Whether a failure on `url` must not be remembered
    pub fn never_cache_failure(&self, url: &str) -> bool {
        host_matches(url, &self.never_cache_failure_domains)
    }

    /// Referer to send for `url`, if its host is hotlink-protected
    pub fn referer_for(&self, url: &str) -> Option<&str> {
        let host = host_of(url)?;
        self.referer_overrides
            .iter()
            .find(|(domain, _)| domain_matches(&host, domain))
            .map(|(_, referer)| referer.as_str())
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        let referer_overrides = [
            ("sinaimg.cn", "https://weibo.com/"),
            ("qpic.cn", "https://mp.weixin.qq.com/"),
            ("zhimg.com", "https://www.zhihu.com/"),
        ]
        .into_iter()
        .map(|(d, r)| (d.to_string(), r.to_string()))
        .collect();

        Self {
            max_concurrent_pages: 8,
            image_concurrency_per_page: 4,
            task_timeout_secs: 90,
            page_timeout_secs: 30,
            image_timeout_secs: 15,
            max_retries: 2,
            reduced_retries: 1,
            high_failure_domains: vec![
                "pinimg.com".to_string(),
                "fbcdn.net".to_string(),
                "cdninstagram.com".to_string(),
            ],
            never_cache_failure_domains: vec![
                "gov".to_string(),
                "gov.cn".to_string(),
                "gov.uk".to_string(),
            ],
            referer_overrides,
            max_image_bytes: 10 * 1024 * 1024,
            max_chars_per_page: 20_000,
            scroll_for_lazy_load: true,
            settle_millis: 1500,
            requests_per_second: 20,
            page_cache_ttl_secs: 1800,
            max_page_cache_entries: 500,
            retry: RetryPolicy::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            storage_dir: None,
        }
    }
}

fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}

fn domain_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches('.').to_lowercase();
    host == domain || host.ends_with(&format!(".{}", domain))
}

pub(crate) fn host_matches(url: &str, domains: &[String]) -> bool {
    match host_of(url) {
        Some(host) => domains.iter().any(|d| domain_matches(&host, d)),
        None => false,
    }
}
