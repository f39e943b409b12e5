// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! URL-pattern prefilter for image candidates
//!
//! Pure function over a normalized URL; it runs before any network call so
//! rejected candidates cost nothing. Indicators match whole words of the
//! path and query (split on any non-alphanumeric character), so `icon`
//! rejects `/icons/x.png` and `/site-icon.png` but not `/iconic-bridge.jpg`.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use super::config::host_matches;

/// Why a candidate was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefilterReason {
    AdDomain(String),
    AdIndicator(String),
    IconIndicator(String),
    NonRasterFormat(String),
    Unparseable,
}

impl fmt::Display for PrefilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdDomain(host) => write!(f, "ad/tracking domain {}", host),
            Self::AdIndicator(pattern) => write!(f, "ad indicator '{}'", pattern),
            Self::IconIndicator(pattern) => write!(f, "icon/logo indicator '{}'", pattern),
            Self::NonRasterFormat(ext) => write!(f, "non-raster format .{}", ext),
            Self::Unparseable => write!(f, "unparseable URL"),
        }
    }
}

/// Prefilter pattern lists
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefilterConfig {
    pub ad_domains: Vec<String>,
    /// Words (or word runs such as `spacer.gif`) that mark ads and trackers
    pub ad_indicators: Vec<String>,
    /// Words that mark icons, logos, avatars and sprites
    pub icon_indicators: Vec<String>,
    pub non_raster_extensions: Vec<String>,
    /// Let vector formats through (e.g. for diagram-heavy themes)
    pub allow_vector_formats: bool,
}

impl Default for PrefilterConfig {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            ad_domains: owned(&[
                "doubleclick.net",
                "googlesyndication.com",
                "googleadservices.com",
                "google-analytics.com",
                "adservice.google.com",
                "amazon-adsystem.com",
                "adnxs.com",
                "criteo.com",
                "taboola.com",
                "outbrain.com",
                "scorecardresearch.com",
                "facebook.net",
                "hm.baidu.com",
                "cnzz.com",
            ]),
            ad_indicators: owned(&[
                "ads",
                "ad",
                "adv",
                "advert",
                "adverts",
                "advertisement",
                "banner",
                "banners",
                "sponsor",
                "sponsored",
                "promo",
                "tracking",
                "pixel",
                "1x1",
                "spacer.gif",
                "blank.gif",
                "adimg",
            ]),
            icon_indicators: owned(&[
                "favicon",
                "icon",
                "icons",
                "logo",
                "logos",
                "avatar",
                "avatars",
                "sprite",
                "sprites",
                "emoji",
                "badge",
                "badges",
                "qrcode",
                "loading.gif",
            ]),
            non_raster_extensions: owned(&["svg", "svgz", "ico", "cur"]),
            allow_vector_formats: false,
        }
    }
}

impl PrefilterConfig {
    pub fn validate(&self) -> Result<(), String> {
        let wordless = |s: &String| words(s).next().is_none();
        if self.ad_indicators.iter().any(wordless) || self.icon_indicators.iter().any(wordless) {
            return Err("prefilter indicators must contain at least one word".to_string());
        }
        Ok(())
    }
}

/// Rejects image candidates by URL pattern
#[derive(Debug, Clone, Default)]
pub struct Prefilter {
    config: PrefilterConfig,
}

impl Prefilter {
    pub fn new(config: PrefilterConfig) -> Self {
        Self { config }
    }

    /// `None` when the candidate may be fetched
    pub fn check(&self, url: &str) -> Option<PrefilterReason> {
        let parsed = match Url::parse(url) {
            Ok(u) => u,
            Err(_) => return Some(PrefilterReason::Unparseable),
        };

        if host_matches(url, &self.config.ad_domains) {
            let host = parsed.host_str().unwrap_or_default().to_string();
            return Some(PrefilterReason::AdDomain(host));
        }

        let path = parsed.path().to_lowercase();
        let text = match parsed.query() {
            Some(q) => format!("{}?{}", path, q.to_lowercase()),
            None => path.clone(),
        };

        let haystack: Vec<&str> = words(&text).collect();
        if let Some(pattern) = find_indicator(&haystack, &self.config.ad_indicators) {
            return Some(PrefilterReason::AdIndicator(pattern));
        }
        if let Some(pattern) = find_indicator(&haystack, &self.config.icon_indicators) {
            return Some(PrefilterReason::IconIndicator(pattern));
        }

        if !self.config.allow_vector_formats {
            if let Some(ext) = extension(&path) {
                if self.config.non_raster_extensions.iter().any(|e| *e == ext) {
                    return Some(PrefilterReason::NonRasterFormat(ext));
                }
            }
        }

        None
    }

    pub fn is_rejected(&self, url: &str) -> bool {
        self.check(url).is_some()
    }
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
}

/// First indicator whose words appear as a contiguous run in `haystack`
fn find_indicator(haystack: &[&str], indicators: &[String]) -> Option<String> {
    indicators
        .iter()
        .find(|indicator| {
            let lowered = indicator.to_lowercase();
            let pattern: Vec<&str> = words(&lowered).collect();
            !pattern.is_empty() && haystack.windows(pattern.len()).any(|run| run == pattern.as_slice())
        })
        .cloned()
}

fn extension(path: &str) -> Option<String> {
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    Some(ext.to_string())
}
