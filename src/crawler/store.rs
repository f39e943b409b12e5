// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Content-addressed store
//!
//! Maps normalized URLs to content hashes and content hashes to one entry per
//! distinct payload. Both maps live behind a single lock so they always change
//! together; a URL whose bytes hash to a known payload is aliased onto the
//! existing entry instead of producing a second artifact.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, info};

use super::types::{EmbeddingMethod, ImageOutcome};

const SNAPSHOT_VERSION: u32 = 1;

/// Where the canonical copy of a payload lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ContentLocation {
    Path(PathBuf),
    Url(String),
}

/// One distinct payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentHashEntry {
    pub content_hash: String,
    pub location: ContentLocation,
    pub known_urls: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_related: Option<bool>,
    pub recorded_at_ms: i64,
}

impl ContentHashEntry {
    pub fn new(content_hash: impl Into<String>, location: ContentLocation) -> Self {
        Self {
            content_hash: content_hash.into(),
            location,
            known_urls: BTreeSet::new(),
            description: None,
            is_related: None,
            recorded_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>, is_related: bool) -> Self {
        self.description = Some(description.into());
        self.is_related = Some(is_related);
        self
    }

    /// Outcome a later reference to the same payload resolves to
    pub fn outcome(&self) -> ImageOutcome {
        match (&self.location, &self.description) {
            (ContentLocation::Path(path), _) => ImageOutcome::Local { path: path.clone() },
            (ContentLocation::Url(url), Some(description)) => ImageOutcome::Described {
                url: url.clone(),
                description: description.clone(),
                is_related: self.is_related.unwrap_or(true),
            },
            (ContentLocation::Url(url), None) => ImageOutcome::Deferred {
                url: url.clone(),
                embedding_method: EmbeddingMethod::ImageUrl,
            },
        }
    }
}

/// Result of [`ContentStore::record_entry`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// First time this payload was seen
    Inserted,
    /// Payload already known; the URL now maps onto the existing entry
    Aliased { existing: ContentHashEntry },
}

/// Why a URL is remembered as not worth fetching again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Fetch failed terminally or exhausted its retries
    FetchFailed,
    /// Fetched fine but rejected by the quality filter or the describer
    Filtered,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub urls: usize,
    pub entries: usize,
    pub failures: usize,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported snapshot version {0}")]
    Version(u32),
}

#[derive(Debug, Default)]
struct StoreState {
    url_to_hash: HashMap<String, String>,
    entries: HashMap<String, ContentHashEntry>,
    failures: HashMap<String, FailureKind>,
}

#[derive(Serialize, Deserialize)]
struct StoreSnapshot {
    version: u32,
    url_to_hash: HashMap<String, String>,
    entries: HashMap<String, ContentHashEntry>,
}

/// Process-lifetime URL/hash maps shared by every harvest task
#[derive(Debug, Default)]
pub struct ContentStore {
    state: RwLock<StoreState>,
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Canonical location for a URL that was already processed
    pub fn lookup(&self, url: &str) -> Option<ContentLocation> {
        self.lookup_entry(url).map(|e| e.location)
    }

    pub fn lookup_entry(&self, url: &str) -> Option<ContentHashEntry> {
        let state = self.read();
        let hash = state.url_to_hash.get(url)?;
        state.entries.get(hash).cloned()
    }

    pub fn lookup_by_hash(&self, hash: &str) -> Option<ContentHashEntry> {
        self.read().entries.get(hash).cloned()
    }

    /// Record `url` as resolving to `hash` stored at `location`
    pub fn record(&self, url: &str, hash: &str, location: ContentLocation) -> RecordOutcome {
        self.record_entry(url, ContentHashEntry::new(hash, location))
    }

    /// Insert `entry` for `url`, or alias `url` onto the existing entry for the same hash
    pub fn record_entry(&self, url: &str, mut entry: ContentHashEntry) -> RecordOutcome {
        let mut state = self.write();
        let hash = entry.content_hash.clone();
        state.failures.remove(url);
        state.url_to_hash.insert(url.to_string(), hash.clone());

        if let Some(existing) = state.entries.get_mut(&hash) {
            existing.known_urls.insert(url.to_string());
            debug!("Aliased {} onto existing payload {}", url, &hash[..hash.len().min(12)]);
            return RecordOutcome::Aliased {
                existing: existing.clone(),
            };
        }

        entry.known_urls.insert(url.to_string());
        state.entries.insert(hash, entry);
        RecordOutcome::Inserted
    }

    /// Map `url` onto an already-recorded payload
    pub fn alias(&self, url: &str, hash: &str) -> Option<ContentHashEntry> {
        let mut state = self.write();
        let entry = state.entries.get_mut(hash)?;
        entry.known_urls.insert(url.to_string());
        let entry = entry.clone();
        state.url_to_hash.insert(url.to_string(), hash.to_string());
        state.failures.remove(url);
        Some(entry)
    }

    pub fn mark_failed(&self, url: &str, kind: FailureKind) {
        self.write().failures.insert(url.to_string(), kind);
    }

    pub fn failure(&self, url: &str) -> Option<FailureKind> {
        self.read().failures.get(url).copied()
    }

    pub fn clear_failures(&self) {
        self.write().failures.clear();
    }

    pub fn url_count(&self) -> usize {
        self.read().url_to_hash.len()
    }

    pub fn entry_count(&self) -> usize {
        self.read().entries.len()
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.read();
        StoreStats {
            urls: state.url_to_hash.len(),
            entries: state.entries.len(),
            failures: state.failures.len(),
        }
    }

    /// Write a JSON snapshot of both maps; failure marks are not persisted
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let snapshot = {
            let state = self.read();
            StoreSnapshot {
                version: SNAPSHOT_VERSION,
                url_to_hash: state.url_to_hash.clone(),
                entries: state.entries.clone(),
            }
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&snapshot)?)?;
        fs::rename(&tmp, path)?;

        info!(
            "Saved content store: {} urls, {} payloads -> {}",
            snapshot.url_to_hash.len(),
            snapshot.entries.len(),
            path.display()
        );
        Ok(())
    }

    /// Load a snapshot written by [`ContentStore::save`]
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let bytes = fs::read(path)?;
        let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Version(snapshot.version));
        }

        // Drop mappings that point at missing entries
        let entries = snapshot.entries;
        let url_to_hash = snapshot
            .url_to_hash
            .into_iter()
            .filter(|(_, hash)| entries.contains_key(hash))
            .collect();

        Ok(Self {
            state: RwLock::new(StoreState {
                url_to_hash,
                entries,
                failures: HashMap::new(),
            }),
        })
    }
}
