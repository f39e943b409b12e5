// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Scoped vector index registry
//!
//! Indexes are scoped to (user, article). Handles are created or loaded from
//! disk on first use and cached for the life of the registry. Lookups for
//! reading fall back from the article scope to the user scope, then to the
//! process-global scope.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task;
use tracing::{debug, info, warn};

use super::index::{IndexConfig, IndexError, VectorIndex, PAYLOADS_FILE, VECTORS_FILE};

/// Shared handle to one scoped index; readers run concurrently, writers and
/// `save` are serialized
pub type IndexHandle = Arc<RwLock<VectorIndex>>;

const GLOBAL_KEY: &str = "_global";
const USER_SCOPE_DIR: &str = "_user";
const NO_USER_DIR: &str = "_anonymous";

/// (user, article) scope of an index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IndexScope {
    pub user: Option<String>,
    pub article: Option<String>,
}

impl IndexScope {
    pub fn article(user: impl Into<String>, article: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            article: Some(article.into()),
        }
    }

    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            article: None,
        }
    }

    pub fn global() -> Self {
        Self::default()
    }

    /// Build from optional parts, treating blank strings as absent
    pub fn from_parts(user: Option<&str>, article: Option<&str>) -> Self {
        let clean = |s: Option<&str>| {
            s.map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            user: clean(user),
            article: clean(article),
        }
    }

    pub fn is_global(&self) -> bool {
        self.user.is_none() && self.article.is_none()
    }

    /// This scope followed by its fallbacks, most specific first
    pub fn fallback_chain(&self) -> Vec<IndexScope> {
        let mut chain = vec![self.clone()];
        if self.article.is_some() {
            if let Some(user) = &self.user {
                chain.push(IndexScope::user(user.clone()));
            }
        }
        if !self.is_global() {
            chain.push(IndexScope::global());
        }
        chain
    }

    /// Relative directory for this scope's artifacts
    pub fn relative_dir(&self) -> PathBuf {
        match (&self.user, &self.article) {
            (None, None) => PathBuf::from(GLOBAL_KEY),
            (Some(user), None) => PathBuf::from(sanitize(user)).join(USER_SCOPE_DIR),
            (Some(user), Some(article)) => PathBuf::from(sanitize(user)).join(sanitize(article)),
            (None, Some(article)) => PathBuf::from(NO_USER_DIR).join(sanitize(article)),
        }
    }
}

impl fmt::Display for IndexScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.user, &self.article) {
            (None, None) => write!(f, "global"),
            (Some(u), None) => write!(f, "user:{}", u),
            (Some(u), Some(a)) => write!(f, "user:{}/article:{}", u, a),
            (None, Some(a)) => write!(f, "article:{}", a),
        }
    }
}

/// Path-safe form of a scope component
fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() || cleaned.starts_with('_') && cleaned.chars().all(|c| c == '_') {
        format!("x{}", cleaned)
    } else {
        cleaned
    }
}

/// Registry counters
#[derive(Debug, Default)]
pub struct RegistryMetrics {
    pub created: AtomicUsize,
    pub loaded: AtomicUsize,
    pub persisted: AtomicUsize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryMetricsSnapshot {
    pub created: usize,
    pub loaded: usize,
    pub persisted: usize,
    pub open_handles: usize,
}

/// Explicit owner of every open index; no global singleton
pub struct IndexRegistry {
    root: PathBuf,
    config: IndexConfig,
    handles: Mutex<HashMap<IndexScope, IndexHandle>>,
    metrics: RegistryMetrics,
}

impl IndexRegistry {
    pub fn new(root: impl Into<PathBuf>, config: IndexConfig) -> Self {
        Self {
            root: root.into(),
            config,
            handles: Mutex::new(HashMap::new()),
            metrics: RegistryMetrics::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scope_dir(&self, scope: &IndexScope) -> PathBuf {
        self.root.join(scope.relative_dir())
    }

    /// Handle for exactly `scope`, loading it from disk or creating it empty
    ///
    /// The disk load runs on the blocking pool with the handle map unlocked;
    /// if two opens race, the first to insert wins.
    pub async fn open(&self, scope: &IndexScope) -> IndexHandle {
        if let Some(handle) = self.handles.lock().await.get(scope) {
            return handle.clone();
        }

        let dir = self.scope_dir(scope);
        let config = self.config.clone();
        let loaded = task::spawn_blocking(move || load_or_create(config, &dir)).await;
        let (index, from_disk) = match loaded {
            Ok(result) => result,
            Err(e) => {
                warn!("Loading index for {} failed: {}", scope, e);
                (empty_index(self.config.clone()), false)
            }
        };

        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(scope) {
            return handle.clone();
        }
        if from_disk {
            self.metrics.loaded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.created.fetch_add(1, Ordering::Relaxed);
            debug!("Created empty index for {}", scope);
        }

        let handle = Arc::new(RwLock::new(index));
        handles.insert(scope.clone(), handle.clone());
        handle
    }

    /// First non-empty index along the fallback chain of `scope`
    pub async fn open_existing(&self, scope: &IndexScope) -> Option<(IndexScope, IndexHandle)> {
        for candidate in scope.fallback_chain() {
            let cached = self.handles.lock().await.get(&candidate).cloned();
            let handle = match cached {
                Some(handle) => handle,
                None if VectorIndex::exists_at(&self.scope_dir(&candidate)) => {
                    self.open(&candidate).await
                }
                None => continue,
            };
            if !handle.read().await.is_empty() {
                if candidate != *scope {
                    debug!("Index scope {} resolved via fallback {}", scope, candidate);
                }
                return Some((candidate, handle));
            }
        }
        None
    }

    /// Save `scope` if it is open
    pub async fn persist(&self, scope: &IndexScope) -> Result<bool, IndexError> {
        let handle = self.handles.lock().await.get(scope).cloned();
        match handle {
            Some(handle) => {
                handle.read().await.save(&self.scope_dir(scope))?;
                self.metrics.persisted.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Save every open index; returns how many were written
    pub async fn persist_all(&self) -> Result<usize, IndexError> {
        let open: Vec<(IndexScope, IndexHandle)> = self
            .handles
            .lock()
            .await
            .iter()
            .map(|(s, h)| (s.clone(), h.clone()))
            .collect();

        for (scope, handle) in &open {
            handle.read().await.save(&self.scope_dir(scope))?;
            self.metrics.persisted.fetch_add(1, Ordering::Relaxed);
        }
        info!("Persisted {} vector indexes under {}", open.len(), self.root.display());
        Ok(open.len())
    }

    /// Persist and forget `scope`
    pub async fn close(&self, scope: &IndexScope) -> Result<(), IndexError> {
        self.persist(scope).await?;
        self.handles.lock().await.remove(scope);
        Ok(())
    }

    /// Empty `scope` in memory and remove its artifacts
    pub async fn clear(&self, scope: &IndexScope) -> Result<(), IndexError> {
        let handle = self.open(scope).await;
        handle.write().await.clear();

        let dir = self.scope_dir(scope);
        for file in [VECTORS_FILE, PAYLOADS_FILE] {
            let path = dir.join(file);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        info!("Cleared vector index for {}", scope);
        Ok(())
    }

    pub async fn open_count(&self) -> usize {
        self.handles.lock().await.len()
    }

    pub async fn metrics(&self) -> RegistryMetricsSnapshot {
        RegistryMetricsSnapshot {
            created: self.metrics.created.load(Ordering::Relaxed),
            loaded: self.metrics.loaded.load(Ordering::Relaxed),
            persisted: self.metrics.persisted.load(Ordering::Relaxed),
            open_handles: self.open_count().await,
        }
    }
}

fn empty_index(config: IndexConfig) -> VectorIndex {
    let mut index = VectorIndex::new(config);
    index.init();
    index
}

fn load_or_create(config: IndexConfig, dir: &Path) -> (VectorIndex, bool) {
    let mut index = empty_index(config);
    let loaded = index.load(dir);
    (index, loaded)
}
