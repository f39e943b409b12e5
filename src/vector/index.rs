// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Vector index for image embeddings
//!
//! Ordered records plus a similarity structure. The dimension is bound by the
//! first insertion; every later vector must match it. Small indexes are
//! searched exactly, larger ones through HNSW with cosine distance.
//!
//! ## Persistence
//!
//! An index is saved as two co-located artifacts:
//! - `vectors.bin`: bincode-encoded dimension and vectors
//! - `payloads.json`: payload list, index-aligned with the vectors
//!
//! Loading fails closed: if either artifact is missing, unreadable or out of
//! step with the other, the index is left empty and reusable.

use hnsw_rs::hnsw::{Hnsw, Neighbour};
use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const VECTORS_FILE: &str = "vectors.bin";
pub const PAYLOADS_FILE: &str = "payloads.json";

const FORMAT_VERSION: u32 = 1;

/// Index tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// HNSW max connections per node
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// Capacity hint for the HNSW graph
    pub max_elements: usize,
    /// Below this size search is an exact linear scan
    pub min_vectors_for_ann: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            max_elements: 100_000,
            min_vectors_for_ann: 256,
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.m == 0 || self.ef_construction == 0 || self.ef_search == 0 {
            return Err("HNSW parameters must be positive".to_string());
        }
        if self.min_vectors_for_ann == 0 {
            return Err("min_vectors_for_ann must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Metadata stored alongside each vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorPayload {
    /// Stable (rehosted when available) image URL
    pub image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_id: Option<String>,
}

impl VectorPayload {
    pub fn new(image_url: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
            page_url: None,
            description: None,
            content_hash: None,
            theme: None,
            article_id: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_page_url(mut self, page_url: impl Into<String>) -> Self {
        self.page_url = Some(page_url.into());
        self
    }
}

/// One search result
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Cosine distance, `1 - similarity`
    pub distance: f32,
    pub payload: VectorPayload,
}

impl SearchHit {
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Invalid vector: {0}")]
    InvalidVector(String),

    #[error("Got {vectors} vectors but {payloads} payloads")]
    LengthMismatch { vectors: usize, payloads: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl IndexError {
    pub fn error_code(&self) -> &'static str {
        match self {
            IndexError::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            IndexError::InvalidVector(_) => "INVALID_VECTOR",
            IndexError::LengthMismatch { .. } => "LENGTH_MISMATCH",
            IndexError::Io(_) => "INDEX_IO",
            IndexError::Serialization(_) => "INDEX_SERIALIZATION",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct VectorsArtifact {
    version: u32,
    dimension: Option<usize>,
    vectors: Vec<Vec<f32>>,
}

/// Nearest-neighbour index over normalized vectors
pub struct VectorIndex {
    config: IndexConfig,
    dimension: Option<usize>,
    vectors: Vec<Vec<f32>>,
    payloads: Vec<VectorPayload>,
    image_urls: HashSet<String>,
    hnsw: Option<Hnsw<'static, f32, DistCosine>>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dimension", &self.dimension)
            .field("size", &self.payloads.len())
            .field("ann", &self.hnsw.is_some())
            .finish()
    }
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new(IndexConfig::default())
    }
}

impl VectorIndex {
    pub fn new(config: IndexConfig) -> Self {
        Self {
            config,
            dimension: None,
            vectors: Vec::new(),
            payloads: Vec::new(),
            image_urls: HashSet::new(),
            hnsw: None,
        }
    }

    /// Prepare for use; the dimension stays unbound until the first insert
    pub fn init(&mut self) {
        debug!("Vector index initialised (dimension {:?})", self.dimension);
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Number of records; equals the payload count
    pub fn size(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn contains_url(&self, image_url: &str) -> bool {
        self.image_urls.contains(image_url)
    }

    pub fn payloads(&self) -> &[VectorPayload] {
        &self.payloads
    }

    pub fn uses_ann(&self) -> bool {
        self.hnsw.is_some()
    }

    pub fn add(&mut self, vector: Vec<f32>, payload: VectorPayload) -> Result<(), IndexError> {
        let normalized = self.check_vector(&vector, self.dimension)?;
        self.dimension.get_or_insert(normalized.len());
        self.push(normalized, payload);
        self.refresh_ann();
        Ok(())
    }

    /// Insert many records; nothing is inserted unless every vector is valid
    pub fn add_batch(
        &mut self,
        vectors: Vec<Vec<f32>>,
        payloads: Vec<VectorPayload>,
    ) -> Result<usize, IndexError> {
        if vectors.len() != payloads.len() {
            return Err(IndexError::LengthMismatch {
                vectors: vectors.len(),
                payloads: payloads.len(),
            });
        }
        if vectors.is_empty() {
            return Ok(0);
        }

        let mut dimension = self.dimension;
        let mut normalized = Vec::with_capacity(vectors.len());
        for vector in &vectors {
            let n = self.check_vector(vector, dimension)?;
            dimension.get_or_insert(n.len());
            normalized.push(n);
        }

        self.dimension = dimension;
        let added = normalized.len();
        for (vector, payload) in normalized.into_iter().zip(payloads) {
            self.push(vector, payload);
        }
        self.refresh_ann();
        debug!("Added {} vectors, index size {}", added, self.size());
        Ok(added)
    }

    /// `k` nearest records in ascending distance
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, IndexError> {
        let Some(dimension) = self.dimension else {
            return Ok(Vec::new());
        };
        if query.len() != dimension {
            return Err(IndexError::DimensionMismatch {
                expected: dimension,
                got: query.len(),
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let query = normalize_vector(query)
            .ok_or_else(|| IndexError::InvalidVector("zero or non-finite query".to_string()))?;

        let mut scored: Vec<(usize, f32)> = match &self.hnsw {
            Some(hnsw) => {
                let ef = self.config.ef_search.max(k);
                let neighbours: Vec<Neighbour> = hnsw.search(&query, k, ef);
                neighbours
                    .into_iter()
                    .filter(|n| n.d_id < self.payloads.len())
                    .map(|n| (n.d_id, n.distance))
                    .collect()
            }
            None => self
                .vectors
                .iter()
                .enumerate()
                .map(|(idx, v)| (idx, cosine_distance(&query, v)))
                .collect(),
        };

        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(idx, distance)| SearchHit {
                distance,
                payload: self.payloads[idx].clone(),
            })
            .collect())
    }

    /// Drop every record and unbind the dimension
    pub fn clear(&mut self) {
        self.dimension = None;
        self.vectors.clear();
        self.payloads.clear();
        self.image_urls.clear();
        self.hnsw = None;
    }

    /// Write both artifacts into `dir`
    pub fn save(&self, dir: &Path) -> Result<(), IndexError> {
        fs::create_dir_all(dir)?;

        let artifact = VectorsArtifact {
            version: FORMAT_VERSION,
            dimension: self.dimension,
            vectors: self.vectors.clone(),
        };
        let vector_bytes =
            bincode::serialize(&artifact).map_err(|e| IndexError::Serialization(e.to_string()))?;
        let payload_bytes = serde_json::to_vec(&self.payloads)
            .map_err(|e| IndexError::Serialization(e.to_string()))?;

        let vectors_tmp = dir.join(format!("{}.tmp", VECTORS_FILE));
        let payloads_tmp = dir.join(format!("{}.tmp", PAYLOADS_FILE));
        fs::write(&vectors_tmp, vector_bytes)?;
        fs::write(&payloads_tmp, payload_bytes)?;
        fs::rename(&vectors_tmp, dir.join(VECTORS_FILE))?;
        fs::rename(&payloads_tmp, dir.join(PAYLOADS_FILE))?;

        info!("Saved vector index ({} records) to {}", self.size(), dir.display());
        Ok(())
    }

    /// Replace the contents with the artifacts in `dir`
    ///
    /// Returns `false` and leaves the index empty when the pair is missing
    /// or inconsistent; never loads partially.
    pub fn load(&mut self, dir: &Path) -> bool {
        self.clear();
        match Self::read_artifacts(dir) {
            Ok((dimension, vectors, payloads)) => {
                for (vector, payload) in vectors.into_iter().zip(payloads) {
                    self.push(vector, payload);
                }
                self.dimension = dimension;
                self.refresh_ann();
                info!("Loaded vector index ({} records) from {}", self.size(), dir.display());
                true
            }
            Err(reason) => {
                if dir.join(VECTORS_FILE).exists() || dir.join(PAYLOADS_FILE).exists() {
                    warn!("Discarding vector index at {}: {}", dir.display(), reason);
                } else {
                    debug!("No vector index at {}", dir.display());
                }
                false
            }
        }
    }

    /// Whether `dir` holds both artifacts
    pub fn exists_at(dir: &Path) -> bool {
        dir.join(VECTORS_FILE).is_file() && dir.join(PAYLOADS_FILE).is_file()
    }

    fn read_artifacts(
        dir: &Path,
    ) -> Result<(Option<usize>, Vec<Vec<f32>>, Vec<VectorPayload>), String> {
        let vector_bytes = fs::read(dir.join(VECTORS_FILE)).map_err(|e| e.to_string())?;
        let payload_bytes = fs::read(dir.join(PAYLOADS_FILE)).map_err(|e| e.to_string())?;

        let artifact: VectorsArtifact =
            bincode::deserialize(&vector_bytes).map_err(|e| e.to_string())?;
        let payloads: Vec<VectorPayload> =
            serde_json::from_slice(&payload_bytes).map_err(|e| e.to_string())?;

        if artifact.version != FORMAT_VERSION {
            return Err(format!("unsupported format version {}", artifact.version));
        }
        if artifact.vectors.len() != payloads.len() {
            return Err(format!(
                "{} vectors vs {} payloads",
                artifact.vectors.len(),
                payloads.len()
            ));
        }
        match artifact.dimension {
            Some(dim) => {
                if artifact
                    .vectors
                    .iter()
                    .any(|v| v.len() != dim || v.iter().any(|x| !x.is_finite()))
                {
                    return Err("vector dimension or values inconsistent".to_string());
                }
            }
            None if !artifact.vectors.is_empty() => {
                return Err("vectors present without a dimension".to_string());
            }
            None => {}
        }

        Ok((artifact.dimension, artifact.vectors, payloads))
    }

    fn check_vector(&self, vector: &[f32], dimension: Option<usize>) -> Result<Vec<f32>, IndexError> {
        if vector.is_empty() {
            return Err(IndexError::InvalidVector("empty vector".to_string()));
        }
        if let Some(expected) = dimension {
            if vector.len() != expected {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    got: vector.len(),
                });
            }
        }
        normalize_vector(vector)
            .ok_or_else(|| IndexError::InvalidVector("zero or non-finite vector".to_string()))
    }

    fn push(&mut self, vector: Vec<f32>, payload: VectorPayload) {
        let id = self.vectors.len();
        if let Some(hnsw) = &self.hnsw {
            hnsw.insert((&vector, id));
        }
        self.image_urls.insert(payload.image_url.clone());
        self.vectors.push(vector);
        self.payloads.push(payload);
    }

    /// Build the HNSW graph once the index is large enough
    fn refresh_ann(&mut self) {
        if self.hnsw.is_some() || self.vectors.len() < self.config.min_vectors_for_ann {
            return;
        }

        let nb_elem = self.vectors.len().max(self.config.max_elements);
        let nb_layer = 16.min((nb_elem as f32).ln().trunc() as usize).max(1);
        let hnsw = Hnsw::<f32, DistCosine>::new(
            self.config.m,
            nb_elem,
            nb_layer,
            self.config.ef_construction,
            DistCosine {},
        );
        let data: Vec<(&Vec<f32>, usize)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(idx, v)| (v, idx))
            .collect();
        hnsw.parallel_insert(&data);

        debug!("Built HNSW graph over {} vectors", self.vectors.len());
        self.hnsw = Some(hnsw);
    }
}

/// Scale to unit length; `None` for zero or non-finite input
pub fn normalize_vector(vector: &[f32]) -> Option<Vec<f32>> {
    if vector.iter().any(|x| !x.is_finite()) {
        return None;
    }
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    Some(vector.iter().map(|x| x / norm).collect())
}

/// Calculate cosine distance (1 - cosine similarity).
/// Lower values mean vectors are more similar.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }

    1.0 - (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}
