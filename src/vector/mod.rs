// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Vector storage for harvested images
//!
//! Per-scope nearest-neighbour indexes, the registry that owns them, and the
//! batching embedding client that feeds them.

pub mod embeddings;
pub mod index;
pub mod registry;

pub use embeddings::{
    is_valid_vector, EmbedItem, EmbeddingClient, EmbeddingConfig, EmbeddingError,
    EmbeddingProvider, HttpEmbeddingProvider,
};
pub use index::{
    cosine_distance, normalize_vector, IndexConfig, IndexError, SearchHit, VectorIndex,
    VectorPayload, PAYLOADS_FILE, VECTORS_FILE,
};
pub use registry::{IndexHandle, IndexRegistry, IndexScope, RegistryMetricsSnapshot};
