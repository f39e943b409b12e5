// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod cli;
pub mod config;
pub mod crawler;
pub mod placement;
pub mod vector;
pub mod vision;

// Re-export main types
pub use config::{ConfigError, HarvesterConfig};
pub use crawler::{
    ContentStore, FetchConfig, FetchError, Fetcher, HarvestError, HarvestMode, HarvestReport,
    HarvestTarget, Harvester, HttpFetcher, ImageOutcome, PageResult,
};
pub use placement::{Chapter, ImagePlacer, PlacedChapter, PlacementConfig, UsedImages};
pub use vector::{
    EmbedItem, EmbeddingClient, EmbeddingProvider, IndexRegistry, IndexScope, VectorIndex,
    VectorPayload,
};
pub use vision::{ImageDescriber, ImageDescription, ImageRehoster};
