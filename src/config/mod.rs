// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Top-level harvester configuration
//!
//! Every section is optional in a TOML file and falls back to its defaults.
//! `from_env` builds the same structure from environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::crawler::{FetchConfig, HarvestMode, PrefilterConfig, QualityThresholds};
use crate::placement::PlacementConfig;
use crate::vector::{EmbeddingConfig, IndexConfig};
use crate::vision::{RehostConfig, VlmConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid {section} config: {message}")]
    Invalid { section: &'static str, message: String },
}

impl ConfigError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "CONFIG_IO",
            ConfigError::Parse(_) => "CONFIG_PARSE",
            ConfigError::Invalid { .. } => "CONFIG_INVALID",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvesterConfig {
    pub fetch: FetchConfig,
    pub prefilter: PrefilterConfig,
    /// Fixed quality thresholds; when absent they follow the harvest mode
    pub quality: Option<QualityThresholds>,
    pub index: IndexConfig,
    pub embedding: EmbeddingConfig,
    pub vlm: VlmConfig,
    pub rehost: RehostConfig,
    pub placement: PlacementConfig,
    /// Root directory of the per-scope index artifacts
    pub index_root: PathBuf,
    /// Content store snapshot loaded before and saved after a harvest
    pub store_snapshot: Option<PathBuf>,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            prefilter: PrefilterConfig::default(),
            quality: None,
            index: IndexConfig::default(),
            embedding: EmbeddingConfig::default(),
            vlm: VlmConfig::default(),
            rehost: RehostConfig::default(),
            placement: PlacementConfig::default(),
            index_root: PathBuf::from("./data/indexes"),
            store_snapshot: None,
        }
    }
}

impl HarvesterConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let quality_overridden = env::vars().any(|(key, _)| key.starts_with("QUALITY_"));

        Self {
            fetch: FetchConfig::from_env(),
            prefilter: defaults.prefilter,
            quality: quality_overridden.then(|| QualityThresholds::from_env(HarvestMode::DirectEmbedding)),
            index: defaults.index,
            embedding: EmbeddingConfig::from_env(),
            vlm: VlmConfig::from_env(),
            rehost: RehostConfig::from_env(),
            placement: PlacementConfig::from_env(),
            index_root: env::var("HARVEST_INDEX_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.index_root),
            store_snapshot: env::var("HARVEST_STORE_SNAPSHOT").ok().map(PathBuf::from),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |section: &'static str| move |message: String| ConfigError::Invalid { section, message };

        self.fetch.validate().map_err(invalid("fetch"))?;
        self.prefilter.validate().map_err(invalid("prefilter"))?;
        if let Some(quality) = &self.quality {
            quality.validate().map_err(invalid("quality"))?;
        }
        self.index.validate().map_err(invalid("index"))?;
        self.embedding.validate().map_err(invalid("embedding"))?;
        self.vlm.validate().map_err(invalid("vlm"))?;
        self.placement.validate().map_err(invalid("placement"))?;
        Ok(())
    }
}
