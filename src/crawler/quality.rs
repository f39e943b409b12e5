// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Image quality filter
//!
//! Inspects downloaded bytes before any embedding or description call.
//! Checks short-circuit in a fixed order: byte size, format, dimensions,
//! area, aspect ratio. A rejection is a logged skip, never an error.

use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;

use super::types::HarvestMode;
use crate::vision::image_utils::{inspect_image, ImageError, ImageInfo};

/// Thresholds applied by [`ImageQualityFilter`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    /// Minimum payload size in bytes
    pub min_bytes: usize,
    pub min_width: u32,
    pub min_height: u32,
    pub min_area: u64,
    /// Long side over short side
    pub max_aspect_ratio: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_bytes: 8 * 1024,
            min_width: 150,
            min_height: 150,
            min_area: 40_000,
            max_aspect_ratio: 4.0,
        }
    }
}

impl QualityThresholds {
    /// Defaults for a harvest mode; multimodal pays per description so it is stricter
    pub fn for_mode(mode: HarvestMode) -> Self {
        match mode {
            HarvestMode::Multimodal => Self {
                min_bytes: 15 * 1024,
                ..Self::default()
            },
            HarvestMode::DirectEmbedding | HarvestMode::None => Self::default(),
        }
    }

    /// Load overrides from environment variables
    pub fn from_env(mode: HarvestMode) -> Self {
        let defaults = Self::for_mode(mode);
        Self {
            min_bytes: env::var("QUALITY_MIN_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.min_bytes),
            min_width: env::var("QUALITY_MIN_WIDTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.min_width),
            min_height: env::var("QUALITY_MIN_HEIGHT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.min_height),
            min_area: env::var("QUALITY_MIN_AREA")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.min_area),
            max_aspect_ratio: env::var("QUALITY_MAX_ASPECT_RATIO")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_aspect_ratio),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_aspect_ratio < 1.0 {
            return Err("max_aspect_ratio must be at least 1.0".to_string());
        }
        if self.min_width == 0 || self.min_height == 0 {
            return Err("min_width and min_height must be positive".to_string());
        }
        Ok(())
    }
}

/// Why an image was rejected
#[derive(Debug, Clone, PartialEq)]
pub enum QualityRejection {
    TooSmallBytes { size: usize, min: usize },
    UnsupportedFormat,
    VectorFormat,
    IconFormat,
    Unreadable(String),
    TooNarrow { width: u32, height: u32 },
    TooSmallArea { area: u64, min: u64 },
    ExtremeAspectRatio { ratio: f64, max: f64 },
}

impl fmt::Display for QualityRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmallBytes { size, min } => write!(f, "{} bytes < {} minimum", size, min),
            Self::UnsupportedFormat => write!(f, "unsupported format"),
            Self::VectorFormat => write!(f, "vector format"),
            Self::IconFormat => write!(f, "icon format"),
            Self::Unreadable(e) => write!(f, "unreadable header: {}", e),
            Self::TooNarrow { width, height } => write!(f, "{}x{} below minimum side", width, height),
            Self::TooSmallArea { area, min } => write!(f, "area {} < {}", area, min),
            Self::ExtremeAspectRatio { ratio, max } => {
                write!(f, "aspect ratio {:.2} > {:.2}", ratio, max)
            }
        }
    }
}

/// Outcome of a quality inspection
#[derive(Debug, Clone, PartialEq)]
pub struct QualityVerdict {
    pub rejected: bool,
    pub reason: Option<QualityRejection>,
    pub dimensions: Option<(u32, u32)>,
    pub format: Option<ImageFormat>,
}

impl QualityVerdict {
    fn accept(info: &ImageInfo) -> Self {
        Self {
            rejected: false,
            reason: None,
            dimensions: Some((info.width, info.height)),
            format: Some(info.format),
        }
    }

    fn reject(reason: QualityRejection, info: Option<&ImageInfo>) -> Self {
        Self {
            rejected: true,
            reason: Some(reason),
            dimensions: info.map(|i| (i.width, i.height)),
            format: info.map(|i| i.format),
        }
    }
}

/// Byte-level quality gate
#[derive(Debug, Clone, Default)]
pub struct ImageQualityFilter {
    thresholds: QualityThresholds,
}

impl ImageQualityFilter {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self { thresholds }
    }

    pub fn for_mode(mode: HarvestMode) -> Self {
        Self::new(QualityThresholds::for_mode(mode))
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    pub fn inspect(&self, bytes: &[u8]) -> QualityVerdict {
        let t = &self.thresholds;

        if bytes.len() < t.min_bytes {
            return QualityVerdict::reject(
                QualityRejection::TooSmallBytes {
                    size: bytes.len(),
                    min: t.min_bytes,
                },
                None,
            );
        }

        let info = match inspect_image(bytes) {
            Ok(info) => info,
            Err(ImageError::VectorFormat) => {
                return QualityVerdict::reject(QualityRejection::VectorFormat, None)
            }
            Err(ImageError::UnsupportedFormat) | Err(ImageError::EmptyData) => {
                return QualityVerdict::reject(QualityRejection::UnsupportedFormat, None)
            }
            Err(ImageError::DecodeFailed(e)) => {
                return QualityVerdict::reject(QualityRejection::Unreadable(e), None)
            }
        };

        if info.format == ImageFormat::Ico {
            return QualityVerdict::reject(QualityRejection::IconFormat, Some(&info));
        }

        if info.width < t.min_width || info.height < t.min_height {
            return QualityVerdict::reject(
                QualityRejection::TooNarrow {
                    width: info.width,
                    height: info.height,
                },
                Some(&info),
            );
        }

        if info.area() < t.min_area {
            return QualityVerdict::reject(
                QualityRejection::TooSmallArea {
                    area: info.area(),
                    min: t.min_area,
                },
                Some(&info),
            );
        }

        let ratio = info.aspect_ratio();
        if ratio > t.max_aspect_ratio {
            return QualityVerdict::reject(
                QualityRejection::ExtremeAspectRatio {
                    ratio,
                    max: t.max_aspect_ratio,
                },
                Some(&info),
            );
        }

        QualityVerdict::accept(&info)
    }
}
