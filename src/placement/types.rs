// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Placement data types

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;

use crate::crawler::url_normalizer::canonical_identity;
use crate::vector::VectorPayload;

/// A generated article section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Chapter {
    pub heading: String,
    /// Only used to build the retrieval query
    pub subheadings: Vec<String>,
    pub paragraphs: Vec<String>,
}

impl Chapter {
    pub fn new(heading: impl Into<String>, paragraphs: Vec<String>) -> Self {
        Self {
            heading: heading.into(),
            subheadings: Vec::new(),
            paragraphs,
        }
    }

    /// Split a markdown body into paragraphs on blank lines
    pub fn from_markdown(heading: impl Into<String>, body: &str) -> Self {
        let paragraphs = body
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        Self::new(heading, paragraphs)
    }

    pub fn with_subheadings(mut self, subheadings: Vec<String>) -> Self {
        self.subheadings = subheadings;
        self
    }

    /// Heading, subheadings and body as one retrieval query
    pub fn query_text(&self) -> String {
        let mut parts = Vec::with_capacity(1 + self.subheadings.len() + self.paragraphs.len());
        parts.push(self.heading.as_str());
        parts.extend(self.subheadings.iter().map(String::as_str));
        parts.extend(self.paragraphs.iter().map(String::as_str));
        parts
            .into_iter()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Nearest neighbours retrieved per chapter (default: 10)
    pub top_k: usize,
    /// Minimum cosine similarity; 0.0 is permissive, 0.5 strict
    pub similarity_threshold: f32,
    /// Per-chapter quota (default: 3)
    pub max_images_per_chapter: usize,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            similarity_threshold: 0.0,
            max_images_per_chapter: 3,
        }
    }
}

impl PlacementConfig {
    /// Threshold used with text-only descriptions
    pub fn strict() -> Self {
        Self {
            similarity_threshold: 0.5,
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            top_k: env::var("PLACEMENT_TOP_K")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.top_k),
            similarity_threshold: env::var("PLACEMENT_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.similarity_threshold),
            max_images_per_chapter: env::var("PLACEMENT_MAX_IMAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_images_per_chapter),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.top_k == 0 {
            return Err("top_k must be at least 1".to_string());
        }
        if self.max_images_per_chapter == 0 {
            return Err("max_images_per_chapter must be at least 1".to_string());
        }
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(format!(
                "similarity_threshold must be within [-1, 1], got {}",
                self.similarity_threshold
            ));
        }
        Ok(())
    }
}

/// Placer progress for one chapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementState {
    Idle,
    Searching,
    Thresholding,
    Placing,
    Done,
}

/// A retrieved image that passed thresholding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub chapter_index: usize,
    pub image: VectorPayload,
    pub similarity_score: f32,
}

/// Image identities already placed somewhere in an article
///
/// Keyed by canonical identity, so the same image under a different scheme
/// or `www.` prefix counts as used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedImages {
    identities: BTreeSet<String>,
}

impl UsedImages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.identities.contains(&canonical_identity(url))
    }

    /// `false` if the image was already used
    pub fn insert(&mut self, url: &str) -> bool {
        self.identities.insert(canonical_identity(url))
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// An image inserted before paragraph `paragraph_index`; equal to the
/// paragraph count when appended at the end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedImage {
    pub paragraph_index: usize,
    #[serde(flatten)]
    pub matched: MatchResult,
}

/// A chapter with its images placed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedChapter {
    pub chapter_index: usize,
    pub chapter: Chapter,
    pub images: Vec<PlacedImage>,
}

impl PlacedChapter {
    pub fn unchanged(chapter_index: usize, chapter: Chapter) -> Self {
        Self {
            chapter_index,
            chapter,
            images: Vec::new(),
        }
    }

    /// Markdown with images inlined between paragraphs
    pub fn to_markdown(&self) -> String {
        let mut blocks = Vec::new();
        if !self.chapter.heading.trim().is_empty() {
            blocks.push(format!("## {}", self.chapter.heading.trim()));
        }

        let paragraph_count = self.chapter.paragraphs.len();
        for position in 0..=paragraph_count {
            blocks.extend(
                self.images
                    .iter()
                    .filter(|img| img.paragraph_index.min(paragraph_count) == position)
                    .map(|img| image_markdown(&img.matched.image)),
            );
            if let Some(paragraph) = self.chapter.paragraphs.get(position) {
                blocks.push(paragraph.clone());
            }
        }
        blocks.join("\n\n")
    }
}

fn image_markdown(image: &VectorPayload) -> String {
    let alt: String = image
        .description
        .as_deref()
        .unwrap_or("image")
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | '\n' | '\r'))
        .collect();
    format!("![{}]({})", alt.trim(), image.image_url)
}
