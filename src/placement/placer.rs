// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Chapter image matching and placement
//!
//! For each chapter: embed the chapter text, take the top-K neighbours from
//! the article's index (falling back to the user, then global index), drop
//! matches below the similarity threshold or already used in the article,
//! and spread up to `max_images_per_chapter` images over the paragraphs.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::types::{Chapter, MatchResult, PlacedChapter, PlacedImage, PlacementConfig, PlacementState, UsedImages};
use crate::crawler::url_normalizer::canonical_identity;
use crate::vector::{EmbedItem, EmbeddingClient, IndexRegistry, IndexScope, SearchHit};

/// Chapters shorter than this get extra images appended instead of spread
const MIN_PARAGRAPHS_FOR_SPREAD: usize = 3;

pub struct ImagePlacer {
    registry: Arc<IndexRegistry>,
    embeddings: Arc<EmbeddingClient>,
    config: PlacementConfig,
}

impl ImagePlacer {
    pub fn new(registry: Arc<IndexRegistry>, embeddings: Arc<EmbeddingClient>, config: PlacementConfig) -> Self {
        Self {
            registry,
            embeddings,
            config,
        }
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    /// Place images into every chapter of an article, in order
    pub async fn place(&self, scope: &IndexScope, chapters: &[Chapter], used: &mut UsedImages) -> Vec<PlacedChapter> {
        let mut placed = Vec::with_capacity(chapters.len());
        for (chapter_index, chapter) in chapters.iter().enumerate() {
            placed.push(self.place_chapter(scope, chapter_index, chapter, used).await);
        }

        let total: usize = placed.iter().map(|c| c.images.len()).sum();
        info!(
            "Placed {} images across {} chapters for {}",
            total,
            chapters.len(),
            scope
        );
        placed
    }

    /// Place images into one chapter; `used` gains every image placed
    pub async fn place_chapter(
        &self,
        scope: &IndexScope,
        chapter_index: usize,
        chapter: &Chapter,
        used: &mut UsedImages,
    ) -> PlacedChapter {
        let mut state = PlacementState::Idle;
        let unchanged = || PlacedChapter::unchanged(chapter_index, chapter.clone());

        state = advance(state, PlacementState::Searching, chapter_index);
        let Some(hits) = self.search(scope, chapter).await else {
            return unchanged();
        };

        state = advance(state, PlacementState::Thresholding, chapter_index);
        let matches = select_matches(
            chapter_index,
            hits,
            self.config.similarity_threshold,
            used,
            self.config.max_images_per_chapter,
        );
        if matches.is_empty() {
            info!(
                "No image above threshold {} for chapter {} ({:?})",
                self.config.similarity_threshold, chapter_index, chapter.heading
            );
            return unchanged();
        }

        state = advance(state, PlacementState::Placing, chapter_index);
        let positions = insertion_points(
            chapter.paragraphs.len(),
            matches.len(),
            self.config.max_images_per_chapter,
        );
        let images: Vec<PlacedImage> = matches
            .into_iter()
            .zip(positions)
            .map(|(matched, paragraph_index)| {
                used.insert(&matched.image.image_url);
                PlacedImage {
                    paragraph_index,
                    matched,
                }
            })
            .collect();

        advance(state, PlacementState::Done, chapter_index);
        PlacedChapter {
            chapter_index,
            chapter: chapter.clone(),
            images,
        }
    }

    async fn search(&self, scope: &IndexScope, chapter: &Chapter) -> Option<Vec<SearchHit>> {
        let query = chapter.query_text();
        if query.is_empty() {
            debug!("Chapter has no text to search with");
            return None;
        }

        let Some((resolved, handle)) = self.registry.open_existing(scope).await else {
            info!("No populated index for {} or its fallbacks", scope);
            return None;
        };
        let vector = self.embeddings.embed_one(&EmbedItem::text(query)).await?;

        let index = handle.read().await;
        match index.search(&vector, self.config.top_k) {
            Ok(hits) => {
                debug!("{} hits from {} for chapter {:?}", hits.len(), resolved, chapter.heading);
                Some(hits)
            }
            Err(e) => {
                info!("Chapter search failed on {}: {}", resolved, e);
                None
            }
        }
    }
}

fn advance(from: PlacementState, to: PlacementState, chapter_index: usize) -> PlacementState {
    debug!("Chapter {}: {:?} -> {:?}", chapter_index, from, to);
    to
}

/// Hits (ascending distance) above `threshold`, not yet used, at most `quota`
pub fn select_matches(
    chapter_index: usize,
    hits: Vec<SearchHit>,
    threshold: f32,
    used: &UsedImages,
    quota: usize,
) -> Vec<MatchResult> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|hit| hit.similarity() >= threshold)
        .filter(|hit| !used.contains(&hit.payload.image_url))
        .filter(|hit| seen.insert(canonical_identity(&hit.payload.image_url)))
        .take(quota)
        .map(|hit| MatchResult {
            chapter_index,
            similarity_score: hit.similarity(),
            image: hit.payload,
        })
        .collect()
}

/// Paragraph index each of `count` images is inserted before
///
/// The first image goes at the start. With fewer than three paragraphs the
/// rest are appended (index == `paragraphs`); otherwise image `i` goes
/// before paragraph `floor(paragraphs / quota) * i`, clamped to
/// `[1, paragraphs - 1]`.
pub fn insertion_points(paragraphs: usize, count: usize, quota: usize) -> Vec<usize> {
    let step = paragraphs / quota.max(1);
    (0..count)
        .map(|i| {
            if i == 0 {
                0
            } else if paragraphs < MIN_PARAGRAPHS_FOR_SPREAD {
                paragraphs
            } else {
                (step * i).clamp(1, paragraphs - 1)
            }
        })
        .collect()
}
