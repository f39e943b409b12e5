// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Selects harvested images for generated chapters and inlines them

pub mod placer;
pub mod types;

pub use placer::{insertion_points, select_matches, ImagePlacer};
pub use types::{Chapter, MatchResult, PlacedChapter, PlacedImage, PlacementConfig, PlacementState, UsedImages};
