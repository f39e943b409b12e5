// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::mock::{image_url, registry_with_images, QueryProvider};
use article_image_harvester::placement::{Chapter, ImagePlacer, PlacementConfig, UsedImages};
use article_image_harvester::vector::{EmbeddingClient, IndexRegistry, IndexScope};
use std::sync::Arc;
use tempfile::TempDir;

fn chapter(heading: &str, paragraphs: &[&str]) -> Chapter {
    Chapter::new(heading, paragraphs.iter().map(|p| p.to_string()).collect())
}

fn placer(registry: Arc<IndexRegistry>, chapters: &[Chapter], config: PlacementConfig) -> ImagePlacer {
    let mut provider = QueryProvider::default();
    for chapter in chapters {
        provider = provider.with_query(&chapter.query_text(), vec![1.0, 0.0]);
    }
    ImagePlacer::new(registry, Arc::new(EmbeddingClient::new(Arc::new(provider))), config)
}

#[tokio::test]
async fn test_short_chapter_appends_extra_images() {
    let dir = TempDir::new().unwrap();
    let scope = IndexScope::article("alice", "a1");
    let registry = registry_with_images(dir.path(), &scope, &[0.9, 0.8, 0.7]).await;
    let chapters = vec![chapter("Harbour", &["First paragraph.", "Second paragraph."])];
    let placer = placer(registry, &chapters, PlacementConfig::default());

    let mut used = UsedImages::new();
    let placed = placer.place(&scope, &chapters, &mut used).await;

    let positions: Vec<_> = placed[0].images.iter().map(|i| i.paragraph_index).collect();
    assert_eq!(positions, vec![0, 2, 2]);
    assert_eq!(used.len(), 3);

    let expected = [
        "## Harbour".to_string(),
        format!("![picture 0]({})", image_url("img0")),
        "First paragraph.".to_string(),
        "Second paragraph.".to_string(),
        format!("![picture 1]({})", image_url("img1")),
        format!("![picture 2]({})", image_url("img2")),
    ]
    .join("\n\n");
    assert_eq!(placed[0].to_markdown(), expected);
}

#[tokio::test]
async fn test_quota_bounds_images_per_chapter() {
    let dir = TempDir::new().unwrap();
    let scope = IndexScope::article("alice", "a1");
    let registry = registry_with_images(dir.path(), &scope, &[0.95, 0.9, 0.85, 0.8, 0.75]).await;
    let chapters = vec![chapter("Coast", &["One.", "Two.", "Three.", "Four.", "Five.", "Six."])];
    let placer = placer(registry, &chapters, PlacementConfig::default());

    let placed = placer.place(&scope, &chapters, &mut UsedImages::new()).await;

    assert_eq!(placed[0].images.len(), 3);
    // best matches first, spread over the paragraphs
    assert_eq!(placed[0].images[0].matched.image.image_url, image_url("img0"));
    let positions: Vec<_> = placed[0].images.iter().map(|i| i.paragraph_index).collect();
    assert_eq!(positions, vec![0, 2, 4]);
    assert!(placed[0].images.windows(2).all(|w| w[0].matched.similarity_score >= w[1].matched.similarity_score));
}

#[tokio::test]
async fn test_raising_threshold_never_adds_images() {
    let dir = TempDir::new().unwrap();
    let scope = IndexScope::article("alice", "a1");
    let registry = registry_with_images(dir.path(), &scope, &[0.95, 0.8, 0.6, 0.3, -0.2]).await;
    let chapters = vec![chapter("Cliffs", &["One.", "Two.", "Three."])];

    let mut previous = usize::MAX;
    for threshold in [-1.0, 0.0, 0.5, 0.7, 0.9, 0.99] {
        let config = PlacementConfig {
            similarity_threshold: threshold,
            max_images_per_chapter: 5,
            ..PlacementConfig::default()
        };
        let placer = placer(registry.clone(), &chapters, config);
        let placed = placer.place(&scope, &chapters, &mut UsedImages::new()).await;

        let count = placed[0].images.len();
        assert!(count <= previous, "threshold {} placed {} after {}", threshold, count, previous);
        assert!(placed[0].images.iter().all(|i| i.matched.similarity_score >= threshold));
        previous = count;
    }
    assert_eq!(previous, 0);
}

#[tokio::test]
async fn test_images_not_reused_across_chapters() {
    let dir = TempDir::new().unwrap();
    let scope = IndexScope::article("alice", "a1");
    let registry = registry_with_images(dir.path(), &scope, &[0.9, 0.8, 0.7, 0.6]).await;
    let chapters = vec![
        chapter("Morning", &["Dawn over the bay."]),
        chapter("Evening", &["Dusk over the bay."]),
    ];
    let config = PlacementConfig {
        max_images_per_chapter: 2,
        ..PlacementConfig::default()
    };
    let placer = placer(registry, &chapters, config);

    let mut used = UsedImages::new();
    let placed = placer.place(&scope, &chapters, &mut used).await;

    let first: Vec<_> = placed[0].images.iter().map(|i| i.matched.image.image_url.clone()).collect();
    let second: Vec<_> = placed[1].images.iter().map(|i| i.matched.image.image_url.clone()).collect();
    assert_eq!(first, vec![image_url("img0"), image_url("img1")]);
    assert_eq!(second, vec![image_url("img2"), image_url("img3")]);
    assert_eq!(used.len(), 4);
}

#[tokio::test]
async fn test_falls_back_to_user_index() {
    let dir = TempDir::new().unwrap();
    let registry = registry_with_images(dir.path(), &IndexScope::user("alice"), &[0.9]).await;
    let chapters = vec![chapter("Pier", &["Wooden planks.", "Gulls."])];
    let placer = placer(registry, &chapters, PlacementConfig::default());

    let placed = placer
        .place(&IndexScope::article("alice", "a1"), &chapters, &mut UsedImages::new())
        .await;

    assert_eq!(placed[0].images.len(), 1);
    assert_eq!(placed[0].images[0].paragraph_index, 0);
}

#[tokio::test]
async fn test_missing_index_leaves_chapter_unchanged() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(IndexRegistry::new(dir.path(), Default::default()));
    let chapters = vec![chapter("Dunes", &["Sand.", "Grass."])];
    let placer = placer(registry, &chapters, PlacementConfig::default());

    let placed = placer
        .place(&IndexScope::article("bob", "b1"), &chapters, &mut UsedImages::new())
        .await;

    assert!(placed[0].images.is_empty());
    assert_eq!(placed[0].chapter, chapters[0]);
    assert_eq!(placed[0].to_markdown(), "## Dunes\n\nSand.\n\nGrass.");
}

#[tokio::test]
async fn test_embedding_failure_leaves_chapter_unchanged() {
    let dir = TempDir::new().unwrap();
    let scope = IndexScope::article("alice", "a1");
    let registry = registry_with_images(dir.path(), &scope, &[0.9]).await;
    let known = vec![chapter("Known", &["Text."])];
    let placer = placer(registry, &known, PlacementConfig::default());

    let unknown = vec![chapter("Unknown", &["Other text."])];
    let mut used = UsedImages::new();
    let placed = placer.place(&scope, &unknown, &mut used).await;

    assert!(placed[0].images.is_empty());
    assert!(used.is_empty());
}
