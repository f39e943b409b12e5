// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::mock::{page_html, png_bytes, test_config, MockEmbeddingProvider, MockFetcher};
use article_image_harvester::crawler::{HarvestMode, Harvester, ImageOutcome};
use article_image_harvester::vector::{EmbeddingClient, IndexConfig, IndexRegistry, IndexScope};
use std::sync::Arc;
use tempfile::TempDir;

fn harvester(fetcher: Arc<MockFetcher>, dir: &TempDir) -> Arc<Harvester> {
    let embeddings = Arc::new(EmbeddingClient::new(Arc::new(MockEmbeddingProvider::new())));
    let registry = Arc::new(IndexRegistry::new(dir.path(), IndexConfig::default()));
    Arc::new(Harvester::new(test_config(), fetcher, embeddings, registry))
}

#[tokio::test]
async fn test_same_bytes_under_two_urls_share_one_entry() {
    let a1 = "https://img.example.com/photos/a.jpg?v=1";
    let a2 = "https://img.example.com/photos/a.jpg?v=2";
    let page = "https://news.example.com/story";
    let bytes = png_bytes(1);

    let fetcher = Arc::new(
        MockFetcher::new()
            .with_page(page, page_html("Story", &[a1, a2]))
            .with_image(a1, bytes.clone())
            .with_image(a2, bytes),
    );
    let dir = TempDir::new().unwrap();
    let harvester = harvester(fetcher.clone(), &dir);

    let report = harvester
        .harvest(&[page.to_string()], "lighthouses", HarvestMode::DirectEmbedding, &IndexScope::global(), None)
        .await
        .unwrap();

    let store = harvester.store();
    assert_eq!(store.entry_count(), 1);
    assert_eq!(store.url_count(), 2);
    assert_eq!(store.lookup(a1), store.lookup(a2));

    let entry = store.lookup_entry(a2).unwrap();
    assert!(entry.known_urls.contains(a1));
    assert!(entry.known_urls.contains(a2));

    // both references resolve to the same outcome, reported once
    assert_eq!(report.pages[0].image_references.len(), 1);
    assert_eq!(report.stats.images_accepted, 1);
    assert_eq!(report.stats.images_deduplicated, 1);
}

#[tokio::test]
async fn test_shared_image_fetched_once_across_pages() {
    let shared = "https://img.example.com/photos/shared.jpg";
    let pages: Vec<String> = (0..6).map(|i| format!("https://site{}.example.com/post", i)).collect();

    let mut fetcher = MockFetcher::new().with_image(shared, png_bytes(2));
    for page in &pages {
        fetcher = fetcher.with_page(page, page_html("Post", &[shared]));
    }
    let fetcher = Arc::new(fetcher);
    let dir = TempDir::new().unwrap();
    let harvester = harvester(fetcher.clone(), &dir);

    let report = harvester
        .harvest(&pages, "lighthouses", HarvestMode::DirectEmbedding, &IndexScope::global(), None)
        .await
        .unwrap();

    assert_eq!(fetcher.image_fetches(shared), 1);
    assert_eq!(harvester.store().entry_count(), 1);
    assert_eq!(report.stats.images_accepted, 1);
    assert_eq!(report.stats.images_deduplicated, 5);
    for page in &report.pages {
        assert_eq!(
            page.image_references,
            vec![ImageOutcome::Deferred {
                url: shared.to_string(),
                embedding_method: article_image_harvester::crawler::EmbeddingMethod::ImageUrl,
            }]
        );
    }
}

#[tokio::test]
async fn test_ad_domain_rejected_before_fetch() {
    let ad = "https://ad.doubleclick.net/photos/creative.jpg";
    let page = "https://news.example.com/story";
    let fetcher = Arc::new(
        MockFetcher::new()
            .with_page(page, page_html("Story", &[ad]))
            .with_image(ad, png_bytes(3)),
    );
    let dir = TempDir::new().unwrap();
    let harvester = harvester(fetcher.clone(), &dir);

    let report = harvester
        .harvest(&[page.to_string()], "lighthouses", HarvestMode::DirectEmbedding, &IndexScope::global(), None)
        .await
        .unwrap();

    assert_eq!(fetcher.total_image_fetches(), 0);
    assert_eq!(report.stats.images_prefiltered, 1);
    assert!(report.pages[0].image_references.is_empty());
}

#[tokio::test]
async fn test_relative_and_protocol_relative_references_resolve() {
    let page = "https://news.example.com/2024/story";
    let html = page_html("Story", &["/media/one.jpg", "//img.example.com/photos/two.jpg"]);
    let fetcher = Arc::new(
        MockFetcher::new()
            .with_page(page, html)
            .with_image("https://news.example.com/media/one.jpg", png_bytes(4))
            .with_image("https://img.example.com/photos/two.jpg", png_bytes(5)),
    );
    let dir = TempDir::new().unwrap();
    let harvester = harvester(fetcher.clone(), &dir);

    let report = harvester
        .harvest(&[page.to_string()], "lighthouses", HarvestMode::DirectEmbedding, &IndexScope::global(), None)
        .await
        .unwrap();

    assert_eq!(report.pages[0].image_references.len(), 2);
    assert_eq!(fetcher.image_fetches("https://news.example.com/media/one.jpg"), 1);
    assert_eq!(fetcher.image_fetches("https://img.example.com/photos/two.jpg"), 1);
}
