// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::mock::{
    page_html, png_bytes, test_config, MockDescriber, MockEmbeddingProvider, MockFetcher, MockRehoster,
};
use article_image_harvester::crawler::{
    FailureKind, FetchConfig, HarvestError, HarvestMode, Harvester, ImageOutcome, ProgressCallback,
};
use article_image_harvester::vector::{
    EmbeddingClient, IndexConfig, IndexRegistry, IndexScope, VectorIndex,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    fetcher: Arc<MockFetcher>,
    describer: Arc<MockDescriber>,
    rehoster: Arc<MockRehoster>,
    registry: Arc<IndexRegistry>,
    harvester: Arc<Harvester>,
    _dir: TempDir,
}

fn fixture(config: FetchConfig, fetcher: MockFetcher, describer: MockDescriber) -> Fixture {
    fixture_with_embeddings(config, fetcher, describer, MockEmbeddingProvider::new())
}

fn fixture_with_embeddings(
    config: FetchConfig,
    fetcher: MockFetcher,
    describer: MockDescriber,
    provider: MockEmbeddingProvider,
) -> Fixture {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(fetcher);
    let describer = Arc::new(describer);
    let rehoster = Arc::new(MockRehoster::default());
    let registry = Arc::new(IndexRegistry::new(dir.path().join("indexes"), IndexConfig::default()));
    let embeddings = Arc::new(EmbeddingClient::new(Arc::new(provider)));

    let harvester = Arc::new(
        Harvester::new(config, fetcher.clone(), embeddings, registry.clone())
            .with_describer(describer.clone())
            .with_rehoster(rehoster.clone()),
    );
    Fixture {
        fetcher,
        describer,
        rehoster,
        registry,
        harvester,
        _dir: dir,
    }
}

fn urls(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_results_in_input_order_with_progress() {
    let pages = ["https://a.example.com/1", "not a url", "https://b.example.com/2", "https://c.example.com/3"];
    let mut fetcher = MockFetcher::new();
    for page in [pages[0], pages[2], pages[3]] {
        fetcher = fetcher.with_page(page, page_html(page, &[]));
    }
    let fx = fixture(test_config(), fetcher, MockDescriber::new());

    let seen: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let progress: ProgressCallback = Arc::new(move |done, total| recorder.lock().unwrap().push((done, total)));

    let report = fx
        .harvester
        .harvest(&urls(&pages), "lighthouses", HarvestMode::DirectEmbedding, &IndexScope::global(), Some(progress))
        .await
        .unwrap();

    assert_eq!(report.pages.len(), 4);
    assert_eq!(report.pages[0].original_url, pages[0]);
    assert_eq!(report.pages[1].error.as_deref(), Some("invalid page URL"));
    assert_eq!(report.pages[2].original_url, pages[2]);
    assert_eq!(report.pages[3].original_url, pages[3]);
    assert_eq!(report.pages[3].title.as_deref(), Some(pages[3]));

    assert_eq!(*seen.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
    assert_eq!(report.stats.pages_ok, 3);
    assert_eq!(report.stats.pages_failed, 1);
}

#[tokio::test]
async fn test_no_valid_urls_is_an_error() {
    let fx = fixture(test_config(), MockFetcher::new(), MockDescriber::new());
    let err = fx
        .harvester
        .harvest(&urls(&["", "mailto:x@example.com"]), "t", HarvestMode::DirectEmbedding, &IndexScope::global(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, HarvestError::NoValidUrls { supplied: 2 }));
    assert_eq!(err.error_code(), "NO_VALID_URLS");
}

#[tokio::test]
async fn test_mode_requirements_checked() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(IndexRegistry::new(dir.path(), IndexConfig::default()));
    let embeddings = Arc::new(EmbeddingClient::new(Arc::new(MockEmbeddingProvider::new())));
    let bare = Arc::new(Harvester::new(test_config(), Arc::new(MockFetcher::new()), embeddings, registry));
    let pages = urls(&["https://a.example.com/1"]);

    let err = bare
        .harvest(&pages, "t", HarvestMode::Multimodal, &IndexScope::global(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::InvalidConfig(_)));

    let err = bare
        .harvest(&pages, "t", HarvestMode::None, &IndexScope::global(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::InvalidConfig(_)));
}

#[tokio::test]
async fn test_stuck_task_reported_as_timeout() {
    let slow = "https://slow.example.com/page";
    let fast = "https://fast.example.com/page";
    let fetcher = MockFetcher::new()
        .with_slow_page(slow, page_html("Slow", &[]), Duration::from_secs(10))
        .with_page(fast, page_html("Fast", &[]));
    let config = FetchConfig {
        task_timeout_secs: 1,
        ..test_config()
    };
    let fx = fixture(config, fetcher, MockDescriber::new());

    let report = fx
        .harvester
        .harvest(&urls(&[slow, fast]), "t", HarvestMode::DirectEmbedding, &IndexScope::global(), None)
        .await
        .unwrap();

    assert!(report.pages[0].error.as_deref().unwrap().contains("timed out"));
    assert!(report.pages[1].is_ok());
    assert_eq!(report.stats.pages_timed_out, 1);
    // abandoned, not retried
    assert_eq!(fx.fetcher.page_fetches(slow), 1);
}

#[tokio::test]
async fn test_multimodal_describes_rehosts_and_indexes() {
    let related = "https://img.example.com/photos/related.jpg";
    let unrelated = "https://img.example.com/photos/unrelated.jpg";
    let junk = "https://img.example.com/photos/junk.jpg";
    let page = "https://news.example.com/story";
    let fetcher = MockFetcher::new()
        .with_page(page, page_html("Story", &[related, unrelated, junk]))
        .with_image(related, png_bytes(10))
        .with_image(unrelated, png_bytes(11))
        .with_image(junk, png_bytes(12));
    let describer = MockDescriber::new().unrelated(unrelated).deleting(junk);
    let fx = fixture(test_config(), fetcher, describer);
    let scope = IndexScope::article("alice", "a1");

    let report = fx
        .harvester
        .harvest(&urls(&[page]), "lighthouses", HarvestMode::Multimodal, &scope, None)
        .await
        .unwrap();

    let refs = &report.pages[0].image_references;
    assert_eq!(refs.len(), 2);
    assert!(refs.iter().all(|r| r.url().unwrap().starts_with("https://rehost.example.com/")));
    assert!(refs.iter().any(|r| matches!(r, ImageOutcome::Described { is_related: false, .. })));

    assert_eq!(fx.describer.call_count(), 3);
    assert_eq!(fx.rehoster.call_count(), 2);
    assert_eq!(report.stats.images_discarded_by_describer, 1);
    assert_eq!(report.stats.images_indexed, 1);
    assert_eq!(fx.harvester.store().failure(junk), Some(FailureKind::Filtered));

    // persisted at the end of the run
    let dir = fx.registry.scope_dir(&scope);
    assert!(VectorIndex::exists_at(&dir));
    let mut reloaded = VectorIndex::default();
    assert!(reloaded.load(&dir));
    assert_eq!(reloaded.size(), 1);
    assert_eq!(reloaded.payloads()[0].image_url, "https://rehost.example.com/related.jpg");
    assert_eq!(reloaded.payloads()[0].article_id.as_deref(), Some("a1"));
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let images = [
        "https://img.example.com/photos/one.jpg",
        "https://img.example.com/photos/two.jpg",
    ];
    let page = "https://news.example.com/story";
    let fetcher = MockFetcher::new()
        .with_page(page, page_html("Story", &images))
        .with_image(images[0], png_bytes(20))
        .with_image(images[1], png_bytes(21));
    let fx = fixture(test_config(), fetcher, MockDescriber::new());
    let scope = IndexScope::article("alice", "a1");

    let first = fx
        .harvester
        .harvest(&urls(&[page]), "lighthouses", HarvestMode::Multimodal, &scope, None)
        .await
        .unwrap();
    let size_after_first = fx.registry.open(&scope).await.read().await.size();
    let second = fx
        .harvester
        .harvest(&urls(&[page]), "lighthouses", HarvestMode::Multimodal, &scope, None)
        .await
        .unwrap();

    assert_eq!(size_after_first, 2);
    assert_eq!(fx.registry.open(&scope).await.read().await.size(), 2);
    assert_eq!(first.pages[0].image_references, second.pages[0].image_references);
    assert_eq!(fx.fetcher.total_page_fetches(), 1);
    assert_eq!(fx.fetcher.total_image_fetches(), 2);
    assert_eq!(fx.describer.call_count(), 2);
    assert_eq!(second.stats.pages_from_cache, 1);
    assert_eq!(second.stats.images_deduplicated, 2);
}

#[tokio::test]
async fn test_mode_none_writes_content_addressed_files() {
    let image = "https://img.example.com/photos/one.jpg";
    let page = "https://news.example.com/story";
    let fetcher = MockFetcher::new()
        .with_page(page, page_html("Story", &[image]))
        .with_image(image, png_bytes(30));
    let storage = TempDir::new().unwrap();
    let config = FetchConfig {
        storage_dir: Some(storage.path().to_path_buf()),
        ..test_config()
    };
    let fx = fixture(config, fetcher, MockDescriber::new());

    let report = fx
        .harvester
        .harvest(&urls(&[page]), "lighthouses", HarvestMode::None, &IndexScope::global(), None)
        .await
        .unwrap();

    let path = match &report.pages[0].image_references[0] {
        ImageOutcome::Local { path } => path.clone(),
        other => panic!("expected local outcome, got {:?}", other),
    };
    assert!(path.exists());
    assert!(path.starts_with(storage.path()));
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("png"));

    let hash = fx.harvester.store().lookup_entry(image).unwrap().content_hash;
    assert_eq!(path.file_stem().and_then(|s| s.to_str()), Some(hash.as_str()));
    assert_eq!(
        path.parent().and_then(|p| p.file_name()).and_then(|n| n.to_str()),
        Some(&hash[..2])
    );
}

#[tokio::test]
async fn test_small_images_rejected_and_remembered() {
    let tiny = "https://img.example.com/photos/tiny.jpg";
    let page = "https://news.example.com/story";
    let fetcher = MockFetcher::new()
        .with_page(page, page_html("Story", &[tiny]))
        .with_image(tiny, vec![0xFF, 0xD8, 0xFF, 0xE0, 0, 0]);
    let fx = fixture(test_config(), fetcher, MockDescriber::new());

    let report = fx
        .harvester
        .harvest(&urls(&[page]), "lighthouses", HarvestMode::DirectEmbedding, &IndexScope::global(), None)
        .await
        .unwrap();

    assert_eq!(report.stats.images_quality_rejected, 1);
    assert!(report.pages[0].image_references.is_empty());
    assert_eq!(fx.harvester.store().failure(tiny), Some(FailureKind::Filtered));
}

#[tokio::test]
async fn test_deferred_images_indexed_in_one_step() {
    let images = [
        "https://img.example.com/photos/one.jpg",
        "https://img.example.com/photos/two.jpg",
        "https://img.example.com/photos/three.jpg",
    ];
    let page = "https://news.example.com/story";
    let fetcher = MockFetcher::new()
        .with_page(page, page_html("Story", &images))
        .with_image(images[0], png_bytes(40))
        .with_image(images[1], png_bytes(41))
        .with_image(images[2], png_bytes(42));
    let fx = fixture(test_config(), fetcher, MockDescriber::new());
    let scope = IndexScope::article("bob", "b1");

    let report = fx
        .harvester
        .harvest(&urls(&[page]), "lighthouses", HarvestMode::DirectEmbedding, &scope, None)
        .await
        .unwrap();
    assert_eq!(fx.registry.open(&scope).await.read().await.size(), 0);

    let first = fx.harvester.index_deferred(&scope, &report.pages).await.unwrap();
    assert_eq!(first.requested, 3);
    assert_eq!(first.indexed, 3);
    assert_eq!(first.failed, 0);

    let second = fx.harvester.index_deferred(&scope, &report.pages).await.unwrap();
    assert_eq!(second.already_indexed, 3);
    assert_eq!(second.indexed, 0);
    assert!(VectorIndex::exists_at(&fx.registry.scope_dir(&scope)));
}

#[tokio::test]
async fn test_wrong_dimension_embedding_excluded_from_deferred_batch() {
    let images = [
        "https://img.example.com/photos/one.jpg",
        "https://img.example.com/photos/two.jpg",
        "https://img.example.com/photos/three.jpg",
    ];
    let page = "https://news.example.com/story";
    let fetcher = MockFetcher::new()
        .with_page(page, page_html("Story", &images))
        .with_image(images[0], png_bytes(50))
        .with_image(images[1], png_bytes(51))
        .with_image(images[2], png_bytes(52));
    let provider = MockEmbeddingProvider::new().with_vector(images[1], vec![1.0, 0.5]);
    let fx = fixture_with_embeddings(test_config(), fetcher, MockDescriber::new(), provider);
    let scope = IndexScope::article("bob", "b2");

    let report = fx
        .harvester
        .harvest(&urls(&[page]), "lighthouses", HarvestMode::DirectEmbedding, &scope, None)
        .await
        .unwrap();
    let deferred = fx.harvester.index_deferred(&scope, &report.pages).await.unwrap();

    assert_eq!(deferred.requested, 3);
    assert_eq!(deferred.indexed, 2);
    assert_eq!(deferred.failed, 1);

    let handle = fx.registry.open(&scope).await;
    let index = handle.read().await;
    assert_eq!(index.size(), 2);
    assert_eq!(index.dimension(), Some(8));
    assert!(index.contains_url(images[0]));
    assert!(!index.contains_url(images[1]));
    assert!(index.contains_url(images[2]));
}

#[tokio::test]
async fn test_wrong_dimension_description_embedding_counted_as_failed() {
    let images = [
        "https://img.example.com/photos/one.jpg",
        "https://img.example.com/photos/two.jpg",
        "https://img.example.com/photos/three.jpg",
    ];
    let page = "https://news.example.com/story";
    let fetcher = MockFetcher::new()
        .with_page(page, page_html("Story", &images))
        .with_image(images[0], png_bytes(60))
        .with_image(images[1], png_bytes(61))
        .with_image(images[2], png_bytes(62));
    let odd_description = format!("lighthouses photo at {}", images[1]);
    let provider = MockEmbeddingProvider::new().with_vector(&odd_description, vec![0.3, 0.7]);
    let fx = fixture_with_embeddings(test_config(), fetcher, MockDescriber::new(), provider);
    let scope = IndexScope::article("alice", "a2");

    let report = fx
        .harvester
        .harvest(&urls(&[page]), "lighthouses", HarvestMode::Multimodal, &scope, None)
        .await
        .unwrap();

    assert_eq!(report.pages[0].image_references.len(), 3);
    assert_eq!(report.stats.images_indexed, 2);
    assert_eq!(report.stats.embeddings_failed, 1);
    assert_eq!(fx.registry.open(&scope).await.read().await.size(), 2);
}

#[tokio::test]
async fn test_timed_out_task_releases_single_flight_entries() {
    let slow = "https://img.example.com/photos/slow.jpg";
    let page = "https://news.example.com/story";
    let fetcher = MockFetcher::new()
        .with_page(page, page_html("Story", &[slow]))
        .with_slow_image(slow, png_bytes(70), Duration::from_secs(10));
    let config = FetchConfig {
        task_timeout_secs: 1,
        ..test_config()
    };
    let fx = fixture(config, fetcher, MockDescriber::new());

    let report = fx
        .harvester
        .harvest(&urls(&[page]), "lighthouses", HarvestMode::DirectEmbedding, &IndexScope::global(), None)
        .await
        .unwrap();

    assert_eq!(report.stats.pages_timed_out, 1);
    assert_eq!(fx.fetcher.image_fetches(slow), 1);
    assert_eq!(fx.harvester.inflight_count(), 0);
}
