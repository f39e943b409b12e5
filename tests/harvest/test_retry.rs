// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::mock::{page_html, test_config, MockEmbeddingProvider, MockFetcher};
use article_image_harvester::crawler::{FailureKind, FetchConfig, FetchError, HarvestMode, Harvester};
use article_image_harvester::vector::{EmbeddingClient, IndexConfig, IndexRegistry, IndexScope};
use std::sync::Arc;
use tempfile::TempDir;

fn harvester(config: FetchConfig, fetcher: Arc<MockFetcher>, dir: &TempDir) -> Arc<Harvester> {
    let embeddings = Arc::new(EmbeddingClient::new(Arc::new(MockEmbeddingProvider::new())));
    let registry = Arc::new(IndexRegistry::new(dir.path(), IndexConfig::default()));
    Arc::new(Harvester::new(config, fetcher, embeddings, registry))
}

async fn harvest_once(harvester: &Arc<Harvester>, page: &str) {
    harvester
        .harvest(&[page.to_string()], "lighthouses", HarvestMode::DirectEmbedding, &IndexScope::global(), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_image_404_is_attempted_once() {
    let missing = "https://img.example.com/photos/missing.jpg";
    let page = "https://news.example.com/story";
    let fetcher = Arc::new(MockFetcher::new().with_page(page, page_html("Story", &[missing])));
    let dir = TempDir::new().unwrap();
    let harvester = harvester(test_config(), fetcher.clone(), &dir);

    harvest_once(&harvester, page).await;

    assert_eq!(fetcher.image_fetches(missing), 1);
    assert_eq!(harvester.store().failure(missing), Some(FailureKind::FetchFailed));
}

#[tokio::test]
async fn test_page_404_is_attempted_once() {
    let page = "https://news.example.com/gone";
    let fetcher = Arc::new(MockFetcher::new());
    let dir = TempDir::new().unwrap();
    let harvester = harvester(test_config(), fetcher.clone(), &dir);

    let report = harvester
        .harvest(&[page.to_string()], "lighthouses", HarvestMode::DirectEmbedding, &IndexScope::global(), None)
        .await
        .unwrap();

    assert_eq!(fetcher.page_fetches(page), 1);
    assert!(!report.pages[0].is_ok());
    assert_eq!(report.stats.pages_failed, 1);
    assert_eq!(harvester.store().failure(page), Some(FailureKind::FetchFailed));

    // remembered, so the next run does not fetch it again
    let again = harvester
        .harvest(&[page.to_string()], "lighthouses", HarvestMode::DirectEmbedding, &IndexScope::global(), None)
        .await
        .unwrap();
    assert_eq!(fetcher.page_fetches(page), 1);
    assert!(!again.pages[0].is_ok());
    assert_eq!(again.stats.pages_failed, 1);
}

#[tokio::test]
async fn test_never_cache_domain_page_failures_are_forgotten() {
    let page = "https://www.health.gov/missing";
    let fetcher = Arc::new(MockFetcher::new());
    let dir = TempDir::new().unwrap();
    let harvester = harvester(test_config(), fetcher.clone(), &dir);

    harvest_once(&harvester, page).await;
    assert!(harvester.store().failure(page).is_none());

    harvest_once(&harvester, page).await;
    assert_eq!(fetcher.page_fetches(page), 2);
}

#[tokio::test]
async fn test_timeouts_exhaust_retry_budget() {
    let slow = "https://img.example.com/photos/slow.jpg";
    let page = "https://news.example.com/story";
    let fetcher = Arc::new(
        MockFetcher::new()
            .with_page(page, page_html("Story", &[slow]))
            .with_image_error(slow, FetchError::Timeout(slow.to_string())),
    );
    let dir = TempDir::new().unwrap();
    let config = test_config();
    let expected = config.max_retries as usize + 1;
    let harvester = harvester(config, fetcher.clone(), &dir);

    harvest_once(&harvester, page).await;

    assert_eq!(fetcher.image_fetches(slow), expected);
    assert_eq!(harvester.store().failure(slow), Some(FailureKind::FetchFailed));
}

#[tokio::test]
async fn test_high_failure_domain_gets_reduced_budget() {
    let pin = "https://i.pinimg.com/originals/board.jpg";
    let page = "https://news.example.com/story";
    let fetcher = Arc::new(
        MockFetcher::new()
            .with_page(page, page_html("Story", &[pin]))
            .with_image_error(pin, FetchError::ConnectionReset(pin.to_string())),
    );
    let dir = TempDir::new().unwrap();
    let config = test_config();
    let expected = config.reduced_retries as usize + 1;
    let harvester = harvester(config, fetcher.clone(), &dir);

    harvest_once(&harvester, page).await;

    assert_eq!(fetcher.image_fetches(pin), expected);
}

#[tokio::test]
async fn test_known_failure_not_refetched() {
    let missing = "https://img.example.com/photos/missing.jpg";
    let page = "https://news.example.com/story";
    let fetcher = Arc::new(MockFetcher::new().with_page(page, page_html("Story", &[missing])));
    let dir = TempDir::new().unwrap();
    let harvester = harvester(test_config(), fetcher.clone(), &dir);

    harvest_once(&harvester, page).await;
    let report = harvester
        .harvest(&[page.to_string()], "lighthouses", HarvestMode::DirectEmbedding, &IndexScope::global(), None)
        .await
        .unwrap();

    assert_eq!(fetcher.image_fetches(missing), 1);
    assert_eq!(report.stats.images_skipped_known_failure, 1);
}

#[tokio::test]
async fn test_never_cache_domain_failures_are_forgotten() {
    let gov = "https://images.health.gov/photos/chart.jpg";
    let page = "https://news.example.com/story";
    let fetcher = Arc::new(MockFetcher::new().with_page(page, page_html("Story", &[gov])));
    let dir = TempDir::new().unwrap();
    let harvester = harvester(test_config(), fetcher.clone(), &dir);

    harvest_once(&harvester, page).await;
    assert!(harvester.store().failure(gov).is_none());

    harvest_once(&harvester, page).await;
    assert_eq!(fetcher.image_fetches(gov), 2);
}
