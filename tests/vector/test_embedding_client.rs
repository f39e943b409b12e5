// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::mock::{item, IndexedProvider};
use article_image_harvester::vector::{EmbeddingClient, VectorIndex, VectorPayload};
use std::sync::Arc;

#[tokio::test]
async fn test_failed_item_excluded_from_index() {
    let provider = Arc::new(IndexedProvider::failing_on(&["item-2"]));
    let client = EmbeddingClient::new(provider.clone());
    let items: Vec<_> = (0..5).map(item).collect();

    let results = client.embed(&items).await;

    assert_eq!(results.len(), 5);
    assert!(results[2].is_none());
    assert_eq!(results.iter().filter(|r| r.is_some()).count(), 4);
    // failed batch of 5, then one call per item
    assert_eq!(provider.calls(), vec![5, 1, 1, 1, 1, 1]);

    let mut vectors = Vec::new();
    let mut payloads = Vec::new();
    for (i, result) in results.into_iter().enumerate() {
        if let Some(vector) = result {
            vectors.push(vector);
            payloads.push(VectorPayload::new(format!("https://cdn.example.com/{}.jpg", i)));
        }
    }

    let mut index = VectorIndex::default();
    assert_eq!(index.add_batch(vectors, payloads).unwrap(), 4);
    assert_eq!(index.size(), 4);
    assert!(!index.contains_url("https://cdn.example.com/2.jpg"));
    assert!(index.contains_url("https://cdn.example.com/4.jpg"));
}

#[tokio::test]
async fn test_short_response_falls_back_to_single_items() {
    let provider = Arc::new(IndexedProvider::short());
    let client = EmbeddingClient::new(provider.clone());
    let items: Vec<_> = (0..3).map(item).collect();

    let results = client.embed(&items).await;

    assert!(results.iter().all(|r| r.is_some()));
    assert_eq!(provider.calls(), vec![3, 1, 1, 1]);
    // order preserved through the fallback
    assert_eq!(results[1].as_ref().unwrap()[0], 2.0);
}

#[tokio::test]
async fn test_empty_input_makes_no_calls() {
    let provider = Arc::new(IndexedProvider::default());
    let client = EmbeddingClient::new(provider.clone());

    assert!(client.embed(&[]).await.is_empty());
    assert!(provider.calls().is_empty());
}
