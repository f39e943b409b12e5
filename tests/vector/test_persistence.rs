// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use article_image_harvester::vector::{
    IndexConfig, IndexRegistry, IndexScope, VectorIndex, VectorPayload, PAYLOADS_FILE, VECTORS_FILE,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use tempfile::TempDir;

fn payload(i: usize) -> VectorPayload {
    VectorPayload::new(format!("https://cdn.example.com/{}.jpg", i)).with_description(format!("image {}", i))
}

fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}

#[tokio::test]
async fn test_index_survives_registry_restart() {
    let dir = TempDir::new().unwrap();
    let scope = IndexScope::article("alice", "a1");

    {
        let registry = IndexRegistry::new(dir.path(), IndexConfig::default());
        let handle = registry.open(&scope).await;
        let vectors = random_vectors(5, 8, 1);
        handle
            .write()
            .await
            .add_batch(vectors, (0..5).map(payload).collect())
            .unwrap();
        assert!(registry.persist(&scope).await.unwrap());
    }

    let registry = IndexRegistry::new(dir.path(), IndexConfig::default());
    let handle = registry.open(&scope).await;
    let index = handle.read().await;
    assert_eq!(index.size(), 5);
    assert_eq!(index.dimension(), Some(8));
    assert_eq!(index.payloads()[3], payload(3));
    assert_eq!(registry.metrics().await.loaded, 1);
}

#[tokio::test]
async fn test_corrupt_payloads_fail_closed() {
    let dir = TempDir::new().unwrap();
    let mut index = VectorIndex::default();
    index.add_batch(random_vectors(3, 4, 2), (0..3).map(payload).collect()).unwrap();
    index.save(dir.path()).unwrap();

    fs::write(dir.path().join(PAYLOADS_FILE), b"{ not json").unwrap();

    let mut reloaded = VectorIndex::default();
    assert!(!reloaded.load(dir.path()));
    assert!(reloaded.is_empty());
    assert_eq!(reloaded.dimension(), None);

    // still usable, with a fresh dimension
    reloaded.add(vec![1.0, 2.0], payload(9)).unwrap();
    assert_eq!(reloaded.dimension(), Some(2));
}

#[tokio::test]
async fn test_missing_artifact_fails_closed() {
    let dir = TempDir::new().unwrap();
    let mut index = VectorIndex::default();
    index.add_batch(random_vectors(3, 4, 3), (0..3).map(payload).collect()).unwrap();
    index.save(dir.path()).unwrap();
    fs::remove_file(dir.path().join(VECTORS_FILE)).unwrap();

    let mut reloaded = VectorIndex::default();
    assert!(!reloaded.load(dir.path()));
    assert!(reloaded.is_empty());
    assert!(!VectorIndex::exists_at(dir.path()));
}

#[tokio::test]
async fn test_scope_falls_back_to_user_then_global() {
    let dir = TempDir::new().unwrap();
    let registry = IndexRegistry::new(dir.path(), IndexConfig::default());
    let article = IndexScope::article("alice", "a1");

    assert!(registry.open_existing(&article).await.is_none());

    let global = registry.open(&IndexScope::global()).await;
    global.write().await.add(vec![1.0, 0.0], payload(1)).unwrap();
    let (resolved, _) = registry.open_existing(&article).await.unwrap();
    assert!(resolved.is_global());

    let user = registry.open(&IndexScope::user("alice")).await;
    user.write().await.add(vec![0.0, 1.0], payload(2)).unwrap();
    let (resolved, _) = registry.open_existing(&article).await.unwrap();
    assert_eq!(resolved, IndexScope::user("alice"));
}

#[tokio::test]
async fn test_clear_removes_artifacts() {
    let dir = TempDir::new().unwrap();
    let registry = IndexRegistry::new(dir.path(), IndexConfig::default());
    let scope = IndexScope::article("bob", "b1");

    let handle = registry.open(&scope).await;
    handle.write().await.add(vec![1.0, 1.0], payload(1)).unwrap();
    registry.persist(&scope).await.unwrap();
    assert!(VectorIndex::exists_at(&registry.scope_dir(&scope)));

    registry.clear(&scope).await.unwrap();
    assert!(handle.read().await.is_empty());
    assert!(!VectorIndex::exists_at(&registry.scope_dir(&scope)));
}

#[tokio::test]
async fn test_persist_all_and_close() {
    let dir = TempDir::new().unwrap();
    let registry = IndexRegistry::new(dir.path(), IndexConfig::default());
    for user in ["u1", "u2"] {
        let handle = registry.open(&IndexScope::user(user)).await;
        handle.write().await.add(vec![1.0, 0.5], payload(0)).unwrap();
    }

    assert_eq!(registry.persist_all().await.unwrap(), 2);
    registry.close(&IndexScope::user("u1")).await.unwrap();
    assert_eq!(registry.open_count().await, 1);
    assert!(VectorIndex::exists_at(&registry.scope_dir(&IndexScope::user("u1"))));
}

#[test]
fn test_ann_search_finds_exact_match() {
    let config = IndexConfig {
        min_vectors_for_ann: 20,
        ..IndexConfig::default()
    };
    let mut index = VectorIndex::new(config);
    let vectors = random_vectors(60, 16, 4);
    index
        .add_batch(vectors.clone(), (0..60).map(payload).collect())
        .unwrap();
    assert!(index.uses_ann());

    let hits = index.search(&vectors[7], 5).unwrap();
    assert_eq!(hits[0].payload, payload(7));
    assert!(hits[0].distance < 1e-3);
    assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
}
