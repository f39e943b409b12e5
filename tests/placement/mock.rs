// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
#![allow(dead_code)]

use article_image_harvester::vector::{
    EmbedItem, EmbeddingError, EmbeddingProvider, IndexConfig, IndexRegistry, IndexScope, VectorPayload,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Returns registered vectors for exact texts and fails for anything else
#[derive(Default)]
pub struct QueryProvider {
    vectors: HashMap<String, Vec<f32>>,
}

impl QueryProvider {
    pub fn with_query(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }
}

#[async_trait]
impl EmbeddingProvider for QueryProvider {
    async fn embed_batch(&self, items: &[EmbedItem]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        items
            .iter()
            .map(|item| match item {
                EmbedItem::Text(text) => self
                    .vectors
                    .get(text)
                    .cloned()
                    .ok_or_else(|| EmbeddingError::InvalidResponse(format!("unknown query {:?}", text))),
                EmbedItem::ImageUrl(_) => Err(EmbeddingError::InvalidResponse("text only".to_string())),
            })
            .collect()
    }

    fn name(&self) -> &str {
        "query"
    }
}

/// Unit vector at cosine `similarity` from `[1, 0]`
pub fn at_similarity(similarity: f32) -> Vec<f32> {
    vec![similarity, (1.0 - similarity * similarity).max(0.0).sqrt()]
}

pub fn image_url(name: &str) -> String {
    format!("https://cdn.example.com/{}.jpg", name)
}

/// Registry under `root` whose `scope` index holds one image per similarity
pub async fn registry_with_images(root: &Path, scope: &IndexScope, similarities: &[f32]) -> Arc<IndexRegistry> {
    let registry = Arc::new(IndexRegistry::new(root, IndexConfig::default()));
    let handle = registry.open(scope).await;
    let mut index = handle.write().await;
    for (i, similarity) in similarities.iter().enumerate() {
        let payload = VectorPayload::new(image_url(&format!("img{}", i)))
            .with_description(format!("picture {}", i));
        index.add(at_similarity(*similarity), payload).unwrap();
    }
    drop(index);
    registry
}
