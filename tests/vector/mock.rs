// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
#![allow(dead_code)]

use article_image_harvester::vector::{EmbedItem, EmbeddingError, EmbeddingProvider};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

/// Vector `[i + 1, 1, 0, ...]` for text `"item-i"`; listed items fail
#[derive(Default)]
pub struct IndexedProvider {
    pub failing: HashSet<String>,
    /// Drop the last vector of every multi-item batch
    pub short_batches: bool,
    pub calls: Mutex<Vec<usize>>,
}

impl IndexedProvider {
    pub fn failing_on(items: &[&str]) -> Self {
        Self {
            failing: items.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn short() -> Self {
        Self {
            short_batches: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }
}

pub fn item(i: usize) -> EmbedItem {
    EmbedItem::text(format!("item-{}", i))
}

fn vector_for(text: &str) -> Vec<f32> {
    let n: f32 = text.trim_start_matches("item-").parse().unwrap_or(0.0);
    vec![n + 1.0, 1.0, 0.0, 0.5]
}

#[async_trait]
impl EmbeddingProvider for IndexedProvider {
    async fn embed_batch(&self, items: &[EmbedItem]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.lock().unwrap().push(items.len());
        let mut out = Vec::new();
        for item in items {
            let EmbedItem::Text(text) = item else {
                return Err(EmbeddingError::InvalidResponse("text only".to_string()));
            };
            if self.failing.contains(text) {
                return Err(EmbeddingError::Request(format!("cannot embed {}", text)));
            }
            out.push(vector_for(text));
        }
        if self.short_batches && out.len() > 1 {
            out.pop();
        }
        Ok(out)
    }

    fn max_batch_size(&self) -> usize {
        30
    }

    fn name(&self) -> &str {
        "indexed"
    }
}
