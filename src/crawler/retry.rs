// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Retry policy with exponential backoff and jitter
//!
//! Retry decisions are a pure match on [`FetchError`] variants; no error
//! message is ever inspected.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::fetcher::FetchError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    /// Upper bound of the random jitter added to every delay
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 500,
            max_delay_ms: 8000,
            exponential_base: 2.0,
            jitter_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before retry number `retry` (0-based), capped at `max_delay_ms`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.exponential_base.powi(retry as i32);
        let capped = if base.is_finite() {
            (base as u64).min(self.max_delay_ms)
        } else {
            self.max_delay_ms
        };
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter).min(self.max_delay_ms + self.jitter_ms))
    }

    /// Run `op` until it succeeds, fails terminally, or the retry budget is spent
    ///
    /// Terminal errors return after a single attempt. On exhaustion the last
    /// retryable error is returned as-is; callers treat it as terminal.
    pub async fn run<T, F, Fut>(&self, url: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut retry = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => {
                    debug!("Terminal fetch error for {}: {}", url, err);
                    return Err(err);
                }
                Err(err) => {
                    if retry >= self.max_retries {
                        warn!(
                            "Giving up on {} after {} attempts: {}",
                            url,
                            retry + 1,
                            err
                        );
                        return Err(err);
                    }
                    let delay = self.delay_for(retry);
                    debug!(
                        "Retryable error for {} ({}), retry {} in {:?}",
                        url,
                        err.error_code(),
                        retry + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }
}
