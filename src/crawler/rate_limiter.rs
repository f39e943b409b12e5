// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Rate limiting for outbound page and image requests

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovRateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

const FALLBACK_RPS: NonZeroU32 = match NonZeroU32::new(20) {
    Some(n) => n,
    None => NonZeroU32::MIN,
};

/// Process-wide limiter shared by every fetch task
#[derive(Clone)]
pub struct FetchRateLimiter {
    limiter: Arc<GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    requests_per_second: u32,
}

impl FetchRateLimiter {
    /// Create a new rate limiter; zero falls back to 20 requests per second
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(FALLBACK_RPS);
        let limiter = Arc::new(GovRateLimiter::direct(Quota::per_second(rps)));

        Self {
            limiter,
            requests_per_second: rps.get(),
        }
    }

    /// Whether a request may go out right now
    pub fn check(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Wait until the limiter admits another request
    pub async fn wait(&self) {
        self.limiter.until_ready().await;
    }

    pub fn requests_per_second(&self) -> u32 {
        self.requests_per_second
    }
}

impl std::fmt::Debug for FetchRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRateLimiter")
            .field("requests_per_second", &self.requests_per_second)
            .finish()
    }
}
