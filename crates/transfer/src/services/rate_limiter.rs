//! Rate limiter trait and fixed-window in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::ServiceError;

/// Verdict for one rate-limited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Seconds until the caller may try again. Zero when allowed.
    pub retry_after_secs: u64,
}

impl RateDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_secs: 0,
        }
    }

    pub fn deny(retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            retry_after_secs,
        }
    }
}

/// Trait for throttling actions per key.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Counts one action against `key` and reports whether it fits within
    /// `max` actions per `window_secs`.
    async fn allow(
        &self,
        key: &str,
        max: u32,
        window_secs: u64,
    ) -> Result<RateDecision, ServiceError>;
}

#[derive(Debug)]
struct Window {
    started: Instant,
    length: Duration,
    count: u32,
}

impl Window {
    fn is_over(&self, now: Instant) -> bool {
        now.duration_since(self.started) >= self.length
    }
}

#[derive(Debug, Default)]
struct InMemoryRateLimiterState {
    windows: HashMap<String, Window>,
    fail: bool,
}

/// Fixed-window rate limiter held in process memory.
///
/// Windows that have run their course are dropped on the next call, so the
/// map only holds keys that acted within their window.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRateLimiter {
    state: Arc<Mutex<InMemoryRateLimiterState>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the limiter to return an error from every call.
    pub async fn set_fail(&self, fail: bool) {
        self.state.lock().await.fail = fail;
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn allow(
        &self,
        key: &str,
        max: u32,
        window_secs: u64,
    ) -> Result<RateDecision, ServiceError> {
        let mut state = self.state.lock().await;
        if state.fail {
            return Err(ServiceError::RateLimiter(
                "limiter unavailable".to_string(),
            ));
        }

        let now = Instant::now();
        let window = Duration::from_secs(window_secs);
        state.windows.retain(|_, w| !w.is_over(now));
        let entry = state.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            length: window,
            count: 0,
        });
        entry.length = window;

        if entry.count >= max {
            let elapsed = now.duration_since(entry.started);
            let remaining = window.saturating_sub(elapsed);
            return Ok(RateDecision::deny(remaining.as_secs().max(1)));
        }

        entry.count += 1;
        Ok(RateDecision::allow())
    }
}
