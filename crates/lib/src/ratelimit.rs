//! Fixed-window connection rate limiting keyed by source address.
//!
//! The counter store is a narrow collaborator so the gateway holds no
//! process-wide state and tests can swap in their own store. Admission is a
//! single read-increment-compare under the store's lock; at the threshold
//! the attempt is denied without incrementing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Expiring counter store. One atomic round-trip per admission check.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key` if it is below `limit`, initializing
    /// it with `window` TTL when absent or expired. Returns whether the
    /// attempt was admitted.
    async fn try_admit(&self, key: &str, limit: u64, window: Duration) -> bool;
}

/// In-memory counter store: count plus window deadline per key.
pub struct MemoryCounterStore {
    inner: Mutex<HashMap<String, (u64, Instant)>>,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn try_admit(&self, key: &str, limit: u64, window: Duration) -> bool {
        let now = Instant::now();
        let mut g = self.inner.lock().await;
        match g.get_mut(key) {
            Some((count, deadline)) if now < *deadline => {
                if *count >= limit {
                    return false;
                }
                *count += 1;
                true
            }
            _ => {
                g.insert(key.to_string(), (1, now + window));
                true
            }
        }
    }
}

/// Per-source connection limiter: `max` admissions per `window`.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    window: Duration,
    max: u64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, window: Duration, max: u64) -> Self {
        Self { store, window, max }
    }

    /// Check one connection attempt from `source`. Denial is terminal for
    /// that attempt; the caller fails the connection rather than queueing.
    pub async fn admit(&self, source: &str) -> bool {
        let admitted = self.store.try_admit(source, self.max, self.window).await;
        if !admitted {
            log::warn!("rate limit exceeded for source {}", source);
        }
        admitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(window: Duration, max: u64) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryCounterStore::new()), window, max)
    }

    #[tokio::test]
    async fn admits_up_to_threshold_then_denies() {
        let l = limiter(Duration::from_secs(60), 5);
        for _ in 0..5 {
            assert!(l.admit("10.0.0.1").await);
        }
        assert!(!l.admit("10.0.0.1").await);
        // Denial does not consume budget for other sources.
        assert!(l.admit("10.0.0.2").await);
    }

    #[tokio::test(start_paused = true)]
    async fn window_elapse_resets_the_counter() {
        let l = limiter(Duration::from_secs(60), 5);
        for _ in 0..5 {
            assert!(l.admit("10.0.0.1").await);
        }
        assert!(!l.admit("10.0.0.1").await);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(l.admit("10.0.0.1").await);
    }

    #[tokio::test]
    async fn denied_attempt_does_not_increment() {
        let l = limiter(Duration::from_secs(60), 1);
        assert!(l.admit("10.0.0.1").await);
        // Repeated denials stay denials within the window, nothing more.
        assert!(!l.admit("10.0.0.1").await);
        assert!(!l.admit("10.0.0.1").await);
    }
}
