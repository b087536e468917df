//! Fixed-window per-endpoint rate limiting

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimiterConfig;
use crate::gateway::endpoint::EndpointId;

/// Snapshot of one endpoint's current window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateStatus {
    /// Requests admitted in the current window
    pub used: u32,
    /// Window limit
    pub limit: u32,
    /// Milliseconds until the window resets
    pub reset_in_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start: Instant,
    count: u32,
}

/// Fixed-window counters, one bucket per endpoint, created lazily
#[derive(Debug)]
pub struct RateLimiter {
    settings: RwLock<RateLimiterConfig>,
    buckets: DashMap<EndpointId, Bucket>,
}

impl RateLimiter {
    /// Create a limiter from configuration
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            settings: RwLock::new(config),
            buckets: DashMap::new(),
        }
    }

    /// Replace the global window settings; live buckets adopt them on their
    /// next acquire
    pub fn configure(&self, config: RateLimiterConfig) {
        let mut settings = match self.settings.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *settings = config;
    }

    fn settings(&self) -> RateLimiterConfig {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Current window settings
    pub fn config(&self) -> RateLimiterConfig {
        self.settings()
    }

    /// Try to admit one request; on refusal returns the milliseconds until
    /// the window resets
    pub fn try_acquire(&self, id: EndpointId) -> Result<(), u64> {
        let settings = self.settings();
        let window = settings.window();
        let now = Instant::now();
        let mut bucket = self.buckets.entry(id).or_insert(Bucket {
            window_start: now,
            count: 0,
        });
        if now.duration_since(bucket.window_start) >= window {
            bucket.window_start = now;
            bucket.count = 0;
        }
        if bucket.count < settings.max_requests {
            bucket.count += 1;
            Ok(())
        } else {
            let elapsed = now.duration_since(bucket.window_start);
            Err(remaining_ms(window, elapsed))
        }
    }

    /// Current window snapshot for one endpoint
    pub fn status(&self, id: EndpointId) -> RateStatus {
        let settings = self.settings();
        let window = settings.window();
        let now = Instant::now();
        match self.buckets.get(&id) {
            Some(bucket) if now.duration_since(bucket.window_start) < window => RateStatus {
                used: bucket.count,
                limit: settings.max_requests,
                reset_in_ms: remaining_ms(window, now.duration_since(bucket.window_start)),
            },
            _ => RateStatus {
                used: 0,
                limit: settings.max_requests,
                reset_in_ms: settings.window_ms,
            },
        }
    }

    /// Drop an endpoint's bucket (endpoint deletion)
    pub fn forget(&self, id: EndpointId) {
        self.buckets.remove(&id);
    }
}

fn remaining_ms(window: Duration, elapsed: Duration) -> u64 {
    window.saturating_sub(elapsed).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            window_ms,
            max_requests,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_limit() {
        let limiter = limiter(3, 60_000);
        let id = EndpointId::generate();
        for _ in 0..3 {
            assert!(limiter.try_acquire(id).is_ok());
        }
        let retry_after = limiter.try_acquire(id).unwrap_err();
        assert!(retry_after <= 60_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets() {
        let limiter = limiter(1, 1_000);
        let id = EndpointId::generate();
        assert!(limiter.try_acquire(id).is_ok());
        assert!(limiter.try_acquire(id).is_err());

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(limiter.try_acquire(id).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_tracks_elapsed() {
        let limiter = limiter(1, 1_000);
        let id = EndpointId::generate();
        assert!(limiter.try_acquire(id).is_ok());
        tokio::time::advance(Duration::from_millis(400)).await;
        let retry_after = limiter.try_acquire(id).unwrap_err();
        assert_eq!(retry_after, 600);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_exact() {
        let limiter = limiter(5, 1_000);
        let id = EndpointId::generate();
        assert_eq!(
            limiter.status(id),
            RateStatus {
                used: 0,
                limit: 5,
                reset_in_ms: 1_000
            }
        );
        limiter.try_acquire(id).unwrap();
        limiter.try_acquire(id).unwrap();
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(
            limiter.status(id),
            RateStatus {
                used: 2,
                limit: 5,
                reset_in_ms: 750
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_buckets_are_per_endpoint() {
        let limiter = limiter(1, 60_000);
        let a = EndpointId::generate();
        let b = EndpointId::generate();
        assert!(limiter.try_acquire(a).is_ok());
        assert!(limiter.try_acquire(b).is_ok());
        assert!(limiter.try_acquire(a).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_applies_next_acquire() {
        let limiter = limiter(1, 60_000);
        let id = EndpointId::generate();
        assert!(limiter.try_acquire(id).is_ok());
        assert!(limiter.try_acquire(id).is_err());
        limiter.configure(RateLimiterConfig {
            window_ms: 60_000,
            max_requests: 5,
        });
        assert!(limiter.try_acquire(id).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_clears_bucket() {
        let limiter = limiter(1, 60_000);
        let id = EndpointId::generate();
        limiter.try_acquire(id).unwrap();
        limiter.forget(id);
        assert!(limiter.try_acquire(id).is_ok());
    }
}
