//! Shared start-time pacing for outbound model calls.
//!
//! One limiter exists per `(base_url, api_key)` pair, process-wide. It
//! spaces out request *start* times only; requests already in flight may
//! overlap when latency exceeds the interval. The lock is held while
//! computing the next allowed slot, never across the sleep.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn interval_for(rate_per_minute: u32) -> Duration {
    if rate_per_minute == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(60.0 / rate_per_minute as f64)
    }
}

#[derive(Debug)]
struct LimiterState {
    interval: Duration,
    next_allowed: Option<Instant>,
}

/// Thread-safe leaky-bucket limiter (start-time pacing).
#[derive(Debug)]
pub struct SharedRateLimiter {
    state: Mutex<LimiterState>,
}

impl SharedRateLimiter {
    pub fn new(rate_per_minute: u32) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                interval: interval_for(rate_per_minute),
                next_allowed: None,
            }),
        }
    }

    /// Adopt the strictest (largest) interval seen for this limiter.
    /// A zero rate means "no limiting" and never relaxes an existing one.
    pub fn tighten(&self, rate_per_minute: u32) {
        let new_interval = interval_for(rate_per_minute);
        if new_interval.is_zero() {
            return;
        }
        let mut state = self.state.lock();
        if new_interval > state.interval {
            state.interval = new_interval;
        }
    }

    pub fn interval(&self) -> Duration {
        self.state.lock().interval
    }

    /// Wait until this call is allowed to start.
    pub async fn acquire(&self) {
        let wait = {
            let mut state = self.state.lock();
            if state.interval.is_zero() {
                return;
            }
            let now = Instant::now();
            match state.next_allowed {
                Some(next) if next > now => {
                    state.next_allowed = Some(next + state.interval);
                    next - now
                }
                _ => {
                    state.next_allowed = Some(now + state.interval);
                    Duration::ZERO
                }
            }
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Registry of limiters keyed by `(base_url, api_key)`.
///
/// Owned by the model gateway; every client constructed for the same
/// endpoint shares the same limiter instance.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<(String, String), Arc<SharedRateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, base_url: &str, api_key: &str, rate_per_minute: u32) -> Arc<SharedRateLimiter> {
        let key = (base_url.to_string(), api_key.to_string());
        let mut limiters = self.limiters.lock();
        match limiters.get(&key) {
            Some(limiter) => {
                limiter.tighten(rate_per_minute);
                Arc::clone(limiter)
            }
            None => {
                let limiter = Arc::new(SharedRateLimiter::new(rate_per_minute));
                limiters.insert(key, Arc::clone(&limiter));
                limiter
            }
        }
    }
}
