//! Gateway request pacing.
//!
//! The gateway enforces two separate budgets: 200 requests per 60s for
//! standard endpoints and 50 per 30s for history/bars. Each bucket keeps
//! a log of send timestamps inside the window; once free capacity drops
//! to the low-water mark, callers sleep until the oldest timestamp ages
//! out instead of burning the remainder and eating 429s.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics;

/// Which budget a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    /// Orders, positions, accounts, auth.
    Standard,
    /// Bar history retrieval.
    History,
}

impl EndpointClass {
    fn label(&self) -> &'static str {
        match self {
            EndpointClass::Standard => "standard",
            EndpointClass::History => "history",
        }
    }
}

#[derive(Debug, Clone)]
struct BucketConfig {
    capacity: usize,
    window: Duration,
    low_water: usize,
}

struct Bucket {
    config: BucketConfig,
    sent: Mutex<VecDeque<Instant>>,
}

impl Bucket {
    fn new(config: BucketConfig) -> Self {
        let capacity = config.capacity;
        Self {
            config,
            sent: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    async fn acquire(&self, label: &'static str) {
        loop {
            let wait = {
                let mut sent = self.sent.lock().await;
                let now = Instant::now();
                while let Some(front) = sent.front() {
                    if now.duration_since(*front) >= self.config.window {
                        sent.pop_front();
                    } else {
                        break;
                    }
                }

                let threshold = self.config.capacity.saturating_sub(self.config.low_water);
                if sent.len() < threshold {
                    sent.push_back(now);
                    return;
                }

                // At the low-water mark. Sleep until the oldest send exits
                // the window, then re-check.
                match sent.front() {
                    Some(oldest) => {
                        let freed_at = *oldest + self.config.window;
                        freed_at.saturating_duration_since(now)
                    }
                    None => Duration::ZERO,
                }
            };

            if wait.is_zero() {
                continue;
            }
            warn!(
                bucket = label,
                wait_ms = wait.as_millis() as u64,
                "Rate limit low-water reached, pacing request"
            );
            metrics::record_rate_limit_wait(label);
            tokio::time::sleep(wait).await;
        }
    }

    async fn in_flight_window(&self) -> usize {
        let mut sent = self.sent.lock().await;
        let now = Instant::now();
        while let Some(front) = sent.front() {
            if now.duration_since(*front) >= self.config.window {
                sent.pop_front();
            } else {
                break;
            }
        }
        sent.len()
    }
}

/// Two-bucket pacing for the gateway's standard and history budgets.
pub struct RateLimiter {
    standard: Bucket,
    history: Bucket,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_budgets(200, Duration::from_secs(60), 50, Duration::from_secs(30), 5)
    }

    pub fn with_budgets(
        standard_capacity: usize,
        standard_window: Duration,
        history_capacity: usize,
        history_window: Duration,
        low_water: usize,
    ) -> Self {
        Self {
            standard: Bucket::new(BucketConfig {
                capacity: standard_capacity,
                window: standard_window,
                low_water,
            }),
            history: Bucket::new(BucketConfig {
                capacity: history_capacity,
                window: history_window,
                low_water,
            }),
        }
    }

    /// Take one slot from the class's budget, sleeping if the bucket is
    /// at its low-water mark. Call immediately before each request.
    pub async fn acquire(&self, class: EndpointClass) {
        let bucket = match class {
            EndpointClass::Standard => &self.standard,
            EndpointClass::History => &self.history,
        };
        bucket.acquire(class.label()).await;
        debug!(bucket = class.label(), "rate limit slot acquired");
    }

    /// Requests currently inside the class's window. Status surface only.
    pub async fn window_usage(&self, class: EndpointClass) -> usize {
        match class {
            EndpointClass::Standard => self.standard.in_flight_window().await,
            EndpointClass::History => self.history.in_flight_window().await,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_freely_below_low_water() {
        let limiter = RateLimiter::with_budgets(10, Duration::from_secs(60), 5, Duration::from_secs(30), 2);
        for _ in 0..8 {
            limiter.acquire(EndpointClass::Standard).await;
        }
        assert_eq!(limiter.window_usage(EndpointClass::Standard).await, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_at_low_water_until_window_frees() {
        let limiter = RateLimiter::with_budgets(4, Duration::from_secs(10), 4, Duration::from_secs(10), 2);

        limiter.acquire(EndpointClass::Standard).await;
        limiter.acquire(EndpointClass::Standard).await;

        // Third acquisition hits the low-water mark (capacity 4, low water
        // 2) and must wait for the first slot to age out of the window.
        let start = tokio::time::Instant::now();
        limiter.acquire(EndpointClass::Standard).await;
        let waited = start.elapsed();
        assert!(
            waited >= Duration::from_secs(10),
            "expected a full-window wait, got {:?}",
            waited
        );
    }

    #[tokio::test(start_paused = true)]
    async fn buckets_are_independent() {
        let limiter = RateLimiter::with_budgets(2, Duration::from_secs(60), 50, Duration::from_secs(30), 2);

        // Standard bucket saturates instantly (capacity == low water).
        let history_start = tokio::time::Instant::now();
        limiter.acquire(EndpointClass::History).await;
        assert_eq!(history_start.elapsed(), Duration::ZERO);
    }
}
