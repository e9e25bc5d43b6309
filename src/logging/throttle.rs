//! Rate-limited logging.
//!
//! Quote-path warnings (stale data, degraded connection) would otherwise
//! fire on every tick. `LogThrottle` lets one line through per interval
//! and counts what it swallowed.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct LogThrottle {
    last_log_time: Option<Instant>,
    suppressed_count: u64,
    interval: Duration,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_log_time: None,
            suppressed_count: 0,
            interval,
        }
    }

    /// True when the interval has passed since the last emitted line.
    /// False increments the suppressed counter.
    pub fn should_log(&mut self) -> bool {
        let now = Instant::now();
        match self.last_log_time {
            Some(last) => {
                if now.duration_since(last) >= self.interval {
                    self.last_log_time = Some(now);
                    true
                } else {
                    self.suppressed_count += 1;
                    false
                }
            }
            None => {
                self.last_log_time = Some(now);
                true
            }
        }
    }

    /// Suppressed-line count since the last emitted line, then resets.
    pub fn get_and_reset_suppressed_count(&mut self) -> u64 {
        let count = self.suppressed_count;
        self.suppressed_count = 0;
        count
    }
}

/// The engine's quote-path throttlers, one per recurring warning.
#[derive(Debug)]
pub struct EngineLogThrottles {
    pub stale_quote: LogThrottle,
    pub degraded_connection: LogThrottle,
    pub heartbeat: LogThrottle,
}

impl EngineLogThrottles {
    pub fn new(interval_secs: u64) -> Self {
        let interval = Duration::from_secs(interval_secs);
        Self {
            stale_quote: LogThrottle::new(interval),
            degraded_connection: LogThrottle::new(interval),
            heartbeat: LogThrottle::new(interval),
        }
    }
}
