//! Order-placement circuit breaker.
//!
//! Trips after a run of consecutive placement failures and blocks new
//! entries until a cool-off elapses. Exit and protective-repair paths
//! never consult it; flattening has to work when the gateway is at its
//! worst.
//!
//! Lock-free: `is_open()` is a few atomic loads and safe on the quote
//! path. The Open -> Closed transition happens lazily on the first check
//! after the cool-off, via CAS so exactly one caller re-arms it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::metrics;

/// Breaker state, u32-encoded for atomic storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BreakerState {
    /// Entries allowed.
    Closed = 0,
    /// Entries blocked until the cool-off elapses.
    Open = 1,
}

impl BreakerState {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => BreakerState::Open,
            _ => BreakerState::Closed,
        }
    }
}

pub struct CircuitBreaker {
    /// 0=Closed, 1=Open.
    state: AtomicU32,
    /// Consecutive failure count.
    failure_count: AtomicU32,
    /// Last failure time as nanoseconds since `creation_time`.
    last_failure_nanos: AtomicU64,
    creation_time: Instant,
    failure_threshold: u32,
    cooloff_nanos: u64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooloff: Duration) -> Self {
        Self {
            state: AtomicU32::new(BreakerState::Closed as u32),
            failure_count: AtomicU32::new(0),
            last_failure_nanos: AtomicU64::new(0),
            creation_time: Instant::now(),
            failure_threshold: failure_threshold.max(1),
            cooloff_nanos: cooloff.as_nanos() as u64,
        }
    }

    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(
            config.failure_threshold,
            Duration::from_secs(config.timeout_minutes.max(0) as u64 * 60),
        )
    }

    #[inline]
    fn elapsed_nanos(&self) -> u64 {
        self.creation_time.elapsed().as_nanos() as u64
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// A placement succeeded: close the breaker and clear the streak.
    pub fn record_success(&self) {
        self.state
            .store(BreakerState::Closed as u32, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
    }

    /// A placement failed. Trips the breaker once the streak reaches the
    /// threshold; further failures while open push the cool-off out.
    pub fn record_failure(&self) {
        let streak = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.last_failure_nanos
            .store(self.elapsed_nanos(), Ordering::Release);

        if streak >= self.failure_threshold
            && self
                .state
                .compare_exchange(
                    BreakerState::Closed as u32,
                    BreakerState::Open as u32,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            metrics::record_breaker_trip();
            warn!(
                failures = streak,
                cooloff_secs = self.cooloff_nanos / 1_000_000_000,
                "Circuit breaker tripped, new entries paused"
            );
        }
    }

    /// Whether entries are currently blocked. Re-arms the breaker when
    /// the cool-off has elapsed since the last failure.
    #[inline]
    pub fn is_open(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            0 => false,
            _ => {
                let last_failure = self.last_failure_nanos.load(Ordering::Acquire);
                let elapsed = self.elapsed_nanos().saturating_sub(last_failure);
                if elapsed > self.cooloff_nanos {
                    if self
                        .state
                        .compare_exchange(
                            BreakerState::Open as u32,
                            BreakerState::Closed as u32,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.failure_count.store(0, Ordering::Release);
                        info!("Circuit breaker cool-off elapsed, entries re-enabled");
                    }
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Back to the initial closed state, streak cleared.
    pub fn reset(&self) {
        self.state
            .store(BreakerState::Closed as u32, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.last_failure_nanos.store(0, Ordering::Release);
    }
}
