//! Event-channel health tracking.
//!
//! The engine cannot tell a quiet market from a dead socket by itself,
//! so every received event stamps this monitor and the main loop grades
//! the silence: inside one heartbeat window is healthy, a few missed
//! windows is degraded, past the limit the channel is declared dead and
//! gets restarted. Quote freshness is tracked separately because risk
//! adjustments must not act on stale prices even while the channel as a
//! whole looks alive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::ConnectionConfig;

/// Channel health derived from time since the last received event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    /// An event arrived inside the current heartbeat window.
    Healthy,
    /// Silent for one or more full windows; suspect but not gone.
    Degraded { missed_heartbeats: u32 },
    /// Silent past the missed-heartbeat limit; restart the channel.
    Dead,
}

impl ConnectionHealth {
    pub fn is_dead(self) -> bool {
        matches!(self, ConnectionHealth::Dead)
    }

    pub fn label(self) -> &'static str {
        match self {
            ConnectionHealth::Healthy => "healthy",
            ConnectionHealth::Degraded { .. } => "degraded",
            ConnectionHealth::Dead => "dead",
        }
    }
}

/// Shared event-receipt clock. All methods are lock-free; the quote
/// path stamps it on every frame.
pub struct ConnectionMonitor {
    created: Instant,
    /// Nanos since `created` of the last event of any kind. Startup
    /// counts as an event so a channel that never connects goes dead.
    last_event_nanos: AtomicU64,
    /// Nanos since `created` of the last quote. Zero until one arrives.
    last_quote_nanos: AtomicU64,
    heartbeat: Duration,
    max_missed: u32,
}

impl ConnectionMonitor {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            created: Instant::now(),
            last_event_nanos: AtomicU64::new(0),
            last_quote_nanos: AtomicU64::new(0),
            heartbeat: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            max_missed: config.max_missed_heartbeats.max(1),
        }
    }

    #[inline]
    fn elapsed_nanos(&self) -> u64 {
        self.created.elapsed().as_nanos() as u64
    }

    /// Stamp receipt of any channel event.
    pub fn record_event(&self) {
        self.last_event_nanos
            .store(self.elapsed_nanos(), Ordering::Release);
    }

    /// Stamp receipt of a quote. Also counts as a channel event.
    pub fn record_quote(&self) {
        let now = self.elapsed_nanos();
        self.last_event_nanos.store(now, Ordering::Release);
        self.last_quote_nanos.store(now, Ordering::Release);
    }

    /// Time since the last event of any kind.
    pub fn silence(&self) -> Duration {
        let last = self.last_event_nanos.load(Ordering::Acquire);
        Duration::from_nanos(self.elapsed_nanos().saturating_sub(last))
    }

    /// Age of the freshest quote, `None` before the first one.
    pub fn quote_age(&self) -> Option<Duration> {
        let last = self.last_quote_nanos.load(Ordering::Acquire);
        if last == 0 {
            return None;
        }
        Some(Duration::from_nanos(
            self.elapsed_nanos().saturating_sub(last),
        ))
    }

    /// Whether the freshest quote is older than `staleness`. No quote at
    /// all counts as stale.
    pub fn is_quote_stale(&self, staleness: Duration) -> bool {
        match self.quote_age() {
            Some(age) => age > staleness,
            None => true,
        }
    }

    pub fn health(&self) -> ConnectionHealth {
        grade(self.silence(), self.heartbeat, self.max_missed)
    }
}

fn grade(silence: Duration, heartbeat: Duration, max_missed: u32) -> ConnectionHealth {
    let missed = (silence.as_nanos() / heartbeat.as_nanos().max(1)) as u32;
    if missed == 0 {
        ConnectionHealth::Healthy
    } else if missed >= max_missed {
        ConnectionHealth::Dead
    } else {
        ConnectionHealth::Degraded {
            missed_heartbeats: missed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn grades_by_missed_windows() {
        assert_eq!(grade(secs(10), secs(60), 3), ConnectionHealth::Healthy);
        assert_eq!(grade(secs(59), secs(60), 3), ConnectionHealth::Healthy);
        assert_eq!(
            grade(secs(61), secs(60), 3),
            ConnectionHealth::Degraded {
                missed_heartbeats: 1
            }
        );
        assert_eq!(
            grade(secs(179), secs(60), 3),
            ConnectionHealth::Degraded {
                missed_heartbeats: 2
            }
        );
        assert_eq!(grade(secs(180), secs(60), 3), ConnectionHealth::Dead);
        assert_eq!(grade(secs(3600), secs(60), 3), ConnectionHealth::Dead);
    }

    #[test]
    fn fresh_monitor_is_healthy_and_quote_stale() {
        let monitor = ConnectionMonitor::new(&ConnectionConfig::default());
        assert_eq!(monitor.health(), ConnectionHealth::Healthy);
        assert!(monitor.is_quote_stale(secs(30)));
        assert_eq!(monitor.quote_age(), None);
    }

    #[test]
    fn quote_receipt_clears_staleness() {
        let monitor = ConnectionMonitor::new(&ConnectionConfig::default());
        monitor.record_quote();
        assert!(!monitor.is_quote_stale(secs(30)));
        assert!(monitor.quote_age().unwrap() < secs(1));
    }
}
