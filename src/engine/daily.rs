//! Daily limits and loss-streak cooldown.
//!
//! Tracks realized P&L, trade count, and consecutive losses per calendar
//! date in the account's trading timezone, and gates new entries on all
//! of them. Thread-safe for concurrent updates from the main loop and
//! the push-event task.
//!
//! # Precision
//!
//! Realized P&L is stored as i64 micros (Decimal * 1_000_000) so the hot
//! path stays lock-free. That covers ±$9.2 trillion, which is enough.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, Utc, Weekday};
use chrono::Datelike;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::config::RiskConfig;

/// Outcome of recording a closed trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DailyStatus {
    /// Within limits, trading continues.
    Normal,
    /// The loss streak just opened a cooldown window.
    Cooldown { until: DateTime<Utc> },
    /// Realized P&L breached the daily loss limit; entries stop today.
    LossLimit,
}

impl std::fmt::Display for DailyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Cooldown { until } => write!(f, "cooldown until {}", until.format("%H:%M:%S")),
            Self::LossLimit => write!(f, "daily loss limit"),
        }
    }
}

/// Why an entry was refused. `reason()` gives the stable token used in
/// logs and the trade journal.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryBlock {
    DailyLimit,
    MaxTrades { taken: u32, max: u32 },
    LossLimit { pnl: Decimal, limit: Decimal },
    Cooldown { until: DateTime<Utc> },
    BlockedDay(Weekday),
}

impl EntryBlock {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::DailyLimit => "daily_limit",
            Self::MaxTrades { .. } => "max_trades",
            Self::LossLimit { .. } => "daily_loss_limit",
            Self::Cooldown { .. } => "cooldown",
            Self::BlockedDay(_) => "blocked_day",
        }
    }
}

impl std::fmt::Display for EntryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DailyLimit => write!(f, "daily limit flag set"),
            Self::MaxTrades { taken, max } => write!(f, "{} of {} daily trades taken", taken, max),
            Self::LossLimit { pnl, limit } => {
                write!(f, "realized {} at or below daily limit {}", pnl, limit)
            }
            Self::Cooldown { until } => write!(f, "cooldown until {}", until.format("%H:%M:%S")),
            Self::BlockedDay(day) => write!(f, "entries blocked on {}", day),
        }
    }
}

/// Per-day risk bookkeeping.
pub struct DailyLimits {
    loss_limit: Decimal,
    max_trades: u32,
    cooldown_enabled: bool,
    loss_streak_trigger: u32,
    cooldown_length: Duration,
    tz: Tz,
    blocked_days: Vec<Weekday>,

    realized_pnl_micros: AtomicI64,
    trades_today: AtomicU32,
    consecutive_losses: AtomicU32,
    limit_hit: AtomicBool,
    cooldown_until: Mutex<Option<DateTime<Utc>>>,
    current_day: Mutex<NaiveDate>,
    /// Fill ids already counted, so a closure observed on both the push
    /// and polling paths is booked once.
    seen_fills: Mutex<HashSet<i64>>,
}

impl DailyLimits {
    pub fn new(
        risk: &RiskConfig,
        tz: Tz,
        blocked_days: Vec<Weekday>,
        cooldown_length: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        info!(
            daily_loss_limit = %risk.daily_loss_limit,
            max_trades_per_day = risk.max_trades_per_day,
            timezone = %tz,
            "Daily limits initialized"
        );
        Self {
            loss_limit: risk.daily_loss_limit,
            max_trades: risk.max_trades_per_day,
            cooldown_enabled: risk.cooldown.enabled,
            loss_streak_trigger: risk.cooldown.consecutive_losses_trigger,
            cooldown_length,
            blocked_days,
            realized_pnl_micros: AtomicI64::new(0),
            trades_today: AtomicU32::new(0),
            consecutive_losses: AtomicU32::new(0),
            limit_hit: AtomicBool::new(false),
            cooldown_until: Mutex::new(None),
            current_day: Mutex::new(now.with_timezone(&tz).date_naive()),
            seen_fills: Mutex::new(HashSet::new()),
            tz,
        }
    }

    /// Record a closed trade's realized P&L.
    ///
    /// Returns `None` when `fill_id` was already counted. Closures
    /// estimated from quotes (polling fallback) pass no id and are always
    /// booked.
    pub fn record_close(
        &self,
        fill_id: Option<i64>,
        pnl: Decimal,
        now: DateTime<Utc>,
    ) -> Option<DailyStatus> {
        if let Some(id) = fill_id {
            let mut seen = self.seen_fills.lock().unwrap_or_else(|e| e.into_inner());
            if !seen.insert(id) {
                return None;
            }
        }

        let pnl_micros = decimal_to_micros(pnl);
        let total_micros = self
            .realized_pnl_micros
            .fetch_add(pnl_micros, Ordering::SeqCst)
            + pnl_micros;
        let total = micros_to_decimal(total_micros);

        let mut status = DailyStatus::Normal;
        if pnl < Decimal::ZERO {
            let streak = self.consecutive_losses.fetch_add(1, Ordering::SeqCst) + 1;
            if self.cooldown_enabled && streak >= self.loss_streak_trigger {
                let until = now + self.cooldown_length;
                *self.cooldown_until.lock().unwrap_or_else(|e| e.into_inner()) = Some(until);
                warn!(
                    consecutive_losses = streak,
                    until = %until,
                    "Loss streak opened a cooldown window"
                );
                status = DailyStatus::Cooldown { until };
            }
        } else {
            self.consecutive_losses.store(0, Ordering::SeqCst);
        }

        if total <= self.loss_limit {
            self.limit_hit.store(true, Ordering::SeqCst);
            error!(
                daily_pnl = %total,
                daily_loss_limit = %self.loss_limit,
                "DAILY LOSS LIMIT BREACHED - no further entries today"
            );
            status = DailyStatus::LossLimit;
        }
        Some(status)
    }

    /// Count an accepted entry toward the daily trade cap.
    pub fn record_entry(&self) {
        self.trades_today.fetch_add(1, Ordering::SeqCst);
    }

    /// Evaluate the entry gates in their fixed order; the first failure
    /// wins and carries the refusal reason.
    pub fn entry_allowed(&self, now: DateTime<Utc>) -> Result<(), EntryBlock> {
        if self.limit_hit.load(Ordering::SeqCst) {
            return Err(EntryBlock::DailyLimit);
        }

        let taken = self.trades_today.load(Ordering::SeqCst);
        if taken >= self.max_trades {
            return Err(EntryBlock::MaxTrades {
                taken,
                max: self.max_trades,
            });
        }

        let pnl = self.realized_pnl();
        if pnl <= self.loss_limit {
            return Err(EntryBlock::LossLimit {
                pnl,
                limit: self.loss_limit,
            });
        }

        {
            let mut cooldown = self.cooldown_until.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(until) = *cooldown {
                if now < until {
                    return Err(EntryBlock::Cooldown { until });
                }
                // Expired: the streak that opened it starts over.
                *cooldown = None;
                self.consecutive_losses.store(0, Ordering::SeqCst);
                info!("Cooldown window elapsed, entries re-enabled");
            }
        }

        let weekday = now.with_timezone(&self.tz).weekday();
        if self.blocked_days.contains(&weekday) {
            return Err(EntryBlock::BlockedDay(weekday));
        }

        Ok(())
    }

    /// Reset all counters when the local calendar date changes. Returns
    /// whether a rollover happened.
    pub fn roll_day(&self, now: DateTime<Utc>) -> bool {
        let today = now.with_timezone(&self.tz).date_naive();
        let mut day = self.current_day.lock().unwrap_or_else(|e| e.into_inner());
        if *day == today {
            return false;
        }
        let previous_pnl = self.realized_pnl();
        *day = today;
        self.realized_pnl_micros.store(0, Ordering::SeqCst);
        self.trades_today.store(0, Ordering::SeqCst);
        self.consecutive_losses.store(0, Ordering::SeqCst);
        self.limit_hit.store(false, Ordering::SeqCst);
        *self.cooldown_until.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.seen_fills
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        info!(
            trading_day = %today,
            previous_day_pnl = %previous_pnl,
            "Daily counters reset for new trading day"
        );
        true
    }

    /// Set the one-shot flag after a daily-loss forced exit.
    pub fn mark_limit_hit(&self) {
        if !self.limit_hit.swap(true, Ordering::SeqCst) {
            warn!("Daily limit flag set - entries blocked for the rest of the day");
        }
    }

    pub fn realized_pnl(&self) -> Decimal {
        micros_to_decimal(self.realized_pnl_micros.load(Ordering::SeqCst))
    }

    pub fn trades_today(&self) -> u32 {
        self.trades_today.load(Ordering::SeqCst)
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses.load(Ordering::SeqCst)
    }

    pub fn limit_hit(&self) -> bool {
        self.limit_hit.load(Ordering::SeqCst)
    }

    pub fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        *self.cooldown_until.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Loss room left before the daily limit halts entries.
    pub fn remaining_loss_capacity(&self) -> Decimal {
        self.realized_pnl() - self.loss_limit
    }
}

/// Convert Decimal to micros (i64) for atomic storage.
fn decimal_to_micros(d: Decimal) -> i64 {
    let scaled = d * Decimal::new(1_000_000, 0);
    scaled.mantissa() as i64 / 10i64.pow(scaled.scale())
}

/// Convert micros (i64) back to Decimal.
fn micros_to_decimal(micros: i64) -> Decimal {
    Decimal::new(micros, 6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn limits() -> DailyLimits {
        limits_with(RiskConfig::default())
    }

    fn limits_with(risk: RiskConfig) -> DailyLimits {
        DailyLimits::new(
            &risk,
            chrono_tz::America::Chicago,
            Vec::new(),
            Duration::minutes(60),
            Utc::now(),
        )
    }

    #[test]
    fn two_losses_open_a_sixty_minute_cooldown() {
        let daily = limits();
        let now = Utc::now();

        assert_eq!(
            daily.record_close(Some(1), dec!(-50), now),
            Some(DailyStatus::Normal)
        );
        let status = daily.record_close(Some(2), dec!(-60), now).unwrap();
        assert!(matches!(status, DailyStatus::Cooldown { .. }));

        // Inside the window the gate refuses with the cooldown reason.
        let blocked = daily.entry_allowed(now + Duration::minutes(30)).unwrap_err();
        assert_eq!(blocked.reason(), "cooldown");

        // After it elapses the entry passes and the streak is reset.
        assert!(daily.entry_allowed(now + Duration::minutes(61)).is_ok());
        assert_eq!(daily.consecutive_losses(), 0);
    }

    #[test]
    fn duplicate_fill_id_is_counted_once() {
        let daily = limits();
        let now = Utc::now();
        assert!(daily.record_close(Some(7), dec!(-100), now).is_some());
        assert!(daily.record_close(Some(7), dec!(-100), now).is_none());
        assert_eq!(daily.realized_pnl(), dec!(-100));
        assert_eq!(daily.consecutive_losses(), 1);
    }

    #[test]
    fn winning_close_resets_the_streak() {
        let daily = limits();
        let now = Utc::now();
        daily.record_close(Some(1), dec!(-50), now);
        assert_eq!(daily.consecutive_losses(), 1);
        daily.record_close(Some(2), dec!(120), now);
        assert_eq!(daily.consecutive_losses(), 0);
    }

    #[test]
    fn realized_breach_blocks_entries() {
        let daily = limits();
        let now = Utc::now();
        let status = daily.record_close(Some(1), dec!(-2600), now).unwrap();
        assert_eq!(status, DailyStatus::LossLimit);
        assert!(daily.limit_hit());
        assert_eq!(daily.entry_allowed(now).unwrap_err().reason(), "daily_limit");
    }

    #[test]
    fn gate_order_reports_daily_limit_first() {
        let mut risk = RiskConfig::default();
        risk.max_trades_per_day = 1;
        let daily = limits_with(risk);
        let now = Utc::now();
        daily.record_entry();
        daily.mark_limit_hit();
        // Both the flag and the trade cap would block; the flag wins.
        assert_eq!(daily.entry_allowed(now).unwrap_err().reason(), "daily_limit");
    }

    #[test]
    fn trade_cap_blocks_after_max_entries() {
        let mut risk = RiskConfig::default();
        risk.max_trades_per_day = 2;
        let daily = limits_with(risk);
        let now = Utc::now();
        daily.record_entry();
        daily.record_entry();
        assert_eq!(daily.entry_allowed(now).unwrap_err().reason(), "max_trades");
    }

    #[test]
    fn blocked_weekday_refuses_entries() {
        let risk = RiskConfig::default();
        let now = Utc::now();
        let weekday = now.with_timezone(&chrono_tz::America::Chicago).weekday();
        let daily = DailyLimits::new(
            &risk,
            chrono_tz::America::Chicago,
            vec![weekday],
            Duration::minutes(60),
            now,
        );
        assert_eq!(daily.entry_allowed(now).unwrap_err().reason(), "blocked_day");
    }

    #[test]
    fn day_rollover_clears_everything() {
        let daily = limits();
        let now = Utc::now();
        daily.record_entry();
        daily.record_close(Some(1), dec!(-2600), now);
        daily.record_close(Some(2), dec!(-10), now);
        assert!(daily.limit_hit());

        assert!(!daily.roll_day(now));
        assert!(daily.roll_day(now + Duration::days(1)));
        assert_eq!(daily.realized_pnl(), dec!(0));
        assert_eq!(daily.trades_today(), 0);
        assert!(!daily.limit_hit());
        assert!(daily.cooldown_until().is_none());
        // Fill ids from the previous day may be booked again.
        assert!(daily
            .record_close(Some(1), dec!(25), now + Duration::days(1))
            .is_some());
    }

    #[test]
    fn micros_conversion_round_trips() {
        let values = vec![dec!(0), dec!(100.123456), dec!(-50.5), dec!(999999.999999)];
        for v in values {
            let micros = decimal_to_micros(v);
            let back = micros_to_decimal(micros);
            assert!(
                (v - back).abs() < dec!(0.000001),
                "failed for {}: got {}",
                v,
                back
            );
        }
    }

    #[test]
    fn remaining_capacity_shrinks_with_losses() {
        let daily = limits();
        assert_eq!(daily.remaining_loss_capacity(), dec!(2500));
        daily.record_close(Some(1), dec!(-400), Utc::now());
        assert_eq!(daily.remaining_loss_capacity(), dec!(2100));
    }
}
