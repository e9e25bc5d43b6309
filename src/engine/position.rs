//! The single-position data model and the shared engine state.
//!
//! At most one [`Position`] exists at a time. It is created on a
//! confirmed entry fill (or adopted from the broker), mutated by the
//! risk pipeline and the reconciler, and destroyed when the broker
//! reports the trade flat. All mutation happens behind the locks in
//! [`EngineState`].

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};

use crate::broker::{ContractSpec, OrderId};
use crate::types::{PositionKind, Quote};

use super::signal::Signal;

/// Local truth for the open trade.
///
/// Invariants the rest of the engine relies on:
/// - `0 <= remaining_quantity <= quantity`; the trade is closed exactly
///   when `remaining_quantity == 0` or the broker confirms flat.
/// - For a long, `current_stop_loss` only ever moves up from
///   `initial_stop_loss`; for a short, only down. All stop mutation goes
///   through [`Position::ratchet_stop`] to enforce this.
/// - `break_even_set` and `partial_exit_done` are one-shot per trade.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub side: PositionKind,
    pub entry_price: Decimal,
    /// Contracts at entry. Kept even after partial exits; R math and the
    /// daily-loss check are measured against the entry size.
    pub quantity: i64,
    pub remaining_quantity: i64,
    pub initial_stop_loss: Decimal,
    pub current_stop_loss: Decimal,
    pub take_profit: Option<Decimal>,
    pub entry_time: DateTime<Utc>,
    /// Broker order ids for the working protective orders. Weak
    /// references: the watchdog re-links or replaces them, never assumes
    /// they are still alive.
    pub stop_order_id: Option<OrderId>,
    pub take_profit_order_id: Option<OrderId>,
    pub break_even_set: bool,
    pub partial_exit_done: bool,
    /// Unbroken structure levels beyond entry, nearest first.
    pub structure_levels: Vec<Decimal>,
    pub last_broken_level: Option<Decimal>,
    pub highest_price: Decimal,
    pub lowest_price: Decimal,
}

impl Position {
    pub fn new(
        side: PositionKind,
        entry_price: Decimal,
        quantity: i64,
        stop_loss: Decimal,
        take_profit: Option<Decimal>,
        structure_levels: Vec<Decimal>,
        entry_time: DateTime<Utc>,
    ) -> Self {
        Self {
            side,
            entry_price,
            quantity,
            remaining_quantity: quantity,
            initial_stop_loss: stop_loss,
            current_stop_loss: stop_loss,
            take_profit,
            entry_time,
            stop_order_id: None,
            take_profit_order_id: None,
            break_even_set: false,
            partial_exit_done: false,
            structure_levels,
            last_broken_level: None,
            highest_price: entry_price,
            lowest_price: entry_price,
        }
    }

    /// Build from an accepted signal and the actual fill. Stop and target
    /// stay at the signal's absolute levels; only the entry reflects the
    /// fill price.
    pub fn from_signal(
        signal: &Signal,
        fill_price: Decimal,
        quantity: i64,
        entry_time: DateTime<Utc>,
    ) -> Self {
        Self::new(
            signal.side,
            fill_price,
            quantity,
            signal.stop_loss,
            signal.take_profit,
            signal.structure_levels.clone(),
            entry_time,
        )
    }

    /// Entry-to-initial-stop distance; the "R" every trigger is scaled by.
    pub fn initial_risk(&self) -> Decimal {
        (self.entry_price - self.initial_stop_loss).abs()
    }

    /// Favorable excursion at `price`: positive when the trade is winning.
    pub fn profit_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.side.direction()
    }

    /// Profit at `price` expressed in multiples of the initial risk.
    pub fn risk_multiple_at(&self, price: Decimal) -> Decimal {
        let risk = self.initial_risk();
        if risk.is_zero() {
            return Decimal::ZERO;
        }
        self.profit_at(price) / risk
    }

    /// Open P&L at `price`, measured at entry size. Realized legs from
    /// partial exits are tracked in the daily total, not here.
    pub fn unrealized_pnl(&self, price: Decimal, contract: &ContractSpec) -> Decimal {
        contract.price_move_pnl(self.profit_at(price), self.quantity)
    }

    /// Track running extremes for the trailing stop.
    pub fn observe_price(&mut self, price: Decimal) {
        if price > self.highest_price {
            self.highest_price = price;
        }
        if price < self.lowest_price {
            self.lowest_price = price;
        }
    }

    /// The extreme the trailing stop measures from.
    pub fn running_extreme(&self) -> Decimal {
        match self.side {
            PositionKind::Long => self.highest_price,
            PositionKind::Short => self.lowest_price,
        }
    }

    /// Whether `candidate` tightens the stop.
    pub fn stop_improves(&self, candidate: Decimal) -> bool {
        match self.side {
            PositionKind::Long => candidate > self.current_stop_loss,
            PositionKind::Short => candidate < self.current_stop_loss,
        }
    }

    /// Move the stop only if it tightens; returns whether it moved.
    pub fn ratchet_stop(&mut self, candidate: Decimal) -> bool {
        if self.stop_improves(candidate) {
            self.current_stop_loss = candidate;
            true
        } else {
            false
        }
    }

    /// Nearest unbroken structure level beyond entry, if any.
    pub fn next_structure_level(&self) -> Option<Decimal> {
        self.structure_levels
            .iter()
            .copied()
            .find(|level| self.profit_at(*level) > Decimal::ZERO)
    }

    /// Consume a broken level so it is never targeted twice.
    pub fn consume_structure_level(&mut self, level: Decimal) {
        self.structure_levels.retain(|l| *l != level);
        self.last_broken_level = Some(level);
    }

    pub fn is_closed(&self) -> bool {
        self.remaining_quantity == 0
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.entry_time
    }
}

/// A parked limit-retest entry. At most one exists; it either converts
/// into a [`Position`] when price touches the limit or expires unfilled.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingLimitEntry {
    pub side: PositionKind,
    pub limit_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Option<Decimal>,
    pub structure_levels: Vec<Decimal>,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingLimitEntry {
    /// Park an entry `offset_ticks` back from the signal price, toward
    /// the retest the strategy expects.
    pub fn from_signal(
        signal: &Signal,
        size: i64,
        offset_ticks: i64,
        tick_size: Decimal,
        lifetime: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let offset = tick_size * Decimal::from(offset_ticks);
        let limit_price = signal.entry_price - signal.side.direction() * offset;
        Self {
            side: signal.side,
            limit_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            structure_levels: signal.structure_levels.clone(),
            size,
            created_at: now,
            expires_at: now + lifetime,
        }
    }

    /// Price has traded through the limit level.
    pub fn touched(&self, price: Decimal) -> bool {
        match self.side {
            PositionKind::Long => price <= self.limit_price,
            PositionKind::Short => price >= self.limit_price,
        }
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// State shared between the main loop and the push-event task.
///
/// The two unit guards replace the re-entrancy flags a naive port would
/// reach for: `entry_guard` is taken with `try_lock` so a second signal
/// arriving mid-entry is refused rather than queued, and `order_guard`
/// serializes protective-order placement, replacement, and the watchdog.
pub struct EngineState {
    pub position: Mutex<Option<Position>>,
    pub pending_entry: Mutex<Option<PendingLimitEntry>>,
    pub last_quote: RwLock<Option<Quote>>,
    pub entry_guard: Mutex<()>,
    pub order_guard: Mutex<()>,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            position: Mutex::new(None),
            pending_entry: Mutex::new(None),
            last_quote: RwLock::new(None),
            entry_guard: Mutex::new(()),
            order_guard: Mutex::new(()),
        }
    }

    pub async fn set_quote(&self, quote: Quote) {
        *self.last_quote.write().await = Some(quote);
    }

    pub async fn quote(&self) -> Option<Quote> {
        self.last_quote.read().await.clone()
    }

    pub async fn has_position(&self) -> bool {
        self.position.lock().await.is_some()
    }

    /// Copy of the current position for read-only surfaces.
    pub async fn position_snapshot(&self) -> Option<Position> {
        self.position.lock().await.clone()
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}
