//! In-trade risk adjustments.
//!
//! Every fresh quote runs the open position through a fixed rule
//! pipeline: structure-break stop moves, the scheduled partial exit,
//! the trailing stop, forced exits, and break-even, in that order. A
//! rule that tightens the stop does so on the local model immediately,
//! so the rules after it ratchet against the already-tightened level;
//! the returned actions tell the engine what to carry out at the
//! broker. Quantities and one-shot flags are only committed once the
//! broker confirms, except `break_even_set`, which arms exactly once
//! whether or not the move was carried out.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::broker::ContractSpec;
use crate::config::{
    BreakEvenConfig, PartialExitConfig, RiskConfig, StructureConfig, TrailingConfig,
};
use crate::types::{PositionKind, Quote};

use super::position::Position;

/// Why a stop was tightened. The token lands in logs and the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMoveReason {
    StructureBreak,
    PartialLock,
    Trailing,
    BreakEven,
}

impl std::fmt::Display for StopMoveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StructureBreak => write!(f, "structure_break"),
            Self::PartialLock => write!(f, "partial_lock"),
            Self::Trailing => write!(f, "trailing"),
            Self::BreakEven => write!(f, "break_even"),
        }
    }
}

/// Why the whole position is being flattened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ForceCloseReason {
    /// Realized plus open P&L breached the daily loss limit.
    DailyLoss { total: Decimal },
    /// The position outlived its maximum holding time.
    MaxAge { hours: i64 },
}

impl std::fmt::Display for ForceCloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DailyLoss { total } => write!(f, "daily loss limit reached ({})", total),
            Self::MaxAge { hours } => write!(f, "position open for {}h", hours),
        }
    }
}

/// Broker work the pipeline decided on.
///
/// Stop moves are already applied to `current_stop_loss`; when several
/// fire in one pass the engine issues a single replacement at the final
/// level.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskAction {
    MoveStop {
        price: Decimal,
        reason: StopMoveReason,
    },
    PartialExit {
        quantity: i64,
    },
    ForceClose {
        reason: ForceCloseReason,
    },
    /// Break-even armed, but clamping against the market would have
    /// dragged the stop past the tolerance; the stop stays where it is.
    BreakEvenSkipped {
        candidate: Decimal,
        drift: Decimal,
    },
}

/// The rule pipeline, configured once per run.
pub struct RiskAdjuster {
    break_even: BreakEvenConfig,
    partial: PartialExitConfig,
    trailing: TrailingConfig,
    structure: StructureConfig,
    daily_loss_limit: Decimal,
    max_position_hours: i64,
    contract: ContractSpec,
}

impl RiskAdjuster {
    pub fn new(risk: &RiskConfig, max_position_hours: i64, contract: ContractSpec) -> Self {
        Self {
            break_even: risk.break_even.clone(),
            partial: risk.partial.clone(),
            trailing: risk.trailing.clone(),
            structure: risk.structure.clone(),
            daily_loss_limit: risk.daily_loss_limit,
            max_position_hours,
            contract,
        }
    }

    /// Run the pipeline for one quote.
    ///
    /// A forced exit supersedes everything queued before it in the same
    /// pass; there is no point scaling out of a position that is about
    /// to be flattened.
    pub fn evaluate(
        &self,
        position: &mut Position,
        quote: &Quote,
        daily_realized: Decimal,
        now: DateTime<Utc>,
    ) -> Vec<RiskAction> {
        if position.is_closed() {
            return Vec::new();
        }
        let price = quote.last_price;
        position.observe_price(price);

        let mut actions = Vec::new();
        self.apply_structure_break(position, price, &mut actions);
        self.apply_partial_exit(position, price, &mut actions);
        self.apply_trailing(position, &mut actions);
        if let Some(close) = self.forced_exit(position, price, daily_realized, now) {
            return vec![close];
        }
        self.apply_break_even(position, quote, &mut actions);
        actions
    }

    /// Price clearing the next structure level by the detection buffer
    /// moves the stop behind that level, offset by the sweep buffer. The
    /// level is consumed either way so it is never targeted twice; at
    /// most one level per evaluation.
    fn apply_structure_break(
        &self,
        position: &mut Position,
        price: Decimal,
        actions: &mut Vec<RiskAction>,
    ) {
        let Some(level) = position.next_structure_level() else {
            return;
        };
        let clearance = (price - level) * position.side.direction();
        if clearance < self.contract.ticks(self.structure.detect_buffer_ticks) {
            return;
        }
        position.consume_structure_level(level);
        let candidate = level
            - position.side.direction() * self.contract.ticks(self.structure.sweep_buffer_ticks);
        if position.ratchet_stop(candidate) {
            info!(
                level = %level,
                stop = %candidate,
                "Structure level broken, stop moved behind it"
            );
            actions.push(RiskAction::MoveStop {
                price: candidate,
                reason: StopMoveReason::StructureBreak,
            });
        } else {
            debug!(level = %level, "Structure level cleared but stop already tighter");
        }
    }

    /// Close part of the position at the first target and lock some of
    /// the gain behind the runner. One-shot; always leaves at least one
    /// contract for the later rules to manage.
    fn apply_partial_exit(
        &self,
        position: &mut Position,
        price: Decimal,
        actions: &mut Vec<RiskAction>,
    ) {
        if !self.partial.enabled || position.partial_exit_done || position.remaining_quantity <= 1 {
            return;
        }
        let risk = position.initial_risk();
        let r_trigger =
            !risk.is_zero() && position.profit_at(price) >= self.partial.first_exit_r * risk;
        let triggered = if self.partial.structure_based {
            match position.next_structure_level() {
                // Scale out as price approaches the level, before it can reject.
                Some(level) => {
                    let distance = (level - price) * position.side.direction();
                    distance <= self.contract.ticks(2 * self.structure.detect_buffer_ticks)
                }
                None => r_trigger,
            }
        } else {
            r_trigger
        };
        if !triggered {
            return;
        }

        let quantity = scale_out_quantity(position.remaining_quantity, self.partial.first_exit_pct);
        if quantity >= position.remaining_quantity {
            debug!(
                remaining = position.remaining_quantity,
                "Partial exit would close the whole position, skipping"
            );
            return;
        }
        info!(
            quantity,
            remaining = position.remaining_quantity,
            price = %price,
            "Partial exit triggered"
        );
        actions.push(RiskAction::PartialExit { quantity });

        if !risk.is_zero() {
            let lock = position.entry_price
                + position.side.direction() * self.partial.post_partial_lock_r * risk;
            if position.ratchet_stop(lock) {
                info!(stop = %lock, "Stop moved to the post-partial lock");
                actions.push(RiskAction::MoveStop {
                    price: lock,
                    reason: StopMoveReason::PartialLock,
                });
            }
        }
    }

    /// Trail the stop a fixed R distance behind the running extreme once
    /// the extreme has reached the activation threshold.
    fn apply_trailing(&self, position: &mut Position, actions: &mut Vec<RiskAction>) {
        if !self.trailing.enabled {
            return;
        }
        let risk = position.initial_risk();
        if risk.is_zero() {
            return;
        }
        let extreme = position.running_extreme();
        if position.profit_at(extreme) < self.trailing.activation_r * risk {
            return;
        }
        let mut candidate =
            extreme - position.side.direction() * self.trailing.trail_distance_r * risk;
        // A short's trail never sits above entry; that would lock in a loss.
        if position.side == PositionKind::Short {
            candidate = candidate.min(position.entry_price);
        }
        if position.ratchet_stop(candidate) {
            info!(extreme = %extreme, stop = %candidate, "Trailing stop tightened");
            actions.push(RiskAction::MoveStop {
                price: candidate,
                reason: StopMoveReason::Trailing,
            });
        }
    }

    fn forced_exit(
        &self,
        position: &Position,
        price: Decimal,
        daily_realized: Decimal,
        now: DateTime<Utc>,
    ) -> Option<RiskAction> {
        let total = daily_realized + position.unrealized_pnl(price, &self.contract);
        if total <= self.daily_loss_limit {
            warn!(
                total_pnl = %total,
                daily_loss_limit = %self.daily_loss_limit,
                "Daily loss limit reached including open P&L, flattening"
            );
            return Some(RiskAction::ForceClose {
                reason: ForceCloseReason::DailyLoss { total },
            });
        }
        let hours = position.age(now).num_hours();
        if self.max_position_hours > 0 && hours >= self.max_position_hours {
            warn!(hours, "Position exceeded its maximum holding time, flattening");
            return Some(RiskAction::ForceClose {
                reason: ForceCloseReason::MaxAge { hours },
            });
        }
        None
    }

    /// Move the stop to entry once either trigger fires: the tick-based
    /// early trigger when enabled and the stop is still on the losing
    /// side, otherwise the R-multiple fallback. The candidate is clamped
    /// a tick off the touch so the resting order is never rejected as
    /// marketable; if that clamp drags it past the tolerance the move is
    /// skipped and reported instead.
    fn apply_break_even(
        &self,
        position: &mut Position,
        quote: &Quote,
        actions: &mut Vec<RiskAction>,
    ) {
        if !self.break_even.enabled || position.break_even_set {
            return;
        }
        let profit = position.profit_at(quote.last_price);
        let early = self.break_even.early_enabled
            && position.stop_improves(position.entry_price)
            && profit >= self.contract.ticks(self.break_even.early_ticks);
        let triggered = early || {
            let risk = position.initial_risk();
            !risk.is_zero() && profit >= self.break_even.trigger_r * risk
        };
        if !triggered {
            return;
        }
        position.break_even_set = true;

        let tick = self.contract.ticks(1);
        let candidate = match position.side {
            PositionKind::Long => position.entry_price.min(quote.bid() - tick),
            PositionKind::Short => position.entry_price.max(quote.ask() + tick),
        };
        let drift = (position.entry_price - candidate) * position.side.direction();
        if drift > self.contract.ticks(self.break_even.tolerance_ticks) {
            warn!(
                candidate = %candidate,
                drift = %drift,
                "Break-even armed but market pulled back past tolerance, leaving stop"
            );
            actions.push(RiskAction::BreakEvenSkipped { candidate, drift });
            return;
        }
        if position.ratchet_stop(candidate) {
            info!(stop = %candidate, early, "Stop moved to break-even");
            actions.push(RiskAction::MoveStop {
                price: candidate,
                reason: StopMoveReason::BreakEven,
            });
        }
    }
}

/// Contracts to close for a scale-out: the configured fraction of what
/// is still open, floored, at least one.
fn scale_out_quantity(remaining: i64, fraction: Decimal) -> i64 {
    let raw = Decimal::from(remaining) * fraction;
    raw.floor().to_i64().unwrap_or(0).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn contract() -> ContractSpec {
        ContractSpec {
            id: "CON.F.US.MGC.Z26".to_string(),
            name: "MGCZ26".to_string(),
            description: "Micro Gold".to_string(),
            tick_size: dec!(0.1),
            tick_value: dec!(1.0),
        }
    }

    fn adjuster(risk: RiskConfig) -> RiskAdjuster {
        RiskAdjuster::new(&risk, 6, contract())
    }

    fn quote(last: Decimal) -> Quote {
        Quote {
            symbol: "MGCZ26".to_string(),
            last_price: last,
            best_bid: Some(last - dec!(0.1)),
            best_ask: Some(last + dec!(0.1)),
            high: None,
            low: None,
            volume: Some(10),
            timestamp: Utc::now(),
        }
    }

    fn long_5(levels: Vec<Decimal>) -> Position {
        Position::new(
            PositionKind::Long,
            dec!(2000.0),
            5,
            dec!(1998.0),
            None,
            levels,
            Utc::now(),
        )
    }

    #[test]
    fn partial_then_lock_then_break_even_noop_in_one_pass() {
        // Long 5 @ 2000.00, stop 1998.00 (risk 2.00 = 20 ticks). At
        // 2002.00 the 1R partial fires for 2 contracts and the stop locks
        // 0.5R at 2001.00. Break-even arms in the same pass but entry
        // (2000.00) no longer improves on 2001.00, so no third action.
        let adjuster = adjuster(RiskConfig::default());
        let mut position = long_5(Vec::new());
        let actions = adjuster.evaluate(&mut position, &quote(dec!(2002.0)), dec!(0), Utc::now());

        assert_eq!(
            actions,
            vec![
                RiskAction::PartialExit { quantity: 2 },
                RiskAction::MoveStop {
                    price: dec!(2001.0),
                    reason: StopMoveReason::PartialLock,
                },
            ]
        );
        assert_eq!(position.current_stop_loss, dec!(2001.0));
        assert!(position.break_even_set);
        // Quantity is committed by the engine on broker confirmation,
        // not by the pipeline.
        assert_eq!(position.remaining_quantity, 5);
        assert!(!position.partial_exit_done);
    }

    #[test]
    fn worked_example_nets_positive_after_the_runner_stops_out() {
        // The scale-out banks 2 contracts at 2002.00 and the remaining 3
        // stop out at the 2001.00 lock; the trade ends green either way.
        let c = contract();
        let partial = c.price_move_pnl(dec!(2002.0) - dec!(2000.0), 2);
        let runner = c.price_move_pnl(dec!(2001.0) - dec!(2000.0), 3);
        assert_eq!(partial, dec!(40.0));
        assert_eq!(partial + runner, dec!(70.0));
    }

    #[test]
    fn break_even_fires_alone_when_partial_disabled() {
        let mut risk = RiskConfig::default();
        risk.partial.enabled = false;
        let adjuster = adjuster(risk);
        let mut position = long_5(Vec::new());
        let actions = adjuster.evaluate(&mut position, &quote(dec!(2002.0)), dec!(0), Utc::now());

        assert_eq!(
            actions,
            vec![RiskAction::MoveStop {
                price: dec!(2000.0),
                reason: StopMoveReason::BreakEven,
            }]
        );
        assert!(position.break_even_set);
    }

    #[test]
    fn early_break_even_fires_before_the_r_trigger() {
        let mut risk = RiskConfig::default();
        risk.partial.enabled = false;
        risk.break_even.early_enabled = true;
        risk.break_even.early_ticks = 10;
        let adjuster = adjuster(risk);
        let mut position = long_5(Vec::new());

        // 10 ticks of profit is only 0.5R, but the early trigger fires.
        let actions = adjuster.evaluate(&mut position, &quote(dec!(2001.0)), dec!(0), Utc::now());
        assert_eq!(
            actions,
            vec![RiskAction::MoveStop {
                price: dec!(2000.0),
                reason: StopMoveReason::BreakEven,
            }]
        );
    }

    #[test]
    fn r_trigger_still_fires_with_early_disabled() {
        let mut risk = RiskConfig::default();
        risk.partial.enabled = false;
        risk.break_even.early_enabled = false;
        let adjuster = adjuster(risk);
        let mut position = long_5(Vec::new());

        assert!(adjuster
            .evaluate(&mut position, &quote(dec!(2001.0)), dec!(0), Utc::now())
            .is_empty());
        assert!(!position.break_even_set);
        let actions = adjuster.evaluate(&mut position, &quote(dec!(2002.0)), dec!(0), Utc::now());
        assert_eq!(actions.len(), 1);
        assert!(position.break_even_set);
    }

    #[test]
    fn break_even_skipped_when_market_pulled_past_tolerance() {
        let mut risk = RiskConfig::default();
        risk.partial.enabled = false;
        risk.break_even.early_enabled = true;
        risk.break_even.early_ticks = 5;
        let adjuster = adjuster(risk);
        let mut position = long_5(Vec::new());

        // Last trades half a point up but the bid has collapsed to
        // 1999.70; a stop at bid minus a tick sits 4 ticks under entry,
        // past the 2-tick tolerance.
        let mut q = quote(dec!(2000.5));
        q.best_bid = Some(dec!(1999.7));
        let actions = adjuster.evaluate(&mut position, &q, dec!(0), Utc::now());
        assert_eq!(
            actions,
            vec![RiskAction::BreakEvenSkipped {
                candidate: dec!(1999.6),
                drift: dec!(0.4),
            }]
        );
        // One-shot: the skip consumed the trigger.
        assert!(position.break_even_set);
        assert_eq!(position.current_stop_loss, dec!(1998.0));
    }

    #[test]
    fn structure_break_consumes_the_level_and_parks_the_stop_behind_it() {
        let mut risk = RiskConfig::default();
        risk.partial.enabled = false;
        risk.break_even.enabled = false;
        let adjuster = adjuster(risk);
        let mut position = long_5(vec![dec!(2003.0), dec!(2006.0)]);

        // 3-tick detect buffer: 2003.2 is not through yet.
        assert!(adjuster
            .evaluate(&mut position, &quote(dec!(2003.2)), dec!(0), Utc::now())
            .is_empty());

        let actions = adjuster.evaluate(&mut position, &quote(dec!(2003.3)), dec!(0), Utc::now());
        assert_eq!(
            actions,
            vec![RiskAction::MoveStop {
                price: dec!(2002.0),
                reason: StopMoveReason::StructureBreak,
            }]
        );
        assert_eq!(position.last_broken_level, Some(dec!(2003.0)));
        assert_eq!(position.next_structure_level(), Some(dec!(2006.0)));

        // Same quote again: the broken level is gone, 2006 is far away.
        assert!(adjuster
            .evaluate(&mut position, &quote(dec!(2003.3)), dec!(0), Utc::now())
            .is_empty());
    }

    #[test]
    fn trailing_follows_the_extreme_not_the_last_price() {
        let mut risk = RiskConfig::default();
        risk.partial.enabled = false;
        risk.break_even.enabled = false;
        risk.trailing.enabled = true;
        let adjuster = adjuster(risk);
        let mut position = long_5(Vec::new());

        // Extreme 2002.5 activates the trail (>= 1R at the extreme);
        // stop trails 0.4R = 0.80 behind it.
        adjuster.evaluate(&mut position, &quote(dec!(2002.5)), dec!(0), Utc::now());
        assert_eq!(position.current_stop_loss, dec!(2001.7));

        // Price falls back; the extreme and the stop both hold.
        let actions = adjuster.evaluate(&mut position, &quote(dec!(2001.9)), dec!(0), Utc::now());
        assert!(actions.is_empty());
        assert_eq!(position.current_stop_loss, dec!(2001.7));
    }

    #[test]
    fn short_trail_is_clamped_at_entry() {
        let mut risk = RiskConfig::default();
        risk.partial.enabled = false;
        risk.break_even.enabled = false;
        risk.trailing.enabled = true;
        risk.trailing.trail_distance_r = dec!(1.2);
        let adjuster = adjuster(risk);
        let mut position = Position::new(
            PositionKind::Short,
            dec!(2000.0),
            5,
            dec!(2002.0),
            None,
            Vec::new(),
            Utc::now(),
        );

        // Extreme 1998.0 is exactly 1R; the raw trail at 1998 + 2.40
        // would sit above entry, so it clamps to entry.
        let actions = adjuster.evaluate(&mut position, &quote(dec!(1998.0)), dec!(0), Utc::now());
        assert_eq!(
            actions,
            vec![RiskAction::MoveStop {
                price: dec!(2000.0),
                reason: StopMoveReason::Trailing,
            }]
        );
    }

    #[test]
    fn daily_loss_breach_supersedes_everything_queued_before_it() {
        let mut risk = RiskConfig::default();
        risk.break_even.enabled = false;
        let adjuster = adjuster(risk);
        // A winning long whose structure break and partial would both
        // fire, while the day's realized losses already ate the limit.
        let mut position = long_5(vec![dec!(2002.0)]);
        let actions =
            adjuster.evaluate(&mut position, &quote(dec!(2003.0)), dec!(-2700), Utc::now());
        assert_eq!(
            actions,
            vec![RiskAction::ForceClose {
                reason: ForceCloseReason::DailyLoss { total: dec!(-2550) },
            }]
        );
    }

    #[test]
    fn stale_position_is_force_closed_by_age() {
        let mut risk = RiskConfig::default();
        risk.partial.enabled = false;
        risk.break_even.enabled = false;
        let adjuster = adjuster(risk);
        let now = Utc::now();
        let mut position = long_5(Vec::new());
        position.entry_time = now - Duration::hours(7);

        let actions = adjuster.evaluate(&mut position, &quote(dec!(2000.5)), dec!(0), now);
        assert_eq!(
            actions,
            vec![RiskAction::ForceClose {
                reason: ForceCloseReason::MaxAge { hours: 7 },
            }]
        );
    }

    #[test]
    fn partial_never_takes_the_whole_position() {
        let mut risk = RiskConfig::default();
        risk.break_even.enabled = false;
        risk.partial.first_exit_pct = dec!(1.0);
        let adjuster = adjuster(risk);
        let mut position = long_5(Vec::new());
        position.remaining_quantity = 2;

        let actions = adjuster.evaluate(&mut position, &quote(dec!(2002.0)), dec!(0), Utc::now());
        assert!(actions.is_empty());

        // A lone contract skips the rule entirely.
        position.remaining_quantity = 1;
        let actions = adjuster.evaluate(&mut position, &quote(dec!(2002.0)), dec!(0), Utc::now());
        assert!(actions.is_empty());
    }

    #[test]
    fn structure_based_partial_fires_on_approach() {
        let mut risk = RiskConfig::default();
        risk.break_even.enabled = false;
        risk.partial.structure_based = true;
        let adjuster = adjuster(risk);
        let mut position = long_5(vec![dec!(2005.0)]);

        // 2 * 3-tick detect buffer = 0.60 of proximity; 2004.3 is still
        // 0.70 away.
        assert!(adjuster
            .evaluate(&mut position, &quote(dec!(2004.3)), dec!(0), Utc::now())
            .is_empty());

        let actions = adjuster.evaluate(&mut position, &quote(dec!(2004.4)), dec!(0), Utc::now());
        assert_eq!(
            actions,
            vec![
                RiskAction::PartialExit { quantity: 2 },
                RiskAction::MoveStop {
                    price: dec!(2001.0),
                    reason: StopMoveReason::PartialLock,
                },
            ]
        );
    }

    #[test]
    fn scale_out_quantity_floors_and_keeps_a_minimum() {
        assert_eq!(scale_out_quantity(5, dec!(0.5)), 2);
        assert_eq!(scale_out_quantity(3, dec!(0.5)), 1);
        assert_eq!(scale_out_quantity(10, dec!(0.05)), 1);
        assert_eq!(scale_out_quantity(4, dec!(0.75)), 3);
    }
}
