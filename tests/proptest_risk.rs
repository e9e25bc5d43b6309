//! Property-based tests for the risk arithmetic.
//!
//! These use proptest to drive the stop ratchet, partial-exit sizing,
//! fallback stop placement, and tick rounding across many random
//! inputs, catching edge cases that unit tests might miss.

use chrono::Utc;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use ordersentinel::broker::ContractSpec;
use ordersentinel::config::{ProtectiveConfig, RiskConfig};
use ordersentinel::engine::{conservative_stop, Position, RiskAction, RiskAdjuster};
use ordersentinel::types::{round_to_tick, PositionKind, Quote};

fn contract() -> ContractSpec {
    ContractSpec {
        id: "CON.F.US.MGC.Z26".to_string(),
        name: "MGCZ26".to_string(),
        description: "Micro Gold".to_string(),
        tick_size: dec!(0.1),
        tick_value: dec!(1.0),
    }
}

fn quote_at(last: Decimal) -> Quote {
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

/// Adjuster with the age exit disabled so only price-driven rules fire.
fn adjuster(risk: &RiskConfig) -> RiskAdjuster {
    RiskAdjuster::new(risk, 0, contract())
}

proptest! {
    /// A long position's stop may only move up, never back down,
    /// whatever order the price wanders in.
    #[test]
    fn long_stop_only_ratchets_upward(
        moves in prop::collection::vec(-50i64..50i64, 1..40)
    ) {
        let risk = RiskConfig::default();
        let adjuster = adjuster(&risk);
        let now = Utc::now();
        let mut position = Position::new(
            PositionKind::Long,
            dec!(2000.0),
            5,
            dec!(1998.0),
            None,
            Vec::new(),
            now,
        );

        let mut price = dec!(2000.0);
        let mut floor = position.current_stop_loss;
        for ticks in moves {
            price += Decimal::from(ticks) * dec!(0.1);
            adjuster.evaluate(&mut position, &quote_at(price), Decimal::ZERO, now);
            prop_assert!(
                position.current_stop_loss >= floor,
                "stop loosened from {} to {} at price {}",
                floor, position.current_stop_loss, price
            );
            floor = position.current_stop_loss;
        }
    }

    /// Mirror image for shorts: the stop only moves down.
    #[test]
    fn short_stop_only_ratchets_downward(
        moves in prop::collection::vec(-50i64..50i64, 1..40)
    ) {
        let risk = RiskConfig::default();
        let adjuster = adjuster(&risk);
        let now = Utc::now();
        let mut position = Position::new(
            PositionKind::Short,
            dec!(2000.0),
            5,
            dec!(2002.0),
            None,
            Vec::new(),
            now,
        );

        let mut price = dec!(2000.0);
        let mut ceiling = position.current_stop_loss;
        for ticks in moves {
            price += Decimal::from(ticks) * dec!(0.1);
            adjuster.evaluate(&mut position, &quote_at(price), Decimal::ZERO, now);
            prop_assert!(
                position.current_stop_loss <= ceiling,
                "stop loosened from {} to {} at price {}",
                ceiling, position.current_stop_loss, price
            );
            ceiling = position.current_stop_loss;
        }
    }

    /// The scale-out never empties the position and never rounds to zero:
    /// whatever the fraction, at least one contract goes and at least one
    /// stays.
    #[test]
    fn partial_exit_keeps_a_runner(
        size in 2i64..50i64,
        tenths in 1i64..10i64
    ) {
        let mut risk = RiskConfig::default();
        risk.partial.enabled = true;
        risk.partial.structure_based = false;
        risk.partial.first_exit_r = Decimal::ONE;
        risk.partial.first_exit_pct = Decimal::new(tenths, 1);
        let adjuster = adjuster(&risk);
        let now = Utc::now();
        let mut position = Position::new(
            PositionKind::Long,
            dec!(2000.0),
            size,
            dec!(1998.0),
            None,
            Vec::new(),
            now,
        );

        // Exactly one R of profit.
        let actions = adjuster.evaluate(&mut position, &quote_at(dec!(2002.0)), Decimal::ZERO, now);

        let quantity = actions.iter().find_map(|a| match a {
            RiskAction::PartialExit { quantity } => Some(*quantity),
            _ => None,
        });
        prop_assert!(quantity.is_some(), "no scale-out at one R: {:?}", actions);
        let quantity = quantity.unwrap();
        prop_assert!(quantity >= 1, "scale-out rounded to zero");
        prop_assert!(
            quantity < size,
            "scale-out of {} would flatten the {}-lot position", quantity, size
        );
    }

    /// The fallback stop for an adopted position always sits on the losing
    /// side of both the entry and the market, so it can neither fill on
    /// placement nor lock in a guaranteed loss at the wrong end.
    #[test]
    fn fallback_stop_stays_on_the_protective_side(
        entry_ticks in 10_000i64..50_000i64,
        offset_ticks in -100i64..100i64,
        with_quote in any::<bool>(),
        long in any::<bool>()
    ) {
        let contract = contract();
        let config = ProtectiveConfig::default();
        let side = if long { PositionKind::Long } else { PositionKind::Short };
        let entry = Decimal::from(entry_ticks) * dec!(0.1);
        let last = entry + Decimal::from(offset_ticks) * dec!(0.1);
        let quote = with_quote.then(|| quote_at(last));

        let stop = conservative_stop(side, entry, quote.as_ref(), &config, &contract);

        match side {
            PositionKind::Long => {
                prop_assert!(stop < entry, "long stop {} at or above entry {}", stop, entry);
                if with_quote {
                    prop_assert!(stop < last, "long stop {} at or above market {}", stop, last);
                }
            }
            PositionKind::Short => {
                prop_assert!(stop > entry, "short stop {} at or below entry {}", stop, entry);
                if with_quote {
                    prop_assert!(stop > last, "short stop {} at or below market {}", stop, last);
                }
            }
        }
    }

    /// Tick rounding lands on the grid, moves the price at most half a
    /// tick, and is idempotent.
    #[test]
    fn tick_rounding_is_shallow_and_stable(
        cents in 1i64..1_000_000i64,
        tick_index in 0usize..3usize
    ) {
        let ticks = [dec!(0.1), dec!(0.25), dec!(0.5)];
        let tick = ticks[tick_index];
        let price = Decimal::new(cents, 2);

        let rounded = round_to_tick(price, tick);

        prop_assert!((rounded % tick).is_zero(), "{} is off the {} grid", rounded, tick);
        prop_assert!(
            (rounded - price).abs() <= tick / dec!(2),
            "rounding {} to {} moved more than half a tick", price, rounded
        );
        prop_assert_eq!(round_to_tick(rounded, tick), rounded);
    }

    /// Currency P&L carries the sign of the price move and scales
    /// linearly with position size.
    #[test]
    fn price_move_pnl_tracks_the_move(
        delta_cents in -1_000_000i64..1_000_000i64,
        size in 1i64..200i64
    ) {
        let contract = contract();
        let delta = Decimal::new(delta_cents, 2);

        let pnl = contract.price_move_pnl(delta, size);

        if delta_cents > 0 {
            prop_assert!(pnl > Decimal::ZERO, "gain priced as {}", pnl);
        } else if delta_cents < 0 {
            prop_assert!(pnl < Decimal::ZERO, "loss priced as {}", pnl);
        } else {
            prop_assert!(pnl.is_zero());
        }
        prop_assert_eq!(pnl, contract.price_move_pnl(delta, 1) * Decimal::from(size));
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn two_lot_position_scales_out_exactly_one() {
        let mut risk = RiskConfig::default();
        risk.partial.enabled = true;
        risk.partial.structure_based = false;
        risk.partial.first_exit_pct = dec!(0.5);
        let adjuster = adjuster(&risk);
        let now = Utc::now();
        let mut position = Position::new(
            PositionKind::Long,
            dec!(2000.0),
            2,
            dec!(1998.0),
            None,
            Vec::new(),
            now,
        );

        let actions = adjuster.evaluate(&mut position, &quote_at(dec!(2002.0)), Decimal::ZERO, now);

        assert!(actions
            .iter()
            .any(|a| matches!(a, RiskAction::PartialExit { quantity: 1 })));
    }

    #[test]
    fn fallback_stop_without_a_quote_measures_from_entry() {
        let stop = conservative_stop(
            PositionKind::Long,
            dec!(2000.0),
            None,
            &ProtectiveConfig::default(),
            &contract(),
        );
        assert_eq!(stop, dec!(1997.0));
    }

    #[test]
    fn midpoint_prices_round_to_the_even_tick() {
        assert_eq!(round_to_tick(dec!(2000.05), dec!(0.1)), dec!(2000.0));
        assert_eq!(round_to_tick(dec!(2000.15), dec!(0.1)), dec!(2000.2));
    }
}
