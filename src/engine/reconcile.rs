//! Broker-state reconciliation.
//!
//! The broker is the source of truth. Every cycle (and on every
//! reconnect) the local position model is compared against what the
//! account actually holds, and the local side is adjusted: orphaned
//! broker positions are adopted and protected, positions that closed
//! while the engine was not looking are finalized, and size drift is
//! taken over from the broker.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::alerts::AlertRouter;
use crate::broker::{BrokerError, BrokerGateway, BrokerPosition, ContractSpec, TradeFill};
use crate::config::ProtectiveConfig;
use crate::logging::{JournalEvent, MultiRecorder, TradeRecord, TradeRecorder};
use crate::metrics;
use crate::types::{round_to_tick, OrderType, PositionKind, Quote};

use super::daily::{DailyLimits, DailyStatus};
use super::position::{EngineState, Position};
use super::protective::{ProtectiveError, ProtectiveOrderManager};

/// What a reconciliation pass found and did.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// No position anywhere.
    Flat,
    /// Local and broker agree.
    InSync,
    /// The broker held a position the engine was not tracking; it is now
    /// adopted and protected.
    Adopted { side: PositionKind, size: i64 },
    /// The broker is flat but the engine was tracking a position; it was
    /// finalized locally.
    Closed { pnl: Option<Decimal> },
    /// Sizes disagreed; the broker's size was taken over.
    Resized { local: i64, broker: i64 },
    /// An orphan could not be protected and was market-closed instead.
    Flattened,
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::InSync => "in_sync",
            Self::Adopted { .. } => "adopted",
            Self::Closed { .. } => "closed",
            Self::Resized { .. } => "resized",
            Self::Flattened => "flattened",
        }
    }
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flat => write!(f, "flat"),
            Self::InSync => write!(f, "in sync"),
            Self::Adopted { side, size } => write!(f, "adopted {} {}", size, side),
            Self::Closed { pnl: Some(p) } => write!(f, "closed, P&L {}", p),
            Self::Closed { pnl: None } => write!(f, "closed"),
            Self::Resized { local, broker } => write!(f, "resized {} -> {}", local, broker),
            Self::Flattened => write!(f, "flattened unprotectable orphan"),
        }
    }
}

/// Compares local state against the broker and repairs the local side.
pub struct PositionReconciler {
    gateway: Arc<dyn BrokerGateway>,
    state: Arc<EngineState>,
    protective: Arc<ProtectiveOrderManager>,
    daily: Arc<DailyLimits>,
    alerts: Arc<AlertRouter>,
    journal: Arc<MultiRecorder>,
    config: ProtectiveConfig,
    delivers_fills: bool,
}

impl PositionReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        state: Arc<EngineState>,
        protective: Arc<ProtectiveOrderManager>,
        daily: Arc<DailyLimits>,
        alerts: Arc<AlertRouter>,
        journal: Arc<MultiRecorder>,
        config: ProtectiveConfig,
        delivers_fills: bool,
    ) -> Self {
        Self {
            gateway,
            state,
            protective,
            daily,
            alerts,
            journal,
            config,
            delivers_fills,
        }
    }

    /// One reconciliation pass.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome, BrokerError> {
        let broker_position = self.gateway.open_position().await?;
        let mut slot = self.state.position.lock().await;

        let outcome = match broker_position {
            None => {
                if slot.is_some() {
                    let pnl = self
                        .finalize(&mut slot, None, JournalEvent::Exit, "broker reports flat")
                        .await;
                    ReconcileOutcome::Closed { pnl }
                } else {
                    ReconcileOutcome::Flat
                }
            }
            Some(bp) => {
                if let Some(local) = slot.as_mut() {
                    if bp.size == local.remaining_quantity {
                        ReconcileOutcome::InSync
                    } else {
                        let before = local.remaining_quantity;
                        self.sync_quantity(local, &bp).await;
                        ReconcileOutcome::Resized {
                            local: before,
                            broker: bp.size,
                        }
                    }
                } else {
                    self.adopt(&mut slot, bp).await?
                }
            }
        };

        match &outcome {
            ReconcileOutcome::Flat | ReconcileOutcome::InSync => {
                debug!(outcome = %outcome, "Reconciled")
            }
            other => {
                metrics::record_reconcile_action(other.label());
                info!(outcome = %other, "Reconciliation repaired state");
            }
        }
        Ok(outcome)
    }

    /// Take over a position the broker holds but the engine does not
    /// know. Protective orders already working at the broker are
    /// recovered from the listing; missing legs are created, a missing
    /// stop conservatively.
    async fn adopt(
        &self,
        slot: &mut Option<Position>,
        bp: BrokerPosition,
    ) -> Result<ReconcileOutcome, BrokerError> {
        warn!(
            side = %bp.kind,
            size = bp.size,
            average_price = %bp.average_price,
            "Broker reports a position the engine is not tracking, adopting it"
        );
        let contract = self.gateway.contract();
        let orders = self.gateway.open_orders().await?;
        let closing = bp.kind.closing_side();
        let direction = bp.kind.direction();
        let entry = bp.average_price;

        let stop_order = orders
            .iter()
            .find(|o| o.kind == OrderType::Stop && o.side == closing && o.status.is_working());
        // A closing limit only counts as the take-profit if it rests on
        // the winning side; anything else is someone else's order.
        let target_order = orders.iter().find(|o| {
            o.kind == OrderType::Limit
                && o.side == closing
                && o.status.is_working()
                && o.working_price()
                    .map_or(false, |p| (p - entry) * direction > Decimal::ZERO)
        });

        let quote = self.state.quote().await;
        let stop_loss = match stop_order.and_then(|o| o.working_price()) {
            Some(price) => price,
            None => conservative_stop(bp.kind, entry, quote.as_ref(), &self.config, contract),
        };
        let take_profit = match target_order.and_then(|o| o.working_price()) {
            Some(price) => price,
            None => {
                let stop_distance = (entry - stop_loss) * direction;
                let target_distance = (stop_distance * self.config.min_reward_risk)
                    .max(contract.ticks(self.config.default_target_ticks));
                round_to_tick(entry + direction * target_distance, contract.tick_size)
            }
        };

        let opened_at = bp.opened_at.unwrap_or_else(Utc::now);
        let mut position = Position::new(
            bp.kind,
            entry,
            bp.size,
            stop_loss,
            Some(take_profit),
            Vec::new(),
            opened_at,
        );
        position.stop_order_id = stop_order.map(|o| o.id.clone());
        position.take_profit_order_id = target_order.map(|o| o.id.clone());

        if position.stop_order_id.is_none() || position.take_profit_order_id.is_none() {
            match self.protective.complete_protection(&mut position).await {
                Ok(()) => {}
                Err(ProtectiveError::StopUnrecoverable { .. }) => {
                    self.alerts
                        .forced_exit(format!(
                            "adopted {} {} could not be protected and was flattened",
                            bp.size, bp.kind
                        ))
                        .await;
                    return Ok(ReconcileOutcome::Flattened);
                }
                Err(err) => {
                    warn!(error = %err, "Adoption left a leg unplaced, watchdog will retry")
                }
            }
        }
        position.initial_stop_loss = position.current_stop_loss;

        info!(
            side = %position.side,
            size = position.quantity,
            entry = %position.entry_price,
            stop = %position.current_stop_loss,
            target = ?position.take_profit,
            "Adopted broker position"
        );
        self.alerts
            .position_adopted(format!(
                "{} {} @ {}, stop {}, target {}",
                bp.size, bp.kind, entry, position.current_stop_loss, take_profit
            ))
            .await;
        let record = TradeRecord::new(
            contract.name.clone(),
            JournalEvent::Entry,
            bp.kind,
            bp.size,
        )
        .price(entry)
        .stop_loss(position.current_stop_loss)
        .take_profit(take_profit)
        .reason("adopted");
        if let Err(err) = self.journal.record(&record).await {
            warn!(error = %err, "Journal write failed");
        }
        metrics::set_position_open(true);

        *slot = Some(position);
        Ok(ReconcileOutcome::Adopted {
            side: bp.kind,
            size: bp.size,
        })
    }

    /// Book a finished trade and clear local state. Idempotent: an empty
    /// slot returns `None` without side effects, so the fill event and a
    /// reconcile pass can both observe the same closure safely.
    ///
    /// Realized P&L comes from the closing fill when one is available.
    /// Without one, it is estimated from the last quote only on channels
    /// that never deliver fills; otherwise booking is left to the fill
    /// path and its id-based dedup.
    pub async fn finalize(
        &self,
        slot: &mut Option<Position>,
        fill: Option<&TradeFill>,
        event: JournalEvent,
        reason: &str,
    ) -> Option<Decimal> {
        let position = slot.take()?;
        let contract = self.gateway.contract();

        let (fill_id, mut pnl) = match fill {
            Some(f) => (Some(f.id), f.profit_and_loss),
            None => (None, None),
        };
        if pnl.is_none() && !self.delivers_fills {
            pnl = self
                .state
                .quote()
                .await
                .map(|q| position.unrealized_pnl(q.last_price, contract));
            if let Some(estimate) = pnl {
                debug!(estimate = %estimate, "Estimated realized P&L from the last quote");
            }
        }

        if let Some(value) = pnl {
            if let Some(status) = self.daily.record_close(fill_id, value, Utc::now()) {
                if status == DailyStatus::LossLimit {
                    self.alerts
                        .daily_limit_reached(format!(
                            "realized {} today, no further entries",
                            self.daily.realized_pnl()
                        ))
                        .await;
                }
            }
            metrics::set_daily_pnl(self.daily.realized_pnl().to_f64().unwrap_or(0.0));
        }

        if let Err(err) = self.protective.cancel_dangling().await {
            warn!(error = %err, "Could not cancel leftover orders after closure");
        }

        let mut record = TradeRecord::new(
            contract.name.clone(),
            event,
            position.side,
            position.remaining_quantity,
        )
        .stop_loss(position.current_stop_loss)
        .reason(reason);
        if let Some(f) = fill {
            record = record.price(f.price);
        }
        if let Some(value) = pnl {
            record = record.realized_pnl(value);
        }
        if let Err(err) = self.journal.record(&record).await {
            warn!(error = %err, "Journal write failed");
        }

        if event != JournalEvent::ForcedExit {
            self.alerts
                .position_closed(match pnl {
                    Some(value) => format!(
                        "{} {} closed ({}), P&L {}",
                        position.remaining_quantity, position.side, reason, value
                    ),
                    None => format!(
                        "{} {} closed ({})",
                        position.remaining_quantity, position.side, reason
                    ),
                })
                .await;
        }
        metrics::set_position_open(false);
        info!(event = %event, reason, pnl = ?pnl, "Position closed");
        pnl
    }

    /// The broker's size wins. The entry size is only ever raised, so R
    /// math never divides by more contracts than were actually entered.
    async fn sync_quantity(&self, local: &mut Position, bp: &BrokerPosition) {
        warn!(
            local = local.remaining_quantity,
            broker = bp.size,
            "Position size drifted from the broker, taking broker size"
        );
        local.remaining_quantity = bp.size;
        if bp.size > local.quantity {
            local.quantity = bp.size;
        }
        if let Err(err) = self.protective.sync_sizes(local).await {
            warn!(error = %err, "Protective resize after size drift failed");
        }
    }
}

/// Stop level for a position with no recoverable stop: the wider of
/// "default distance behind the market" and "minimum distance behind
/// entry", so it neither triggers instantly nor hugs a runaway price.
pub fn conservative_stop(
    side: PositionKind,
    entry: Decimal,
    quote: Option<&Quote>,
    config: &ProtectiveConfig,
    contract: &ContractSpec,
) -> Decimal {
    let price = match quote {
        Some(q) => match side {
            PositionKind::Long => (q.last_price - contract.ticks(config.default_stop_ticks))
                .min(entry - contract.ticks(config.min_stop_ticks)),
            PositionKind::Short => (q.last_price + contract.ticks(config.default_stop_ticks))
                .max(entry + contract.ticks(config.min_stop_ticks)),
        },
        None => entry - side.direction() * contract.ticks(config.min_stop_ticks),
    };
    round_to_tick(price, contract.tick_size)
}
