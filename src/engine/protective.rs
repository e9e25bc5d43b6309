//! Protective order lifecycle: placement, replacement, and the watchdog.
//!
//! Every stop and take-profit goes through the same discipline: validate
//! the price against the live quote, place, then confirm the order is
//! actually working by polling the open-order listing. An accepted order
//! that never shows up is treated as not placed. The watchdog re-walks
//! the listing on an interval and repairs whatever drifted: missing
//! orders, stale prices, wrong sizes, duplicates.
//!
//! All mutation of working orders is serialized through
//! [`EngineState::order_guard`]; the watchdog skips its pass when the
//! guard is busy rather than queueing behind a replacement in flight.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::alerts::{Alert, AlertRouter};
use crate::broker::{
    BrokerError, BrokerGateway, BrokerOrder, ContractSpec, OrderChanges, OrderId, OrderTicket,
};
use crate::config::ProtectiveConfig;
use crate::metrics;
use crate::types::{round_to_tick, OrderType, PositionKind, Quote};

use super::position::{EngineState, Position};

/// Which protective leg an operation is acting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectiveKind {
    Stop,
    TakeProfit,
}

impl ProtectiveKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::TakeProfit => "target",
        }
    }
}

impl std::fmt::Display for ProtectiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum ProtectiveError {
    /// The stop could not be placed within the attempt budget. The
    /// position has already been market-closed when this is returned.
    #[error("stop placement exhausted after {attempts} attempts, position flattened")]
    StopUnrecoverable { attempts: u32 },

    /// A replacement was accepted but never verified; the previous order
    /// was kept working.
    #[error("{kind} replacement accepted but never verified")]
    ReplacementNotVerified { kind: ProtectiveKind },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Outcome of one watchdog pass.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogReport {
    /// The interval has not elapsed yet.
    NotDue,
    /// Another order operation holds the guard; skipped.
    Busy,
    Clean,
    Repaired { actions: Vec<String> },
}

/// Places and babysits the stop and take-profit for the open position.
pub struct ProtectiveOrderManager {
    gateway: Arc<dyn BrokerGateway>,
    state: Arc<EngineState>,
    alerts: Arc<AlertRouter>,
    config: ProtectiveConfig,
    last_watchdog: Mutex<Option<Instant>>,
}

impl ProtectiveOrderManager {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        state: Arc<EngineState>,
        alerts: Arc<AlertRouter>,
        config: ProtectiveConfig,
    ) -> Self {
        Self {
            gateway,
            state,
            alerts,
            config,
            last_watchdog: Mutex::new(None),
        }
    }

    /// Place the initial bracket for a fresh or adopted position: the
    /// stop first, with the full retry budget, then the take-profit.
    ///
    /// A stop that cannot be placed means the position cannot be held;
    /// it is market-closed and [`ProtectiveError::StopUnrecoverable`]
    /// comes back. A failed take-profit is only warned about, the
    /// watchdog re-places it on its next pass.
    pub async fn place_initial(&self, position: &mut Position) -> Result<(), ProtectiveError> {
        let _guard = self.state.order_guard.lock().await;
        self.place_stop_leg(position).await?;
        // R math keys off the stop that actually rests at the broker.
        position.initial_stop_loss = position.current_stop_loss;

        if position.take_profit.is_some() {
            if let Err(err) = self.place_target_leg(position).await {
                warn!(error = %err, "Take-profit placement failed, watchdog will retry");
                self.alerts
                    .send(Alert::warning(
                        "Take-profit missing",
                        format!("take-profit could not be placed: {}", err),
                    ))
                    .await;
            }
        }
        Ok(())
    }

    /// Place whichever protective leg has no tracked order yet. Used for
    /// adopted positions where one leg was recovered from the listing
    /// and the other must be created.
    pub async fn complete_protection(&self, position: &mut Position) -> Result<(), ProtectiveError> {
        let _guard = self.state.order_guard.lock().await;
        if position.stop_order_id.is_none() {
            self.place_stop_leg(position).await?;
        }
        if position.take_profit.is_some() && position.take_profit_order_id.is_none() {
            if let Err(err) = self.place_target_leg(position).await {
                warn!(error = %err, "Take-profit placement failed, watchdog will retry");
            }
        }
        Ok(())
    }

    /// Replace a protective order with one at a new price and size.
    ///
    /// Place-then-cancel, never the reverse: the old order keeps working
    /// until the new one is verified, so the position is protected at
    /// every instant. If the new order cannot be verified it is
    /// best-effort cancelled and the old one stays.
    pub async fn replace(
        &self,
        position: &mut Position,
        kind: ProtectiveKind,
        price: Decimal,
        size: i64,
    ) -> Result<(), ProtectiveError> {
        let _guard = self.state.order_guard.lock().await;
        self.replace_unlocked(position, kind, price, size).await
    }

    async fn replace_unlocked(
        &self,
        position: &mut Position,
        kind: ProtectiveKind,
        price: Decimal,
        size: i64,
    ) -> Result<(), ProtectiveError> {
        let quote = self.state.quote().await;
        let contract = self.gateway.contract();
        let (validated, ticket, old_id) = match kind {
            ProtectiveKind::Stop => {
                let p = validated_stop_price(position.side, price, quote.as_ref(), 0, contract);
                (
                    p,
                    OrderTicket::stop(position.side.closing_side(), size, p),
                    position.stop_order_id.clone(),
                )
            }
            ProtectiveKind::TakeProfit => {
                let p = validated_target_price(position.side, price, quote.as_ref(), contract);
                (
                    p,
                    OrderTicket::limit(position.side.closing_side(), size, p),
                    position.take_profit_order_id.clone(),
                )
            }
        };

        let new_id = match self.gateway.place_order(&ticket).await {
            Ok(id) => id,
            Err(err) => {
                metrics::record_order(kind.label(), false);
                warn!(
                    kind = kind.label(),
                    error = %err,
                    "Replacement order rejected, keeping the working one"
                );
                return Err(err.into());
            }
        };
        if let Err(err) = self.verify_working(&new_id).await {
            warn!(kind = kind.label(), order_id = %new_id, error = %err, "Replacement never verified");
            let _ = self.gateway.cancel_order(&new_id).await;
            self.alerts
                .send(Alert::warning(
                    "Protective replacement unverified",
                    format!(
                        "{} replacement {} never showed as working, previous order kept",
                        kind.label(),
                        new_id
                    ),
                ))
                .await;
            return Err(ProtectiveError::ReplacementNotVerified { kind });
        }

        metrics::record_order(kind.label(), true);
        match kind {
            ProtectiveKind::Stop => {
                position.stop_order_id = Some(new_id.clone());
                position.current_stop_loss = validated;
            }
            ProtectiveKind::TakeProfit => {
                position.take_profit_order_id = Some(new_id.clone());
                position.take_profit = Some(validated);
            }
        }
        metrics::record_protective_replacement(kind.label());
        info!(
            kind = kind.label(),
            order_id = %new_id,
            price = %validated,
            size,
            "Protective order replaced"
        );
        if let Some(old) = old_id {
            self.cancel_with_retry(&old).await;
        }
        Ok(())
    }

    /// Resize both legs to the position's remaining quantity, after a
    /// partial exit. Modify in place; a leg that refuses the modify is
    /// replaced outright.
    pub async fn sync_sizes(&self, position: &mut Position) -> Result<(), ProtectiveError> {
        let _guard = self.state.order_guard.lock().await;
        let size = position.remaining_quantity;

        if let Some(id) = position.stop_order_id.clone() {
            if let Err(err) = self.gateway.modify_order(&id, &OrderChanges::size(size)).await {
                warn!(order_id = %id, error = %err, "Stop resize failed, replacing");
                let price = position.current_stop_loss;
                self.replace_unlocked(position, ProtectiveKind::Stop, price, size)
                    .await?;
            }
        }
        if let (Some(id), Some(target)) =
            (position.take_profit_order_id.clone(), position.take_profit)
        {
            if let Err(err) = self.gateway.modify_order(&id, &OrderChanges::size(size)).await {
                warn!(order_id = %id, error = %err, "Take-profit resize failed, replacing");
                self.replace_unlocked(position, ProtectiveKind::TakeProfit, target, size)
                    .await?;
            }
        }
        Ok(())
    }

    /// One repair pass over the open-order listing.
    ///
    /// Returns [`WatchdogReport::NotDue`] inside the interval and
    /// [`WatchdogReport::Busy`] when an order operation is in flight.
    /// Propagates [`ProtectiveError::StopUnrecoverable`] when a missing
    /// stop could not be re-placed; the position is already flat then and
    /// the caller must drop its local copy.
    pub async fn watchdog(
        &self,
        position: &mut Position,
    ) -> Result<WatchdogReport, ProtectiveError> {
        {
            let mut last = self.last_watchdog.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(at) = *last {
                if at.elapsed() < Duration::from_secs(self.config.watchdog_interval_secs) {
                    return Ok(WatchdogReport::NotDue);
                }
            }
            *last = Some(Instant::now());
        }
        let Ok(_guard) = self.state.order_guard.try_lock() else {
            return Ok(WatchdogReport::Busy);
        };

        let orders = self.gateway.open_orders().await?;
        let closing = position.side.closing_side();
        let mut stops: Vec<&BrokerOrder> = orders
            .iter()
            .filter(|o| o.kind == OrderType::Stop && o.side == closing && o.status.is_working())
            .collect();
        let mut targets: Vec<&BrokerOrder> = orders
            .iter()
            .filter(|o| o.kind == OrderType::Limit && o.side == closing && o.status.is_working())
            .collect();
        let mut actions = Vec::new();

        // Duplicate stops double the closing exposure; keep the tightest.
        if stops.len() > 1 {
            match position.side {
                PositionKind::Long => stops.sort_by(|a, b| b.working_price().cmp(&a.working_price())),
                PositionKind::Short => stops.sort_by(|a, b| a.working_price().cmp(&b.working_price())),
            }
            for extra in stops.split_off(1) {
                if self.cancel_with_retry(&extra.id).await {
                    metrics::record_watchdog_repair("dedup_stop");
                    actions.push(format!("cancelled duplicate stop {}", extra.id));
                }
            }
        }

        match stops.first() {
            Some(stop) => {
                if position.stop_order_id.as_ref() != Some(&stop.id) {
                    // Bracket-created or adopted stop the engine was not
                    // tracking yet.
                    position.stop_order_id = Some(stop.id.clone());
                    metrics::record_watchdog_repair("link_stop");
                    actions.push(format!("linked stop {}", stop.id));
                }
                if let Some(working) = stop.working_price() {
                    if position.stop_improves(working) {
                        // The resting order is tighter than the local
                        // model; the ratchet never loosens, so trust it.
                        position.current_stop_loss = working;
                    } else if working != position.current_stop_loss {
                        let changes = OrderChanges::stop_price(position.current_stop_loss);
                        match self.gateway.modify_order(&stop.id, &changes).await {
                            Ok(()) => {
                                metrics::record_watchdog_repair("reprice_stop");
                                actions.push(format!(
                                    "repriced stop to {}",
                                    position.current_stop_loss
                                ));
                            }
                            Err(err) => {
                                warn!(order_id = %stop.id, error = %err, "Stop reprice failed")
                            }
                        }
                    }
                }
                if stop.size != position.remaining_quantity {
                    let changes = OrderChanges::size(position.remaining_quantity);
                    match self.gateway.modify_order(&stop.id, &changes).await {
                        Ok(()) => {
                            metrics::record_watchdog_repair("resize_stop");
                            actions.push(format!(
                                "resized stop to {}",
                                position.remaining_quantity
                            ));
                        }
                        Err(err) => {
                            warn!(order_id = %stop.id, error = %err, "Stop resize failed, replacing");
                            let price = position.current_stop_loss;
                            let size = position.remaining_quantity;
                            self.replace_unlocked(position, ProtectiveKind::Stop, price, size)
                                .await?;
                            actions.push("replaced stop after failed resize".to_string());
                        }
                    }
                }
            }
            None => {
                warn!("Watchdog found the position without a working stop");
                position.stop_order_id = None;
                self.place_stop_leg(position).await?;
                metrics::record_watchdog_repair("place_stop");
                actions.push("placed missing stop".to_string());
            }
        }

        if targets.len() > 1 {
            // Keep the one covering the most contracts.
            targets.sort_by_key(|o| std::cmp::Reverse(o.size));
            for extra in targets.split_off(1) {
                if self.cancel_with_retry(&extra.id).await {
                    metrics::record_watchdog_repair("dedup_target");
                    actions.push(format!("cancelled duplicate take-profit {}", extra.id));
                }
            }
        }

        match targets.first() {
            Some(target) => {
                if position.take_profit_order_id.as_ref() != Some(&target.id) {
                    position.take_profit_order_id = Some(target.id.clone());
                    if position.take_profit.is_none() {
                        position.take_profit = target.working_price();
                    }
                    metrics::record_watchdog_repair("link_target");
                    actions.push(format!("linked take-profit {}", target.id));
                }
                if target.size != position.remaining_quantity {
                    let changes = OrderChanges::size(position.remaining_quantity);
                    match self.gateway.modify_order(&target.id, &changes).await {
                        Ok(()) => {
                            metrics::record_watchdog_repair("resize_target");
                            actions.push(format!(
                                "resized take-profit to {}",
                                position.remaining_quantity
                            ));
                        }
                        Err(err) => {
                            warn!(order_id = %target.id, error = %err, "Take-profit resize failed")
                        }
                    }
                }
            }
            None if position.take_profit.is_some() => {
                match self.place_target_leg(position).await {
                    Ok(()) => {
                        metrics::record_watchdog_repair("place_target");
                        actions.push("placed missing take-profit".to_string());
                    }
                    Err(err) => {
                        warn!(error = %err, "Take-profit re-placement failed, will retry next pass")
                    }
                }
            }
            None => {}
        }

        Ok(if actions.is_empty() {
            WatchdogReport::Clean
        } else {
            info!(?actions, "Watchdog repaired protective orders");
            WatchdogReport::Repaired { actions }
        })
    }

    /// Cancel every working order left on the contract. Used once the
    /// position is gone so nothing can fire into a flat book.
    pub async fn cancel_dangling(&self) -> Result<usize, BrokerError> {
        let _guard = self.state.order_guard.lock().await;
        let orders = self.gateway.open_orders().await?;
        let mut cancelled = 0;
        for order in orders.iter().filter(|o| o.status.is_working()) {
            if self.cancel_with_retry(&order.id).await {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(cancelled, "Cancelled leftover working orders");
        }
        Ok(cancelled)
    }

    /// Stop placement with the full attempt budget. Each retry nudges the
    /// desired price one tick further from the market, so a borderline
    /// rejection does not repeat forever. Exhaustion flattens the
    /// position: better out flat than in without a stop.
    async fn place_stop_leg(&self, position: &mut Position) -> Result<(), ProtectiveError> {
        let desired = position.current_stop_loss;
        let size = position.remaining_quantity;
        for attempt in 0..self.config.max_place_attempts {
            if attempt > 0 {
                sleep(Duration::from_millis(self.config.verify_delay_ms)).await;
            }
            let quote = self.state.quote().await;
            let price = validated_stop_price(
                position.side,
                desired,
                quote.as_ref(),
                i64::from(attempt),
                self.gateway.contract(),
            );
            let ticket = OrderTicket::stop(position.side.closing_side(), size, price);
            match self.gateway.place_order(&ticket).await {
                Ok(id) => match self.verify_working(&id).await {
                    Ok(_) => {
                        metrics::record_order("stop", true);
                        info!(order_id = %id, price = %price, size, "Protective stop placed and verified");
                        position.stop_order_id = Some(id);
                        position.current_stop_loss = price;
                        return Ok(());
                    }
                    Err(err) => {
                        metrics::record_order("stop", false);
                        warn!(attempt, order_id = %id, error = %err, "Stop accepted but not verified");
                    }
                },
                Err(err) => {
                    metrics::record_order("stop", false);
                    warn!(attempt, price = %price, error = %err, "Stop placement attempt failed");
                }
            }
        }

        error!(
            attempts = self.config.max_place_attempts,
            "Could not place a protective stop, flattening the position"
        );
        self.alerts
            .unprotected_position(format!(
                "stop placement failed {} times, market-closing {} {}",
                self.config.max_place_attempts, position.remaining_quantity, position.side
            ))
            .await;
        if let Err(err) = self.gateway.close_position().await {
            error!(error = %err, "Failed to flatten the unprotected position");
            self.alerts
                .send(Alert::critical(
                    "Unprotected position",
                    format!("stop placement and market close both failed: {}", err),
                ))
                .await;
        }
        Err(ProtectiveError::StopUnrecoverable {
            attempts: self.config.max_place_attempts,
        })
    }

    /// Single-shot take-profit placement; the watchdog owns retries.
    async fn place_target_leg(&self, position: &mut Position) -> Result<(), ProtectiveError> {
        let Some(desired) = position.take_profit else {
            return Ok(());
        };
        let quote = self.state.quote().await;
        let price =
            validated_target_price(position.side, desired, quote.as_ref(), self.gateway.contract());
        let ticket = OrderTicket::limit(
            position.side.closing_side(),
            position.remaining_quantity,
            price,
        );
        match self.gateway.place_order(&ticket).await {
            Ok(id) => {
                self.verify_working(&id).await?;
                metrics::record_order("target", true);
                info!(order_id = %id, price = %price, "Take-profit placed and verified");
                position.take_profit_order_id = Some(id);
                position.take_profit = Some(price);
                Ok(())
            }
            Err(err) => {
                metrics::record_order("target", false);
                Err(err.into())
            }
        }
    }

    /// Poll the open-order listing until the order shows as working.
    async fn verify_working(&self, id: &OrderId) -> Result<BrokerOrder, ProtectiveError> {
        for _ in 0..self.config.verify_attempts {
            sleep(Duration::from_millis(self.config.verify_delay_ms)).await;
            let orders = self.gateway.open_orders().await?;
            if let Some(order) = orders
                .into_iter()
                .find(|o| &o.id == id && o.status.is_working())
            {
                return Ok(order);
            }
        }
        Err(BrokerError::VerificationFailed(id.clone()).into())
    }

    async fn cancel_with_retry(&self, id: &OrderId) -> bool {
        for attempt in 0..self.config.cancel_attempts {
            match self.gateway.cancel_order(id).await {
                Ok(()) => return true,
                Err(err) => {
                    warn!(order_id = %id, attempt, error = %err, "Cancel failed")
                }
            }
            if attempt + 1 < self.config.cancel_attempts {
                sleep(Duration::from_millis(self.config.cancel_retry_delay_ms)).await;
            }
        }
        warn!(order_id = %id, "Cancel retries exhausted, the watchdog will prune it");
        false
    }
}

/// A resting stop must sit on the losing side of the market or the
/// gateway rejects it as immediately marketable. Clamp a tick off the
/// touch and nudge further away per retry.
pub fn validated_stop_price(
    side: PositionKind,
    desired: Decimal,
    quote: Option<&Quote>,
    nudge_ticks: i64,
    contract: &ContractSpec,
) -> Decimal {
    let tick = contract.ticks(1);
    let mut price = match side {
        PositionKind::Long => desired - contract.ticks(nudge_ticks),
        PositionKind::Short => desired + contract.ticks(nudge_ticks),
    };
    if let Some(q) = quote {
        price = match side {
            PositionKind::Long => price.min(q.bid() - tick),
            PositionKind::Short => price.max(q.ask() + tick),
        };
    }
    round_to_tick(price, contract.tick_size)
}

/// A take-profit limit must rest on the winning side of the market.
pub fn validated_target_price(
    side: PositionKind,
    desired: Decimal,
    quote: Option<&Quote>,
    contract: &ContractSpec,
) -> Decimal {
    let tick = contract.ticks(1);
    let mut price = desired;
    if let Some(q) = quote {
        price = match side {
            PositionKind::Long => price.max(q.ask() + tick),
            PositionKind::Short => price.min(q.bid() - tick),
        };
    }
    round_to_tick(price, contract.tick_size)
}
