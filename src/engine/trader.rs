//! The order-management engine.
//!
//! One task drives everything: a `select!` over the real-time event
//! channel and a fixed-cadence cycle timer. Events carry quotes, order
//! and position updates, and fills; the cycle reconciles against the
//! broker, runs the protective-order watchdog, expires parked entries,
//! and polls the signal source. The broker stays the source of truth
//! throughout; local state is a cache the reconciler keeps honest.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alerts::AlertRouter;
use crate::broker::{
    ticks_between, BracketTicks, BrokerGateway, BrokerPosition, MarketEvent, MarketEvents,
    OrderTicket, TradeFill,
};
use crate::config::{EngineConfig, EntryMode};
use crate::health::{self, HealthState};
use crate::logging::{
    self, EngineLogThrottles, JournalEvent, MultiRecorder, TradeRecord, TradeRecorder,
};
use crate::metrics;
use crate::resilience::{CircuitBreaker, ConnectionHealth, ConnectionMonitor};
use crate::types::Quote;

use super::daily::{DailyLimits, DailyStatus};
use super::position::{EngineState, PendingLimitEntry, Position};
use super::protective::{ProtectiveError, ProtectiveKind, ProtectiveOrderManager};
use super::reconcile::PositionReconciler;
use super::risk::{ForceCloseReason, RiskAction, RiskAdjuster, StopMoveReason};
use super::signal::{Signal, SignalSource};
use super::EngineError;

/// Tag stamped on entry orders so they can be told apart in listings.
const ENTRY_TAG: &str = "engine-entry";

/// Capacity of the internal event queue between the channel task and the
/// main loop.
const EVENT_QUEUE_DEPTH: usize = 256;

pub struct TradeEngine {
    config: EngineConfig,
    gateway: Arc<dyn BrokerGateway>,
    events: Arc<dyn MarketEvents>,
    signals: Box<dyn SignalSource>,
    state: Arc<EngineState>,
    daily: Arc<DailyLimits>,
    risk: RiskAdjuster,
    protective: Arc<ProtectiveOrderManager>,
    reconciler: PositionReconciler,
    breaker: CircuitBreaker,
    monitor: ConnectionMonitor,
    alerts: Arc<AlertRouter>,
    journal: Arc<MultiRecorder>,
    health: HealthState,
    throttles: EngineLogThrottles,
    delivers_fills: bool,
    started: Instant,
}

impl TradeEngine {
    pub fn new(
        config: EngineConfig,
        gateway: Arc<dyn BrokerGateway>,
        events: Box<dyn MarketEvents>,
        signals: Box<dyn SignalSource>,
        health: HealthState,
    ) -> Result<Self, EngineError> {
        let tz: Tz = config.timezone()?;
        let blocked_days = config.blocked_weekdays()?;
        let events: Arc<dyn MarketEvents> = Arc::from(events);
        let delivers_fills = events.delivers_fills();

        let state = Arc::new(EngineState::new());
        let alerts = Arc::new(AlertRouter::from_config(&config.alerts));
        let journal = Arc::new(logging::build_journal(&config.journal));
        let daily = Arc::new(DailyLimits::new(
            &config.risk,
            tz,
            blocked_days,
            config.cooldown_duration(),
            Utc::now(),
        ));
        let risk = RiskAdjuster::new(
            &config.risk,
            config.trading.max_position_hours,
            gateway.contract().clone(),
        );
        let protective = Arc::new(ProtectiveOrderManager::new(
            gateway.clone(),
            state.clone(),
            alerts.clone(),
            config.protective.clone(),
        ));
        let reconciler = PositionReconciler::new(
            gateway.clone(),
            state.clone(),
            protective.clone(),
            daily.clone(),
            alerts.clone(),
            journal.clone(),
            config.protective.clone(),
            delivers_fills,
        );
        let breaker = CircuitBreaker::from_config(&config.breaker);
        let monitor = ConnectionMonitor::new(&config.connection);
        let throttles = EngineLogThrottles::new(config.connection.heartbeat_log_secs);

        Ok(Self {
            config,
            gateway,
            events,
            signals,
            state,
            daily,
            risk,
            protective,
            reconciler,
            breaker,
            monitor,
            alerts,
            journal,
            health,
            throttles,
            delivers_fills,
            started: Instant::now(),
        })
    }

    /// Run until Ctrl-C.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
        });
        self.run_with_shutdown(shutdown_rx).await
    }

    /// Run until the shutdown flag flips (or its sender is dropped).
    pub async fn run_with_shutdown(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        info!(
            contract = %self.gateway.contract().name,
            account = self.gateway.account_id(),
            mode = ?self.config.trading.entry_mode,
            size = self.config.trading.position_size,
            push = self.delivers_fills,
            "Engine starting"
        );

        let (event_tx, mut event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let mut stream_task = self.spawn_stream(event_tx.clone(), shutdown.clone());

        match self.reconciler.reconcile().await {
            Ok(outcome) => info!(outcome = %outcome, "Startup reconciliation complete"),
            Err(err) => {
                warn!(error = %err, "Startup reconciliation failed, retrying next cycle")
            }
        }

        let mut cycle = interval(Duration::from_secs(
            self.config.trading.poll_interval_secs.max(1),
        ));
        cycle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(event) = event_rx.recv() => {
                    self.handle_event(event).await;
                }
                _ = cycle.tick() => {
                    if stream_task.is_finished() || self.monitor.health().is_dead() {
                        warn!(
                            health = self.monitor.health().label(),
                            silence = ?self.monitor.silence(),
                            "Event channel gone, restarting it"
                        );
                        stream_task.abort();
                        stream_task = self.spawn_stream(event_tx.clone(), shutdown.clone());
                        self.monitor.record_event();
                        metrics::record_push_reconnect("stream");
                        if let Err(err) = self.reconciler.reconcile().await {
                            warn!(error = %err, "Reconcile after channel restart failed");
                        }
                    }
                    self.run_cycle().await;
                }
            }
        }

        info!("Engine stopping");
        stream_task.abort();
        Ok(())
    }

    fn spawn_stream(
        &self,
        tx: mpsc::Sender<MarketEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(err) = events.stream(tx, shutdown).await {
                error!(error = %err, "Event channel terminated");
            }
        })
    }

    async fn handle_event(&mut self, event: MarketEvent) {
        match event {
            MarketEvent::Quote(quote) => {
                self.monitor.record_quote();
                metrics::record_quote_received();
                self.state.set_quote(quote.clone()).await;
                self.check_pending_entry(&quote).await;
                self.evaluate_position().await;
            }
            MarketEvent::Order(order) => {
                self.monitor.record_event();
                debug!(order_id = %order.id, status = ?order.status, "Order update");
            }
            MarketEvent::Position(update) => {
                self.monitor.record_event();
                debug!(size = update.size, "Position update received, reconciling");
                if let Err(err) = self.reconciler.reconcile().await {
                    warn!(error = %err, "Reconcile after position update failed");
                }
            }
            MarketEvent::Trade(fill) => {
                self.monitor.record_event();
                self.handle_fill(fill).await;
            }
            MarketEvent::Connected => {
                self.monitor.record_event();
                info!("Event channel connected, reconciling");
                if let Err(err) = self.reconciler.reconcile().await {
                    warn!(error = %err, "Reconcile after reconnect failed");
                }
            }
            MarketEvent::Disconnected => {
                warn!("Event channel disconnected, reconnect in progress");
            }
        }
    }

    /// Book a fill reported by the event channel.
    ///
    /// Closing fills are booked into the daily ledger before anything
    /// else, even when no local position is tracked; the fill-id dedup
    /// absorbs replays and the overlap with reconciliation. Whether the
    /// whole position is done comes from the broker, not the fill: a
    /// scale-out produces a closing fill too.
    async fn handle_fill(&self, fill: TradeFill) {
        if fill.voided {
            debug!(fill_id = fill.id, "Ignoring voided fill");
            return;
        }
        info!(
            fill_id = fill.id,
            side = ?fill.side,
            size = fill.size,
            price = %fill.price,
            pnl = ?fill.profit_and_loss,
            "Fill"
        );
        if !fill.is_closing() {
            return;
        }

        if let Some(pnl) = fill.profit_and_loss {
            if let Some(status) = self.daily.record_close(Some(fill.id), pnl, Utc::now()) {
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

        match self.gateway.open_position().await {
            Ok(None) => {
                let mut slot = self.state.position.lock().await;
                if slot.is_some() {
                    self.reconciler
                        .finalize(
                            &mut slot,
                            Some(&fill),
                            JournalEvent::Exit,
                            "protective order filled",
                        )
                        .await;
                }
            }
            Ok(Some(_)) => {
                debug!("Closing fill with contracts still open, syncing sizes");
                if let Err(err) = self.reconciler.reconcile().await {
                    warn!(error = %err, "Reconcile after partial fill failed");
                }
            }
            Err(err) => {
                warn!(error = %err, "Could not confirm the position after a closing fill")
            }
        }
    }

    /// One pass of the periodic duties.
    pub async fn run_cycle(&mut self) {
        let now = Utc::now();
        if self.daily.roll_day(now) {
            self.state.pending_entry.lock().await.take();
            metrics::set_daily_pnl(0.0);
        }

        if let ConnectionHealth::Degraded { missed_heartbeats } = self.monitor.health() {
            if self.throttles.degraded_connection.should_log() {
                let suppressed = self
                    .throttles
                    .degraded_connection
                    .get_and_reset_suppressed_count();
                warn!(missed_heartbeats, suppressed, "Event channel degraded");
            }
        }

        if let Err(err) = self.reconciler.reconcile().await {
            warn!(error = %err, "Reconciliation failed");
        }

        if self.state.has_position().await {
            self.evaluate_position().await;
            self.run_watchdog().await;
        } else {
            self.expire_pending_entry(now).await;
            self.poll_signal_and_enter(now).await;
        }

        self.heartbeat_log();
        self.update_health().await;
    }

    /// Run the open position through the risk pipeline and carry out
    /// whatever it decided.
    pub async fn evaluate_position(&mut self) {
        let staleness = Duration::from_secs(self.config.trading.quote_staleness_secs.max(0) as u64);
        if self.monitor.is_quote_stale(staleness) {
            if self.state.has_position().await && self.throttles.stale_quote.should_log() {
                let suppressed = self.throttles.stale_quote.get_and_reset_suppressed_count();
                warn!(
                    age = ?self.monitor.quote_age(),
                    suppressed,
                    "Quote stale, holding off risk adjustments"
                );
            }
            return;
        }
        let Some(quote) = self.state.quote().await else {
            return;
        };

        let mut slot = self.state.position.lock().await;
        let Some(position) = slot.as_mut() else {
            return;
        };
        let actions = self
            .risk
            .evaluate(position, &quote, self.daily.realized_pnl(), Utc::now());
        if actions.is_empty() {
            return;
        }

        // A forced exit comes back alone and supersedes everything else.
        if let Some(reason) = actions.iter().find_map(|action| match action {
            RiskAction::ForceClose { reason } => Some(*reason),
            _ => None,
        }) {
            self.force_close(&mut slot, reason).await;
            return;
        }

        let mut stop_moves: Vec<(rust_decimal::Decimal, StopMoveReason)> = Vec::new();
        for action in actions {
            match action {
                RiskAction::ForceClose { .. } => {}
                RiskAction::PartialExit { quantity } => {
                    self.execute_partial(position, quantity).await;
                }
                RiskAction::MoveStop { price, reason } => {
                    stop_moves.push((price, reason));
                }
                RiskAction::BreakEvenSkipped { candidate, drift } => {
                    self.alerts
                        .stop_move_skipped(format!(
                            "break-even to {} skipped, market pulled {} past entry",
                            candidate, drift
                        ))
                        .await;
                }
            }
        }

        if stop_moves.is_empty() {
            return;
        }
        for (price, reason) in &stop_moves {
            let record = TradeRecord::new(
                self.gateway.contract().name.clone(),
                JournalEvent::StopMoved,
                position.side,
                position.remaining_quantity,
            )
            .stop_loss(*price)
            .reason(reason.to_string());
            if let Err(err) = self.journal.record(&record).await {
                warn!(error = %err, "Journal write failed");
            }
        }
        // Several rules may have tightened the stop in one pass; the
        // broker gets a single replacement at the final level.
        let final_stop = position.current_stop_loss;
        let size = position.remaining_quantity;
        if let Err(err) = self
            .protective
            .replace(position, ProtectiveKind::Stop, final_stop, size)
            .await
        {
            warn!(error = %err, "Stop replacement failed, the watchdog will reprice it");
        }
    }

    async fn force_close(&self, slot: &mut Option<Position>, reason: ForceCloseReason) {
        warn!(reason = %reason, "Force-closing the position");
        if let Err(err) = self.gateway.close_position().await {
            error!(error = %err, "Forced close failed, retrying next evaluation");
            self.alerts
                .forced_exit(format!("forced close FAILED: {}", err))
                .await;
            return;
        }
        if matches!(reason, ForceCloseReason::DailyLoss { .. }) {
            self.daily.mark_limit_hit();
        }
        self.alerts.forced_exit(reason.to_string()).await;
        let label = match reason {
            ForceCloseReason::DailyLoss { .. } => "daily_loss_limit",
            ForceCloseReason::MaxAge { .. } => "max_position_age",
        };
        self.reconciler
            .finalize(slot, None, JournalEvent::ForcedExit, label)
            .await;
    }

    /// Scale out at the broker; quantity and the one-shot flag commit
    /// only on confirmation.
    async fn execute_partial(&self, position: &mut Position, quantity: i64) {
        info!(
            quantity,
            remaining = position.remaining_quantity,
            "Scaling out"
        );
        if let Err(err) = self.gateway.partial_close_position(quantity).await {
            warn!(error = %err, "Partial close failed, will retry on the next trigger");
            metrics::record_order("partial_close", false);
            return;
        }
        metrics::record_order("partial_close", true);
        position.remaining_quantity -= quantity;
        position.partial_exit_done = true;

        let mut record = TradeRecord::new(
            self.gateway.contract().name.clone(),
            JournalEvent::PartialExit,
            position.side,
            quantity,
        )
        .stop_loss(position.current_stop_loss)
        .reason("first target");
        // Channels without fill events never learn the realized leg;
        // estimate it from the last quote so the daily ledger moves.
        if !self.delivers_fills {
            if let Some(quote) = self.state.quote().await {
                let estimate = self
                    .gateway
                    .contract()
                    .price_move_pnl(position.profit_at(quote.last_price), quantity);
                record = record.price(quote.last_price).realized_pnl(estimate);
                self.daily.record_close(None, estimate, Utc::now());
                metrics::set_daily_pnl(self.daily.realized_pnl().to_f64().unwrap_or(0.0));
            }
        }
        if let Err(err) = self.journal.record(&record).await {
            warn!(error = %err, "Journal write failed");
        }
        if let Err(err) = self.protective.sync_sizes(position).await {
            warn!(error = %err, "Protective resize after scale-out failed");
        }
    }

    async fn run_watchdog(&self) {
        let mut slot = self.state.position.lock().await;
        let Some(position) = slot.as_mut() else {
            return;
        };
        // The manager logs its own repairs; only failures matter here.
        match self.protective.watchdog(position).await {
            Ok(_) => {}
            Err(ProtectiveError::StopUnrecoverable { .. }) => {
                // The manager already flattened at the broker.
                self.reconciler
                    .finalize(
                        &mut slot,
                        None,
                        JournalEvent::ForcedExit,
                        "protective orders unrecoverable",
                    )
                    .await;
            }
            Err(err) => warn!(error = %err, "Watchdog pass failed"),
        }
    }

    /// Ask the signal source for an entry and act on it, entry gates
    /// permitting.
    async fn poll_signal_and_enter(&mut self, now: DateTime<Utc>) {
        if self.breaker.is_open() {
            debug!("Circuit breaker open, not taking entries");
            return;
        }
        if let Err(block) = self.daily.entry_allowed(now) {
            debug!(reason = block.reason(), "Entries blocked: {}", block);
            return;
        }
        if self.state.pending_entry.lock().await.is_some() {
            return;
        }
        let Some(signal) = self.signals.poll().await else {
            return;
        };
        info!(
            side = %signal.side,
            entry = %signal.entry_price,
            stop = %signal.stop_loss,
            target = ?signal.take_profit,
            "Signal received"
        );
        if let Err(err) = signal.validate() {
            warn!(error = %err, "Rejecting malformed signal");
            return;
        }
        let staleness = Duration::from_secs(self.config.trading.quote_staleness_secs.max(0) as u64);
        if self.monitor.is_quote_stale(staleness) {
            warn!("No fresh quote, dropping the signal");
            return;
        }

        match self.config.trading.entry_mode {
            EntryMode::LimitRetest => {
                let pending = PendingLimitEntry::from_signal(
                    &signal,
                    self.config.trading.position_size,
                    self.config.trading.retest_entry_offset_ticks,
                    self.gateway.contract().tick_size,
                    self.config.retest_lifetime(),
                    now,
                );
                info!(
                    limit = %pending.limit_price,
                    expires_at = %pending.expires_at,
                    "Parking limit-retest entry"
                );
                *self.state.pending_entry.lock().await = Some(pending);
            }
            _ => self.execute_entry(signal, now).await,
        }
    }

    /// Convert a parked retest entry when price trades through its level.
    async fn check_pending_entry(&self, quote: &Quote) {
        let touched = {
            let mut pending = self.state.pending_entry.lock().await;
            let hit = pending
                .as_ref()
                .is_some_and(|p| p.touched(quote.last_price));
            if hit {
                pending.take()
            } else {
                None
            }
        };
        let Some(pending) = touched else {
            return;
        };
        info!(
            limit = %pending.limit_price,
            last = %quote.last_price,
            "Retest touched, converting the parked entry"
        );
        let now = Utc::now();
        if self.breaker.is_open() {
            warn!("Circuit breaker open, parked entry dropped");
            return;
        }
        if let Err(block) = self.daily.entry_allowed(now) {
            warn!(reason = block.reason(), "Parked entry no longer allowed: {}", block);
            return;
        }
        let signal = Signal {
            side: pending.side,
            entry_price: pending.limit_price,
            stop_loss: pending.stop_loss,
            take_profit: pending.take_profit,
            risk_ticks: None,
            reward_ticks: None,
            structure_levels: pending.structure_levels,
            session: None,
            confidence: None,
            confirmations: Vec::new(),
            timestamp: now,
        };
        self.execute_entry(signal, now).await;
    }

    async fn expire_pending_entry(&self, now: DateTime<Utc>) {
        let mut pending = self.state.pending_entry.lock().await;
        if pending.as_ref().is_some_and(|p| p.expired(now)) {
            if let Some(p) = pending.take() {
                info!(limit = %p.limit_price, "Limit-retest entry expired unfilled");
            }
        }
    }

    /// Place the entry, wait for the fill, and protect the position.
    async fn execute_entry(&self, signal: Signal, now: DateTime<Utc>) {
        let Ok(_guard) = self.state.entry_guard.try_lock() else {
            warn!("An entry is already in flight, dropping the signal");
            return;
        };
        let size = self.config.trading.position_size;
        let mode = self.config.trading.entry_mode;
        let ticket = match mode {
            EntryMode::Bracket => OrderTicket::market(signal.side.entry_side(), size)
                .with_bracket(self.bracket_ticks(&signal))
                .with_tag(ENTRY_TAG),
            _ => OrderTicket::market(signal.side.entry_side(), size).with_tag(ENTRY_TAG),
        };
        info!(side = %signal.side, size, mode = ?mode, "Placing entry");

        let order_id = match self.gateway.place_order(&ticket).await {
            Ok(id) => id,
            Err(err) => {
                error!(error = %err, "Entry placement failed");
                metrics::record_order("entry", false);
                let was_open = self.breaker.is_open();
                self.breaker.record_failure();
                if !was_open && self.breaker.is_open() {
                    self.alerts
                        .breaker_tripped(format!(
                            "{} consecutive entry failures",
                            self.breaker.failure_count()
                        ))
                        .await;
                }
                return;
            }
        };
        self.breaker.record_success();
        metrics::record_order("entry", true);
        self.daily.record_entry();

        let Some(broker_position) = self.wait_for_fill().await else {
            // The order may still fill; adoption picks it up if it does.
            warn!(order_id = %order_id, "Entry never showed up in positions");
            return;
        };
        let position = Position::from_signal(
            &signal,
            broker_position.average_price,
            broker_position.size,
            now,
        );
        info!(
            side = %position.side,
            size = position.quantity,
            entry = %position.entry_price,
            "Entry filled"
        );
        let mut record = TradeRecord::new(
            self.gateway.contract().name.clone(),
            JournalEvent::Entry,
            position.side,
            position.quantity,
        )
        .price(position.entry_price)
        .stop_loss(position.current_stop_loss)
        .reason("signal");
        if let Some(tp) = position.take_profit {
            record = record.take_profit(tp);
        }
        if let Err(err) = self.journal.record(&record).await {
            warn!(error = %err, "Journal write failed");
        }
        metrics::set_position_open(true);

        let mut slot = self.state.position.lock().await;
        *slot = Some(position);
        match mode {
            // Bracket legs are created broker-side on the fill; the
            // watchdog links them on its first pass.
            EntryMode::Bracket => {}
            _ => {
                if let Some(position) = slot.as_mut() {
                    match self.protective.place_initial(position).await {
                        Ok(()) => {}
                        Err(ProtectiveError::StopUnrecoverable { .. }) => {
                            self.reconciler
                                .finalize(
                                    &mut slot,
                                    None,
                                    JournalEvent::ForcedExit,
                                    "entry could not be protected",
                                )
                                .await;
                        }
                        Err(err) => {
                            warn!(error = %err, "Protection incomplete, watchdog will finish it")
                        }
                    }
                }
            }
        }
    }

    /// Bracket distances in ticks, from the signal's advisory fields or
    /// derived from its price levels.
    fn bracket_ticks(&self, signal: &Signal) -> BracketTicks {
        let contract = self.gateway.contract();
        let stop_ticks = signal.risk_ticks.unwrap_or_else(|| {
            ticks_between(signal.stop_loss, signal.entry_price, contract.tick_size)
                .abs()
                .round()
                .to_i64()
                .unwrap_or(self.config.protective.default_stop_ticks)
        });
        let target_ticks = signal
            .reward_ticks
            .or_else(|| {
                signal.take_profit.map(|tp| {
                    ticks_between(signal.entry_price, tp, contract.tick_size)
                        .abs()
                        .round()
                        .to_i64()
                        .unwrap_or(self.config.protective.default_target_ticks)
                })
            })
            .unwrap_or(self.config.protective.default_target_ticks);
        BracketTicks {
            stop_ticks: stop_ticks.max(1),
            target_ticks: target_ticks.max(1),
        }
    }

    async fn wait_for_fill(&self) -> Option<BrokerPosition> {
        for attempt in 0..self.config.trading.max_fill_wait_attempts {
            match self.gateway.open_position().await {
                Ok(Some(bp)) => return Some(bp),
                Ok(None) => debug!(attempt, "Waiting for the entry fill"),
                Err(err) => {
                    warn!(error = %err, "Position check failed while waiting for the fill")
                }
            }
            sleep(Duration::from_millis(self.config.trading.fill_wait_delay_ms)).await;
        }
        None
    }

    fn heartbeat_log(&mut self) {
        if self.throttles.heartbeat.should_log() {
            info!(
                uptime_secs = self.started.elapsed().as_secs(),
                connection = self.monitor.health().label(),
                daily_pnl = %self.daily.realized_pnl(),
                trades_today = self.daily.trades_today(),
                breaker = %health::format_breaker_state(self.breaker.state()),
                "Heartbeat"
            );
        }
    }

    async fn update_health(&self) {
        let position = self.state.position_snapshot().await;
        let connection = self.monitor.health().label().to_string();
        let breaker_state = health::format_breaker_state(self.breaker.state());
        let trading_paused = self.daily.entry_allowed(Utc::now()).is_err();
        let daily_pnl = self.daily.realized_pnl().to_string();
        let trades_today = self.daily.trades_today();
        let uptime_seconds = self.started.elapsed().as_secs();
        let account_id = self.gateway.account_id();
        let contract = self.gateway.contract().name.clone();
        health::update(&self.health, move |h| {
            h.account_id = account_id;
            h.contract = contract;
            h.connection = connection;
            h.breaker_state = breaker_state;
            h.position_open = position.is_some();
            h.position_side = position.as_ref().map(|p| p.side.to_string());
            h.position_quantity = position.as_ref().map_or(0, |p| p.remaining_quantity);
            h.daily_pnl = daily_pnl;
            h.trades_today = trades_today;
            h.trading_paused = trading_paused;
            h.uptime_seconds = uptime_seconds;
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;

    use crate::broker::{BrokerError, OrderId};
    use crate::engine::signal::ChannelSignalSource;
    use crate::engine::testing::{contract, listed_order, quote, StubGateway};
    use crate::types::{OrderSide, OrderType, PositionKind};

    struct StubEvents {
        delivers_fills: bool,
    }

    #[async_trait]
    impl MarketEvents for StubEvents {
        async fn stream(
            &self,
            _tx: mpsc::Sender<MarketEvent>,
            mut shutdown: watch::Receiver<bool>,
        ) -> Result<(), BrokerError> {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
        }

        fn delivers_fills(&self) -> bool {
            self.delivers_fills
        }
    }

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.trading.max_fill_wait_attempts = 3;
        config.trading.fill_wait_delay_ms = 1;
        config.protective.verify_attempts = 2;
        config.protective.verify_delay_ms = 1;
        config.protective.cancel_retry_delay_ms = 1;
        config.protective.watchdog_interval_secs = 0;
        config.breaker.failure_threshold = 2;
        config
    }

    fn engine(
        stub: &Arc<StubGateway>,
        config: EngineConfig,
    ) -> (TradeEngine, mpsc::Sender<Signal>) {
        let (tx, source) = ChannelSignalSource::pair();
        let engine = TradeEngine::new(
            config,
            stub.clone(),
            Box::new(StubEvents {
                delivers_fills: true,
            }),
            Box::new(source),
            health::create_health_state(),
        )
        .unwrap();
        (engine, tx)
    }

    fn long_signal() -> Signal {
        Signal {
            side: PositionKind::Long,
            entry_price: dec!(2000.0),
            stop_loss: dec!(1998.0),
            take_profit: Some(dec!(2004.0)),
            risk_ticks: None,
            reward_ticks: None,
            structure_levels: Vec::new(),
            session: None,
            confidence: None,
            confirmations: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    fn long_position(quantity: i64) -> Position {
        Position::new(
            PositionKind::Long,
            dec!(2000.0),
            quantity,
            dec!(1998.0),
            None,
            Vec::new(),
            Utc::now(),
        )
    }

    async fn feed_quote(engine: &mut TradeEngine, last: rust_decimal::Decimal) {
        engine.handle_event(MarketEvent::Quote(quote(last))).await;
    }

    #[tokio::test]
    async fn market_signal_becomes_a_protected_position() {
        let stub = StubGateway::new(true);
        stub.fill_market_orders_at(dec!(2000.2));
        let (mut engine, signals) = engine(&stub, test_config());

        feed_quote(&mut engine, dec!(2000.0)).await;
        signals.send(long_signal()).await.unwrap();
        engine.run_cycle().await;

        let position = engine.state.position_snapshot().await.unwrap();
        assert_eq!(position.side, PositionKind::Long);
        assert_eq!(position.quantity, 5);
        // Entry reflects the actual fill, stop and target stay at the
        // signal's levels.
        assert_eq!(position.entry_price, dec!(2000.2));
        assert_eq!(position.current_stop_loss, dec!(1998.0));
        assert_eq!(position.take_profit, Some(dec!(2004.0)));
        assert!(position.stop_order_id.is_some());
        assert!(position.take_profit_order_id.is_some());

        let placed = stub.placed_tickets();
        assert_eq!(placed.len(), 3);
        assert_eq!(placed[0].order_type, OrderType::Market);
        assert_eq!(placed[0].side, OrderSide::Bid);
        assert_eq!(placed[1].order_type, OrderType::Stop);
        assert_eq!(placed[2].order_type, OrderType::Limit);
        assert_eq!(engine.daily.trades_today(), 1);
    }

    #[tokio::test]
    async fn entries_stop_after_the_daily_loss_limit() {
        let stub = StubGateway::new(true);
        stub.fill_market_orders_at(dec!(2000.0));
        let (mut engine, signals) = engine(&stub, test_config());
        engine
            .daily
            .record_close(Some(1), dec!(-3000.0), Utc::now());

        feed_quote(&mut engine, dec!(2000.0)).await;
        signals.send(long_signal()).await.unwrap();
        engine.run_cycle().await;

        assert!(engine.state.position_snapshot().await.is_none());
        assert!(stub.placed_tickets().is_empty());
    }

    #[tokio::test]
    async fn closing_fill_books_once_and_clears_the_position() {
        let stub = StubGateway::new(true);
        let (mut engine, _signals) = engine(&stub, test_config());
        *engine.state.position.lock().await = Some(long_position(5));

        let fill = TradeFill {
            id: 41,
            contract_id: contract().id,
            side: OrderSide::Ask,
            size: 5,
            price: dec!(1998.0),
            profit_and_loss: Some(dec!(-100.0)),
            fees: None,
            voided: false,
            timestamp: Utc::now(),
        };
        engine.handle_event(MarketEvent::Trade(fill.clone())).await;

        assert!(engine.state.position_snapshot().await.is_none());
        assert_eq!(engine.daily.realized_pnl(), dec!(-100.0));

        // A replay of the same fill changes nothing.
        engine.handle_event(MarketEvent::Trade(fill)).await;
        assert_eq!(engine.daily.realized_pnl(), dec!(-100.0));
    }

    #[tokio::test]
    async fn partial_exit_commits_on_broker_confirmation() {
        let stub = StubGateway::new(true);
        stub.set_position(Some(BrokerPosition {
            contract_id: contract().id,
            kind: PositionKind::Long,
            size: 5,
            average_price: dec!(2000.0),
            opened_at: None,
        }));
        stub.seed_listing(vec![listed_order(
            "1",
            OrderType::Stop,
            OrderSide::Ask,
            5,
            dec!(1998.0),
        )]);
        let (mut engine, _signals) = engine(&stub, test_config());
        let mut position = long_position(5);
        position.stop_order_id = Some(OrderId::new("1"));
        *engine.state.position.lock().await = Some(position);

        // 1R of profit: scale out and lock half the R behind the runner.
        feed_quote(&mut engine, dec!(2002.0)).await;

        assert_eq!(*stub.partial_closes.lock().unwrap(), vec![2]);
        let position = engine.state.position_snapshot().await.unwrap();
        assert_eq!(position.remaining_quantity, 3);
        assert!(position.partial_exit_done);
        assert_eq!(position.current_stop_loss, dec!(2001.0));
        // The stop at the broker was replaced at the lock level for the
        // remaining size.
        let listing = stub.listing.lock().unwrap();
        let stops: Vec<_> = listing.iter().filter(|o| o.kind == OrderType::Stop).collect();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].stop_price, Some(dec!(2001.0)));
        assert_eq!(stops[0].size, 3);
    }

    #[tokio::test]
    async fn aged_position_is_force_closed() {
        let stub = StubGateway::new(true);
        stub.set_position(Some(BrokerPosition {
            contract_id: contract().id,
            kind: PositionKind::Long,
            size: 5,
            average_price: dec!(2000.0),
            opened_at: None,
        }));
        let (mut engine, _signals) = engine(&stub, test_config());
        let mut position = long_position(5);
        position.entry_time = Utc::now() - ChronoDuration::hours(7);
        *engine.state.position.lock().await = Some(position);

        feed_quote(&mut engine, dec!(2000.5)).await;

        assert_eq!(stub.closes.load(Ordering::SeqCst), 1);
        assert!(engine.state.position_snapshot().await.is_none());
    }

    #[tokio::test]
    async fn parked_retest_entry_converts_on_touch() {
        let stub = StubGateway::new(true);
        stub.fill_market_orders_at(dec!(1999.9));
        let mut config = test_config();
        config.trading.entry_mode = EntryMode::LimitRetest;
        let (mut engine, signals) = engine(&stub, config);

        feed_quote(&mut engine, dec!(2000.4)).await;
        signals.send(long_signal()).await.unwrap();
        engine.run_cycle().await;

        // Parked one tick below the signal entry, nothing placed yet.
        {
            let pending = engine.state.pending_entry.lock().await;
            assert_eq!(pending.as_ref().unwrap().limit_price, dec!(1999.9));
        }
        assert!(stub.placed_tickets().is_empty());

        // Price trades through the limit: market entry with the parked
        // levels.
        feed_quote(&mut engine, dec!(1999.8)).await;

        assert!(engine.state.pending_entry.lock().await.is_none());
        let position = engine.state.position_snapshot().await.unwrap();
        assert_eq!(position.entry_price, dec!(1999.9));
        assert_eq!(position.current_stop_loss, dec!(1998.0));
        assert_eq!(stub.placed_tickets()[0].order_type, OrderType::Market);
    }

    #[tokio::test]
    async fn breaker_trips_after_repeated_entry_failures() {
        let stub = StubGateway::new(true);
        stub.fail_next_places(vec![
            BrokerError::Network("down".into()),
            BrokerError::Network("down".into()),
        ]);
        let (mut engine, signals) = engine(&stub, test_config());

        feed_quote(&mut engine, dec!(2000.0)).await;
        signals.send(long_signal()).await.unwrap();
        engine.run_cycle().await;
        signals.send(long_signal()).await.unwrap();
        engine.run_cycle().await;

        assert!(engine.breaker.is_open());
        assert_eq!(stub.placed_tickets().len(), 2);

        // Entries are refused while the breaker cools off; the signal is
        // left unread.
        signals.send(long_signal()).await.unwrap();
        engine.run_cycle().await;
        assert_eq!(stub.placed_tickets().len(), 2);
        assert_eq!(engine.daily.trades_today(), 0);
    }

    #[tokio::test]
    async fn expired_parked_entry_is_dropped() {
        let stub = StubGateway::new(true);
        let mut config = test_config();
        config.trading.entry_mode = EntryMode::LimitRetest;
        let (mut engine, signals) = engine(&stub, config);

        feed_quote(&mut engine, dec!(2000.4)).await;
        signals.send(long_signal()).await.unwrap();
        engine.run_cycle().await;
        {
            let mut pending = engine.state.pending_entry.lock().await;
            let entry = pending.as_mut().unwrap();
            entry.expires_at = Utc::now() - ChronoDuration::seconds(1);
        }

        engine.run_cycle().await;
        assert!(engine.state.pending_entry.lock().await.is_none());
        assert!(stub.placed_tickets().is_empty());
    }

    #[test]
    fn bracket_ticks_prefer_the_signal_and_derive_otherwise() {
        let stub = StubGateway::new(true);
        let (engine, _signals) = engine(&stub, test_config());

        let mut signal = long_signal();
        signal.risk_ticks = Some(25);
        signal.reward_ticks = Some(50);
        assert_eq!(
            engine.bracket_ticks(&signal),
            BracketTicks {
                stop_ticks: 25,
                target_ticks: 50
            }
        );

        // Derived from the price levels: 2.0 and 4.0 points at 0.1/tick.
        let signal = long_signal();
        assert_eq!(
            engine.bracket_ticks(&signal),
            BracketTicks {
                stop_ticks: 20,
                target_ticks: 40
            }
        );
    }

    #[tokio::test]
    async fn stale_quote_blocks_entries_and_adjustments() {
        let stub = StubGateway::new(true);
        stub.fill_market_orders_at(dec!(2000.0));
        let (mut engine, signals) = engine(&stub, test_config());
        // A quote is cached but its receipt clock never ticked.
        engine.state.set_quote(quote(dec!(2000.0))).await;

        signals.send(long_signal()).await.unwrap();
        engine.run_cycle().await;

        assert!(stub.placed_tickets().is_empty());
        assert!(engine.state.position_snapshot().await.is_none());
    }
}
