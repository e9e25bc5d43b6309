//! Protect command handler: one-shot protective placement.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::alerts::AlertRouter;
use crate::broker::{connect_gateway, BarsRequest, BrokerGateway};
use crate::config::{EngineConfig, GatewayCredentials};
use crate::engine::{
    DailyLimits, EngineState, PositionReconciler, ProtectiveOrderManager,
};
use crate::logging;
use crate::types::Quote;

/// Adopt and protect whatever position the account holds, then exit.
///
/// Runs the same reconciliation pass the engine runs at startup:
/// working protective orders are recovered, missing legs are placed, and
/// a missing stop is set conservatively. A position that cannot be
/// stop-protected is flattened.
///
/// # Errors
/// Returns an error when configuration, credentials, or the gateway
/// connection fail, or when the reconciliation pass itself fails.
pub async fn run_protect(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::load(config_path)?;
    let credentials = GatewayCredentials::from_env()?;
    let gateway = connect_gateway(credentials, &config.instrument).await?;
    let contract = gateway.contract().clone();

    let Some(position) = gateway.open_position().await? else {
        info!(contract = %contract.name, "No open position, nothing to protect");
        return Ok(());
    };
    info!(
        side = %position.kind,
        size = position.size,
        average_price = %position.average_price,
        "Open position found"
    );

    let state = Arc::new(EngineState::new());
    // Seed the latest close as a quote so a conservative stop is placed
    // relative to the market, not just the entry.
    if let Ok(bars) = gateway.recent_bars(&BarsRequest::latest_minutes(1)).await {
        if let Some(bar) = bars.last() {
            state
                .set_quote(Quote {
                    symbol: contract.name.clone(),
                    last_price: bar.close,
                    best_bid: None,
                    best_ask: None,
                    high: Some(bar.high),
                    low: Some(bar.low),
                    volume: Some(bar.volume),
                    timestamp: bar.timestamp,
                })
                .await;
        }
    }

    let alerts = Arc::new(AlertRouter::from_config(&config.alerts));
    let journal = Arc::new(logging::build_journal(&config.journal));
    let daily = Arc::new(DailyLimits::new(
        &config.risk,
        config.timezone()?,
        config.blocked_weekdays()?,
        config.cooldown_duration(),
        Utc::now(),
    ));
    let protective = Arc::new(ProtectiveOrderManager::new(
        gateway.clone(),
        state.clone(),
        alerts.clone(),
        config.protective.clone(),
    ));
    let reconciler = PositionReconciler::new(
        gateway,
        state,
        protective,
        daily,
        alerts,
        journal,
        config.protective.clone(),
        true,
    );

    let outcome = reconciler.reconcile().await?;
    info!(outcome = %outcome, "Protection pass complete");
    Ok(())
}
