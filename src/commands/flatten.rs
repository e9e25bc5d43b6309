//! Flatten command handler: cancel everything, close the position.

use std::io::{self, BufRead, Write};
use std::path::Path;

use tracing::{info, warn};

use crate::broker::{connect_gateway, BrokerGateway};
use crate::config::{EngineConfig, GatewayCredentials};

/// Cancel all working orders on the contract and market-close any open
/// position. Prompts for confirmation unless `yes` is set.
///
/// # Errors
/// Returns an error when configuration, credentials, or the gateway
/// connection fail, or when the position close itself is rejected.
/// Individual cancel failures are logged and skipped.
pub async fn run_flatten(
    config_path: Option<&Path>,
    yes: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::load(config_path)?;
    let credentials = GatewayCredentials::from_env()?;
    let gateway = connect_gateway(credentials, &config.instrument).await?;

    let position = gateway.open_position().await?;
    let orders = gateway.open_orders().await?;
    if position.is_none() && orders.is_empty() {
        info!(contract = %gateway.contract().name, "Nothing to flatten");
        return Ok(());
    }

    if let Some(p) = &position {
        info!(side = %p.kind, size = p.size, average_price = %p.average_price, "Open position");
    }
    info!(count = orders.len(), "Working orders");

    if !yes && !confirm("Cancel all orders and market-close the position? [y/N] ")? {
        info!("Flatten aborted");
        return Ok(());
    }

    let mut cancelled = 0usize;
    for order in &orders {
        match gateway.cancel_order(&order.id).await {
            Ok(()) => cancelled += 1,
            Err(err) => warn!(order_id = %order.id, error = %err, "Cancel failed"),
        }
    }
    info!(cancelled, of = orders.len(), "Orders cancelled");

    if position.is_some() {
        gateway.close_position().await?;
        info!("Position closed at market");
    }
    Ok(())
}

fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}
