//! Status command handler: one-shot account snapshot.

use std::path::Path;

use crate::broker::{connect_gateway, BrokerGateway};
use crate::config::{EngineConfig, GatewayCredentials};

/// Print the account, contract, position, and working-order snapshot.
///
/// # Errors
/// Returns an error when configuration, credentials, or any of the
/// snapshot calls fail.
pub async fn run_status(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::load(config_path)?;
    let credentials = GatewayCredentials::from_env()?;
    let gateway = connect_gateway(credentials, &config.instrument).await?;
    let contract = gateway.contract();

    println!(
        "Account:   {} (id {})",
        gateway.account_name(),
        gateway.account_id()
    );
    println!(
        "Contract:  {} ({}, tick {} worth {})",
        contract.name, contract.description, contract.tick_size, contract.tick_value
    );
    if let Some(balance) = gateway.account_balance().await? {
        println!("Balance:   {}", balance);
    }

    match gateway.open_position().await? {
        Some(p) => {
            println!("Position:  {} {} @ {}", p.kind, p.size, p.average_price);
            if let Some(opened) = p.opened_at {
                println!("           opened {}", opened.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
        None => println!("Position:  flat"),
    }

    let orders = gateway.open_orders().await?;
    if orders.is_empty() {
        println!("Orders:    none working");
    } else {
        println!("Orders:    {} working", orders.len());
        for order in &orders {
            let price = order
                .working_price()
                .map_or_else(|| "market".to_string(), |p| p.to_string());
            println!(
                "           {} {:?} {} x{} @ {}",
                order.id, order.kind, order.side, order.size, price
            );
        }
    }
    Ok(())
}
