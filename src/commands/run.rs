//! Run command handler: the resident engine.

use std::path::Path;

use tracing::{info, warn};

use crate::broker::{connect_gateway, create_event_channel, BrokerGateway};
use crate::cli::RunOverrides;
use crate::config::{EngineConfig, GatewayCredentials};
use crate::engine::{FileSignalSource, NullSignalSource, SignalSource, TradeEngine};
use crate::health;

/// Start the order-management engine and run it until shutdown.
///
/// # Errors
/// Returns an error when configuration, credentials, or the gateway
/// connection fail. Runtime faults after startup are handled inside the
/// engine loop and do not surface here.
pub async fn run_engine(
    config_path: Option<&Path>,
    overrides: RunOverrides,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = EngineConfig::load(config_path)?;
    if let Some(secs) = overrides.poll_interval_secs {
        config.trading.poll_interval_secs = secs;
    }
    if overrides.no_push {
        config.connection.push_enabled = false;
    }
    if let Some(port) = overrides.health_port {
        config.health.port = port;
    }
    if let Some(path) = overrides.signal_file {
        config.trading.signal_file = Some(path);
    }

    let credentials = GatewayCredentials::from_env()?;
    let gateway = connect_gateway(credentials, &config.instrument).await?;
    info!(
        account = gateway.account_id(),
        name = gateway.account_name(),
        contract = %gateway.contract().name,
        "Gateway connected"
    );

    let health = health::create_health_state();
    if config.health.enabled {
        tokio::spawn(health::run_health_server(config.health.port, health.clone()));
    }

    let events = create_event_channel(gateway.clone(), &config.connection);
    let signals: Box<dyn SignalSource> = match &config.trading.signal_file {
        Some(path) => {
            info!(path = %path, "Watching for file-drop signals");
            Box::new(FileSignalSource::new(path))
        }
        None => {
            warn!("No signal file configured; managing existing positions only");
            Box::new(NullSignalSource)
        }
    };

    let mut engine = TradeEngine::new(config, gateway, events, signals, health)?;
    engine.run().await?;
    Ok(())
}
