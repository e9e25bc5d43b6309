//! Broker Gateway Abstraction Layer
//!
//! Exchange-agnostic traits for order routing and real-time events, plus
//! the concrete gateway client. Trading logic depends only on the traits
//! here, so a degraded REST-polling channel slots in where the push
//! channel normally runs without the engine noticing.

pub mod polling;
pub mod push;
pub mod rate_limit;
pub mod rest;
pub mod types;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::config::{ConnectionConfig, GatewayCredentials, InstrumentConfig};
use crate::types::Quote;

pub use types::{
    BarsRequest, BracketTicks, BrokerOrder, BrokerPosition, ContractSpec, OrderChanges, OrderId,
    OrderTicket, PositionUpdate, TradeFill,
};

/// Errors surfaced by gateway operations.
///
/// `Network`, `AuthExpired` and `RateLimited` are transient; the client
/// retries the latter two internally exactly once. `OrderRejected` and
/// `VerificationFailed` are handed to the caller, which owns the retry
/// budget for its operation.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("network error: {0}")]
    Network(String),

    #[error("session token expired or invalid")]
    AuthExpired,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("order {0} accepted but never observed in open orders")]
    VerificationFailed(OrderId),

    #[error("gateway error {code}: {message}")]
    Api { code: i32, message: String },

    #[error("failed to decode gateway response: {0}")]
    Decode(String),

    #[error("gateway configuration error: {0}")]
    Configuration(String),
}

impl BrokerError {
    /// Whether the operation may succeed if simply retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Network(_) | BrokerError::AuthExpired | BrokerError::RateLimited { .. }
        )
    }
}

/// Order routing and account state, scoped to one account and contract.
///
/// Implementations resolve the account and contract at construction so
/// call sites never thread ids through.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Submit an order. Returns the broker-assigned id on acceptance.
    async fn place_order(&self, ticket: &OrderTicket) -> Result<OrderId, BrokerError>;

    /// Cancel a working order.
    async fn cancel_order(&self, order_id: &OrderId) -> Result<(), BrokerError>;

    /// Modify size and/or prices of a working order. Unset fields keep
    /// their current values.
    async fn modify_order(&self, order_id: &OrderId, changes: &OrderChanges)
        -> Result<(), BrokerError>;

    /// All working orders on this account for this contract.
    async fn open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError>;

    /// Open position for this contract, if any. Zero-size records are
    /// filtered out.
    async fn open_position(&self) -> Result<Option<BrokerPosition>, BrokerError>;

    /// Market-close the whole position.
    async fn close_position(&self) -> Result<(), BrokerError>;

    /// Market-close `size` contracts of the position.
    async fn partial_close_position(&self, size: i64) -> Result<(), BrokerError>;

    /// Recent bars for the contract (history rate bucket).
    async fn recent_bars(&self, request: &BarsRequest) -> Result<Vec<crate::types::Bar>, BrokerError>;

    /// The resolved contract this gateway trades.
    fn contract(&self) -> &ContractSpec;

    /// The resolved account id.
    fn account_id(&self) -> i64;
}

/// A single event from the market data / account event channel.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Quote(Quote),
    Order(BrokerOrder),
    Position(PositionUpdate),
    Trade(TradeFill),
    /// Channel (re)established and subscriptions are live. The engine
    /// reconciles on this.
    Connected,
    /// Channel lost; a reconnect is in progress.
    Disconnected,
}

/// Capability trait for the real-time event channel.
///
/// The push implementation streams gateway hub events; the polling
/// implementation synthesizes what it can from REST. `delivers_fills`
/// tells the engine whether realized P&L will arrive as fill events or
/// must be estimated from quotes at closure time.
#[async_trait]
pub trait MarketEvents: Send + Sync {
    /// Run the channel until shutdown, forwarding events into `tx`.
    /// Implementations own their reconnect loops; returning `Ok` means a
    /// clean shutdown was requested.
    async fn stream(
        &self,
        tx: mpsc::Sender<MarketEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError>;

    /// Whether trade fills (with realized P&L) flow through this channel.
    fn delivers_fills(&self) -> bool;
}

/// Connect to the gateway: authenticate, resolve the account and
/// contract, and return the ready client.
pub async fn connect_gateway(
    credentials: GatewayCredentials,
    instrument: &InstrumentConfig,
) -> Result<Arc<rest::GatewayClient>, BrokerError> {
    let client = rest::GatewayClient::connect(credentials, instrument).await?;
    Ok(Arc::new(client))
}

/// Build the event channel for the configured mode. Push when enabled,
/// REST polling otherwise.
pub fn create_event_channel(
    gateway: Arc<rest::GatewayClient>,
    connection: &ConnectionConfig,
) -> Box<dyn MarketEvents> {
    if connection.push_enabled {
        Box::new(push::PushEventChannel::new(gateway))
    } else {
        tracing::warn!(
            interval_secs = connection.polling_interval_secs,
            "Push channel disabled, falling back to REST polling; fills will be estimated"
        );
        Box::new(polling::PollingEventChannel::new(
            gateway,
            connection.polling_interval_secs,
        ))
    }
}

/// Ticks between two prices for a given tick size, sign-preserving.
pub fn ticks_between(from: Decimal, to: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size.is_zero() {
        return Decimal::ZERO;
    }
    (to - from) / tick_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn transient_classification() {
        assert!(BrokerError::Network("reset".into()).is_transient());
        assert!(BrokerError::AuthExpired.is_transient());
        assert!(BrokerError::RateLimited { retry_after_secs: 2 }.is_transient());
        assert!(!BrokerError::OrderRejected("bad price".into()).is_transient());
        assert!(!BrokerError::VerificationFailed(OrderId::new("9")).is_transient());
    }

    #[test]
    fn tick_distance() {
        assert_eq!(ticks_between(dec!(2000.0), dec!(2002.0), dec!(0.10)), dec!(20));
        assert_eq!(ticks_between(dec!(2000.0), dec!(1999.5), dec!(0.10)), dec!(-5));
    }
}
