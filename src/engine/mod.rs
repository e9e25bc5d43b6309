//! The order-management engine.
//!
//! Intake and execution are split into small pieces with one job each:
//! [`signal`] sources entries, [`daily`] gates them, [`protective`]
//! owns the stop and target legs, [`risk`] decides adjustments from
//! price action, [`reconcile`] keeps local state honest against the
//! broker, and [`trader`] wires it all into the event loop.

pub mod daily;
pub mod position;
pub mod protective;
pub mod reconcile;
pub mod risk;
pub mod signal;
pub mod trader;

#[cfg(test)]
pub(crate) mod testing;

pub use daily::{DailyLimits, DailyStatus, EntryBlock};
pub use position::{EngineState, PendingLimitEntry, Position};
pub use protective::{ProtectiveError, ProtectiveKind, ProtectiveOrderManager, WatchdogReport};
pub use reconcile::{conservative_stop, PositionReconciler, ReconcileOutcome};
pub use risk::{ForceCloseReason, RiskAction, RiskAdjuster, StopMoveReason};
pub use signal::{
    ChannelSignalSource, FileSignalSource, NullSignalSource, Signal, SignalError, SignalSource,
};
pub use trader::TradeEngine;

use thiserror::Error;

use crate::broker::BrokerError;
use crate::config::ConfigError;

/// Failure building or running the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protective(#[from] ProtectiveError),
}
