//! Entry signal intake.
//!
//! Signal generation lives outside this crate; the engine consumes
//! [`Signal`] values from whatever [`SignalSource`] it is wired to and
//! treats each one as immutable and single-use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::PositionKind;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("entry price must be positive, got {0}")]
    BadEntry(Decimal),

    #[error("stop {stop} is on the wrong side of a {side} entry at {entry}")]
    StopSide {
        side: PositionKind,
        entry: Decimal,
        stop: Decimal,
    },

    #[error("target {target} is on the wrong side of a {side} entry at {entry}")]
    TargetSide {
        side: PositionKind,
        entry: Decimal,
        target: Decimal,
    },
}

/// A single trade instruction from the strategy collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub side: PositionKind,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    /// Advisory risk distance in ticks; the engine derives its own from
    /// entry and stop when absent.
    #[serde(default)]
    pub risk_ticks: Option<i64>,
    #[serde(default)]
    pub reward_ticks: Option<i64>,
    /// Price levels beyond entry the stop can advance behind, nearest
    /// first.
    #[serde(default)]
    pub structure_levels: Vec<Decimal>,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub confidence: Option<Decimal>,
    #[serde(default)]
    pub confirmations: Vec<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    /// Entry-to-stop distance.
    pub fn initial_risk(&self) -> Decimal {
        (self.entry_price - self.stop_loss).abs()
    }

    /// Reject signals whose prices cannot form a coherent bracket.
    pub fn validate(&self) -> Result<(), SignalError> {
        if self.entry_price <= Decimal::ZERO {
            return Err(SignalError::BadEntry(self.entry_price));
        }
        let stop_ok = match self.side {
            PositionKind::Long => self.stop_loss < self.entry_price,
            PositionKind::Short => self.stop_loss > self.entry_price,
        };
        if !stop_ok {
            return Err(SignalError::StopSide {
                side: self.side,
                entry: self.entry_price,
                stop: self.stop_loss,
            });
        }
        if let Some(target) = self.take_profit {
            let target_ok = match self.side {
                PositionKind::Long => target > self.entry_price,
                PositionKind::Short => target < self.entry_price,
            };
            if !target_ok {
                return Err(SignalError::TargetSide {
                    side: self.side,
                    entry: self.entry_price,
                    target,
                });
            }
        }
        Ok(())
    }
}

/// Where the engine asks for the next entry. Polled once per loop cycle;
/// implementations must not block when nothing is available.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn poll(&mut self) -> Option<Signal>;
}

/// In-process source fed through an mpsc channel, used by embedding code
/// and tests.
pub struct ChannelSignalSource {
    rx: mpsc::Receiver<Signal>,
}

impl ChannelSignalSource {
    pub fn new(rx: mpsc::Receiver<Signal>) -> Self {
        Self { rx }
    }

    /// Create a connected sender/source pair.
    pub fn pair() -> (mpsc::Sender<Signal>, Self) {
        let (tx, rx) = mpsc::channel(8);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl SignalSource for ChannelSignalSource {
    async fn poll(&mut self) -> Option<Signal> {
        match self.rx.try_recv() {
            Ok(signal) => Some(signal),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                debug!("Signal channel closed");
                None
            }
        }
    }
}

/// File-drop source: an external process writes a JSON `Signal` to the
/// configured path and the engine consumes (deletes) it on pickup.
pub struct FileSignalSource {
    path: PathBuf,
}

impl FileSignalSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SignalSource for FileSignalSource {
    async fn poll(&mut self) -> Option<Signal> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(_) => return None,
        };
        // The file is consumed whether or not it parses; a bad payload
        // left in place would be re-read forever.
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            warn!(path = %self.path.display(), error = %e, "Failed to remove consumed signal file");
        }
        match serde_json::from_str::<Signal>(&text) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Discarding unparseable signal file");
                None
            }
        }
    }
}

/// Source that never yields. With no strategy wired in, the engine still
/// reconciles, protects, and manages whatever position the account holds.
pub struct NullSignalSource;

#[async_trait]
impl SignalSource for NullSignalSource {
    async fn poll(&mut self) -> Option<Signal> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_signal() -> Signal {
        Signal {
            side: PositionKind::Long,
            entry_price: dec!(2000.0),
            stop_loss: dec!(1998.0),
            take_profit: Some(dec!(2004.0)),
            risk_ticks: Some(20),
            reward_ticks: Some(40),
            structure_levels: vec![dec!(2005.0)],
            session: Some("ny_open".to_string()),
            confidence: None,
            confirmations: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn valid_signal_passes() {
        let signal = long_signal();
        assert!(signal.validate().is_ok());
        assert_eq!(signal.initial_risk(), dec!(2.0));
    }

    #[test]
    fn stop_above_long_entry_is_rejected() {
        let mut signal = long_signal();
        signal.stop_loss = dec!(2001.0);
        assert!(matches!(
            signal.validate(),
            Err(SignalError::StopSide { .. })
        ));
    }

    #[test]
    fn target_below_long_entry_is_rejected() {
        let mut signal = long_signal();
        signal.take_profit = Some(dec!(1999.0));
        assert!(matches!(
            signal.validate(),
            Err(SignalError::TargetSide { .. })
        ));
    }

    #[test]
    fn short_signal_mirrors_validation() {
        let mut signal = long_signal();
        signal.side = PositionKind::Short;
        signal.stop_loss = dec!(2002.0);
        signal.take_profit = Some(dec!(1996.0));
        assert!(signal.validate().is_ok());
    }

    #[tokio::test]
    async fn channel_source_is_non_blocking() {
        let (tx, mut source) = ChannelSignalSource::pair();
        assert!(source.poll().await.is_none());
        tx.send(long_signal()).await.unwrap();
        assert!(source.poll().await.is_some());
        assert!(source.poll().await.is_none());
    }

    #[tokio::test]
    async fn null_source_never_yields() {
        let mut source = NullSignalSource;
        assert!(source.poll().await.is_none());
    }

    #[tokio::test]
    async fn file_source_consumes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal.json");
        let json = serde_json::to_string(&long_signal()).unwrap();
        tokio::fs::write(&path, json).await.unwrap();

        let mut source = FileSignalSource::new(&path);
        let signal = source.poll().await.unwrap();
        assert_eq!(signal.entry_price, dec!(2000.0));
        assert!(!path.exists());
        assert!(source.poll().await.is_none());
    }

    #[tokio::test]
    async fn file_source_discards_garbage_but_still_consumes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal.json");
        tokio::fs::write(&path, "not a signal").await.unwrap();

        let mut source = FileSignalSource::new(&path);
        assert!(source.poll().await.is_none());
        assert!(!path.exists());
    }

    #[test]
    fn signal_parses_with_minimal_fields() {
        let json = r#"{"side": 1, "entry_price": 2000.0, "stop_loss": 1998.0}"#;
        let signal: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(signal.side, PositionKind::Long);
        assert!(signal.take_profit.is_none());
        assert!(signal.structure_levels.is_empty());
    }
}
