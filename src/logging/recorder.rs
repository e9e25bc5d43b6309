//! Trade journal.
//!
//! Pluggable `TradeRecorder` trait with one record per position lifecycle
//! event: entries, partial exits, stop moves, closures. Backends are
//! best-effort; a journal failure must never block an order path.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::PositionKind;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// What happened to the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEvent {
    Entry,
    PartialExit,
    StopMoved,
    Exit,
    ForcedExit,
}

impl fmt::Display for JournalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JournalEvent::Entry => "entry",
            JournalEvent::PartialExit => "partial_exit",
            JournalEvent::StopMoved => "stop_moved",
            JournalEvent::Exit => "exit",
            JournalEvent::ForcedExit => "forced_exit",
        };
        write!(f, "{}", label)
    }
}

/// One journal line.
#[derive(Debug, Clone)]
pub struct TradeRecord {
    /// Unique record identifier.
    pub record_id: String,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub event: JournalEvent,
    pub side: PositionKind,
    /// Contracts affected by this event.
    pub quantity: i64,
    /// Execution or reference price, when one applies.
    pub price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Realized P&L for exits; `None` on entries and stop moves.
    pub realized_pnl: Option<Decimal>,
    /// Free-form cause, e.g. which rule moved the stop.
    pub reason: Option<String>,
}

impl TradeRecord {
    pub fn new(
        symbol: impl Into<String>,
        event: JournalEvent,
        side: PositionKind,
        quantity: i64,
    ) -> Self {
        Self::with_timestamp(symbol, event, side, quantity, Utc::now())
    }

    /// Explicit-timestamp constructor for deterministic tests.
    pub fn with_timestamp(
        symbol: impl Into<String>,
        event: JournalEvent,
        side: PositionKind,
        quantity: i64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            symbol: symbol.into(),
            event,
            side,
            quantity,
            price: None,
            stop_loss: None,
            take_profit: None,
            realized_pnl: None,
            reason: None,
        }
    }

    #[must_use]
    pub fn price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    #[must_use]
    pub fn stop_loss(mut self, stop: Decimal) -> Self {
        self.stop_loss = Some(stop);
        self
    }

    #[must_use]
    pub fn take_profit(mut self, target: Decimal) -> Self {
        self.take_profit = Some(target);
        self
    }

    #[must_use]
    pub fn realized_pnl(mut self, pnl: Decimal) -> Self {
        self.realized_pnl = Some(pnl);
        self
    }

    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn csv_header() -> &'static str {
        "record_id,timestamp,symbol,event,side,quantity,price,stop_loss,take_profit,realized_pnl,reason"
    }

    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{}",
            self.record_id,
            self.timestamp.to_rfc3339(),
            self.symbol,
            self.event,
            self.side,
            self.quantity,
            opt(self.price),
            opt(self.stop_loss),
            opt(self.take_profit),
            opt(self.realized_pnl),
            // Free-form text must not break the column layout.
            self.reason.as_deref().unwrap_or("").replace(',', ";"),
        )
    }
}

fn opt(value: Option<Decimal>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Journal backend. Implementations must not block the caller for long;
/// file writers go through `spawn_blocking`.
#[async_trait]
pub trait TradeRecorder: Send + Sync {
    async fn record(&self, record: &TradeRecord) -> Result<(), RecordError>;

    /// Flush buffered records, default no-op.
    async fn flush(&self) -> Result<(), RecordError> {
        Ok(())
    }
}

/// Fans one record out to every backend. Individual failures are logged
/// and swallowed; only all-backends-failed surfaces as an error.
pub struct MultiRecorder {
    recorders: Vec<Box<dyn TradeRecorder>>,
}

impl MultiRecorder {
    pub fn new(recorders: Vec<Box<dyn TradeRecorder>>) -> Self {
        Self { recorders }
    }

    pub fn add(&mut self, recorder: Box<dyn TradeRecorder>) {
        self.recorders.push(recorder);
    }

    pub fn is_empty(&self) -> bool {
        self.recorders.is_empty()
    }
}

#[async_trait]
impl TradeRecorder for MultiRecorder {
    async fn record(&self, record: &TradeRecord) -> Result<(), RecordError> {
        let mut failures = 0;
        let mut last_error = None;

        for recorder in &self.recorders {
            if let Err(e) = recorder.record(record).await {
                tracing::error!(error = %e, "Journal backend failed to record");
                last_error = Some(e);
                failures += 1;
            }
        }

        if failures > 0 && failures == self.recorders.len() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), RecordError> {
        for recorder in &self.recorders {
            recorder.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn csv_line_matches_header_columns() {
        let timestamp = Utc.with_ymd_and_hms(2025, 6, 2, 14, 30, 0).unwrap();
        let record =
            TradeRecord::with_timestamp("MGC", JournalEvent::Entry, PositionKind::Long, 5, timestamp)
                .price(dec!(2000.0))
                .stop_loss(dec!(1998.0))
                .take_profit(dec!(2004.0))
                .reason("signal breakout, retest confirmed");

        let line = record.to_csv_line();
        let header_cols = TradeRecord::csv_header().split(',').count();
        assert_eq!(line.split(',').count(), header_cols);
        assert!(line.contains("entry"));
        assert!(line.contains("LONG"));
        // Commas in free text must not add columns.
        assert!(line.contains("signal breakout; retest confirmed"));
    }

    #[test]
    fn exit_record_carries_pnl() {
        let record = TradeRecord::new("MGC", JournalEvent::Exit, PositionKind::Short, 5)
            .price(dec!(1990.0))
            .realized_pnl(dec!(250.0));
        let line = record.to_csv_line();
        assert!(line.contains("exit"));
        assert!(line.contains("250.0"));
    }

    #[tokio::test]
    async fn empty_multi_recorder_is_fine() {
        let multi = MultiRecorder::new(Vec::new());
        let record = TradeRecord::new("MGC", JournalEvent::Entry, PositionKind::Long, 1);
        multi.record(&record).await.unwrap();
        assert!(multi.is_empty());
    }
}
