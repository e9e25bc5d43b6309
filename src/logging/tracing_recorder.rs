//! Structured-log journal backend.
//!
//! Emits one structured event per journal record so log collectors see
//! the trade history even when no CSV path is configured.

use async_trait::async_trait;
use tracing::info;

use super::recorder::{RecordError, TradeRecord, TradeRecorder};

pub struct TracingRecorder;

impl TracingRecorder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TracingRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TradeRecorder for TracingRecorder {
    async fn record(&self, record: &TradeRecord) -> Result<(), RecordError> {
        info!(
            target: "journal",
            record_id = %record.record_id,
            event = %record.event,
            symbol = %record.symbol,
            side = %record.side,
            quantity = record.quantity,
            price = record.price.map(|p| p.to_string()).unwrap_or_default(),
            stop_loss = record.stop_loss.map(|p| p.to_string()).unwrap_or_default(),
            take_profit = record.take_profit.map(|p| p.to_string()).unwrap_or_default(),
            realized_pnl = record.realized_pnl.map(|p| p.to_string()).unwrap_or_default(),
            reason = record.reason.as_deref().unwrap_or(""),
            "Trade journal event"
        );
        Ok(())
    }
}
