//! REST polling fallback for the event channel.
//!
//! When the push hubs are disabled this channel fakes the same event
//! stream from REST: the latest minute bar's close becomes a quote and
//! the open-position snapshot becomes a position update. No trade fills
//! flow here, so `delivers_fills` is false and the engine estimates
//! realized P&L at closure time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::rest::GatewayClient;
use super::types::{BarsRequest, PositionUpdate};
use super::{BrokerError, BrokerGateway, MarketEvent, MarketEvents};
use crate::types::Quote;

/// Consecutive poll failures before the channel reports itself down.
const FAILURE_THRESHOLD: u32 = 3;

pub struct PollingEventChannel {
    gateway: Arc<GatewayClient>,
    poll_interval: Duration,
}

impl PollingEventChannel {
    pub fn new(gateway: Arc<GatewayClient>, interval_secs: u64) -> Self {
        Self {
            gateway,
            poll_interval: Duration::from_secs(interval_secs.max(1)),
        }
    }

    /// One poll pass: quote from the freshest bar, then the position
    /// snapshot. Either payload can be absent without it being an error.
    async fn poll_once(&self) -> Result<Vec<MarketEvent>, BrokerError> {
        let mut events = Vec::with_capacity(2);

        let bars = self
            .gateway
            .recent_bars(&BarsRequest::latest_minutes(2))
            .await?;
        if let Some(bar) = bars.last() {
            events.push(MarketEvent::Quote(Quote {
                symbol: self.gateway.contract().id.clone(),
                last_price: bar.close,
                best_bid: None,
                best_ask: None,
                high: Some(bar.high),
                low: Some(bar.low),
                volume: Some(bar.volume),
                timestamp: bar.timestamp,
            }));
        } else {
            debug!("Bar poll returned nothing, market likely closed");
        }

        let position = self.gateway.open_position().await?;
        events.push(MarketEvent::Position(match position {
            Some(p) => PositionUpdate {
                contract_id: p.contract_id,
                size: p.size,
                kind: Some(p.kind),
                average_price: Some(p.average_price),
            },
            None => PositionUpdate {
                contract_id: self.gateway.contract().id.clone(),
                size: 0,
                kind: None,
                average_price: None,
            },
        }));

        Ok(events)
    }
}

#[async_trait]
impl MarketEvents for PollingEventChannel {
    async fn stream(
        &self,
        tx: mpsc::Sender<MarketEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        info!(
            interval_secs = self.poll_interval.as_secs(),
            "Polling event channel started"
        );
        if tx.send(MarketEvent::Connected).await.is_err() {
            return Ok(());
        }

        let mut ticker = interval(self.poll_interval);
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(events) => {
                            if consecutive_failures >= FAILURE_THRESHOLD {
                                info!("Polling recovered");
                                if tx.send(MarketEvent::Connected).await.is_err() {
                                    return Ok(());
                                }
                            }
                            consecutive_failures = 0;
                            for event in events {
                                if tx.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            warn!(
                                consecutive_failures,
                                error = %e,
                                "Poll pass failed"
                            );
                            if consecutive_failures == FAILURE_THRESHOLD
                                && tx.send(MarketEvent::Disconnected).await.is_err()
                            {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    fn delivers_fills(&self) -> bool {
        false
    }
}
