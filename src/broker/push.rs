//! Real-time push channel over the gateway's SignalR-style hubs.
//!
//! Two websocket hubs: the user hub streams order, position and trade
//! events for the account; the market hub streams quotes for the
//! contract. Frames are JSON records terminated by an ASCII record
//! separator, possibly several per websocket message. Each hub runs its
//! own reconnect loop with jittered exponential backoff and resubscribes
//! after every reconnect. The engine reconciles on user-hub `Connected`
//! events, so anything missed during an outage is picked up there.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::rest::GatewayClient;
use super::types::{BrokerOrder, OrderModel, PositionUpdate, TradeFill};
use super::{BrokerError, BrokerGateway, MarketEvent, MarketEvents};
use crate::metrics;
use crate::types::{OrderSide, PositionKind, Quote};

const RECORD_SEPARATOR: char = '\x1e';
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CLIENT_PING_INTERVAL: Duration = Duration::from_secs(15);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

type HubSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Push-mode event channel. Fills arrive with realized P&L attached.
pub struct PushEventChannel {
    gateway: Arc<GatewayClient>,
}

impl PushEventChannel {
    pub fn new(gateway: Arc<GatewayClient>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl MarketEvents for PushEventChannel {
    async fn stream(
        &self,
        tx: mpsc::Sender<MarketEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        let user = run_hub(
            Arc::clone(&self.gateway),
            HubKind::User,
            tx.clone(),
            shutdown.clone(),
        );
        let market = run_hub(Arc::clone(&self.gateway), HubKind::Market, tx, shutdown);
        tokio::join!(user, market);
        Ok(())
    }

    fn delivers_fills(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HubKind {
    User,
    Market,
}

impl HubKind {
    fn label(self) -> &'static str {
        match self {
            HubKind::User => "user",
            HubKind::Market => "market",
        }
    }

    fn path(self) -> &'static str {
        match self {
            HubKind::User => "/hubs/user",
            HubKind::Market => "/hubs/market",
        }
    }

    fn subscriptions(self, account_id: i64, contract_id: &str) -> Vec<Value> {
        match self {
            HubKind::User => vec![
                invocation("SubscribeAccounts", vec![]),
                invocation("SubscribeOrders", vec![json!(account_id)]),
                invocation("SubscribePositions", vec![json!(account_id)]),
                invocation("SubscribeTrades", vec![json!(account_id)]),
            ],
            HubKind::Market => vec![invocation("SubscribeContractQuotes", vec![json!(contract_id)])],
        }
    }
}

enum SessionEnd {
    Shutdown,
    ReceiverDropped,
    ConnectionLost,
}

/// One hub's supervision loop: connect, run, back off, repeat.
async fn run_hub(
    gateway: Arc<GatewayClient>,
    hub: HubKind,
    tx: mpsc::Sender<MarketEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    loop {
        if *shutdown.borrow() {
            return;
        }

        match run_session(&gateway, hub, &tx, &mut shutdown).await {
            Ok(SessionEnd::Shutdown) | Ok(SessionEnd::ReceiverDropped) => return,
            Ok(SessionEnd::ConnectionLost) => {
                // The session got as far as subscribing, so restart the
                // backoff schedule from the bottom.
                attempt = 1;
            }
            Err(e) => {
                attempt += 1;
                warn!(hub = hub.label(), attempt, error = %e, "Hub connect failed");
            }
        }

        if hub == HubKind::User && tx.send(MarketEvent::Disconnected).await.is_err() {
            return;
        }
        metrics::record_push_reconnect(hub.label());

        // A stale session token is the usual cause of repeated refusals.
        if attempt >= 2 {
            if let Err(e) = gateway.refresh_token().await {
                warn!(hub = hub.label(), error = %e, "Token refresh before reconnect failed");
            }
        }

        let jitter = rand::thread_rng().gen_range(0..750);
        let delay = backoff_delay(attempt, jitter);
        info!(
            hub = hub.label(),
            delay_ms = delay.as_millis() as u64,
            "Reconnecting hub after backoff"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// One connected hub session, from handshake to the first terminal event.
async fn run_session(
    gateway: &Arc<GatewayClient>,
    hub: HubKind,
    tx: &mpsc::Sender<MarketEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionEnd, BrokerError> {
    let token = gateway.session_token().await;
    let url = format!("{}{}?access_token={}", gateway.rtc_url(), hub.path(), token);
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(|e| BrokerError::Network(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();

    // SignalR handshake; the hub accepts invocations only after its ack.
    send_frame(&mut write, &json!({"protocol": "json", "version": 1})).await?;
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, read.next()).await {
        Ok(Some(Ok(_))) => {}
        Ok(Some(Err(e))) => return Err(BrokerError::Network(e.to_string())),
        Ok(None) => return Err(BrokerError::Network("hub closed during handshake".into())),
        Err(_) => return Err(BrokerError::Network("hub handshake timed out".into())),
    }

    let contract_id = gateway.contract().id.clone();
    for subscription in hub.subscriptions(gateway.account_id(), &contract_id) {
        send_frame(&mut write, &subscription).await?;
    }
    info!(hub = hub.label(), "Hub connected and subscribed");

    // Only the user hub drives reconcile-on-reconnect; a quote gap needs
    // no catch-up.
    if hub == HubKind::User && tx.send(MarketEvent::Connected).await.is_err() {
        return Ok(SessionEnd::ReceiverDropped);
    }

    let mut ping = interval(CLIENT_PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
            }
            _ = ping.tick() => {
                send_frame(&mut write, &json!({"type": 6})).await?;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        for frame in decode_frames(&text) {
                            match frame.kind {
                                Some(6) => {
                                    send_frame(&mut write, &json!({"type": 6})).await?;
                                }
                                Some(7) => {
                                    info!(hub = hub.label(), "Hub sent close frame");
                                    return Ok(SessionEnd::ConnectionLost);
                                }
                                Some(1) => {
                                    if let Some(event) = map_invocation(&frame, &contract_id) {
                                        if tx.send(event).await.is_err() {
                                            return Ok(SessionEnd::ReceiverDropped);
                                        }
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(hub = hub.label(), "Hub closed connection");
                        return Ok(SessionEnd::ConnectionLost);
                    }
                    Some(Err(e)) => {
                        warn!(hub = hub.label(), error = %e, "Hub read error");
                        return Ok(SessionEnd::ConnectionLost);
                    }
                    None => return Ok(SessionEnd::ConnectionLost),
                    _ => {}
                }
            }
        }
    }
}

async fn send_frame(write: &mut HubSink, value: &Value) -> Result<(), BrokerError> {
    let payload = format!("{}{}", value, RECORD_SEPARATOR);
    write
        .send(Message::Text(payload.into()))
        .await
        .map_err(|e| BrokerError::Network(e.to_string()))
}

fn invocation(target: &str, arguments: Vec<Value>) -> Value {
    json!({"arguments": arguments, "target": target, "type": 1})
}

#[derive(Debug, Deserialize)]
struct HubFrame {
    #[serde(rename = "type")]
    kind: Option<i32>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Option<Vec<Value>>,
}

fn decode_frames(text: &str) -> Vec<HubFrame> {
    text.split(RECORD_SEPARATOR)
        .filter(|chunk| !chunk.is_empty())
        .filter_map(|chunk| match serde_json::from_str::<HubFrame>(chunk) {
            Ok(frame) => Some(frame),
            Err(e) => {
                debug!(error = %e, "Undecodable hub frame");
                None
            }
        })
        .collect()
}

/// The event payload is the last invocation argument; some gateway
/// builds wrap it as `{"action": n, "data": {...}}`.
fn event_payload(frame: &HubFrame) -> Option<&Value> {
    let last = frame.arguments.as_ref()?.last()?;
    match last.get("data") {
        Some(data) if data.is_object() => Some(data),
        _ => Some(last),
    }
}

fn map_invocation(frame: &HubFrame, contract_id: &str) -> Option<MarketEvent> {
    let target = frame.target.as_deref()?;
    let payload = event_payload(frame)?;
    match target {
        "GatewayQuote" => decode_quote(payload, contract_id).map(MarketEvent::Quote),
        "GatewayUserOrder" => {
            let model: OrderModel = decode(payload)?;
            let order = BrokerOrder::from(model);
            (order.contract_id == contract_id).then(|| MarketEvent::Order(order))
        }
        "GatewayUserPosition" => {
            let model: PositionEventModel = decode(payload)?;
            if model.contract_id != contract_id {
                return None;
            }
            Some(MarketEvent::Position(PositionUpdate {
                contract_id: model.contract_id,
                size: model.size.abs(),
                kind: PositionKind::try_from(model.kind).ok(),
                average_price: model.average_price,
            }))
        }
        "GatewayUserTrade" => {
            let model: TradeModel = decode(payload)?;
            if model.contract_id != contract_id {
                return None;
            }
            Some(MarketEvent::Trade(TradeFill {
                id: model.id,
                contract_id: model.contract_id,
                side: model.side,
                size: model.size,
                price: model.price,
                profit_and_loss: model.profit_and_loss,
                fees: model.fees,
                voided: model.voided,
                timestamp: model.creation_timestamp,
            }))
        }
        _ => None,
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: &Value) -> Option<T> {
    match serde_json::from_value(value.clone()) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            debug!(error = %e, "Undecodable hub payload");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuotePayload {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    last_price: Option<Decimal>,
    #[serde(default)]
    best_bid: Option<Decimal>,
    #[serde(default)]
    best_ask: Option<Decimal>,
    #[serde(default)]
    high: Option<Decimal>,
    #[serde(default)]
    low: Option<Decimal>,
    #[serde(default)]
    volume: Option<i64>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

fn decode_quote(value: &Value, contract_id: &str) -> Option<Quote> {
    let payload: QuotePayload = decode(value)?;
    let last_price = payload.last_price.or_else(|| {
        match (payload.best_bid, payload.best_ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    })?;
    Some(Quote {
        symbol: payload.symbol.unwrap_or_else(|| contract_id.to_string()),
        last_price,
        best_bid: payload.best_bid,
        best_ask: payload.best_ask,
        high: payload.high,
        low: payload.low,
        volume: payload.volume,
        timestamp: payload.timestamp.unwrap_or_else(Utc::now),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionEventModel {
    contract_id: String,
    #[serde(rename = "type", default)]
    kind: i32,
    size: i64,
    #[serde(default)]
    average_price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TradeModel {
    id: i64,
    contract_id: String,
    side: OrderSide,
    size: i64,
    price: Decimal,
    #[serde(default)]
    profit_and_loss: Option<Decimal>,
    #[serde(default)]
    fees: Option<Decimal>,
    #[serde(default)]
    voided: bool,
    #[serde(default = "Utc::now")]
    creation_timestamp: DateTime<Utc>,
}

fn backoff_delay(attempt: u32, jitter_ms: u64) -> Duration {
    let shift = attempt.saturating_sub(1).min(6);
    let base = Duration::from_secs(1u64 << shift);
    (base + Duration::from_millis(jitter_ms)).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const CONTRACT: &str = "CON.F.US.MGC.Q25";

    #[test]
    fn frames_split_on_record_separator() {
        let text = "{\"type\":6}\x1e{\"type\":1,\"target\":\"GatewayQuote\",\"arguments\":[]}\x1enot json\x1e";
        let frames = decode_frames(text);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, Some(6));
        assert_eq!(frames[1].target.as_deref(), Some("GatewayQuote"));
    }

    #[test]
    fn quote_invocation_maps_to_event() {
        let text = format!(
            "{{\"type\":1,\"target\":\"GatewayQuote\",\"arguments\":[\"{}\",{{\"bestBid\":2010.1,\"bestAsk\":2010.3,\"lastPrice\":2010.2,\"high\":2015.0,\"low\":2005.5,\"volume\":41,\"timestamp\":\"2025-06-02T14:30:00Z\"}}]}}\x1e",
            CONTRACT
        );
        let frames = decode_frames(&text);
        let event = map_invocation(&frames[0], CONTRACT).expect("quote event");
        match event {
            MarketEvent::Quote(q) => {
                assert_eq!(q.last_price, dec!(2010.2));
                assert_eq!(q.bid(), dec!(2010.1));
                assert_eq!(q.ask(), dec!(2010.3));
                assert_eq!(q.high, Some(dec!(2015.0)));
                assert_eq!(q.low, Some(dec!(2005.5)));
            }
            other => panic!("expected quote, got {:?}", other),
        }
    }

    #[test]
    fn quote_without_last_price_uses_midpoint() {
        let value = serde_json::json!({"bestBid": 2000.0, "bestAsk": 2000.4});
        let quote = decode_quote(&value, CONTRACT).expect("quote");
        assert_eq!(quote.last_price, dec!(2000.2));
        assert_eq!(quote.symbol, CONTRACT);
    }

    #[test]
    fn order_event_for_other_contract_is_dropped() {
        let text = "{\"type\":1,\"target\":\"GatewayUserOrder\",\"arguments\":[{\"id\":9,\"contractId\":\"CON.F.US.NQ.M25\",\"type\":4,\"side\":1,\"status\":1,\"size\":5}]}\x1e";
        let frames = decode_frames(text);
        assert!(map_invocation(&frames[0], CONTRACT).is_none());
    }

    #[test]
    fn wrapped_action_data_payload_unwraps() {
        let text = format!(
            "{{\"type\":1,\"target\":\"GatewayUserPosition\",\"arguments\":[{{\"action\":1,\"data\":{{\"contractId\":\"{}\",\"type\":1,\"size\":3,\"averagePrice\":2011.5}}}}]}}\x1e",
            CONTRACT
        );
        let frames = decode_frames(&text);
        let event = map_invocation(&frames[0], CONTRACT).expect("position event");
        match event {
            MarketEvent::Position(update) => {
                assert_eq!(update.size, 3);
                assert_eq!(update.kind, Some(PositionKind::Long));
                assert_eq!(update.average_price, Some(dec!(2011.5)));
            }
            other => panic!("expected position, got {:?}", other),
        }
    }

    #[test]
    fn flat_position_event_has_no_direction() {
        let value = serde_json::json!({"contractId": CONTRACT, "type": 0, "size": 0});
        let frame = HubFrame {
            kind: Some(1),
            target: Some("GatewayUserPosition".to_string()),
            arguments: Some(vec![value]),
        };
        match map_invocation(&frame, CONTRACT).expect("position event") {
            MarketEvent::Position(update) => {
                assert_eq!(update.size, 0);
                assert_eq!(update.kind, None);
            }
            other => panic!("expected position, got {:?}", other),
        }
    }

    #[test]
    fn closing_trade_carries_pnl() {
        let text = format!(
            "{{\"type\":1,\"target\":\"GatewayUserTrade\",\"arguments\":[{{\"id\":501,\"contractId\":\"{}\",\"side\":1,\"size\":2,\"price\":2012.4,\"profitAndLoss\":47.5,\"creationTimestamp\":\"2025-06-02T15:00:00Z\"}}]}}\x1e",
            CONTRACT
        );
        let frames = decode_frames(&text);
        match map_invocation(&frames[0], CONTRACT).expect("trade event") {
            MarketEvent::Trade(fill) => {
                assert!(fill.is_closing());
                assert_eq!(fill.profit_and_loss, Some(dec!(47.5)));
                assert_eq!(fill.side, OrderSide::Ask);
            }
            other => panic!("expected trade, got {:?}", other),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(3, 0), Duration::from_secs(4));
        assert_eq!(backoff_delay(20, 999), MAX_BACKOFF);
    }

    #[test]
    fn subscriptions_cover_account_and_contract() {
        let subs = HubKind::User.subscriptions(1077, CONTRACT);
        let targets: Vec<&str> = subs
            .iter()
            .map(|s| s["target"].as_str().unwrap())
            .collect();
        assert_eq!(
            targets,
            vec![
                "SubscribeAccounts",
                "SubscribeOrders",
                "SubscribePositions",
                "SubscribeTrades"
            ]
        );
        assert_eq!(subs[1]["arguments"][0], 1077);

        let market = HubKind::Market.subscriptions(1077, CONTRACT);
        assert_eq!(market[0]["target"], "SubscribeContractQuotes");
        assert_eq!(market[0]["arguments"][0], CONTRACT);
    }
}
