//! Typed gateway payloads.
//!
//! Every REST endpoint and hub event gets a concrete struct here; raw
//! JSON never crosses into the trading logic. Wire structs mirror the
//! gateway's camelCase fields, domain structs carry only what the engine
//! consumes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::BrokerError;
use crate::types::{OrderSide, OrderStatus, OrderType, PositionKind};

/// Broker-assigned order identifier.
///
/// Newtype so order ids cannot be mixed up with other strings at call
/// sites. Gateway ids are numeric but arrive in several widths; storing
/// the canonical string form sidesteps that.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(String);

impl OrderId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for OrderId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for OrderId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for OrderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The futures contract this session trades, resolved at connect time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractSpec {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tick_size: Decimal,
    pub tick_value: Decimal,
}

impl ContractSpec {
    /// Currency value of a one-tick move for `size` contracts.
    pub fn tick_pnl(&self, size: i64) -> Decimal {
        self.tick_value * Decimal::from(size)
    }

    /// Currency P&L for a price move over `size` contracts.
    pub fn price_move_pnl(&self, price_delta: Decimal, size: i64) -> Decimal {
        if self.tick_size.is_zero() {
            return Decimal::ZERO;
        }
        price_delta / self.tick_size * self.tick_value * Decimal::from(size)
    }

    /// Price distance covered by `ticks` ticks.
    pub fn ticks(&self, ticks: i64) -> Decimal {
        self.tick_size * Decimal::from(ticks)
    }
}

/// Linked protective brackets attached to an entry order, in ticks of
/// distance from the fill. Signs are applied per side at the wire layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BracketTicks {
    pub stop_ticks: i64,
    pub target_ticks: i64,
}

/// An order the engine wants placed.
#[derive(Debug, Clone)]
pub struct OrderTicket {
    pub side: OrderSide,
    pub order_type: OrderType,
    pub size: i64,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    /// Free-form tag echoed back by the gateway, used to spot our own
    /// orders in listings.
    pub tag: Option<String>,
    pub bracket: Option<BracketTicks>,
}

impl OrderTicket {
    pub fn market(side: OrderSide, size: i64) -> Self {
        Self {
            side,
            order_type: OrderType::Market,
            size,
            limit_price: None,
            stop_price: None,
            tag: None,
            bracket: None,
        }
    }

    pub fn limit(side: OrderSide, size: i64, price: Decimal) -> Self {
        Self {
            side,
            order_type: OrderType::Limit,
            size,
            limit_price: Some(price),
            stop_price: None,
            tag: None,
            bracket: None,
        }
    }

    pub fn stop(side: OrderSide, size: i64, price: Decimal) -> Self {
        Self {
            side,
            order_type: OrderType::Stop,
            size,
            limit_price: None,
            stop_price: Some(price),
            tag: None,
            bracket: None,
        }
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    #[must_use]
    pub fn with_bracket(mut self, bracket: BracketTicks) -> Self {
        self.bracket = Some(bracket);
        self
    }
}

/// Changes for a modify call; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct OrderChanges {
    pub size: Option<i64>,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
}

impl OrderChanges {
    pub fn size(size: i64) -> Self {
        Self {
            size: Some(size),
            ..Default::default()
        }
    }

    pub fn stop_price(price: Decimal) -> Self {
        Self {
            stop_price: Some(price),
            ..Default::default()
        }
    }

    pub fn limit_price(price: Decimal) -> Self {
        Self {
            limit_price: Some(price),
            ..Default::default()
        }
    }
}

/// A working order as the gateway reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerOrder {
    pub id: OrderId,
    pub contract_id: String,
    pub kind: OrderType,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub size: i64,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub created_at: Option<DateTime<Utc>>,
}

impl BrokerOrder {
    /// The price the order rests at, whichever field carries it.
    pub fn working_price(&self) -> Option<Decimal> {
        self.stop_price.or(self.limit_price)
    }
}

/// An open position as the gateway reports it. `size` is always positive;
/// direction comes from `kind`.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerPosition {
    pub contract_id: String,
    pub kind: PositionKind,
    pub size: i64,
    pub average_price: Decimal,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Position change pushed over the user hub. `size == 0` means flat;
/// the direction field can be stale on flat frames, so it stays optional.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionUpdate {
    pub contract_id: String,
    pub size: i64,
    pub kind: Option<PositionKind>,
    pub average_price: Option<Decimal>,
}

/// A fill (half-turn) reported by the gateway. `profit_and_loss` is
/// `None` on entry fills and set on closing fills.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeFill {
    pub id: i64,
    pub contract_id: String,
    pub side: OrderSide,
    pub size: i64,
    pub price: Decimal,
    pub profit_and_loss: Option<Decimal>,
    pub fees: Option<Decimal>,
    pub voided: bool,
    pub timestamp: DateTime<Utc>,
}

impl TradeFill {
    /// Closing fills carry realized P&L; entry half-turns do not.
    pub fn is_closing(&self) -> bool {
        self.profit_and_loss.is_some()
    }
}

/// Bars request in domain terms; the client fills in the time range.
#[derive(Debug, Clone, Copy)]
pub struct BarsRequest {
    pub unit_minutes: u32,
    pub count: u32,
    pub include_partial: bool,
}

impl BarsRequest {
    /// The most recent `count` one-minute bars including the forming one.
    pub fn latest_minutes(count: u32) -> Self {
        Self {
            unit_minutes: 1,
            count,
            include_partial: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire structs. Field names match the gateway exactly.
// ---------------------------------------------------------------------------

pub(crate) fn envelope_result(
    success: bool,
    error_code: i32,
    error_message: Option<String>,
) -> Result<(), BrokerError> {
    if success {
        return Ok(());
    }
    Err(BrokerError::Api {
        code: error_code,
        message: error_message.unwrap_or_else(|| "no error message".to_string()),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoginKeyRequest<'a> {
    pub user_name: &'a str,
    pub api_key: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoginResponse {
    pub token: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ValidateResponse {
    pub success: bool,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error_message: Option<String>,
    pub new_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AccountSearchRequest {
    pub only_active_accounts: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AccountModel {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub can_trade: bool,
    #[serde(default)]
    pub balance: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AccountSearchResponse {
    pub success: bool,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub accounts: Vec<AccountModel>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ContractSearchRequest<'a> {
    pub search_text: &'a str,
    pub live: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ContractModel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tick_size: Decimal,
    pub tick_value: Decimal,
    #[serde(default)]
    pub active_contract: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ContractSearchResponse {
    pub success: bool,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub contracts: Vec<ContractModel>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BracketSpec {
    pub ticks: i64,
    #[serde(rename = "type")]
    pub kind: OrderType,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PlaceOrderRequest<'a> {
    pub account_id: i64,
    pub contract_id: &'a str,
    #[serde(rename = "type")]
    pub kind: OrderType,
    pub side: OrderSide,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_tag: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss_bracket: Option<BracketSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit_bracket: Option<BracketSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PlaceOrderResponse {
    pub success: bool,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error_message: Option<String>,
    pub order_id: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CancelOrderRequest {
    pub account_id: i64,
    pub order_id: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ModifyOrderRequest {
    pub account_id: i64,
    pub order_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatusResponse {
    pub success: bool,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AccountScopedRequest {
    pub account_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OrderModel {
    pub id: i64,
    pub contract_id: String,
    #[serde(rename = "type")]
    pub kind: OrderType,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub size: i64,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl From<OrderModel> for BrokerOrder {
    fn from(m: OrderModel) -> Self {
        Self {
            id: OrderId::from(m.id),
            contract_id: m.contract_id,
            kind: m.kind,
            side: m.side,
            status: m.status,
            size: m.size,
            limit_price: m.limit_price,
            stop_price: m.stop_price,
            created_at: m.creation_timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OrderSearchResponse {
    pub success: bool,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub orders: Vec<OrderModel>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PositionModel {
    pub contract_id: String,
    #[serde(rename = "type")]
    pub kind: PositionKind,
    pub size: i64,
    pub average_price: Decimal,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl From<PositionModel> for BrokerPosition {
    fn from(m: PositionModel) -> Self {
        Self {
            contract_id: m.contract_id,
            kind: m.kind,
            size: m.size.abs(),
            average_price: m.average_price,
            opened_at: m.creation_timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PositionSearchResponse {
    pub success: bool,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub positions: Vec<PositionModel>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CloseContractRequest<'a> {
    pub account_id: i64,
    pub contract_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PartialCloseContractRequest<'a> {
    pub account_id: i64,
    pub contract_id: &'a str,
    pub size: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RetrieveBarsRequest<'a> {
    pub contract_id: &'a str,
    pub live: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// 2 = minute bars.
    pub unit: i32,
    pub unit_number: u32,
    pub limit: u32,
    pub include_partial_bar: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RetrieveBarsResponse {
    pub success: bool,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub bars: Vec<crate::types::Bar>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn envelope_maps_failure_to_api_error() {
        assert!(envelope_result(true, 0, None).is_ok());
        let err = envelope_result(false, 3, Some("insufficient margin".into())).unwrap_err();
        match err {
            BrokerError::Api { code, message } => {
                assert_eq!(code, 3);
                assert!(message.contains("margin"));
            }
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    #[test]
    fn order_model_decodes_gateway_shape() {
        let json = r#"{
            "id": 4421,
            "accountId": 7,
            "contractId": "CON.F.US.MGC.Q25",
            "type": 4,
            "side": 1,
            "status": 1,
            "size": 5,
            "stopPrice": 1998.0,
            "creationTimestamp": "2025-06-02T14:30:00Z"
        }"#;
        let model: OrderModel = serde_json::from_str(json).unwrap();
        let order = BrokerOrder::from(model);
        assert_eq!(order.id, OrderId::new("4421"));
        assert_eq!(order.kind, OrderType::Stop);
        assert_eq!(order.side, OrderSide::Ask);
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.working_price(), Some(dec!(1998.0)));
    }

    #[test]
    fn position_model_normalizes_size() {
        let json = r#"{
            "contractId": "CON.F.US.MGC.Q25",
            "type": 2,
            "size": -3,
            "averagePrice": 2010.5
        }"#;
        let model: PositionModel = serde_json::from_str(json).unwrap();
        let position = BrokerPosition::from(model);
        assert_eq!(position.kind, PositionKind::Short);
        assert_eq!(position.size, 3);
    }

    #[test]
    fn place_request_skips_unset_fields() {
        let req = PlaceOrderRequest {
            account_id: 7,
            contract_id: "CON.F.US.MGC.Q25",
            kind: OrderType::Market,
            side: OrderSide::Bid,
            size: 5,
            limit_price: None,
            stop_price: None,
            custom_tag: None,
            stop_loss_bracket: None,
            take_profit_bracket: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("limitPrice"));
        assert!(!json.contains("stopLossBracket"));
        assert!(json.contains("\"type\":2"));
        assert!(json.contains("\"side\":0"));
    }

    #[test]
    fn contract_math() {
        let spec = ContractSpec {
            id: "CON.F.US.MGC.Q25".into(),
            name: "MGCQ25".into(),
            description: "Micro Gold".into(),
            tick_size: dec!(0.10),
            tick_value: dec!(1.0),
        };
        assert_eq!(spec.ticks(30), dec!(3.0));
        assert_eq!(spec.price_move_pnl(dec!(2.0), 5), dec!(100.0));
        assert_eq!(spec.price_move_pnl(dec!(-1.0), 2), dec!(-20.0));
    }
}
