//! Common Types Module
//!
//! Wire-level enums and market data types shared across the codebase.
//! The gateway speaks integer codes on every endpoint; the conversions
//! live here so nothing else handles raw codes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side using the gateway's wire codes (0 = bid/buy, 1 = ask/sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum OrderSide {
    Bid,
    Ask,
}

impl OrderSide {
    /// The side that closes a position opened on this side.
    pub fn closing(&self) -> OrderSide {
        match self {
            OrderSide::Bid => OrderSide::Ask,
            OrderSide::Ask => OrderSide::Bid,
        }
    }
}

impl From<OrderSide> for i32 {
    fn from(side: OrderSide) -> i32 {
        match side {
            OrderSide::Bid => 0,
            OrderSide::Ask => 1,
        }
    }
}

impl TryFrom<i32> for OrderSide {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(OrderSide::Bid),
            1 => Ok(OrderSide::Ask),
            other => Err(format!("unknown order side code {}", other)),
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Bid => write!(f, "buy"),
            OrderSide::Ask => write!(f, "sell"),
        }
    }
}

/// Order type codes as the gateway defines them. Codes 3 and 5+ exist on
/// the wire (trailing stop, join bid, etc.) but the engine never places
/// them; they decode to `Other` so an unexpected open order cannot poison
/// a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum OrderType {
    Limit,
    Market,
    Stop,
    Other(i32),
}

impl From<OrderType> for i32 {
    fn from(kind: OrderType) -> i32 {
        match kind {
            OrderType::Limit => 1,
            OrderType::Market => 2,
            OrderType::Stop => 4,
            OrderType::Other(code) => code,
        }
    }
}

impl TryFrom<i32> for OrderType {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(OrderType::Limit),
            2 => Ok(OrderType::Market),
            4 => Ok(OrderType::Stop),
            other => Ok(OrderType::Other(other)),
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Limit => write!(f, "limit"),
            OrderType::Market => write!(f, "market"),
            OrderType::Stop => write!(f, "stop"),
            OrderType::Other(code) => write!(f, "other({})", code),
        }
    }
}

/// Order status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
    Expired,
    Rejected,
    Pending,
}

impl OrderStatus {
    /// Whether the order can still execute.
    pub fn is_working(&self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_working()
    }
}

impl From<OrderStatus> for i32 {
    fn from(status: OrderStatus) -> i32 {
        match status {
            OrderStatus::Open => 1,
            OrderStatus::Filled => 2,
            OrderStatus::Cancelled => 3,
            OrderStatus::Expired => 4,
            OrderStatus::Rejected => 5,
            OrderStatus::Pending => 6,
        }
    }
}

impl TryFrom<i32> for OrderStatus {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(OrderStatus::Open),
            2 => Ok(OrderStatus::Filled),
            3 => Ok(OrderStatus::Cancelled),
            4 => Ok(OrderStatus::Expired),
            5 => Ok(OrderStatus::Rejected),
            6 => Ok(OrderStatus::Pending),
            other => Err(format!("unknown order status code {}", other)),
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            OrderStatus::Open => "open",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Expired => "expired",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Pending => "pending",
        };
        write!(f, "{}", label)
    }
}

/// Position direction as reported by the gateway (1 = long, 2 = short).
/// Reconciliation trusts this field, never the sign of the size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum PositionKind {
    Long,
    Short,
}

impl PositionKind {
    /// Side of the entry order that produced this position.
    pub fn entry_side(&self) -> OrderSide {
        match self {
            PositionKind::Long => OrderSide::Bid,
            PositionKind::Short => OrderSide::Ask,
        }
    }

    /// Side of any order that reduces or closes this position.
    pub fn closing_side(&self) -> OrderSide {
        self.entry_side().closing()
    }

    /// +1 for long, -1 for short. Lets price math read as
    /// `entry + direction * offset` instead of branching everywhere.
    pub fn direction(&self) -> Decimal {
        match self {
            PositionKind::Long => Decimal::ONE,
            PositionKind::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl From<PositionKind> for i32 {
    fn from(kind: PositionKind) -> i32 {
        match kind {
            PositionKind::Long => 1,
            PositionKind::Short => 2,
        }
    }
}

impl TryFrom<i32> for PositionKind {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(PositionKind::Long),
            2 => Ok(PositionKind::Short),
            other => Err(format!("unknown position type code {}", other)),
        }
    }
}

impl std::fmt::Display for PositionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionKind::Long => write!(f, "LONG"),
            PositionKind::Short => write!(f, "SHORT"),
        }
    }
}

/// A real-time quote from the market data channel. Fields the gateway
/// omits on a given frame come through as `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub symbol: String,
    pub last_price: Decimal,
    #[serde(default)]
    pub best_bid: Option<Decimal>,
    #[serde(default)]
    pub best_ask: Option<Decimal>,
    #[serde(default)]
    pub high: Option<Decimal>,
    #[serde(default)]
    pub low: Option<Decimal>,
    #[serde(default)]
    pub volume: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// Best bid, falling back to last traded price when the frame had none.
    pub fn bid(&self) -> Decimal {
        self.best_bid.unwrap_or(self.last_price)
    }

    pub fn ask(&self) -> Decimal {
        self.best_ask.unwrap_or(self.last_price)
    }
}

/// One OHLCV bar from the history endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "o")]
    pub open: Decimal,
    #[serde(rename = "h")]
    pub high: Decimal,
    #[serde(rename = "l")]
    pub low: Decimal,
    #[serde(rename = "c")]
    pub close: Decimal,
    #[serde(rename = "v")]
    pub volume: i64,
}

/// Round a price to the nearest multiple of `tick_size`.
pub fn round_to_tick(price: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size.is_zero() {
        return price;
    }
    (price / tick_size).round() * tick_size
}
