//! Shared test doubles for the engine modules.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::broker::{
    BarsRequest, BrokerError, BrokerGateway, BrokerOrder, BrokerPosition, ContractSpec,
    OrderChanges, OrderId, OrderTicket,
};
use crate::types::{Bar, OrderSide, OrderStatus, OrderType, PositionKind, Quote};

pub fn contract() -> ContractSpec {
    ContractSpec {
        id: "CON.F.US.MGC.Z26".to_string(),
        name: "MGCZ26".to_string(),
        description: "Micro Gold".to_string(),
        tick_size: dec!(0.1),
        tick_value: dec!(1.0),
    }
}

pub fn quote(last: Decimal) -> Quote {
    Quote {
        symbol: "MGCZ26".to_string(),
        last_price: last,
        best_bid: Some(last - dec!(0.1)),
        best_ask: Some(last + dec!(0.1)),
        high: None,
        low: None,
        volume: Some(10),
        timestamp: Utc::now(),
    }
}

pub fn listed_order(
    id: &str,
    kind: OrderType,
    side: OrderSide,
    size: i64,
    price: Decimal,
) -> BrokerOrder {
    let (limit_price, stop_price) = match kind {
        OrderType::Stop => (None, Some(price)),
        _ => (Some(price), None),
    };
    BrokerOrder {
        id: OrderId::new(id),
        contract_id: contract().id,
        kind,
        side,
        status: OrderStatus::Open,
        size,
        limit_price,
        stop_price,
        created_at: None,
    }
}

/// Scriptable in-memory gateway.
///
/// With `auto_list` on, placed orders land in the open-order listing so
/// verification finds them; off, they vanish and verification fails.
/// Cancels prune the listing, modifies are applied to it, and `position`
/// plays the account. Every mutation is recorded for assertions.
pub struct StubGateway {
    pub contract: ContractSpec,
    pub next_id: AtomicI64,
    pub auto_list: bool,
    /// When set, a market order with no position open becomes the open
    /// position at `market_fill_price`.
    pub fill_market_orders: AtomicBool,
    pub market_fill_price: StdMutex<Decimal>,
    pub fail_places: StdMutex<VecDeque<BrokerError>>,
    pub placed: StdMutex<Vec<OrderTicket>>,
    pub cancelled: StdMutex<Vec<OrderId>>,
    pub modified: StdMutex<Vec<(OrderId, OrderChanges)>>,
    pub listing: StdMutex<Vec<BrokerOrder>>,
    pub position: StdMutex<Option<BrokerPosition>>,
    pub closes: AtomicU32,
    pub partial_closes: StdMutex<Vec<i64>>,
}

impl StubGateway {
    pub fn new(auto_list: bool) -> Arc<Self> {
        Arc::new(Self {
            contract: contract(),
            next_id: AtomicI64::new(100),
            auto_list,
            fill_market_orders: AtomicBool::new(false),
            market_fill_price: StdMutex::new(dec!(2000.0)),
            fail_places: StdMutex::new(VecDeque::new()),
            placed: StdMutex::new(Vec::new()),
            cancelled: StdMutex::new(Vec::new()),
            modified: StdMutex::new(Vec::new()),
            listing: StdMutex::new(Vec::new()),
            position: StdMutex::new(None),
            closes: AtomicU32::new(0),
            partial_closes: StdMutex::new(Vec::new()),
        })
    }

    pub fn seed_listing(&self, orders: Vec<BrokerOrder>) {
        *self.listing.lock().unwrap() = orders;
    }

    pub fn set_position(&self, position: Option<BrokerPosition>) {
        *self.position.lock().unwrap() = position;
    }

    pub fn fail_next_places(&self, errors: Vec<BrokerError>) {
        self.fail_places.lock().unwrap().extend(errors);
    }

    pub fn fill_market_orders_at(&self, price: Decimal) {
        self.fill_market_orders.store(true, Ordering::SeqCst);
        *self.market_fill_price.lock().unwrap() = price;
    }

    pub fn placed_tickets(&self) -> Vec<OrderTicket> {
        self.placed.lock().unwrap().clone()
    }

    pub fn cancelled_ids(&self) -> Vec<OrderId> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerGateway for StubGateway {
    async fn place_order(&self, ticket: &OrderTicket) -> Result<OrderId, BrokerError> {
        self.placed.lock().unwrap().push(ticket.clone());
        if let Some(err) = self.fail_places.lock().unwrap().pop_front() {
            return Err(err);
        }
        let id = OrderId::from(self.next_id.fetch_add(1, Ordering::SeqCst));
        if self.auto_list && ticket.order_type != OrderType::Market {
            self.listing.lock().unwrap().push(BrokerOrder {
                id: id.clone(),
                contract_id: self.contract.id.clone(),
                kind: ticket.order_type,
                side: ticket.side,
                status: OrderStatus::Open,
                size: ticket.size,
                limit_price: ticket.limit_price,
                stop_price: ticket.stop_price,
                created_at: None,
            });
        }
        if ticket.order_type == OrderType::Market
            && self.fill_market_orders.load(Ordering::SeqCst)
        {
            let mut position = self.position.lock().unwrap();
            if position.is_none() {
                let kind = match ticket.side {
                    OrderSide::Bid => PositionKind::Long,
                    OrderSide::Ask => PositionKind::Short,
                };
                *position = Some(BrokerPosition {
                    contract_id: self.contract.id.clone(),
                    kind,
                    size: ticket.size,
                    average_price: *self.market_fill_price.lock().unwrap(),
                    opened_at: Some(Utc::now()),
                });
            }
        }
        Ok(id)
    }

    async fn cancel_order(&self, order_id: &OrderId) -> Result<(), BrokerError> {
        self.cancelled.lock().unwrap().push(order_id.clone());
        self.listing.lock().unwrap().retain(|o| &o.id != order_id);
        Ok(())
    }

    async fn modify_order(
        &self,
        order_id: &OrderId,
        changes: &OrderChanges,
    ) -> Result<(), BrokerError> {
        self.modified
            .lock()
            .unwrap()
            .push((order_id.clone(), changes.clone()));
        let mut listing = self.listing.lock().unwrap();
        if let Some(order) = listing.iter_mut().find(|o| &o.id == order_id) {
            if let Some(size) = changes.size {
                order.size = size;
            }
            if changes.stop_price.is_some() {
                order.stop_price = changes.stop_price;
            }
            if changes.limit_price.is_some() {
                order.limit_price = changes.limit_price;
            }
        }
        Ok(())
    }

    async fn open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        Ok(self.listing.lock().unwrap().clone())
    }

    async fn open_position(&self) -> Result<Option<BrokerPosition>, BrokerError> {
        Ok(self.position.lock().unwrap().clone())
    }

    async fn close_position(&self) -> Result<(), BrokerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.position.lock().unwrap().take();
        Ok(())
    }

    async fn partial_close_position(&self, size: i64) -> Result<(), BrokerError> {
        self.partial_closes.lock().unwrap().push(size);
        let mut position = self.position.lock().unwrap();
        if let Some(bp) = position.as_mut() {
            bp.size -= size;
            if bp.size <= 0 {
                *position = None;
            }
        }
        Ok(())
    }

    async fn recent_bars(&self, _request: &BarsRequest) -> Result<Vec<Bar>, BrokerError> {
        Ok(Vec::new())
    }

    fn contract(&self) -> &ContractSpec {
        &self.contract
    }

    fn account_id(&self) -> i64 {
        7
    }
}
