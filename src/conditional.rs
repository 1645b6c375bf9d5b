//! Conditional orders: market or limit orders parked until the mark price
//! reaches a trigger.
//!
//! Conditional orders are stored separately from the order book. The trigger
//! direction is fixed at placement: a trigger above the mark fires once the
//! mark rises to it, a trigger below fires once the mark falls to it. Each
//! block every active market is scanned in parallel and the triggered orders
//! are turned into ordinary transient orders.

use crate::interfaces::PriceOracle;
use crate::market::Market;
use crate::order::{OrderError, OrderInfo};
use crate::margin::order_fee_hold;
use crate::types::{MarketId, OrderHash, Side, SubaccountId};
use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where the trigger sat relative to the mark price at placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerDirection {
    /// Fires when mark ≥ trigger
    Above,
    /// Fires when mark ≤ trigger
    Below,
}

impl TriggerDirection {
    pub fn from_prices(trigger_price: Decimal, mark_price: Decimal) -> Result<Self, OrderError> {
        if trigger_price > mark_price {
            Ok(TriggerDirection::Above)
        } else if trigger_price < mark_price {
            Ok(TriggerDirection::Below)
        } else {
            Err(OrderError::InvalidTriggerPrice { trigger_price, mark_price })
        }
    }
}

/// What the order becomes once triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionalKind {
    Market,
    Limit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalOrder {
    pub hash: OrderHash,
    pub market_id: MarketId,
    pub side: Side,
    pub kind: ConditionalKind,
    pub info: OrderInfo,
    pub margin: Decimal,
    pub trigger_price: Decimal,
    pub direction: TriggerDirection,
}

impl ConditionalOrder {
    pub fn subaccount_id(&self) -> SubaccountId {
        self.info.subaccount_id
    }

    pub fn price(&self) -> Decimal {
        self.info.price
    }

    pub fn quantity(&self) -> Decimal {
        self.info.quantity
    }

    pub fn is_buy(&self) -> bool {
        self.side.is_buy()
    }

    pub fn is_reduce_only(&self) -> bool {
        self.margin.is_zero()
    }

    pub fn is_limit(&self) -> bool {
        self.kind == ConditionalKind::Limit
    }

    pub fn should_trigger(&self, mark_price: Decimal) -> bool {
        match self.direction {
            TriggerDirection::Above => mark_price >= self.trigger_price,
            TriggerDirection::Below => mark_price <= self.trigger_price,
        }
    }

    /// Balance locked while the order waits: margin plus the taker fee.
    pub fn hold(&self, taker_fee_rate: Decimal) -> Decimal {
        if self.is_reduce_only() {
            return Decimal::ZERO;
        }
        self.margin + order_fee_hold(self.price(), self.quantity(), taker_fee_rate)
    }
}

/// Conditional orders of one market, in hash (placement) order.
#[derive(Debug, Clone, Default)]
pub struct ConditionalOrderBook {
    orders: BTreeMap<OrderHash, ConditionalOrder>,
}

impl ConditionalOrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, order: ConditionalOrder) {
        self.orders.insert(order.hash, order);
    }

    pub fn remove(&mut self, hash: OrderHash) -> Option<ConditionalOrder> {
        self.orders.remove(&hash)
    }

    pub fn get(&self, hash: OrderHash) -> Option<&ConditionalOrder> {
        self.orders.get(&hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConditionalOrder> {
        self.orders.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConditionalOrder> {
        self.orders.values_mut()
    }

    pub fn by_subaccount(&self, subaccount_id: SubaccountId) -> Vec<&ConditionalOrder> {
        self.orders.values().filter(|o| o.subaccount_id() == subaccount_id).collect()
    }

    /// A subaccount keeps at most one conditional market order per trigger direction.
    pub fn has_market_order_in_direction(&self, subaccount_id: SubaccountId, direction: TriggerDirection) -> bool {
        self.orders
            .values()
            .any(|o| o.subaccount_id() == subaccount_id && o.kind == ConditionalKind::Market && o.direction == direction)
    }

    /// Orders that fire at `mark_price`, market orders first.
    pub fn triggered(&self, mark_price: Decimal) -> (Vec<ConditionalOrder>, Vec<ConditionalOrder>) {
        self.orders
            .values()
            .filter(|o| o.should_trigger(mark_price))
            .cloned()
            .partition(|o| o.kind == ConditionalKind::Market)
    }

    pub fn hashes(&self) -> Vec<OrderHash> {
        self.orders.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

/// Triggered orders of one market at the mark price they fired at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggeredOrders {
    pub market_id: MarketId,
    pub mark_price: Decimal,
    pub market_orders: Vec<ConditionalOrder>,
    pub limit_orders: Vec<ConditionalOrder>,
}

impl TriggeredOrders {
    pub fn is_empty(&self) -> bool {
        self.market_orders.is_empty() && self.limit_orders.is_empty()
    }

    pub fn len(&self) -> usize {
        self.market_orders.len() + self.limit_orders.len()
    }
}

fn scan_market(market: &Market, book: &ConditionalOrderBook, oracle: &dyn PriceOracle) -> Option<TriggeredOrders> {
    if !market.is_active() || book.is_empty() {
        return None;
    }
    let mark_price = market.oracle().scaled_price(oracle.price(market.oracle())?);
    let (market_orders, limit_orders) = book.triggered(mark_price);
    let triggered = TriggeredOrders {
        market_id: market.id(),
        mark_price,
        market_orders,
        limit_orders,
    };
    (!triggered.is_empty()).then_some(triggered)
}

/// Reads every market's conditional book in parallel. Nothing is mutated here;
/// the result is sorted by market so callers apply triggers deterministically.
pub fn find_triggered_orders(markets: &[(&Market, &ConditionalOrderBook)], oracle: &dyn PriceOracle) -> Vec<TriggeredOrders> {
    let mut triggered: Vec<TriggeredOrders> = markets
        .par_iter()
        .filter_map(|(market, book)| scan_market(market, book, oracle))
        .collect();
    triggered.sort_by_key(|t| t.market_id);
    triggered
}
