//! Derivative orders and the resting order book.
//!
//! Limit orders rest in a price-time ordered book. Market orders never rest;
//! they carry a worst acceptable price and resolve in the block they arrive.
//! An order with zero margin is reduce-only.

use crate::margin::pro_rata;
use crate::types::{MarketId, OrderHash, Side, SubaccountId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Fields shared by every order kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderInfo {
    pub subaccount_id: SubaccountId,
    /// Receives the relayer share of trading fees
    pub fee_recipient: SubaccountId,
    /// Limit price, or worst acceptable price for market orders
    pub price: Decimal,
    pub quantity: Decimal,
    pub cid: Option<String>,
}

impl OrderInfo {
    pub fn new(subaccount_id: SubaccountId, price: Decimal, quantity: Decimal) -> Self {
        Self {
            subaccount_id,
            fee_recipient: SubaccountId::AUCTION,
            price,
            quantity,
            cid: None,
        }
    }

    pub fn with_fee_recipient(mut self, fee_recipient: SubaccountId) -> Self {
        self.fee_recipient = fee_recipient;
        self
    }

    pub fn with_cid(mut self, cid: &str) -> Self {
        self.cid = Some(cid.to_string());
        self
    }
}

/// 2.0: a limit order, resting or transient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivativeLimitOrder {
    pub hash: OrderHash,
    pub market_id: MarketId,
    pub side: Side,
    pub info: OrderInfo,
    pub margin: Decimal,
    /// Quantity still open
    pub fillable: Decimal,
    pub post_only: bool,
    /// Cancelled at the start of this block height
    pub expiration_block: Option<u64>,
}

impl DerivativeLimitOrder {
    pub fn new(hash: OrderHash, market_id: MarketId, side: Side, info: OrderInfo, margin: Decimal) -> Self {
        let fillable = info.quantity;
        Self {
            hash,
            market_id,
            side,
            info,
            margin,
            fillable,
            post_only: false,
            expiration_block: None,
        }
    }

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

    pub fn is_vanilla(&self) -> bool {
        !self.is_reduce_only()
    }

    pub fn filled_quantity(&self) -> Decimal {
        self.info.quantity - self.fillable
    }

    /// Margin used up by the first `filled` units of the order.
    fn margin_consumed(&self, filled: Decimal) -> Decimal {
        pro_rata(self.margin, filled.min(self.info.quantity), self.info.quantity)
    }

    /// Margin a fill of `fill_quantity` takes from what is still locked.
    /// successive fills telescope, so with the final cancel they add up to `margin`.
    pub fn margin_for_fill(&self, fill_quantity: Decimal) -> Decimal {
        let filled = self.filled_quantity();
        self.margin_consumed(filled + fill_quantity) - self.margin_consumed(filled)
    }

    /// Margin still locked for the open quantity.
    pub fn margin_for_fillable(&self) -> Decimal {
        self.margin - self.margin_consumed(self.filled_quantity())
    }

    /// Available balance returned when the open quantity is cancelled.
    pub fn cancel_refund(&self, fee_rate: Decimal) -> Decimal {
        if self.is_reduce_only() {
            return Decimal::ZERO;
        }
        self.margin_for_fillable() + self.fillable * self.info.price * fee_rate.max(Decimal::ZERO)
    }

    pub fn is_expired(&self, block_height: u64) -> bool {
        matches!(self.expiration_block, Some(h) if h <= block_height)
    }
}

/// 2.1: a market order. info.price is the worst acceptable execution price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivativeMarketOrder {
    pub hash: OrderHash,
    pub market_id: MarketId,
    pub side: Side,
    pub info: OrderInfo,
    pub margin: Decimal,
    /// Margin plus the taker fee held for the full quantity
    pub margin_hold: Decimal,
}

impl DerivativeMarketOrder {
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

    pub fn is_vanilla(&self) -> bool {
        !self.is_reduce_only()
    }
}

/// Margin a binary options order must lock: the most it can lose.
pub fn binary_options_order_margin(price: Decimal, quantity: Decimal, is_buy: bool, is_reduce_only: bool, scale: Decimal) -> Decimal {
    if is_reduce_only {
        return Decimal::ZERO;
    }
    if is_buy {
        price * quantity
    } else {
        (scale - price) * quantity
    }
}

/// Per (market, subaccount, side) aggregates of open limit orders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubaccountOrderbookMetadata {
    pub vanilla_limit_order_count: u32,
    pub reduce_only_limit_order_count: u32,
    /// Sum of fillable quantity over reduce-only orders
    pub aggregate_reduce_only_quantity: Decimal,
    /// Sum of fillable quantity over vanilla orders
    pub aggregate_vanilla_quantity: Decimal,
    pub vanilla_conditional_order_count: u32,
    pub reduce_only_conditional_order_count: u32,
}

impl SubaccountOrderbookMetadata {
    pub fn add_order(&mut self, is_reduce_only: bool, fillable: Decimal) {
        if is_reduce_only {
            self.reduce_only_limit_order_count += 1;
            self.aggregate_reduce_only_quantity += fillable;
        } else {
            self.vanilla_limit_order_count += 1;
            self.aggregate_vanilla_quantity += fillable;
        }
    }

    pub fn remove_order(&mut self, is_reduce_only: bool, fillable: Decimal) {
        if is_reduce_only {
            self.reduce_only_limit_order_count = self.reduce_only_limit_order_count.saturating_sub(1);
            self.aggregate_reduce_only_quantity = (self.aggregate_reduce_only_quantity - fillable).max(Decimal::ZERO);
        } else {
            self.vanilla_limit_order_count = self.vanilla_limit_order_count.saturating_sub(1);
            self.aggregate_vanilla_quantity = (self.aggregate_vanilla_quantity - fillable).max(Decimal::ZERO);
        }
    }

    /// A fill shrinks the aggregate without removing the order.
    pub fn reduce_fillable(&mut self, is_reduce_only: bool, filled: Decimal) {
        if is_reduce_only {
            self.aggregate_reduce_only_quantity = (self.aggregate_reduce_only_quantity - filled).max(Decimal::ZERO);
        } else {
            self.aggregate_vanilla_quantity = (self.aggregate_vanilla_quantity - filled).max(Decimal::ZERO);
        }
    }

    pub fn add_conditional(&mut self, is_reduce_only: bool) {
        if is_reduce_only {
            self.reduce_only_conditional_order_count += 1;
        } else {
            self.vanilla_conditional_order_count += 1;
        }
    }

    pub fn remove_conditional(&mut self, is_reduce_only: bool) {
        if is_reduce_only {
            self.reduce_only_conditional_order_count = self.reduce_only_conditional_order_count.saturating_sub(1);
        } else {
            self.vanilla_conditional_order_count = self.vanilla_conditional_order_count.saturating_sub(1);
        }
    }
}

// priority key: bids store the negated price so both sides iterate best-first ascending.
// equal prices fall back to the hash, which the engine assigns in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    priority_price: Decimal,
    hash: OrderHash,
}

impl OrderKey {
    fn new(side: Side, price: Decimal, hash: OrderHash) -> Self {
        let priority_price = match side {
            Side::Buy => -price,
            Side::Sell => price,
        };
        Self { priority_price, hash }
    }
}

/// Resting limit orders of one market, both sides, in price-time priority.
#[derive(Debug, Clone, Default)]
pub struct RestingOrderbook {
    bids: BTreeMap<OrderKey, DerivativeLimitOrder>,
    asks: BTreeMap<OrderKey, DerivativeLimitOrder>,
    order_index: HashMap<OrderHash, (Side, OrderKey)>,
}

impl RestingOrderbook {
    pub fn new() -> Self {
        Self::default()
    }

    fn side_map(&self, side: Side) -> &BTreeMap<OrderKey, DerivativeLimitOrder> {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    fn side_map_mut(&mut self, side: Side) -> &mut BTreeMap<OrderKey, DerivativeLimitOrder> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    pub fn insert(&mut self, order: DerivativeLimitOrder) {
        let key = OrderKey::new(order.side, order.price(), order.hash);
        self.order_index.insert(order.hash, (order.side, key));
        self.side_map_mut(order.side).insert(key, order);
    }

    pub fn remove(&mut self, hash: OrderHash) -> Option<DerivativeLimitOrder> {
        let (side, key) = self.order_index.remove(&hash)?;
        self.side_map_mut(side).remove(&key)
    }

    pub fn get(&self, hash: OrderHash) -> Option<&DerivativeLimitOrder> {
        let (side, key) = self.order_index.get(&hash)?;
        self.side_map(*side).get(key)
    }

    pub fn get_mut(&mut self, hash: OrderHash) -> Option<&mut DerivativeLimitOrder> {
        let (side, key) = *self.order_index.get(&hash)?;
        self.side_map_mut(side).get_mut(&key)
    }

    /// Best-first iteration over one side.
    pub fn iter_side(&self, side: Side) -> impl Iterator<Item = &DerivativeLimitOrder> {
        self.side_map(side).values()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DerivativeLimitOrder> {
        self.bids.values().chain(self.asks.values())
    }

    pub fn best_price(&self, side: Side) -> Option<Decimal> {
        self.iter_side(side).next().map(|o| o.price())
    }

    /// Midpoint of the best bid and ask, or the only side present.
    pub fn mid_price_or_best_price(&self) -> Option<Decimal> {
        match (self.best_price(Side::Buy), self.best_price(Side::Sell)) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            (Some(bid), None) => Some(bid),
            (None, Some(ask)) => Some(ask),
            (None, None) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.order_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order_index.is_empty()
    }

    pub fn hashes(&self) -> Vec<OrderHash> {
        self.iter().map(|o| o.hash).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("Market {0:?} is not active")]
    MarketNotActive(MarketId),

    #[error("Price {price} is not a multiple of tick size {tick}")]
    InvalidPriceTick { price: Decimal, tick: Decimal },

    #[error("Quantity {quantity} is not a multiple of tick size {tick}")]
    InvalidQuantityTick { quantity: Decimal, tick: Decimal },

    #[error("Price and quantity must be positive")]
    NonPositiveAmount,

    #[error("Order notional {notional} below minimum {min}")]
    BelowMinNotional { notional: Decimal, min: Decimal },

    #[error("Insufficient order margin: provided {provided}, required {required}")]
    InsufficientOrderMargin { provided: Decimal, required: Decimal },

    #[error("Order fails initial margin check at mark price {mark_price}")]
    MarkPriceThresholdBreached { mark_price: Decimal },

    #[error("Binary options price {0} outside the payout range")]
    InvalidBinaryOptionsPrice(Decimal),

    #[error("Reduce-only order requires an open position")]
    NoPositionForReduceOnly,

    #[error("Reduce-only order must oppose the position direction")]
    InvalidReduceOnlyDirection,

    #[error("Insufficient position quantity to reduce")]
    InsufficientPositionQuantity,

    #[error("Client order id {0} already in use")]
    DuplicateClientId(String),

    #[error("Post-only order would cross the book at {price}")]
    PostOnlyWouldCross { price: Decimal },

    #[error("Order breaches the open notional cap")]
    OpenNotionalCapBreached,

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("Order {0} not found")]
    NotFound(OrderHash),

    #[error("Trigger price {trigger_price} must differ from mark price {mark_price}")]
    InvalidTriggerPrice { trigger_price: Decimal, mark_price: Decimal },

    #[error("No mark price for market {0:?}")]
    NoMarkPrice(MarketId),

    #[error("Subaccount already has a conditional market order triggering in this direction")]
    ConditionalMarketOrderExists,

    #[error("Conditional order needs a trigger price")]
    MissingTriggerPrice,

    #[error("No open order with client id {0}")]
    UnknownClientId(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn limit(hash: u64, side: Side, price: Decimal, qty: Decimal) -> DerivativeLimitOrder {
        DerivativeLimitOrder::new(
            OrderHash(hash),
            MarketId(1),
            side,
            OrderInfo::new(SubaccountId(hash), price, qty),
            price * qty,
        )
    }

    #[test]
    fn price_time_priority_per_side() {
        let mut book = RestingOrderbook::new();
        book.insert(limit(1, Side::Buy, dec!(99), dec!(1)));
        book.insert(limit(2, Side::Buy, dec!(100), dec!(1)));
        book.insert(limit(3, Side::Buy, dec!(100), dec!(1)));
        book.insert(limit(4, Side::Sell, dec!(102), dec!(1)));
        book.insert(limit(5, Side::Sell, dec!(101), dec!(1)));

        let bids: Vec<u64> = book.iter_side(Side::Buy).map(|o| o.hash.0).collect();
        assert_eq!(bids, vec![2, 3, 1]);
        let asks: Vec<u64> = book.iter_side(Side::Sell).map(|o| o.hash.0).collect();
        assert_eq!(asks, vec![5, 4]);
        assert_eq!(book.mid_price_or_best_price(), Some(dec!(100.5)));
    }

    #[test]
    fn remove_and_lookup() {
        let mut book = RestingOrderbook::new();
        book.insert(limit(1, Side::Sell, dec!(10), dec!(2)));
        assert!(book.get(OrderHash(1)).is_some());
        assert_eq!(book.remove(OrderHash(1)).map(|o| o.hash), Some(OrderHash(1)));
        assert!(book.is_empty());
        assert_eq!(book.mid_price_or_best_price(), None);
    }

    #[test]
    fn cancel_refund_covers_margin_and_fee() {
        let mut order = limit(1, Side::Buy, dec!(100), dec!(4));
        order.margin = dec!(40);
        order.fillable = dec!(1);
        // 40 * 1/4 + 1 * 100 * 0.001
        assert_eq!(order.cancel_refund(dec!(0.001)), dec!(10.1));
        assert_eq!(order.cancel_refund(dec!(-0.001)), dec!(10));

        order.margin = Decimal::ZERO;
        assert_eq!(order.cancel_refund(dec!(0.001)), Decimal::ZERO);
    }

    #[test]
    fn partial_fills_use_up_exactly_the_margin() {
        let mut order = limit(1, Side::Buy, dec!(100), dec!(3));
        order.margin = dec!(10);
        let mut used = Decimal::ZERO;
        for _ in 0..2 {
            let part = order.margin_for_fill(dec!(1));
            assert!(part.scale() <= crate::types::AMOUNT_DP);
            used += part;
            order.fillable -= dec!(1);
        }
        assert_eq!(used + order.margin_for_fillable(), dec!(10));
        assert_eq!(order.margin_for_fill(order.fillable), order.margin_for_fillable());
    }

    #[test]
    fn binary_margin_by_side() {
        let scale = dec!(1);
        assert_eq!(binary_options_order_margin(dec!(0.3), dec!(10), true, false, scale), dec!(3));
        assert_eq!(binary_options_order_margin(dec!(0.3), dec!(10), false, false, scale), dec!(7));
        assert_eq!(binary_options_order_margin(dec!(0.3), dec!(10), false, true, scale), Decimal::ZERO);
    }

    #[test]
    fn metadata_tracks_aggregates() {
        let mut meta = SubaccountOrderbookMetadata::default();
        meta.add_order(true, dec!(2));
        meta.add_order(false, dec!(3));
        meta.reduce_fillable(false, dec!(1));
        meta.remove_order(true, dec!(2));
        assert_eq!(meta.reduce_only_limit_order_count, 0);
        assert_eq!(meta.aggregate_vanilla_quantity, dec!(2));
        assert_eq!(meta.vanilla_limit_order_count, 1);
    }
}
