//! Exchange state.
//!
//! One [`MarketState`] per market holds everything keyed by that market:
//! the resting book, this block's transient orders, conditional orders,
//! positions, order metadata, the market balance and open interest.
//! Markets are kept in id order so every block walks them the same way.

use crate::conditional::ConditionalOrderBook;
use crate::market::{Market, SettlementPrice};
use crate::order::{DerivativeLimitOrder, DerivativeMarketOrder, RestingOrderbook, SubaccountOrderbookMetadata};
use crate::position::{Position, PositionState};
use crate::types::{MarketId, OrderHash, Side, SubaccountId};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Everything stored for one market.
#[derive(Debug, Clone)]
pub struct MarketState {
    pub market: Market,
    pub resting: RestingOrderbook,
    /// Limit orders placed this block, in arrival order
    pub transient_limit_orders: Vec<DerivativeLimitOrder>,
    /// Market orders placed this block, in arrival order
    pub transient_market_orders: Vec<DerivativeMarketOrder>,
    pub conditional: ConditionalOrderBook,
    pub positions: BTreeMap<SubaccountId, Position>,
    metadata: HashMap<(SubaccountId, Side), SubaccountOrderbookMetadata>,
    cids: HashMap<(SubaccountId, String), OrderHash>,
    /// Funds held by the market for its positions
    pub balance: Decimal,
    /// Σ|position quantity| over both sides
    pub open_interest: Decimal,
    /// Subaccounts whose positions market orders touched this block
    pub modified_by_market_orders: BTreeSet<SubaccountId>,
}

impl MarketState {
    pub fn new(market: Market) -> Self {
        Self {
            market,
            resting: RestingOrderbook::new(),
            transient_limit_orders: Vec::new(),
            transient_market_orders: Vec::new(),
            conditional: ConditionalOrderBook::new(),
            positions: BTreeMap::new(),
            metadata: HashMap::new(),
            cids: HashMap::new(),
            balance: Decimal::ZERO,
            open_interest: Decimal::ZERO,
            modified_by_market_orders: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> MarketId {
        self.market.id()
    }

    pub fn metadata(&self, subaccount_id: SubaccountId, side: Side) -> SubaccountOrderbookMetadata {
        self.metadata.get(&(subaccount_id, side)).cloned().unwrap_or_default()
    }

    pub fn metadata_mut(&mut self, subaccount_id: SubaccountId, side: Side) -> &mut SubaccountOrderbookMetadata {
        self.metadata.entry((subaccount_id, side)).or_default()
    }

    pub fn position(&self, subaccount_id: SubaccountId) -> Option<&Position> {
        self.positions.get(&subaccount_id)
    }

    /// Writes a position back, deleting it once closed.
    pub fn set_position(&mut self, subaccount_id: SubaccountId, position: Position) {
        if position.is_empty() {
            self.positions.remove(&subaccount_id);
        } else {
            self.positions.insert(subaccount_id, position);
        }
    }

    pub fn set_positions(&mut self, states: Vec<PositionState>) {
        for state in states {
            self.set_position(state.subaccount_id, state.position);
        }
    }

    /// Removes every position, sorted by subaccount.
    pub fn take_positions(&mut self) -> Vec<PositionState> {
        std::mem::take(&mut self.positions)
            .into_iter()
            .map(|(subaccount_id, position)| PositionState { subaccount_id, position })
            .collect()
    }

    pub fn positions_snapshot(&self) -> HashMap<SubaccountId, Position> {
        self.positions.iter().map(|(id, p)| (*id, p.clone())).collect()
    }

    pub fn cid_in_use(&self, subaccount_id: SubaccountId, cid: &str) -> bool {
        self.cids.contains_key(&(subaccount_id, cid.to_string()))
    }

    pub fn register_cid(&mut self, subaccount_id: SubaccountId, cid: Option<&str>, hash: OrderHash) {
        if let Some(cid) = cid {
            self.cids.insert((subaccount_id, cid.to_string()), hash);
        }
    }

    pub fn release_cid(&mut self, subaccount_id: SubaccountId, cid: Option<&str>) {
        if let Some(cid) = cid {
            self.cids.remove(&(subaccount_id, cid.to_string()));
        }
    }

    pub fn order_by_cid(&self, subaccount_id: SubaccountId, cid: &str) -> Option<OrderHash> {
        self.cids.get(&(subaccount_id, cid.to_string())).copied()
    }

    /// Resting orders of a subaccount on one side, best first.
    pub fn subaccount_resting_orders(&self, subaccount_id: SubaccountId, side: Side) -> Vec<DerivativeLimitOrder> {
        self.resting
            .iter_side(side)
            .filter(|o| o.subaccount_id() == subaccount_id)
            .cloned()
            .collect()
    }

    /// Transient limit orders of a subaccount on one side, in arrival order.
    pub fn subaccount_transient_orders(&self, subaccount_id: SubaccountId, side: Side) -> Vec<DerivativeLimitOrder> {
        self.transient_limit_orders
            .iter()
            .filter(|o| o.subaccount_id() == subaccount_id && o.side == side)
            .cloned()
            .collect()
    }

    pub fn remove_transient_limit_order(&mut self, hash: OrderHash) -> Option<DerivativeLimitOrder> {
        let idx = self.transient_limit_orders.iter().position(|o| o.hash == hash)?;
        Some(self.transient_limit_orders.remove(idx))
    }

    pub fn remove_transient_market_order(&mut self, hash: OrderHash) -> Option<DerivativeMarketOrder> {
        let idx = self.transient_market_orders.iter().position(|o| o.hash == hash)?;
        Some(self.transient_market_orders.remove(idx))
    }

    /// Takes this block's transient limit orders, split by side and sorted best price first.
    pub fn take_transient_limit_orders(&mut self) -> (Vec<DerivativeLimitOrder>, Vec<DerivativeLimitOrder>) {
        let (mut buys, mut sells): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.transient_limit_orders).into_iter().partition(|o| o.is_buy());
        buys.sort_by(|a, b| b.price().cmp(&a.price()).then(a.hash.cmp(&b.hash)));
        sells.sort_by(|a, b| a.price().cmp(&b.price()).then(a.hash.cmp(&b.hash)));
        (buys, sells)
    }

    /// Takes this block's market orders, split by side in arrival order.
    pub fn take_transient_market_orders(&mut self) -> (Vec<DerivativeMarketOrder>, Vec<DerivativeMarketOrder>) {
        std::mem::take(&mut self.transient_market_orders).into_iter().partition(|o| o.is_buy())
    }

    pub fn resting_side(&self, side: Side) -> Vec<DerivativeLimitOrder> {
        self.resting.iter_side(side).cloned().collect()
    }

    /// Σ long quantity and Σ short quantity.
    pub fn position_totals(&self) -> (Decimal, Decimal) {
        self.positions.values().fold((Decimal::ZERO, Decimal::ZERO), |(long, short), p| {
            if p.is_long {
                (long + p.quantity, short)
            } else {
                (long, short + p.quantity)
            }
        })
    }
}

/// All markets plus the block-scoped queues that span them.
#[derive(Debug, Clone, Default)]
pub struct ExchangeStore {
    markets: BTreeMap<MarketId, MarketState>,
    /// Markets paused for settlement, settled at the start of the next block.
    /// A zero price settles at the oracle price.
    scheduled_settlements: BTreeMap<MarketId, SettlementPrice>,
    next_order_hash: u64,
}

impl ExchangeStore {
    pub fn new() -> Self {
        Self {
            markets: BTreeMap::new(),
            scheduled_settlements: BTreeMap::new(),
            next_order_hash: 1,
        }
    }

    pub fn insert_market(&mut self, market: Market) {
        self.markets.insert(market.id(), MarketState::new(market));
    }

    pub fn contains_market(&self, market_id: MarketId) -> bool {
        self.markets.contains_key(&market_id)
    }

    pub fn market(&self, market_id: MarketId) -> Option<&Market> {
        self.markets.get(&market_id).map(|s| &s.market)
    }

    pub fn state(&self, market_id: MarketId) -> Option<&MarketState> {
        self.markets.get(&market_id)
    }

    pub fn state_mut(&mut self, market_id: MarketId) -> Option<&mut MarketState> {
        self.markets.get_mut(&market_id)
    }

    pub fn market_ids(&self) -> Vec<MarketId> {
        self.markets.keys().copied().collect()
    }

    pub fn states(&self) -> impl Iterator<Item = &MarketState> {
        self.markets.values()
    }

    pub fn states_mut(&mut self) -> impl Iterator<Item = &mut MarketState> {
        self.markets.values_mut()
    }

    /// Hashes are sequential, so hash order is placement order.
    pub fn next_order_hash(&mut self) -> OrderHash {
        let hash = OrderHash(self.next_order_hash);
        self.next_order_hash += 1;
        hash
    }

    pub fn schedule_settlement(&mut self, market_id: MarketId, price: SettlementPrice) {
        self.scheduled_settlements.insert(market_id, price);
    }

    pub fn scheduled_settlement(&self, market_id: MarketId) -> Option<SettlementPrice> {
        self.scheduled_settlements.get(&market_id).copied()
    }

    pub fn remove_scheduled_settlement(&mut self, market_id: MarketId) {
        self.scheduled_settlements.remove(&market_id);
    }

    pub fn scheduled_settlements(&self) -> Vec<(MarketId, SettlementPrice)> {
        self.scheduled_settlements.iter().map(|(id, p)| (*id, *p)).collect()
    }

    pub fn position(&self, market_id: MarketId, subaccount_id: SubaccountId) -> Option<&Position> {
        self.markets.get(&market_id)?.position(subaccount_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MarketParams;
    use crate::order::OrderInfo;
    use crate::types::Timestamp;
    use rust_decimal_macros::dec;

    fn limit(hash: u64, side: Side, price: Decimal) -> DerivativeLimitOrder {
        DerivativeLimitOrder::new(OrderHash(hash), MarketId(1), side, OrderInfo::new(SubaccountId(1), price, dec!(1)), dec!(10))
    }

    #[test]
    fn transient_orders_sort_best_first_then_by_hash() {
        let mut state = MarketState::new(Market::perpetual(MarketParams::btc_perp(MarketId(1)), Timestamp(0), 3600));
        state.transient_limit_orders = vec![
            limit(1, Side::Buy, dec!(99)),
            limit(2, Side::Buy, dec!(100)),
            limit(3, Side::Sell, dec!(102)),
            limit(4, Side::Buy, dec!(100)),
            limit(5, Side::Sell, dec!(101)),
        ];
        let (buys, sells) = state.take_transient_limit_orders();
        assert_eq!(buys.iter().map(|o| o.hash.0).collect::<Vec<_>>(), vec![2, 4, 1]);
        assert_eq!(sells.iter().map(|o| o.hash.0).collect::<Vec<_>>(), vec![5, 3]);
        assert!(state.transient_limit_orders.is_empty());
    }

    #[test]
    fn closed_positions_are_deleted() {
        let mut state = MarketState::new(Market::perpetual(MarketParams::btc_perp(MarketId(1)), Timestamp(0), 3600));
        let mut position = Position::new(true, Decimal::ZERO);
        position.quantity = dec!(2);
        state.set_position(SubaccountId(1), position.clone());
        assert_eq!(state.position_totals(), (dec!(2), Decimal::ZERO));

        position.quantity = Decimal::ZERO;
        state.set_position(SubaccountId(1), position);
        assert!(state.position(SubaccountId(1)).is_none());
    }

    #[test]
    fn hashes_and_schedule() {
        let mut store = ExchangeStore::new();
        assert_eq!(store.next_order_hash(), OrderHash(1));
        assert_eq!(store.next_order_hash(), OrderHash(2));

        store.schedule_settlement(MarketId(2), SettlementPrice::Price(Decimal::ZERO));
        store.schedule_settlement(MarketId(1), SettlementPrice::Refund);
        let ids: Vec<_> = store.scheduled_settlements().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![MarketId(1), MarketId(2)]);
        store.remove_scheduled_settlement(MarketId(1));
        assert_eq!(store.scheduled_settlement(MarketId(1)), None);
    }

    #[test]
    fn cid_index() {
        let mut state = MarketState::new(Market::perpetual(MarketParams::btc_perp(MarketId(1)), Timestamp(0), 3600));
        state.register_cid(SubaccountId(1), Some("a"), OrderHash(7));
        assert!(state.cid_in_use(SubaccountId(1), "a"));
        assert!(!state.cid_in_use(SubaccountId(2), "a"));
        assert_eq!(state.order_by_cid(SubaccountId(1), "a"), Some(OrderHash(7)));
        state.release_cid(SubaccountId(1), Some("a"));
        assert!(!state.cid_in_use(SubaccountId(1), "a"));
    }
}
