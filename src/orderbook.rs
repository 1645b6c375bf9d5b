// 4.1 / 4.2: per-pass orderbook sides used by the matching loops.
// a side exposes peek() and fill(). both take the MatchingSession, which owns the
// open-notional counters of every side and the tentative positions used for validation.
// tentative positions are what-if copies; the authoritative ones live in `positions`
// and only change when fills are expanded.

use crate::margin::{check_initial_margin_mark_price_threshold, pro_rata};
use crate::market::Market;
use crate::order::{DerivativeLimitOrder, DerivativeMarketOrder};
use crate::position::{Position, PositionCache, PositionDelta};
use crate::risk::{does_breach_open_notional_cap, values_for_notional_cap_checks};
use crate::types::{OrderHash, Side, SubaccountId};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::iter::Peekable;

/// Best order of a side: its price and remaining quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Open-notional bookkeeping of one side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotionalCounters {
    /// Notional added by fills so far
    pub added: Decimal,
    /// Notional of the peeked order that has not filled yet
    pub cached: Decimal,
    pub open_interest_delta: Decimal,
}

/// The order fields every check needs, independent of order kind.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    subaccount_id: SubaccountId,
    is_buy: bool,
    price: Decimal,
    quantity: Decimal,
    margin: Decimal,
    remaining: Decimal,
    fee_rate: Decimal,
}

impl Candidate {
    fn is_reduce_only(&self) -> bool {
        self.margin.is_zero()
    }
}

/// Shared state of one market's matching pass.
#[derive(Debug)]
pub struct MatchingSession<'a> {
    market: &'a Market,
    mark_price: Option<Decimal>,
    current_open_notional: Decimal,
    counters: Vec<NotionalCounters>,
    tentative: HashMap<SubaccountId, Position>,
    pub positions: PositionCache,
}

impl<'a> MatchingSession<'a> {
    pub fn new(market: &'a Market, mark_price: Option<Decimal>, current_open_notional: Decimal, positions: PositionCache) -> Self {
        Self {
            market,
            mark_price,
            current_open_notional,
            counters: Vec::new(),
            tentative: HashMap::new(),
            positions,
        }
    }

    pub fn market(&self) -> &'a Market {
        self.market
    }

    pub fn mark_price(&self) -> Option<Decimal> {
        self.mark_price
    }

    /// Allocates counters for a new side and returns their slot.
    pub fn open_counters(&mut self) -> usize {
        self.counters.push(NotionalCounters::default());
        self.counters.len() - 1
    }

    pub fn counters(&self, slot: usize) -> NotionalCounters {
        self.counters.get(slot).copied().unwrap_or_default()
    }

    pub fn open_interest_delta(&self) -> Decimal {
        self.counters.iter().map(|c| c.open_interest_delta).sum()
    }

    pub fn into_positions(self) -> PositionCache {
        self.positions
    }

    fn total_open_notional(&self, own: usize, opposite: usize) -> Decimal {
        let own = self.counters(own);
        let opposite = self.counters(opposite);
        self.current_open_notional + own.added + opposite.added + opposite.cached
    }

    fn tentative_position(&mut self, subaccount_id: SubaccountId, is_buy: bool) -> &mut Position {
        let positions = &mut self.positions;
        self.tentative
            .entry(subaccount_id)
            .or_insert_with(|| positions.snapshot(subaccount_id, is_buy))
    }

    // runs the admission checks in order: reduce-only validity, closing against bankruptcy,
    // initial margin at mark, open-notional cap. position checks are skipped for liquidations.
    fn validate(&mut self, candidate: &Candidate, own: usize, opposite: usize, skip_position_checks: bool) -> bool {
        let is_binary = self.market.is_binary_options();
        if !skip_position_checks {
            let position = self.tentative_position(candidate.subaccount_id, candidate.is_buy);
            if candidate.is_reduce_only() && !is_valid_reduce_only(position, candidate.is_buy, candidate.remaining) {
                return false;
            }
            let is_closing = candidate.is_buy != position.is_long && position.quantity > Decimal::ZERO;
            if is_closing {
                let closing_quantity = candidate.remaining.min(position.quantity);
                let close_margin = pro_rata(candidate.margin, closing_quantity, candidate.quantity);
                if position
                    .check_valid_position_to_reduce(candidate.price, candidate.is_buy, candidate.fee_rate, close_margin, is_binary)
                    .is_err()
                {
                    return false;
                }
            }
        }

        if !candidate.is_reduce_only() && !is_binary {
            if let Some(mark_price) = self.mark_price {
                let failed = check_initial_margin_mark_price_threshold(
                    candidate.is_buy,
                    candidate.price,
                    candidate.quantity,
                    candidate.margin,
                    self.market.initial_margin_ratio(),
                    mark_price,
                )
                .is_err();
                if failed {
                    return false;
                }
            }
        }

        self.admits_open_notional(own, opposite, candidate.subaccount_id, candidate.is_buy, candidate.quantity)
    }

    /// Tentative cap check. the admitted notional is cached for the opposite side.
    fn admits_open_notional(&mut self, own: usize, opposite: usize, subaccount_id: SubaccountId, is_buy: bool, quantity: Decimal) -> bool {
        let mark_price = self.mark_price.unwrap_or_default();
        let signed = self.tentative_position(subaccount_id, is_buy).signed_quantity();
        let values = values_for_notional_cap_checks(is_buy, quantity, mark_price, signed);
        let total = self.total_open_notional(own, opposite);
        let (breaches, notional) = does_breach_open_notional_cap(self.market.open_notional_cap(), values.notional_delta, total);
        if let Some(counters) = self.counters.get_mut(own) {
            counters.cached = if breaches { Decimal::ZERO } else { notional };
        }
        !breaches
    }

    // the clearing price is unknown mid-loop, so the tentative position fills at the order price
    fn record_fill(&mut self, own: usize, candidate: &Candidate, quantity: Decimal) {
        let mark_price = self.mark_price.unwrap_or_default();
        let signed = self.tentative_position(candidate.subaccount_id, candidate.is_buy).signed_quantity();
        let values = values_for_notional_cap_checks(candidate.is_buy, quantity, mark_price, signed);
        if let Some(counters) = self.counters.get_mut(own) {
            counters.open_interest_delta += values.quantity_delta;
            counters.added += values.notional_delta;
            counters.cached = Decimal::ZERO;
        }

        let execution_margin = pro_rata(candidate.margin, quantity, candidate.quantity);
        let fee = quantity * candidate.price * candidate.fee_rate;
        let delta = PositionDelta::new(candidate.is_buy, quantity, execution_margin, candidate.price);
        self.tentative_position(candidate.subaccount_id, candidate.is_buy)
            .apply_position_delta(&delta, fee);
    }
}

/// A reduce-only order needs an opposite position at least as large as what it may still fill.
pub fn is_valid_reduce_only(position: &Position, is_buy: bool, remaining: Decimal) -> bool {
    is_buy != position.is_long && remaining <= position.quantity
}

/// Orders of one tier with their cumulative fills.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderbookFills {
    pub orders: Vec<DerivativeLimitOrder>,
    pub fill_quantities: Vec<Decimal>,
}

impl OrderbookFills {
    pub fn new(orders: Vec<DerivativeLimitOrder>) -> Self {
        let fill_quantities = vec![Decimal::ZERO; orders.len()];
        Self { orders, fill_quantities }
    }

    fn push(&mut self, order: DerivativeLimitOrder) -> usize {
        self.orders.push(order);
        self.fill_quantities.push(Decimal::ZERO);
        self.orders.len() - 1
    }

    fn remaining(&self, idx: usize) -> Decimal {
        self.orders[idx].fillable - self.fill_quantities[idx]
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn total_filled(&self) -> Decimal {
        self.fill_quantities.iter().sum()
    }

    fn without(&self, excluded: &HashSet<OrderHash>) -> OrderbookFills {
        let mut filtered = OrderbookFills::default();
        for (order, fill) in self.orders.iter().zip(&self.fill_quantities) {
            if !excluded.contains(&order.hash) {
                filtered.orders.push(order.clone());
                filtered.fill_quantities.push(*fill);
            }
        }
        filtered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Resting(usize),
    Transient(usize),
}

/// Everything a limit side hands over once its loop is done.
#[derive(Debug, Clone, Default)]
pub struct LimitSideOutcome {
    /// Resting orders reached by the loop, full cancels removed
    pub resting_fills: OrderbookFills,
    /// Every transient order, full cancels removed
    pub transient_fills: OrderbookFills,
    pub resting_cancels: Vec<DerivativeLimitOrder>,
    pub transient_cancels: Vec<DerivativeLimitOrder>,
    /// Orders that filled and were invalidated afterwards
    pub partial_cancels: HashSet<OrderHash>,
    pub notional: Decimal,
    pub total_quantity: Decimal,
}

/// 4.1: one side of the limit book. merges resting orders (pulled lazily, best first)
/// with this block's transient orders.
#[derive(Debug)]
pub struct LimitOrderbookSide {
    side: Side,
    own: usize,
    opposite: usize,
    maker_fee_rate: Decimal,
    taker_fee_rate: Decimal,
    resting_source: std::vec::IntoIter<DerivativeLimitOrder>,
    resting: OrderbookFills,
    transient: OrderbookFills,
    transient_idx: usize,
    resting_cancels: Vec<DerivativeLimitOrder>,
    transient_cancels: Vec<DerivativeLimitOrder>,
    cancelled: HashSet<OrderHash>,
    partial_cancels: HashSet<OrderHash>,
    notional: Decimal,
    total_quantity: Decimal,
    current: Option<Cursor>,
}

impl LimitOrderbookSide {
    /// `resting` must be in priority order and `transient` sorted best price first.
    pub fn new(
        side: Side,
        session: &mut MatchingSession<'_>,
        resting: Vec<DerivativeLimitOrder>,
        transient: Vec<DerivativeLimitOrder>,
    ) -> Self {
        let own = session.open_counters();
        let market = session.market();
        Self {
            side,
            own,
            opposite: own,
            maker_fee_rate: market.maker_fee_rate(),
            taker_fee_rate: market.taker_fee_rate(),
            resting_source: resting.into_iter(),
            resting: OrderbookFills::default(),
            transient: OrderbookFills::new(transient),
            transient_idx: 0,
            resting_cancels: Vec::new(),
            transient_cancels: Vec::new(),
            cancelled: HashSet::new(),
            partial_cancels: HashSet::new(),
            notional: Decimal::ZERO,
            total_quantity: Decimal::ZERO,
            current: None,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn counters_slot(&self) -> usize {
        self.own
    }

    pub fn set_opposite(&mut self, opposite: usize) {
        self.opposite = opposite;
    }

    pub fn notional(&self) -> Decimal {
        self.notional
    }

    pub fn total_quantity(&self) -> Decimal {
        self.total_quantity
    }

    fn is_dropped(&self, hash: &OrderHash) -> bool {
        self.cancelled.contains(hash) || self.partial_cancels.contains(hash)
    }

    fn resting_order(&mut self) -> Option<usize> {
        if let Some(idx) = self.resting.len().checked_sub(1) {
            let order = &self.resting.orders[idx];
            if !self.is_dropped(&order.hash) && self.resting.remaining(idx) > Decimal::ZERO {
                return Some(idx);
            }
        }
        let order = self.resting_source.next()?;
        Some(self.resting.push(order))
    }

    fn transient_order(&mut self) -> Option<usize> {
        while self.transient_idx < self.transient.len() {
            if self.transient.remaining(self.transient_idx) > Decimal::ZERO {
                return Some(self.transient_idx);
            }
            self.transient_idx += 1;
        }
        None
    }

    // ties go to the resting order
    fn select(&mut self) -> Option<Cursor> {
        let resting = self.resting_order();
        let transient = self.transient_order();
        match (resting, transient) {
            (Some(r), Some(t)) => {
                let resting_price = self.resting.orders[r].price();
                let transient_price = self.transient.orders[t].price();
                if self.side.is_better_price(transient_price, resting_price) {
                    Some(Cursor::Transient(t))
                } else {
                    Some(Cursor::Resting(r))
                }
            }
            (Some(r), None) => Some(Cursor::Resting(r)),
            (None, Some(t)) => Some(Cursor::Transient(t)),
            (None, None) => None,
        }
    }

    fn candidate(&self, cursor: Cursor) -> Candidate {
        let (fills, idx, fee_rate) = match cursor {
            Cursor::Resting(idx) => (&self.resting, idx, self.maker_fee_rate),
            Cursor::Transient(idx) => (&self.transient, idx, self.taker_fee_rate),
        };
        let order = &fills.orders[idx];
        Candidate {
            subaccount_id: order.subaccount_id(),
            is_buy: order.is_buy(),
            price: order.price(),
            quantity: order.quantity(),
            margin: order.margin,
            remaining: fills.remaining(idx),
            fee_rate,
        }
    }

    fn drop_order(&mut self, cursor: Cursor) {
        let (fills, idx) = match cursor {
            Cursor::Resting(idx) => (&self.resting, idx),
            Cursor::Transient(idx) => (&self.transient, idx),
        };
        let order = fills.orders[idx].clone();
        // an order that already matched keeps its fills and only loses the remainder
        if fills.fill_quantities[idx] > Decimal::ZERO {
            self.partial_cancels.insert(order.hash);
        } else {
            self.cancelled.insert(order.hash);
        }
        match cursor {
            Cursor::Resting(_) => self.resting_cancels.push(order),
            Cursor::Transient(_) => {
                self.transient_cancels.push(order);
                self.transient_idx += 1;
            }
        }
        self.current = None;
    }

    /// Best valid order of the side. invalid orders met on the way are cancelled.
    pub fn peek(&mut self, session: &mut MatchingSession<'_>) -> Option<PriceLevel> {
        loop {
            let cursor = self.select()?;
            let candidate = self.candidate(cursor);
            if session.validate(&candidate, self.own, self.opposite, false) {
                self.current = Some(cursor);
                return Some(PriceLevel {
                    price: candidate.price,
                    quantity: candidate.remaining,
                });
            }
            self.drop_order(cursor);
        }
    }

    /// Fills the order returned by the last peek.
    pub fn fill(&mut self, session: &mut MatchingSession<'_>, quantity: Decimal) {
        let Some(cursor) = self.current else {
            return;
        };
        let candidate = self.candidate(cursor);
        let (fills, idx) = match cursor {
            Cursor::Resting(idx) => (&mut self.resting, idx),
            Cursor::Transient(idx) => (&mut self.transient, idx),
        };
        fills.fill_quantities[idx] += quantity;
        let fully_filled = fills.remaining(idx).is_zero();

        self.notional += quantity * candidate.price;
        self.total_quantity += quantity;
        session.record_fill(self.own, &candidate, quantity);

        if fully_filled {
            self.current = None;
        }
    }

    pub fn into_outcome(self) -> LimitSideOutcome {
        LimitSideOutcome {
            resting_fills: self.resting.without(&self.cancelled),
            transient_fills: self.transient.without(&self.cancelled),
            resting_cancels: self.resting_cancels,
            transient_cancels: self.transient_cancels,
            partial_cancels: self.partial_cancels,
            notional: self.notional,
            total_quantity: self.total_quantity,
        }
    }
}

/// 4.2: this block's market orders of one direction, in arrival order.
#[derive(Debug)]
pub struct MarketOrderbookSide {
    side: Side,
    own: usize,
    opposite: usize,
    fee_rate: Decimal,
    is_liquidation: bool,
    orders: Vec<DerivativeMarketOrder>,
    fill_quantities: Vec<Decimal>,
    idx: usize,
    notional: Decimal,
    total_quantity: Decimal,
}

impl MarketOrderbookSide {
    pub fn new(
        side: Side,
        session: &mut MatchingSession<'_>,
        orders: Vec<DerivativeMarketOrder>,
        fee_rate: Decimal,
        is_liquidation: bool,
    ) -> Self {
        let own = session.open_counters();
        let fill_quantities = vec![Decimal::ZERO; orders.len()];
        Self {
            side,
            own,
            opposite: own,
            fee_rate,
            is_liquidation,
            orders,
            fill_quantities,
            idx: 0,
            notional: Decimal::ZERO,
            total_quantity: Decimal::ZERO,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn counters_slot(&self) -> usize {
        self.own
    }

    pub fn set_opposite(&mut self, opposite: usize) {
        self.opposite = opposite;
    }

    pub fn notional(&self) -> Decimal {
        self.notional
    }

    pub fn total_quantity(&self) -> Decimal {
        self.total_quantity
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    fn candidate(&self) -> Option<Candidate> {
        let order = self.orders.get(self.idx)?;
        Some(Candidate {
            subaccount_id: order.subaccount_id(),
            is_buy: order.is_buy(),
            price: order.price(),
            quantity: order.quantity(),
            margin: order.margin,
            remaining: order.quantity() - self.fill_quantities[self.idx],
            fee_rate: self.fee_rate,
        })
    }

    /// Next order that passes validation and still has quantity. skipped orders keep their fills.
    pub fn peek(&mut self, session: &mut MatchingSession<'_>) -> Option<PriceLevel> {
        loop {
            let candidate = self.candidate()?;
            if !session.validate(&candidate, self.own, self.opposite, self.is_liquidation) || candidate.remaining.is_zero() {
                self.idx += 1;
                continue;
            }
            return Some(PriceLevel {
                price: candidate.price,
                quantity: candidate.remaining,
            });
        }
    }

    pub fn fill(&mut self, session: &mut MatchingSession<'_>, quantity: Decimal) {
        let Some(candidate) = self.candidate() else {
            return;
        };
        self.fill_quantities[self.idx] += quantity;
        self.notional += quantity * candidate.price;
        self.total_quantity += quantity;
        session.record_fill(self.own, &candidate, quantity);
    }

    pub fn into_orders(self) -> Vec<(DerivativeMarketOrder, Decimal)> {
        self.orders.into_iter().zip(self.fill_quantities).collect()
    }
}

/// One entry of a merged fill walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderbookFill {
    pub order: DerivativeLimitOrder,
    pub fill_quantity: Decimal,
    pub is_transient: bool,
}

type FillIter = Peekable<std::iter::Zip<std::vec::IntoIter<DerivativeLimitOrder>, std::vec::IntoIter<Decimal>>>;

/// Walks resting and transient fills of one side closest to the top of book first.
/// at equal price the resting order comes first.
pub struct MergedOrderbookFills {
    side: Side,
    transient: FillIter,
    resting: FillIter,
}

impl MergedOrderbookFills {
    pub fn new(side: Side, transient: OrderbookFills, resting: OrderbookFills) -> Self {
        Self {
            side,
            transient: transient.orders.into_iter().zip(transient.fill_quantities).peekable(),
            resting: resting.orders.into_iter().zip(resting.fill_quantities).peekable(),
        }
    }
}

impl Iterator for MergedOrderbookFills {
    type Item = OrderbookFill;

    fn next(&mut self) -> Option<Self::Item> {
        let take_resting = match (self.resting.peek(), self.transient.peek()) {
            (None, None) => return None,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some((resting, _)), Some((transient, _))) => !self.side.is_better_price(transient.price(), resting.price()),
        };
        let (iter, is_transient) = if take_resting {
            (&mut self.resting, false)
        } else {
            (&mut self.transient, true)
        };
        iter.next().map(|(order, fill_quantity)| OrderbookFill {
            order,
            fill_quantity,
            is_transient,
        })
    }
}
