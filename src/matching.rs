// 4.1 / 4.2: the two matching loops and what they hand to the batch.
// 4.1 limit-vs-limit: frequent batch auction, single clearing price for every fill.
// 4.2 market-vs-limit: market orders walk the resting book, resting orders execute at their own price.

use crate::expansion::{expand_limit_fill, expand_market_fill, ExpansionContext, FilledOrder, OrderStateExpansion};
use crate::order::{DerivativeLimitOrder, DerivativeMarketOrder};
use crate::orderbook::{LimitOrderbookSide, MarketOrderbookSide, MatchingSession, MergedOrderbookFills, PriceLevel};
use crate::position::PositionCache;
use crate::types::{round_amount, OrderHash, Side};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

/// Every resting and transient order of one market taking part in limit matching.
#[derive(Debug, Clone, Default)]
pub struct LimitMatchingInput {
    /// Priority order, best first
    pub resting_buys: Vec<DerivativeLimitOrder>,
    pub resting_sells: Vec<DerivativeLimitOrder>,
    /// Best price first, ties by hash
    pub transient_buys: Vec<DerivativeLimitOrder>,
    pub transient_sells: Vec<DerivativeLimitOrder>,
    /// Mid price (or single best price) of the resting book before matching
    pub resting_mid_price: Option<Decimal>,
}

/// A limit order leaving the book, in its post-fill state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitOrderCancel {
    pub order: DerivativeLimitOrder,
    pub is_transient: bool,
    /// Fee rate the held fee is refunded at
    pub refund_rate: Decimal,
}

impl LimitOrderCancel {
    pub fn refund(&self) -> Decimal {
        self.order.cancel_refund(self.refund_rate)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LimitSideResult {
    pub resting_expansions: Vec<OrderStateExpansion>,
    pub transient_expansions: Vec<OrderStateExpansion>,
    pub new_resting_orders: Vec<DerivativeLimitOrder>,
    pub cancels: Vec<LimitOrderCancel>,
}

impl LimitSideResult {
    pub fn expansions(&self) -> impl Iterator<Item = &OrderStateExpansion> {
        self.resting_expansions.iter().chain(&self.transient_expansions)
    }
}

/// Outcome of one market's limit auction.
#[derive(Debug)]
pub struct LimitMatchingData {
    pub buy: LimitSideResult,
    pub sell: LimitSideResult,
    pub clearing_price: Option<Decimal>,
    pub clearing_quantity: Decimal,
    pub open_interest_delta: Decimal,
    pub positions: PositionCache,
}

impl LimitMatchingData {
    pub fn market_balance_delta(&self) -> Decimal {
        self.buy.expansions().chain(self.sell.expansions()).map(|e| e.market_balance_delta).sum()
    }
}

/// Market orders of one direction and the resting orders they hit.
#[derive(Debug, Clone, Default)]
pub struct MarketSideResult {
    pub clearing_price: Option<Decimal>,
    pub clearing_quantity: Decimal,
    pub market_expansions: Vec<OrderStateExpansion>,
    pub resting_expansions: Vec<OrderStateExpansion>,
    pub resting_cancels: Vec<LimitOrderCancel>,
    /// Unfilled market order remainders. the refund already sits in the expansion.
    pub market_cancels: Vec<(DerivativeMarketOrder, Decimal)>,
}

impl MarketSideResult {
    pub fn expansions(&self) -> impl Iterator<Item = &OrderStateExpansion> {
        self.market_expansions.iter().chain(&self.resting_expansions)
    }
}

#[derive(Debug)]
pub struct MarketMatchingData {
    pub buy: MarketSideResult,
    pub sell: MarketSideResult,
    pub open_interest_delta: Decimal,
    pub positions: PositionCache,
}

impl MarketMatchingData {
    pub fn market_balance_delta(&self) -> Decimal {
        self.buy.expansions().chain(self.sell.expansions()).map(|e| e.market_balance_delta).sum()
    }

    pub fn filled_quantity(&self) -> Decimal {
        self.buy.clearing_quantity + self.sell.clearing_quantity
    }
}

pub fn full_fallback_clearing_price(last_buy: Decimal, last_sell: Decimal) -> Decimal {
    (last_buy + last_sell) / Decimal::TWO
}

pub fn oracle_fallback_clearing_price(last_buy: Decimal, last_sell: Decimal, mark_price: Decimal) -> Decimal {
    if last_buy <= mark_price {
        return last_buy;
    }
    if last_sell >= mark_price {
        return last_sell;
    }
    mark_price
}

pub fn regular_clearing_price(last_buy: Decimal, last_sell: Decimal, mark_price: Option<Decimal>, mid_price: Decimal) -> Decimal {
    if last_buy <= mid_price {
        return last_buy;
    }
    if last_sell >= mid_price {
        return last_sell;
    }
    match mark_price {
        Some(mark_price) => oracle_fallback_clearing_price(last_buy, last_sell, mark_price),
        None => mid_price,
    }
}

/// Clearing price of an auction whose last crossing pair was (last_buy, last_sell).
pub fn clearing_price(last_buy: Decimal, last_sell: Decimal, mark_price: Option<Decimal>, mid_price: Option<Decimal>) -> Decimal {
    match (mid_price, mark_price) {
        (None, None) => full_fallback_clearing_price(last_buy, last_sell),
        (None, Some(mark_price)) => oracle_fallback_clearing_price(last_buy, last_sell, mark_price),
        (Some(mid_price), mark_price) => regular_clearing_price(last_buy, last_sell, mark_price, mid_price),
    }
}

fn crosses(buy: &PriceLevel, sell: &PriceLevel) -> Option<Decimal> {
    let quantity = buy.quantity.min(sell.quantity);
    if sell.price > buy.price || quantity.is_zero() {
        return None;
    }
    Some(quantity)
}

/// Cancelled orders in their post-fill state, with the rate their held fee is returned at.
fn limit_cancels(
    orders: Vec<DerivativeLimitOrder>,
    is_transient: bool,
    filled: &HashMap<OrderHash, DerivativeLimitOrder>,
    partial_cancels: &HashSet<OrderHash>,
    maker_fee_rate: Decimal,
    taker_fee_rate: Decimal,
) -> Vec<LimitOrderCancel> {
    orders
        .into_iter()
        .map(|order| {
            let is_partial = partial_cancels.contains(&order.hash);
            let order = filled.get(&order.hash).cloned().unwrap_or(order);
            // a transient order that filled was already refunded the taker-over-maker part
            let refund_rate = match (is_transient, is_partial) {
                (false, _) => maker_fee_rate,
                (true, false) => taker_fee_rate,
                (true, true) => maker_fee_rate.max(Decimal::ZERO),
            };
            LimitOrderCancel {
                order,
                is_transient,
                refund_rate,
            }
        })
        .collect()
}

fn post_fill_orders<'e>(expansions: impl Iterator<Item = &'e OrderStateExpansion>) -> HashMap<OrderHash, DerivativeLimitOrder> {
    expansions
        .filter_map(|e| match &e.order {
            FilledOrder::Limit(order) => Some((order.hash, order.clone())),
            FilledOrder::Market(_) => None,
        })
        .collect()
}

/// 4.1: runs the batch auction of one market.
pub fn limit_matching_execution_data(ctx: &ExpansionContext<'_>, mut session: MatchingSession<'_>, input: LimitMatchingInput) -> LimitMatchingData {
    let mark_price = session.mark_price();
    let mut buys = LimitOrderbookSide::new(Side::Buy, &mut session, input.resting_buys, input.transient_buys);
    let mut sells = LimitOrderbookSide::new(Side::Sell, &mut session, input.resting_sells, input.transient_sells);
    buys.set_opposite(sells.counters_slot());
    sells.set_opposite(buys.counters_slot());

    let mut last = None;
    loop {
        let Some(buy) = buys.peek(&mut session) else {
            break;
        };
        let Some(sell) = sells.peek(&mut session) else {
            break;
        };
        let Some(quantity) = crosses(&buy, &sell) else {
            break;
        };
        last = Some((buy.price, sell.price));
        buys.fill(&mut session, quantity);
        sells.fill(&mut session, quantity);
    }

    let clearing_quantity = buys.total_quantity();
    let clearing_price = match last {
        Some((last_buy, last_sell)) if clearing_quantity > Decimal::ZERO => {
            Some(clearing_price(last_buy, last_sell, mark_price, input.resting_mid_price))
        }
        _ => None,
    };

    let maker_fee_rate = ctx.market.maker_fee_rate();
    let taker_fee_rate = ctx.market.taker_fee_rate();
    let open_interest_delta = session.open_interest_delta();
    let mut positions = session.into_positions();

    let mut expand_side = |side: LimitOrderbookSide| {
        let side_kind = side.side();
        let outcome = side.into_outcome();
        let mut result = LimitSideResult::default();
        let merged = MergedOrderbookFills::new(side_kind, outcome.transient_fills, outcome.resting_fills);
        for fill in merged {
            let expansion = expand_limit_fill(ctx, &mut positions, fill.order, fill.fill_quantity, clearing_price, fill.is_transient);
            if fill.is_transient {
                if let FilledOrder::Limit(order) = &expansion.order {
                    if order.fillable > Decimal::ZERO && !outcome.partial_cancels.contains(&order.hash) {
                        result.new_resting_orders.push(order.clone());
                    }
                }
                result.transient_expansions.push(expansion);
            } else {
                result.resting_expansions.push(expansion);
            }
        }

        let filled = post_fill_orders(result.expansions());
        let mut cancels = limit_cancels(outcome.resting_cancels, false, &filled, &outcome.partial_cancels, maker_fee_rate, taker_fee_rate);
        cancels.extend(limit_cancels(outcome.transient_cancels, true, &filled, &outcome.partial_cancels, maker_fee_rate, taker_fee_rate));
        result.cancels = cancels;
        result
    };
    let buy = expand_side(buys);
    let sell = expand_side(sells);

    LimitMatchingData {
        buy,
        sell,
        clearing_price,
        clearing_quantity,
        open_interest_delta,
        positions,
    }
}

/// Market orders of one market, split by direction and in arrival order.
#[derive(Debug, Clone, Default)]
pub struct MarketMatchingInput {
    pub market_buys: Vec<DerivativeMarketOrder>,
    pub market_sells: Vec<DerivativeMarketOrder>,
    pub resting_buys: Vec<DerivativeLimitOrder>,
    pub resting_sells: Vec<DerivativeLimitOrder>,
    /// Replaces the market's taker rate, for atomic orders
    pub taker_fee_rate: Option<Decimal>,
}

struct MarketPair {
    limit: LimitOrderbookSide,
    market: MarketOrderbookSide,
}

fn match_market_pair(session: &mut MatchingSession<'_>, pair: &mut MarketPair) {
    let market_is_buy = pair.market.side().is_buy();
    loop {
        let Some(market_level) = pair.market.peek(session) else {
            break;
        };
        let Some(limit_level) = pair.limit.peek(session) else {
            break;
        };
        let (buy, sell) = if market_is_buy {
            (market_level, limit_level)
        } else {
            (limit_level, market_level)
        };
        let Some(quantity) = crosses(&buy, &sell) else {
            break;
        };
        pair.market.fill(session, quantity);
        pair.limit.fill(session, quantity);
    }
}

/// 4.2: market buys against resting sells and market sells against resting buys.
pub fn market_order_execution_data(ctx: &ExpansionContext<'_>, mut session: MatchingSession<'_>, input: MarketMatchingInput) -> MarketMatchingData {
    let fee_rate = if ctx.is_liquidation {
        Decimal::ZERO
    } else {
        input.taker_fee_rate.unwrap_or_else(|| ctx.market.taker_fee_rate())
    };

    let mut pairs = Vec::with_capacity(2);
    for (market_side, market_orders, resting) in [
        (Side::Sell, input.market_sells, input.resting_buys),
        (Side::Buy, input.market_buys, input.resting_sells),
    ] {
        let mut limit = LimitOrderbookSide::new(market_side.opposite(), &mut session, resting, Vec::new());
        let mut market = MarketOrderbookSide::new(market_side, &mut session, market_orders, fee_rate, ctx.is_liquidation);
        limit.set_opposite(market.counters_slot());
        market.set_opposite(limit.counters_slot());
        pairs.push(MarketPair { limit, market });
    }

    for pair in pairs.iter_mut().filter(|p| !p.market.is_empty()) {
        match_market_pair(&mut session, pair);
    }

    let open_interest_delta = session.open_interest_delta();
    let mut positions = session.into_positions();
    let maker_fee_rate = ctx.market.maker_fee_rate();

    let mut buy = MarketSideResult::default();
    let mut sell = MarketSideResult::default();
    for pair in pairs {
        if pair.market.is_empty() {
            continue;
        }
        let is_buy = pair.market.side().is_buy();
        let market_total = pair.market.total_quantity();
        let clearing_price = (!market_total.is_zero()).then(|| round_amount(pair.limit.notional() / market_total));

        let mut result = MarketSideResult {
            clearing_price,
            clearing_quantity: market_total,
            ..MarketSideResult::default()
        };
        for (order, fill_quantity) in pair.market.into_orders() {
            let unfilled = order.quantity() - fill_quantity;
            if !unfilled.is_zero() {
                result.market_cancels.push((order.clone(), unfilled));
            }
            result
                .market_expansions
                .push(expand_market_fill(ctx, &mut positions, order, fill_quantity, clearing_price, fee_rate));
        }

        let outcome = pair.limit.into_outcome();
        for (order, fill_quantity) in outcome.resting_fills.orders.into_iter().zip(outcome.resting_fills.fill_quantities) {
            result
                .resting_expansions
                .push(expand_limit_fill(ctx, &mut positions, order, fill_quantity, None, false));
        }
        let filled = post_fill_orders(result.resting_expansions.iter());
        result.resting_cancels = limit_cancels(outcome.resting_cancels, false, &filled, &outcome.partial_cancels, maker_fee_rate, maker_fee_rate);

        if is_buy {
            buy = result;
        } else {
            sell = result;
        }
    }

    MarketMatchingData {
        buy,
        sell,
        open_interest_delta,
        positions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expansion::FeeDiscounts;
    use crate::interfaces::InMemoryBank;
    use crate::market::{Market, MarketParams};
    use crate::order::OrderInfo;
    use crate::types::{MarketId, SubaccountId, Timestamp};
    use rust_decimal_macros::dec;

    fn perp() -> Market {
        Market::perpetual(MarketParams::btc_perp(MarketId(1)), Timestamp(0), 3600)
    }

    fn limit(hash: u64, sub: u64, side: Side, price: Decimal, qty: Decimal) -> DerivativeLimitOrder {
        DerivativeLimitOrder::new(
            OrderHash(hash),
            MarketId(1),
            side,
            OrderInfo::new(SubaccountId(sub), price, qty),
            price * qty * dec!(0.1),
        )
    }

    fn market_buy(hash: u64, sub: u64, worst: Decimal, qty: Decimal) -> DerivativeMarketOrder {
        let margin = worst * qty * dec!(0.1);
        DerivativeMarketOrder {
            hash: OrderHash(hash),
            market_id: MarketId(1),
            side: Side::Buy,
            info: OrderInfo::new(SubaccountId(sub), worst, qty),
            margin,
            margin_hold: margin + worst * qty * dec!(0.001),
        }
    }

    #[test]
    fn clearing_price_fallbacks() {
        assert_eq!(clearing_price(dec!(100), dec!(95), None, None), dec!(97.5));
        assert_eq!(clearing_price(dec!(100), dec!(95), Some(dec!(97)), None), dec!(97));
        assert_eq!(clearing_price(dec!(96), dec!(95), Some(dec!(97)), None), dec!(96));
        assert_eq!(clearing_price(dec!(100), dec!(99), Some(dec!(97)), None), dec!(99));
        assert_eq!(clearing_price(dec!(100), dec!(95), None, Some(dec!(98))), dec!(98));
        assert_eq!(clearing_price(dec!(100), dec!(95), Some(dec!(96)), Some(dec!(98))), dec!(96));
        assert_eq!(clearing_price(dec!(97), dec!(95), Some(dec!(96)), Some(dec!(98))), dec!(97));
    }

    #[test]
    fn crossing_transients_clear_at_mark() {
        let market = perp();
        let bank = InMemoryBank::new();
        let discounts = FeeDiscounts::new();
        let ctx = ExpansionContext {
            market: &market,
            discounts: &discounts,
            bank: &bank,
            is_liquidation: false,
        };
        let session = MatchingSession::new(&market, Some(dec!(97)), Decimal::ZERO, PositionCache::default());
        let input = LimitMatchingInput {
            transient_buys: vec![limit(1, 1, Side::Buy, dec!(100), dec!(5))],
            transient_sells: vec![limit(2, 2, Side::Sell, dec!(95), dec!(3))],
            ..LimitMatchingInput::default()
        };
        let data = limit_matching_execution_data(&ctx, session, input);

        assert_eq!(data.clearing_quantity, dec!(3));
        assert_eq!(data.clearing_price, Some(dec!(97)));
        assert_eq!(data.open_interest_delta, dec!(6));
        // the buy rests with its remaining 2
        assert_eq!(data.buy.new_resting_orders.len(), 1);
        assert_eq!(data.buy.new_resting_orders[0].fillable, dec!(2));
        assert!(data.sell.new_resting_orders.is_empty());
        assert!(data.buy.cancels.is_empty() && data.sell.cancels.is_empty());
    }

    #[test]
    fn no_cross_rests_everything() {
        let market = perp();
        let bank = InMemoryBank::new();
        let discounts = FeeDiscounts::new();
        let ctx = ExpansionContext {
            market: &market,
            discounts: &discounts,
            bank: &bank,
            is_liquidation: false,
        };
        let session = MatchingSession::new(&market, Some(dec!(100)), Decimal::ZERO, PositionCache::default());
        let input = LimitMatchingInput {
            transient_buys: vec![limit(1, 1, Side::Buy, dec!(99), dec!(1))],
            transient_sells: vec![limit(2, 2, Side::Sell, dec!(101), dec!(1))],
            ..LimitMatchingInput::default()
        };
        let data = limit_matching_execution_data(&ctx, session, input);
        assert_eq!(data.clearing_price, None);
        assert_eq!(data.buy.new_resting_orders.len(), 1);
        assert_eq!(data.sell.new_resting_orders.len(), 1);
        assert_eq!(data.market_balance_delta(), Decimal::ZERO);
    }

    #[test]
    fn market_buy_walks_the_book() {
        let market = perp();
        let bank = InMemoryBank::new();
        let discounts = FeeDiscounts::new();
        let ctx = ExpansionContext {
            market: &market,
            discounts: &discounts,
            bank: &bank,
            is_liquidation: false,
        };
        let session = MatchingSession::new(&market, Some(dec!(97)), Decimal::ZERO, PositionCache::default());
        let input = MarketMatchingInput {
            market_buys: vec![market_buy(10, 1, dec!(98), dec!(10))],
            resting_sells: vec![limit(1, 2, Side::Sell, dec!(95), dec!(4)), limit(2, 3, Side::Sell, dec!(98), dec!(6))],
            ..MarketMatchingInput::default()
        };
        let data = market_order_execution_data(&ctx, session, input);

        assert_eq!(data.buy.clearing_quantity, dec!(10));
        assert_eq!(data.buy.clearing_price, Some(dec!(96.8)));
        assert_eq!(data.buy.resting_expansions.len(), 2);
        assert!(data.buy.market_cancels.is_empty());
        assert_eq!(data.open_interest_delta, dec!(20));
    }

    #[test]
    fn market_order_respects_worst_price() {
        let market = perp();
        let bank = InMemoryBank::new();
        let discounts = FeeDiscounts::new();
        let ctx = ExpansionContext {
            market: &market,
            discounts: &discounts,
            bank: &bank,
            is_liquidation: false,
        };
        let session = MatchingSession::new(&market, Some(dec!(97)), Decimal::ZERO, PositionCache::default());
        let input = MarketMatchingInput {
            market_buys: vec![market_buy(10, 1, dec!(96), dec!(10))],
            resting_sells: vec![limit(1, 2, Side::Sell, dec!(95), dec!(4)), limit(2, 3, Side::Sell, dec!(98), dec!(6))],
            ..MarketMatchingInput::default()
        };
        let data = market_order_execution_data(&ctx, session, input);
        assert_eq!(data.buy.clearing_quantity, dec!(4));
        assert_eq!(data.buy.market_cancels.len(), 1);
        assert_eq!(data.buy.market_cancels[0].1, dec!(6));
    }

    #[test]
    fn taker_rate_override_prices_the_market_side() {
        let market = perp();
        let bank = InMemoryBank::new();
        let discounts = FeeDiscounts::new();
        let ctx = ExpansionContext {
            market: &market,
            discounts: &discounts,
            bank: &bank,
            is_liquidation: false,
        };
        let session = MatchingSession::new(&market, Some(dec!(97)), Decimal::ZERO, PositionCache::default());
        let input = MarketMatchingInput {
            market_buys: vec![market_buy(10, 1, dec!(98), dec!(10))],
            resting_sells: vec![limit(1, 2, Side::Sell, dec!(95), dec!(4)), limit(2, 3, Side::Sell, dec!(98), dec!(6))],
            taker_fee_rate: Some(dec!(0.0025)),
            ..MarketMatchingInput::default()
        };
        let data = market_order_execution_data(&ctx, session, input);
        // 10 × 96.8 × 0.0025
        assert_eq!(data.buy.market_expansions[0].fee.total_trade_fee, dec!(2.42));
        // resting orders still pay the maker rate
        assert_eq!(data.buy.resting_expansions[0].fee.total_trade_fee, dec!(4) * dec!(95) * market.maker_fee_rate());
    }
}
