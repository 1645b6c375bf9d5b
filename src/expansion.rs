// 4.4: turning fills into state changes.
// an expansion carries everything one order's fill does to the world: the position delta,
// the trader's deposit deltas, the fee split and the market balance change.
// nothing here writes to the store; persistence applies expansions afterwards.

use crate::interfaces::BankKeeper;
use crate::margin::pro_rata;
use crate::market::Market;
use crate::order::{binary_options_order_margin, DerivativeLimitOrder, DerivativeMarketOrder};
use crate::position::{Position, PositionCache, PositionDelta};
use crate::types::{round_amount, OrderHash, SubaccountId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Flat per-subaccount fee discount, as a fraction of the fee rate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeDiscounts(BTreeMap<SubaccountId, Decimal>);

impl FeeDiscounts {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with(mut self, subaccount_id: SubaccountId, discount: Decimal) -> Self {
        self.set(subaccount_id, discount);
        self
    }

    pub fn set(&mut self, subaccount_id: SubaccountId, discount: Decimal) {
        self.0.insert(subaccount_id, discount.max(Decimal::ZERO).min(Decimal::ONE));
    }

    pub fn discount(&self, subaccount_id: SubaccountId) -> Decimal {
        self.0.get(&subaccount_id).copied().unwrap_or_default()
    }

    /// Rebates are never discounted.
    pub fn discounted_rate(&self, subaccount_id: SubaccountId, fee_rate: Decimal) -> Decimal {
        if fee_rate.is_sign_positive() && !fee_rate.is_zero() {
            fee_rate * (Decimal::ONE - self.discount(subaccount_id))
        } else {
            fee_rate
        }
    }
}

/// How the fee of one fill is split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeFeeData {
    pub total_trade_fee: Decimal,
    /// What the trader pays, negative for a rebate
    pub trader_fee: Decimal,
    pub fee_recipient_reward: Decimal,
    /// Goes to the auction subaccount, negative when it funds a rebate
    pub auction_fee_reward: Decimal,
    pub discounted_trade_fee_rate: Decimal,
}

impl TradeFeeData {
    pub fn empty(discounted_trade_fee_rate: Decimal) -> Self {
        Self {
            discounted_trade_fee_rate,
            ..Self::default()
        }
    }

    // the relayer keeps its share of a rebate, so the auction subaccount pays the whole rebate
    pub fn new(fill_quantity: Decimal, execution_price: Decimal, discounted_rate: Decimal, relayer_fee_share_rate: Decimal) -> Self {
        if fill_quantity.is_zero() {
            return Self::empty(discounted_rate);
        }
        let total_trade_fee = round_amount(fill_quantity * execution_price * discounted_rate);
        let fee_recipient_reward = round_amount(relayer_fee_share_rate * total_trade_fee).abs();
        let (trader_fee, auction_fee_reward) = if total_trade_fee.is_sign_negative() {
            (total_trade_fee + fee_recipient_reward, total_trade_fee)
        } else {
            (total_trade_fee, total_trade_fee - fee_recipient_reward)
        };
        Self {
            total_trade_fee,
            trader_fee,
            fee_recipient_reward,
            auction_fee_reward,
            discounted_trade_fee_rate: discounted_rate,
        }
    }
}

/// The order an expansion came from, with its state after the fill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilledOrder {
    Limit(DerivativeLimitOrder),
    Market(DerivativeMarketOrder),
}

impl FilledOrder {
    pub fn hash(&self) -> OrderHash {
        match self {
            FilledOrder::Limit(order) => order.hash,
            FilledOrder::Market(order) => order.hash,
        }
    }

    pub fn cid(&self) -> Option<&str> {
        match self {
            FilledOrder::Limit(order) => order.info.cid.as_deref(),
            FilledOrder::Market(order) => order.info.cid.as_deref(),
        }
    }

    pub fn is_reduce_only(&self) -> bool {
        match self {
            FilledOrder::Limit(order) => order.is_reduce_only(),
            FilledOrder::Market(order) => order.is_reduce_only(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderStateExpansion {
    pub subaccount_id: SubaccountId,
    pub fee_recipient: SubaccountId,
    pub is_buy: bool,
    pub position_delta: Option<PositionDelta>,
    pub payout: Decimal,
    pub pnl: Decimal,
    pub market_balance_delta: Decimal,
    pub total_balance_delta: Decimal,
    pub available_balance_delta: Decimal,
    pub fee: TradeFeeData,
    pub fill_quantity: Decimal,
    pub order: FilledOrder,
}

impl OrderStateExpansion {
    pub fn order_hash(&self) -> OrderHash {
        self.order.hash()
    }

    pub fn is_self_relayed(&self) -> bool {
        self.fee_recipient == self.subaccount_id
    }
}

/// Read-only inputs shared by every expansion of one matching pass.
pub struct ExpansionContext<'a> {
    pub market: &'a Market,
    pub discounts: &'a FeeDiscounts,
    pub bank: &'a dyn BankKeeper,
    pub is_liquidation: bool,
}

impl<'a> ExpansionContext<'a> {
    fn fee_data(&self, subaccount_id: SubaccountId, fill_quantity: Decimal, execution_price: Decimal, fee_rate: Decimal) -> TradeFeeData {
        let discounted = self.discounts.discounted_rate(subaccount_id, fee_rate);
        TradeFeeData::new(fill_quantity, execution_price, discounted, self.market.relayer_fee_share_rate())
    }

    /// `proportional` is the order's own margin share for the fill.
    fn execution_margin(&self, proportional: Decimal, is_reduce_only: bool, is_buy: bool, fill_quantity: Decimal, execution_price: Decimal) -> Decimal {
        if self.market.is_binary_options() {
            binary_options_order_margin(execution_price, fill_quantity, is_buy, is_reduce_only, self.market.oracle_scale())
        } else {
            proportional
        }
    }
}

/// Fee components of one fill, all from the trader's point of view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeesAndRefunds {
    /// Held fee returned for quantity that did not fill
    pub unmatched_fee_refund: Decimal,
    /// Held fee returned (or extra charged) for the filled quantity
    pub matched_fee_refund_or_charge: Decimal,
    pub fee_charge: Decimal,
}

/// Splits the fee held at `order_price` into what was paid and what comes back.
/// `unmatched_fee_refund_rate` is zero for resting orders, `taker − max(maker, 0)` for transient
/// limit orders and the taker rate for market orders.
#[allow(clippy::too_many_arguments)]
pub fn order_fees_and_refunds(
    fillable_quantity: Decimal,
    order_price: Decimal,
    is_reduce_only: bool,
    fill_quantity: Decimal,
    execution_price: Decimal,
    trade_fee_rate: Decimal,
    unmatched_fee_refund_rate: Decimal,
    fee: &TradeFeeData,
) -> FeesAndRefunds {
    if is_reduce_only {
        return FeesAndRefunds::default();
    }
    let positive_rate = trade_fee_rate.max(Decimal::ZERO);
    let positive_discounted = fee.discounted_trade_fee_rate.max(Decimal::ZERO);
    let unfilled = fillable_quantity - fill_quantity;

    // held for the fill minus what the fill paid: the price improvement plus the discount
    let matched_hold = fill_quantity * order_price * positive_rate;
    let matched_paid = if positive_discounted.is_zero() {
        Decimal::ZERO
    } else {
        fee.trader_fee
    };

    FeesAndRefunds {
        unmatched_fee_refund: unfilled * order_price * unmatched_fee_refund_rate,
        matched_fee_refund_or_charge: matched_hold - matched_paid,
        fee_charge: fee.trader_fee,
    }
}

/// Market funds change of one fill. reduce-only fees are taken out of the payout, so the market pays them.
pub fn market_balance_delta(payout: Decimal, collateralization_margin: Decimal, trader_fee: Decimal, is_reduce_only: bool) -> Decimal {
    let delta = collateralization_margin - payout;
    if is_reduce_only {
        delta - trader_fee
    } else {
        delta
    }
}

/// Balance deltas after margin adjustment, plus what moved between position margin and the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarginAdjustment {
    pub available_balance_delta: Decimal,
    pub total_balance_delta: Decimal,
    pub market_balance_delta: Decimal,
}

// a sell filled at a better price owes extra fee. when the trader cannot pay it from the
// balance it comes out of position margin instead.
pub fn adjust_position_margin_if_necessary(
    market: &Market,
    bank: &dyn BankKeeper,
    subaccount_id: SubaccountId,
    position: &mut Position,
    available_balance_delta: Decimal,
    total_balance_delta: Decimal,
) -> MarginAdjustment {
    let unchanged = MarginAdjustment {
        available_balance_delta,
        total_balance_delta,
        market_balance_delta: Decimal::ZERO,
    };
    if !available_balance_delta.is_sign_negative() || available_balance_delta.is_zero() || market.is_binary_options() {
        return unchanged;
    }
    if position.margin <= available_balance_delta.abs() {
        return unchanged;
    }
    let spendable = bank.spendable_funds(subaccount_id, market.quote_denom());
    if !(spendable + available_balance_delta).is_sign_negative() {
        return unchanged;
    }

    position.margin += available_balance_delta;
    MarginAdjustment {
        available_balance_delta: Decimal::ZERO,
        total_balance_delta: total_balance_delta - available_balance_delta,
        market_balance_delta: available_balance_delta,
    }
}

/// Expands one limit order's fill. `clearing_price` is None for resting orders hit by market
/// orders, which execute at their own price. the order's fillable is reduced by the fill.
pub fn expand_limit_fill(
    ctx: &ExpansionContext<'_>,
    positions: &mut PositionCache,
    mut order: DerivativeLimitOrder,
    fill_quantity: Decimal,
    clearing_price: Option<Decimal>,
    is_transient: bool,
) -> OrderStateExpansion {
    let market = ctx.market;
    let execution_price = clearing_price.unwrap_or(order.price());
    let mut fee_rate = if is_transient {
        market.taker_fee_rate()
    } else {
        market.maker_fee_rate()
    };
    // liquidations close with no fee, so no taker fee exists to pay a maker rebate
    if fee_rate.is_sign_negative() && ctx.is_liquidation {
        fee_rate = Decimal::ZERO;
    }

    let subaccount_id = order.subaccount_id();
    let fee = ctx.fee_data(subaccount_id, fill_quantity, execution_price, fee_rate);
    let position = positions.get_or_create(subaccount_id, order.is_buy());

    let mut unused_margin_refund = Decimal::ZERO;
    let position_delta = (fill_quantity > Decimal::ZERO).then(|| {
        let proportional = order.margin_for_fill(fill_quantity);
        let execution_margin = ctx.execution_margin(proportional, order.is_reduce_only(), order.is_buy(), fill_quantity, execution_price);
        if market.is_binary_options() && proportional > execution_margin {
            unused_margin_refund = proportional - execution_margin;
        }
        PositionDelta::new(order.is_buy(), fill_quantity, execution_margin, execution_price)
    });
    let outcome = match &position_delta {
        Some(delta) => position.apply_position_delta(delta, fee.trader_fee),
        None => Default::default(),
    };

    let unmatched_fee_refund_rate = if is_transient {
        market.taker_fee_rate() - market.maker_fee_rate().max(Decimal::ZERO)
    } else {
        Decimal::ZERO
    };
    let fees = order_fees_and_refunds(
        order.fillable,
        order.price(),
        order.is_reduce_only(),
        fill_quantity,
        execution_price,
        fee_rate,
        unmatched_fee_refund_rate,
        &fee,
    );
    order.fillable -= fill_quantity;

    let total_balance_delta = outcome.payout - (outcome.collateralization_margin + fees.fee_charge);
    let mut available_balance_delta = outcome.payout
        + outcome.close_execution_margin
        + fees.matched_fee_refund_or_charge
        + fees.unmatched_fee_refund
        + unused_margin_refund;
    if fee.trader_fee.is_sign_negative() && !order.is_reduce_only() {
        available_balance_delta += fee.trader_fee.abs();
    }

    let adjusted = adjust_position_margin_if_necessary(market, ctx.bank, subaccount_id, position, available_balance_delta, total_balance_delta);
    let is_reduce_only = order.is_reduce_only();
    OrderStateExpansion {
        subaccount_id,
        fee_recipient: order.info.fee_recipient,
        is_buy: order.is_buy(),
        position_delta,
        payout: outcome.payout,
        pnl: outcome.pnl,
        market_balance_delta: market_balance_delta(outcome.payout, outcome.collateralization_margin, fee.trader_fee, is_reduce_only)
            + adjusted.market_balance_delta,
        total_balance_delta: adjusted.total_balance_delta,
        available_balance_delta: adjusted.available_balance_delta,
        fee,
        fill_quantity,
        order: FilledOrder::Limit(order),
    }
}

/// Expands one market order. without a clearing price nothing filled and the hold is returned.
pub fn expand_market_fill(
    ctx: &ExpansionContext<'_>,
    positions: &mut PositionCache,
    order: DerivativeMarketOrder,
    fill_quantity: Decimal,
    clearing_price: Option<Decimal>,
    fee_rate: Decimal,
) -> OrderStateExpansion {
    let subaccount_id = order.subaccount_id();
    let Some(clearing_price) = clearing_price else {
        return OrderStateExpansion {
            subaccount_id,
            fee_recipient: order.info.fee_recipient,
            is_buy: order.is_buy(),
            position_delta: None,
            payout: Decimal::ZERO,
            pnl: Decimal::ZERO,
            market_balance_delta: Decimal::ZERO,
            total_balance_delta: Decimal::ZERO,
            available_balance_delta: order.margin_hold,
            fee: TradeFeeData::default(),
            fill_quantity: Decimal::ZERO,
            order: FilledOrder::Market(order),
        };
    };

    let market = ctx.market;
    let fee = ctx.fee_data(subaccount_id, fill_quantity, clearing_price, fee_rate);
    let position = positions.get_or_create(subaccount_id, order.is_buy());

    let proportional = pro_rata(order.margin, fill_quantity, order.quantity());
    let execution_margin = ctx.execution_margin(proportional, order.is_reduce_only(), order.is_buy(), fill_quantity, clearing_price);
    let unused_margin_refund = order.margin - execution_margin;
    let position_delta = (fill_quantity > Decimal::ZERO)
        .then(|| PositionDelta::new(order.is_buy(), fill_quantity, execution_margin, clearing_price));
    let outcome = match &position_delta {
        Some(delta) => position.apply_position_delta(delta, fee.trader_fee),
        None => Default::default(),
    };

    let fees = order_fees_and_refunds(
        order.quantity(),
        order.price(),
        order.is_reduce_only(),
        fill_quantity,
        clearing_price,
        fee_rate,
        fee_rate,
        &fee,
    );

    let total_balance_delta = outcome.payout - (outcome.collateralization_margin + fees.fee_charge);
    let available_balance_delta = outcome.payout
        + outcome.close_execution_margin
        + unused_margin_refund
        + fees.matched_fee_refund_or_charge
        + fees.unmatched_fee_refund;

    let adjusted = adjust_position_margin_if_necessary(market, ctx.bank, subaccount_id, position, available_balance_delta, total_balance_delta);
    let is_reduce_only = order.is_reduce_only();
    OrderStateExpansion {
        subaccount_id,
        fee_recipient: order.info.fee_recipient,
        is_buy: order.is_buy(),
        position_delta,
        payout: outcome.payout,
        pnl: outcome.pnl,
        market_balance_delta: market_balance_delta(outcome.payout, outcome.collateralization_margin, fee.trader_fee, is_reduce_only)
            + adjusted.market_balance_delta,
        total_balance_delta: adjusted.total_balance_delta,
        available_balance_delta: adjusted.available_balance_delta,
        fee,
        fill_quantity,
        order: FilledOrder::Market(order),
    }
}
