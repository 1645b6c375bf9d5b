// 11.7: BatchExecutionData is everything one matching pass wants to persist.
// built from matching output without touching the store, then applied in one go
// (or discarded whole when the market cannot pay for it).

use crate::events::{
    BatchExecutionEvent, CancelReason, EventPayload, ExecutionType, NewOrdersEvent, OrderCancelledEvent, TradeLog,
};
use crate::expansion::{FilledOrder, OrderStateExpansion};
use crate::market::Market;
use crate::matching::{LimitMatchingData, LimitOrderCancel, MarketMatchingData, MarketSideResult};
use crate::order::{DerivativeLimitOrder, DerivativeMarketOrder};
use crate::position::PositionState;
use crate::types::{DepositDelta, DepositDeltas, MarketId, SubaccountId};
use rust_decimal::Decimal;

/// Volume-weighted execution price of a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VwapData {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl VwapData {
    pub fn apply_execution(&mut self, price: Option<Decimal>, quantity: Decimal) {
        let Some(price) = price else {
            return;
        };
        if quantity.is_zero() {
            return;
        }
        let total = self.quantity + quantity;
        self.price = (self.price * self.quantity + price * quantity) / total;
        self.quantity = total;
    }

    pub fn is_empty(&self) -> bool {
        self.price.is_zero() || self.quantity.is_zero()
    }
}

/// A limit order fill to persist, in the order's post-fill state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitFill {
    pub order: DerivativeLimitOrder,
    pub fill_quantity: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct BatchExecutionData {
    pub market_id: MarketId,
    pub market_balance_delta: Decimal,
    pub open_interest_delta: Decimal,
    pub deposit_deltas: DepositDeltas,
    pub positions: Vec<PositionState>,
    pub vwap: VwapData,
    pub resting_fills: Vec<LimitFill>,
    pub transient_fills: Vec<LimitFill>,
    pub limit_cancels: Vec<LimitOrderCancel>,
    pub market_cancels: Vec<(DerivativeMarketOrder, Decimal)>,
    pub new_resting_orders: Vec<DerivativeLimitOrder>,
    pub events: Vec<EventPayload>,
}

impl BatchExecutionData {
    fn new(market_id: MarketId, positions: Vec<PositionState>, open_interest_delta: Decimal) -> Self {
        Self {
            market_id,
            open_interest_delta,
            positions,
            deposit_deltas: DepositDeltas::new(),
            ..Self::default()
        }
    }

    /// Balance and event side of a set of expansions of one (side, execution type).
    fn add_expansions(&mut self, market: &Market, expansions: &[OrderStateExpansion], is_buy: bool, execution_type: ExecutionType, is_liquidation: bool) {
        let mut trades = Vec::new();
        for expansion in expansions {
            self.market_balance_delta += expansion.market_balance_delta;
            add_expansion_deposits(&mut self.deposit_deltas, expansion);
            if let Some(trade) = trade_log(expansion) {
                trades.push(trade);
            }
        }
        if trades.is_empty() {
            return;
        }
        self.events.push(EventPayload::BatchDerivativeExecution(BatchExecutionEvent {
            market_id: market.id(),
            is_buy,
            execution_type,
            is_liquidation,
            cumulative_funding: market.funding().map(|f| f.cumulative_funding),
            trades,
        }));
    }

    fn add_limit_cancels(&mut self, cancels: Vec<LimitOrderCancel>, reason: CancelReason) {
        for cancel in cancels {
            let refund = cancel.refund();
            if !refund.is_zero() {
                self.deposit_deltas.add_available(cancel.order.subaccount_id(), refund);
            }
            self.events.push(EventPayload::OrderCancelled(OrderCancelledEvent {
                market_id: self.market_id,
                order_hash: cancel.order.hash,
                subaccount_id: cancel.order.subaccount_id(),
                is_limit: true,
                cancel_quantity: cancel.order.fillable,
                refund,
                reason,
            }));
            self.limit_cancels.push(cancel);
        }
    }

    fn add_limit_fills(expansions: &[OrderStateExpansion], into: &mut Vec<LimitFill>) {
        for expansion in expansions {
            if let FilledOrder::Limit(order) = &expansion.order {
                into.push(LimitFill {
                    order: order.clone(),
                    fill_quantity: expansion.fill_quantity,
                });
            }
        }
    }

    /// 4.1 output: resting and new orders of both sides, cancels, one event per side and tier.
    pub fn from_limit_matching(market: &Market, data: LimitMatchingData) -> Self {
        let mut batch = Self::new(market.id(), data.positions.into_touched(), data.open_interest_delta);
        batch.vwap.apply_execution(data.clearing_price, data.clearing_quantity);

        let mut new_buys = Vec::new();
        let mut new_sells = Vec::new();
        for (is_buy, side) in [(true, data.buy), (false, data.sell)] {
            batch.add_expansions(market, &side.resting_expansions, is_buy, ExecutionType::LimitMatchRestingOrder, false);
            batch.add_expansions(market, &side.transient_expansions, is_buy, ExecutionType::LimitMatchNewOrder, false);
            Self::add_limit_fills(&side.resting_expansions, &mut batch.resting_fills);
            Self::add_limit_fills(&side.transient_expansions, &mut batch.transient_fills);
            batch.add_limit_cancels(side.cancels, CancelReason::MatchingValidation);

            let hashes = side.new_resting_orders.iter().map(|o| o.hash).collect();
            if is_buy {
                new_buys = hashes;
            } else {
                new_sells = hashes;
            }
            batch.new_resting_orders.extend(side.new_resting_orders);
        }

        if !new_buys.is_empty() || !new_sells.is_empty() {
            batch.events.push(EventPayload::NewOrders(NewOrdersEvent {
                market_id: market.id(),
                buy_orders: new_buys,
                sell_orders: new_sells,
            }));
        }
        batch
    }

    /// 4.2 output. liquidation trades are tagged as such.
    pub fn from_market_matching(market: &Market, data: MarketMatchingData, is_liquidation: bool) -> Self {
        let mut batch = Self::new(market.id(), data.positions.into_touched(), data.open_interest_delta);
        let market_execution = if is_liquidation {
            ExecutionType::MarketLiquidation
        } else {
            ExecutionType::Market
        };

        for (is_buy, side) in [(true, data.buy), (false, data.sell)] {
            batch.add_market_side(market, side, is_buy, market_execution, is_liquidation);
        }
        batch
    }

    fn add_market_side(&mut self, market: &Market, side: MarketSideResult, is_buy: bool, execution_type: ExecutionType, is_liquidation: bool) {
        self.vwap.apply_execution(side.clearing_price, side.clearing_quantity);
        self.add_expansions(market, &side.market_expansions, is_buy, execution_type, is_liquidation);
        self.add_expansions(market, &side.resting_expansions, !is_buy, ExecutionType::LimitFill, is_liquidation);
        Self::add_limit_fills(&side.resting_expansions, &mut self.resting_fills);
        self.add_limit_cancels(side.resting_cancels, CancelReason::MatchingValidation);

        for (order, unfilled) in side.market_cancels {
            self.events.push(EventPayload::OrderCancelled(OrderCancelledEvent {
                market_id: self.market_id,
                order_hash: order.hash,
                subaccount_id: order.subaccount_id(),
                is_limit: false,
                cancel_quantity: unfilled,
                refund: Decimal::ZERO,
                reason: CancelReason::Unfilled,
            }));
            self.market_cancels.push((order, unfilled));
        }
    }

    pub fn has_trades(&self) -> bool {
        self.events.iter().any(|e| matches!(e, EventPayload::BatchDerivativeExecution(_)))
    }
}

fn add_expansion_deposits(deltas: &mut DepositDeltas, expansion: &OrderStateExpansion) {
    deltas.apply(
        expansion.subaccount_id,
        DepositDelta::new(expansion.total_balance_delta, expansion.available_balance_delta),
    );
    if !expansion.fee.fee_recipient_reward.is_zero() {
        deltas.add_both(expansion.fee_recipient, expansion.fee.fee_recipient_reward);
    }
    if !expansion.fee.auction_fee_reward.is_zero() {
        deltas.add_both(SubaccountId::AUCTION, expansion.fee.auction_fee_reward);
    }
}

fn trade_log(expansion: &OrderStateExpansion) -> Option<TradeLog> {
    let position_delta = expansion.position_delta?;
    let fee = if expansion.is_self_relayed() {
        expansion.fee.auction_fee_reward
    } else {
        expansion.fee.fee_recipient_reward + expansion.fee.auction_fee_reward
    };
    Some(TradeLog {
        subaccount_id: expansion.subaccount_id,
        position_delta,
        payout: expansion.payout,
        fee,
        order_hash: expansion.order_hash(),
        fee_recipient: expansion.fee_recipient,
        cid: expansion.order.cid().map(str::to_string),
        pnl: expansion.pnl,
    })
}
