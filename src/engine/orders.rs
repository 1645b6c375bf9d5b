// 8.2 engine/orders.rs: order admission and cancellation.
// placement validates against the stored state, charges margin plus the taker fee
// and queues the order for this block's batch. nothing matches here.

use super::core::Engine;
use super::execution::{current_open_notional, TakenOrders};
use super::results::{AtomicOrderResult, EngineError, PlacedOrder};
use crate::batch::BatchExecutionData;
use crate::conditional::{ConditionalKind, ConditionalOrder, TriggerDirection};
use crate::events::{CancelReason, EventPayload, OrderCancelledEvent};
use crate::expansion::ExpansionContext;
use crate::margin::{order_fee_hold, validate_order_margin};
use crate::matching::{market_order_execution_data, MarketMatchingInput};
use crate::order::{DerivativeLimitOrder, DerivativeMarketOrder, OrderError, OrderInfo};
use crate::orderbook::MatchingSession;
use crate::position::PositionCache;
use crate::reduce_only::{resolve_reduce_only_conflicts, ReduceOnlyResolution, SubaccountOrder};
use crate::risk::{does_breach_open_notional_cap, open_notional, values_for_notional_cap_checks};
use crate::store::MarketState;
use crate::types::{MarketId, OrderHash, Side, SubaccountId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// An order as submitted. Zero margin makes it reduce-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub market_id: MarketId,
    pub side: Side,
    pub info: OrderInfo,
    pub margin: Decimal,
    pub post_only: bool,
    pub expiration_block: Option<u64>,
    /// Conditional orders only
    pub trigger_price: Option<Decimal>,
}

impl OrderRequest {
    pub fn new(market_id: MarketId, side: Side, info: OrderInfo, margin: Decimal) -> Self {
        Self {
            market_id,
            side,
            info,
            margin,
            post_only: false,
            expiration_block: None,
            trigger_price: None,
        }
    }

    pub fn reduce_only(market_id: MarketId, side: Side, info: OrderInfo) -> Self {
        Self::new(market_id, side, info, Decimal::ZERO)
    }

    pub fn post_only(mut self) -> Self {
        self.post_only = true;
        self
    }

    pub fn expires_at(mut self, block_height: u64) -> Self {
        self.expiration_block = Some(block_height);
        self
    }

    pub fn with_trigger(mut self, trigger_price: Decimal) -> Self {
        self.trigger_price = Some(trigger_price);
        self
    }

    pub fn is_reduce_only(&self) -> bool {
        self.margin.is_zero()
    }

    /// Margin plus the fee at `taker_fee_rate`, locked until the order fills or is cancelled.
    fn hold(&self, quantity: Decimal, taker_fee_rate: Decimal) -> Decimal {
        if self.is_reduce_only() {
            return Decimal::ZERO;
        }
        self.margin + order_fee_hold(self.info.price, quantity, taker_fee_rate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderType {
    Limit,
    Market,
    Conditional,
}

/// Order in which resting orders are considered when freeing funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CancellationStrategy {
    /// Book order
    #[default]
    Unsorted,
    /// Farthest from the reference price first
    FromWorstToBest,
    /// Closest to the reference price first
    FromBestToWorst,
}

/// A resting order picked to free funds, and what cancelling it returns.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderToCancel {
    pub hash: OrderHash,
    pub refund: Decimal,
}

fn is_tick_multiple(value: Decimal, tick: Decimal) -> bool {
    tick.is_zero() || (value % tick).is_zero()
}

// 8.2.1: everything that can be checked without touching balances.
fn validate_request(
    state: &MarketState,
    request: &OrderRequest,
    order_type: OrderType,
    mark_price: Option<Decimal>,
) -> Result<(), EngineError> {
    let market = &state.market;
    let params = market.params();
    if !market.is_active() {
        return Err(OrderError::MarketNotActive(market.id()).into());
    }

    let info = &request.info;
    if info.price <= Decimal::ZERO || info.quantity <= Decimal::ZERO {
        return Err(OrderError::NonPositiveAmount.into());
    }
    if !is_tick_multiple(info.price, params.min_price_tick_size) {
        return Err(OrderError::InvalidPriceTick {
            price: info.price,
            tick: params.min_price_tick_size,
        }
        .into());
    }
    if !is_tick_multiple(info.quantity, params.min_quantity_tick_size) {
        return Err(OrderError::InvalidQuantityTick {
            quantity: info.quantity,
            tick: params.min_quantity_tick_size,
        }
        .into());
    }
    let notional = info.price * info.quantity;
    if notional < params.min_notional {
        return Err(OrderError::BelowMinNotional {
            notional,
            min: params.min_notional,
        }
        .into());
    }
    if let Some(cid) = &info.cid {
        if state.cid_in_use(info.subaccount_id, cid) {
            return Err(OrderError::DuplicateClientId(cid.clone()).into());
        }
    }

    let is_buy = request.side.is_buy();
    validate_order_margin(market, is_buy, info.price, info.quantity, request.margin, mark_price)?;

    if request.is_reduce_only() {
        validate_reduce_only(state, request, order_type)?;
    }

    if request.post_only && order_type == OrderType::Limit {
        if let Some(best) = state.resting.best_price(request.side.opposite()) {
            let crosses = if is_buy { info.price >= best } else { info.price <= best };
            if crosses {
                return Err(OrderError::PostOnlyWouldCross { price: info.price }.into());
            }
        }
    }

    let cap = market.open_notional_cap();
    if !request.is_reduce_only() && cap.is_capped() {
        let mark_price = mark_price.ok_or(OrderError::NoMarkPrice(market.id()))?;
        let signed_position = state
            .position(info.subaccount_id)
            .map(|p| p.signed_quantity())
            .unwrap_or_default();
        let values = values_for_notional_cap_checks(is_buy, info.quantity, mark_price, signed_position);
        let (breaches, _) = does_breach_open_notional_cap(cap, values.notional_delta, open_notional(state.open_interest, mark_price));
        if breaches {
            return Err(OrderError::OpenNotionalCapBreached.into());
        }
    }
    Ok(())
}

fn validate_reduce_only(state: &MarketState, request: &OrderRequest, order_type: OrderType) -> Result<(), EngineError> {
    let market = &state.market;
    let mut position = state
        .position(request.info.subaccount_id)
        .filter(|p| !p.is_empty())
        .cloned()
        .ok_or(OrderError::NoPositionForReduceOnly)?;
    if position.is_long == request.side.is_buy() {
        return Err(OrderError::InvalidReduceOnlyDirection.into());
    }
    // conditional orders are checked against the position when they trigger
    if order_type == OrderType::Conditional {
        return Ok(());
    }

    position.apply_funding(market.funding());
    position.check_valid_position_to_reduce(
        request.info.price,
        request.side.is_buy(),
        market.taker_fee_rate(),
        Decimal::ZERO,
        market.is_binary_options(),
    )?;
    if order_type == OrderType::Market && request.info.quantity > position.quantity {
        return Err(OrderError::InsufficientPositionQuantity.into());
    }
    Ok(())
}

/// The subaccount's open limit orders on the request's side, best first, resting before transient at a level.
fn subaccount_orders(state: &MarketState, subaccount_id: SubaccountId, side: Side) -> Vec<SubaccountOrder> {
    let mut orders: Vec<SubaccountOrder> = state
        .subaccount_resting_orders(subaccount_id, side)
        .iter()
        .chain(state.subaccount_transient_orders(subaccount_id, side).iter())
        .map(SubaccountOrder::from)
        .collect();
    orders.sort_by(|a, b| match side {
        Side::Buy => b.price.cmp(&a.price),
        Side::Sell => a.price.cmp(&b.price),
    });
    orders
}

fn reduce_only_resolution(state: &MarketState, request: &OrderRequest) -> Result<ReduceOnlyResolution, OrderError> {
    let subaccount_id = request.info.subaccount_id;
    let metadata = state.metadata(subaccount_id, request.side);
    let orders = subaccount_orders(state, subaccount_id, request.side);
    resolve_reduce_only_conflicts(
        state.position(subaccount_id),
        request.side,
        request.info.price,
        request.info.quantity,
        request.is_reduce_only(),
        &metadata,
        &orders,
    )
}

/// Remaining margin plus the positive maker fee of the open quantity.
fn resting_refund(order: &DerivativeLimitOrder, maker_fee_rate: Decimal) -> Decimal {
    order.cancel_refund(maker_fee_rate)
}

impl Engine {
    pub fn place_limit_order(&mut self, request: OrderRequest) -> Result<PlacedOrder, EngineError> {
        self.admit(request, OrderType::Limit)
    }

    pub fn place_market_order(&mut self, request: OrderRequest) -> Result<PlacedOrder, EngineError> {
        self.admit(request, OrderType::Market)
    }

    // 8.2.3: an atomic market order trades against the resting book right away instead of
    // waiting for the block, at the taker rate times the market kind's multiplier.
    pub fn place_atomic_market_order(&mut self, request: OrderRequest) -> Result<AtomicOrderResult, EngineError> {
        let market_id = request.market_id;
        let mark_price = self.mark_price(market_id);
        let state = self.state(market_id)?;
        validate_request(state, &request, OrderType::Market, mark_price)?;
        let resolution = reduce_only_resolution(state, &request)?;
        let denom = state.market.quote_denom().to_string();
        let fee_rate = state.market.taker_fee_rate() * self.config.atomic_fee_multiplier(state.market.kind());

        let quantity = resolution.resized_quantity.unwrap_or(request.info.quantity);
        let hold = request.hold(quantity, fee_rate);
        let subaccount_id = request.info.subaccount_id;
        self.charge(subaccount_id, &denom, hold)?;

        let hash = self.store.next_order_hash();
        let mut info = request.info;
        info.quantity = quantity;
        let order = DerivativeMarketOrder {
            hash,
            market_id,
            side: request.side,
            info,
            margin: request.margin,
            margin_hold: hold,
        };
        let (batch, result) = self.atomic_batch(market_id, order.clone(), fee_rate, mark_price)?;
        let Some(result) = result else {
            self.release_hold(subaccount_id, &denom, hold);
            debug!(market = ?market_id, order = %hash, "atomic order found nothing to trade against");
            return Err(EngineError::NoLiquidity(market_id));
        };

        for conflict in &resolution.cancels {
            self.cancel_limit_order(market_id, *conflict, CancelReason::ReduceOnlyConflict)?;
        }
        // an insolvent batch puts the order back in the queue, where the pause cancels and refunds it
        let Some(vwap) = self.commit_batch(market_id, batch, TakenOrders::Market(vec![order]), true)? else {
            return Err(EngineError::InsolventMarket(market_id));
        };
        self.accrue_vwap(market_id, &vwap)?;
        info!(
            market = ?market_id,
            order = %hash,
            filled = %result.filled_quantity,
            price = %result.price,
            fee = %result.fee,
            "atomic order executed"
        );
        Ok(result)
    }

    /// The single order against the whole resting book. None when nothing filled.
    fn atomic_batch(
        &self,
        market_id: MarketId,
        order: DerivativeMarketOrder,
        fee_rate: Decimal,
        mark_price: Option<Decimal>,
    ) -> Result<(BatchExecutionData, Option<AtomicOrderResult>), EngineError> {
        let state = self.state(market_id)?;
        let hash = order.hash;
        let is_buy = order.is_buy();
        let (market_buys, market_sells) = if is_buy { (vec![order], Vec::new()) } else { (Vec::new(), vec![order]) };
        let input = MarketMatchingInput {
            market_buys,
            market_sells,
            resting_buys: state.resting_side(Side::Buy),
            resting_sells: state.resting_side(Side::Sell),
            taker_fee_rate: Some(fee_rate),
        };

        let ctx = ExpansionContext {
            market: &state.market,
            discounts: &self.discounts,
            bank: self.bank.as_ref(),
            is_liquidation: false,
        };
        let positions = PositionCache::new(state.positions_snapshot(), state.market.funding().cloned());
        let session = MatchingSession::new(&state.market, mark_price, current_open_notional(state.open_interest, mark_price), positions);
        let data = market_order_execution_data(&ctx, session, input);

        let side = if is_buy { &data.buy } else { &data.sell };
        let result = match (side.clearing_price, side.market_expansions.first()) {
            (Some(price), Some(expansion)) if !side.clearing_quantity.is_zero() => Some(AtomicOrderResult {
                hash,
                filled_quantity: side.clearing_quantity,
                price,
                fee: expansion.fee.trader_fee,
                payout: expansion.payout,
            }),
            _ => None,
        };
        Ok((BatchExecutionData::from_market_matching(&state.market, data, false), result))
    }

    fn release_hold(&mut self, subaccount_id: SubaccountId, denom: &str, hold: Decimal) {
        if hold > Decimal::ZERO {
            self.bank.increment_available_balance_or_bank(subaccount_id, denom, hold);
        }
    }

    fn admit(&mut self, request: OrderRequest, order_type: OrderType) -> Result<PlacedOrder, EngineError> {
        let market_id = request.market_id;
        let mark_price = self.mark_price(market_id);
        let state = self.state(market_id)?;
        validate_request(state, &request, order_type, mark_price)?;
        let resolution = reduce_only_resolution(state, &request)?;
        let denom = state.market.quote_denom().to_string();
        let taker_fee_rate = state.market.taker_fee_rate();

        let quantity = resolution.resized_quantity.unwrap_or(request.info.quantity);
        let hold = request.hold(quantity, taker_fee_rate);
        self.charge(request.info.subaccount_id, &denom, hold)?;

        for hash in &resolution.cancels {
            self.cancel_limit_order(market_id, *hash, CancelReason::ReduceOnlyConflict)?;
        }

        let hash = self.store.next_order_hash();
        let subaccount_id = request.info.subaccount_id;
        let side = request.side;
        let mut info = request.info;
        info.quantity = quantity;
        let state = self.state_mut(market_id)?;
        match order_type {
            OrderType::Market => {
                state.transient_market_orders.push(DerivativeMarketOrder {
                    hash,
                    market_id,
                    side,
                    info,
                    margin: request.margin,
                    margin_hold: hold,
                });
            }
            _ => {
                let mut order = DerivativeLimitOrder::new(hash, market_id, side, info, request.margin);
                order.post_only = request.post_only;
                order.expiration_block = request.expiration_block;
                state.metadata_mut(subaccount_id, side).add_order(order.is_reduce_only(), order.fillable);
                state.register_cid(subaccount_id, order.info.cid.as_deref(), hash);
                state.transient_limit_orders.push(order);
            }
        }
        debug!(market = ?market_id, order = %hash, ?side, %quantity, %hold, "order placed");

        Ok(PlacedOrder {
            hash,
            quantity,
            cancelled_reduce_only: resolution.cancels,
        })
    }

    // 8.2.2: conditional orders are validated against their trigger price and wait in the
    // conditional book until the mark price reaches it.
    pub fn place_conditional_order(&mut self, request: OrderRequest, kind: ConditionalKind) -> Result<PlacedOrder, EngineError> {
        let market_id = request.market_id;
        let trigger_price = request.trigger_price.ok_or(OrderError::MissingTriggerPrice)?;
        let mark_price = self.mark_price(market_id);
        let state = self.state(market_id)?;
        let mark_price = mark_price.ok_or(OrderError::NoMarkPrice(market_id))?;
        let direction = TriggerDirection::from_prices(trigger_price, mark_price)?;
        validate_request(state, &request, OrderType::Conditional, Some(trigger_price))?;

        let subaccount_id = request.info.subaccount_id;
        if kind == ConditionalKind::Market && state.conditional.has_market_order_in_direction(subaccount_id, direction) {
            return Err(OrderError::ConditionalMarketOrderExists.into());
        }
        let denom = state.market.quote_denom().to_string();
        let taker_fee_rate = state.market.taker_fee_rate();

        let mut order = ConditionalOrder {
            hash: OrderHash::default(),
            market_id,
            side: request.side,
            kind,
            info: request.info,
            margin: request.margin,
            trigger_price,
            direction,
        };
        self.charge(subaccount_id, &denom, order.hold(taker_fee_rate))?;

        order.hash = self.store.next_order_hash();
        let hash = order.hash;
        let quantity = order.quantity();
        let state = self.state_mut(market_id)?;
        state.metadata_mut(subaccount_id, order.side).add_conditional(order.is_reduce_only());
        state.register_cid(subaccount_id, order.info.cid.as_deref(), hash);
        state.conditional.insert(order);
        debug!(market = ?market_id, order = %hash, %trigger_price, ?direction, "conditional order placed");

        Ok(PlacedOrder {
            hash,
            quantity,
            cancelled_reduce_only: Vec::new(),
        })
    }

    pub(super) fn charge(&mut self, subaccount_id: SubaccountId, denom: &str, amount: Decimal) -> Result<(), EngineError> {
        if amount <= Decimal::ZERO {
            return Ok(());
        }
        let available = self.bank.spendable_funds(subaccount_id, denom);
        if available < amount {
            return Err(OrderError::InsufficientFunds {
                required: amount,
                available,
            }
            .into());
        }
        self.bank.charge_account(subaccount_id, denom, amount)?;
        Ok(())
    }

    /// Cancels any open order of `subaccount_id`: resting, transient or conditional.
    pub fn cancel_order(&mut self, market_id: MarketId, subaccount_id: SubaccountId, hash: OrderHash) -> Result<(), EngineError> {
        let state = self.state(market_id)?;
        let owned = |sub: SubaccountId| sub == subaccount_id;
        let reason = CancelReason::UserRequested;

        if state.resting.get(hash).is_some_and(|o| owned(o.subaccount_id())) {
            self.cancel_resting_order(market_id, hash, reason)
        } else if state.transient_limit_orders.iter().any(|o| o.hash == hash && owned(o.subaccount_id())) {
            self.cancel_transient_limit_order(market_id, hash, reason)
        } else if state.transient_market_orders.iter().any(|o| o.hash == hash && owned(o.subaccount_id())) {
            self.cancel_transient_market_order(market_id, hash, reason)
        } else if state.conditional.get(hash).is_some_and(|o| owned(o.subaccount_id())) {
            self.cancel_conditional_order(market_id, hash, reason)
        } else {
            Err(OrderError::NotFound(hash).into())
        }
    }

    pub fn cancel_order_by_cid(&mut self, market_id: MarketId, subaccount_id: SubaccountId, cid: &str) -> Result<(), EngineError> {
        let hash = self
            .state(market_id)?
            .order_by_cid(subaccount_id, cid)
            .ok_or_else(|| OrderError::UnknownClientId(cid.to_string()))?;
        self.cancel_order(market_id, subaccount_id, hash)
    }

    /// Resting or transient limit order, whichever holds `hash`.
    pub(super) fn cancel_limit_order(&mut self, market_id: MarketId, hash: OrderHash, reason: CancelReason) -> Result<(), EngineError> {
        if self.state(market_id)?.resting.get(hash).is_some() {
            self.cancel_resting_order(market_id, hash, reason)
        } else {
            self.cancel_transient_limit_order(market_id, hash, reason)
        }
    }

    pub(super) fn cancel_resting_order(&mut self, market_id: MarketId, hash: OrderHash, reason: CancelReason) -> Result<(), EngineError> {
        let state = self.state_mut(market_id)?;
        let order = state.resting.remove(hash).ok_or(OrderError::NotFound(hash))?;
        let refund = resting_refund(&order, state.market.maker_fee_rate());
        self.finish_limit_cancel(market_id, order, refund, reason)
    }

    pub(super) fn cancel_transient_limit_order(&mut self, market_id: MarketId, hash: OrderHash, reason: CancelReason) -> Result<(), EngineError> {
        let state = self.state_mut(market_id)?;
        let order = state.remove_transient_limit_order(hash).ok_or(OrderError::NotFound(hash))?;
        let refund = order.cancel_refund(state.market.taker_fee_rate());
        self.finish_limit_cancel(market_id, order, refund, reason)
    }

    fn finish_limit_cancel(&mut self, market_id: MarketId, order: DerivativeLimitOrder, refund: Decimal, reason: CancelReason) -> Result<(), EngineError> {
        let state = self.state_mut(market_id)?;
        let subaccount_id = order.subaccount_id();
        state.metadata_mut(subaccount_id, order.side).remove_order(order.is_reduce_only(), order.fillable);
        state.release_cid(subaccount_id, order.info.cid.as_deref());
        let denom = state.market.quote_denom().to_string();
        self.refund_cancelled(
            &denom,
            OrderCancelledEvent {
                market_id,
                order_hash: order.hash,
                subaccount_id,
                is_limit: true,
                cancel_quantity: order.fillable,
                refund,
                reason,
            },
        );
        Ok(())
    }

    pub(super) fn cancel_transient_market_order(&mut self, market_id: MarketId, hash: OrderHash, reason: CancelReason) -> Result<(), EngineError> {
        let state = self.state_mut(market_id)?;
        let order = state.remove_transient_market_order(hash).ok_or(OrderError::NotFound(hash))?;
        let denom = state.market.quote_denom().to_string();
        self.refund_cancelled(
            &denom,
            OrderCancelledEvent {
                market_id,
                order_hash: hash,
                subaccount_id: order.subaccount_id(),
                is_limit: false,
                cancel_quantity: order.quantity(),
                refund: order.margin_hold,
                reason,
            },
        );
        Ok(())
    }

    pub(super) fn cancel_conditional_order(&mut self, market_id: MarketId, hash: OrderHash, reason: CancelReason) -> Result<(), EngineError> {
        let state = self.state_mut(market_id)?;
        let order = state.conditional.remove(hash).ok_or(OrderError::NotFound(hash))?;
        let subaccount_id = order.subaccount_id();
        state.metadata_mut(subaccount_id, order.side).remove_conditional(order.is_reduce_only());
        state.release_cid(subaccount_id, order.info.cid.as_deref());
        let refund = order.hold(state.market.taker_fee_rate());
        let denom = state.market.quote_denom().to_string();
        self.refund_cancelled(
            &denom,
            OrderCancelledEvent {
                market_id,
                order_hash: hash,
                subaccount_id,
                is_limit: order.is_limit(),
                cancel_quantity: order.quantity(),
                refund,
                reason,
            },
        );
        Ok(())
    }

    fn refund_cancelled(&mut self, denom: &str, cancelled: OrderCancelledEvent) {
        if cancelled.refund > Decimal::ZERO {
            self.bank
                .increment_available_balance_or_bank(cancelled.subaccount_id, denom, cancelled.refund);
        }
        debug!(
            market = ?cancelled.market_id,
            order = %cancelled.order_hash,
            reason = ?cancelled.reason,
            refund = %cancelled.refund,
            "order cancelled"
        );
        self.emit_event(EventPayload::OrderCancelled(cancelled));
    }

    pub(super) fn cancel_all_resting_orders(&mut self, market_id: MarketId, reason: CancelReason) -> Result<usize, EngineError> {
        let hashes = self.state(market_id)?.resting.hashes();
        for hash in &hashes {
            self.cancel_resting_order(market_id, *hash, reason)?;
        }
        Ok(hashes.len())
    }

    pub(super) fn cancel_all_transient_orders(&mut self, market_id: MarketId, include_market_orders: bool, reason: CancelReason) -> Result<usize, EngineError> {
        let state = self.state(market_id)?;
        let limit_hashes: Vec<OrderHash> = state.transient_limit_orders.iter().map(|o| o.hash).collect();
        let market_hashes: Vec<OrderHash> = if include_market_orders {
            state.transient_market_orders.iter().map(|o| o.hash).collect()
        } else {
            Vec::new()
        };
        for hash in &limit_hashes {
            self.cancel_transient_limit_order(market_id, *hash, reason)?;
        }
        for hash in &market_hashes {
            self.cancel_transient_market_order(market_id, *hash, reason)?;
        }
        Ok(limit_hashes.len() + market_hashes.len())
    }

    pub(super) fn cancel_all_conditional_orders(&mut self, market_id: MarketId, reason: CancelReason) -> Result<usize, EngineError> {
        let hashes = self.state(market_id)?.conditional.hashes();
        for hash in &hashes {
            self.cancel_conditional_order(market_id, *hash, reason)?;
        }
        Ok(hashes.len())
    }

    /// Resting, transient limit and conditional orders, plus transient market orders when asked.
    pub(super) fn cancel_all_orders(&mut self, market_id: MarketId, include_market_orders: bool, reason: CancelReason) -> Result<usize, EngineError> {
        let mut cancelled = self.cancel_all_transient_orders(market_id, include_market_orders, reason)?;
        cancelled += self.cancel_all_resting_orders(market_id, reason)?;
        cancelled += self.cancel_all_conditional_orders(market_id, reason)?;
        Ok(cancelled)
    }

    /// Cancels resting orders whose expiration block has been reached.
    pub(super) fn cancel_expired_orders(&mut self) -> Result<usize, EngineError> {
        let height = self.block.height;
        let mut cancelled = 0;
        for market_id in self.store.market_ids() {
            let expired: Vec<OrderHash> = self
                .state(market_id)?
                .resting
                .iter()
                .filter(|o| o.is_expired(height))
                .map(|o| o.hash)
                .collect();
            for hash in expired {
                self.cancel_resting_order(market_id, hash, CancelReason::Expired)?;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    // 8.2.3: picks vanilla resting orders of a subaccount until their refunds reach `amount`.
    // returns the picks and whether they cover the full amount.
    pub fn orders_to_cancel_up_to_amount(
        &self,
        market_id: MarketId,
        subaccount_id: SubaccountId,
        side: Option<Side>,
        strategy: CancellationStrategy,
        reference_price: Option<Decimal>,
        amount: Decimal,
    ) -> Result<(Vec<OrderToCancel>, bool), EngineError> {
        let state = self.state(market_id)?;
        let maker_fee_rate = state.market.maker_fee_rate();
        let mut orders: Vec<&DerivativeLimitOrder> = state
            .resting
            .iter()
            .filter(|o| o.subaccount_id() == subaccount_id && !o.is_reduce_only())
            .filter(|o| side.map_or(true, |s| s == o.side))
            .collect();

        if let Some(reference) = reference_price {
            let distance = |o: &DerivativeLimitOrder| if o.is_buy() { reference - o.price() } else { o.price() - reference };
            match strategy {
                CancellationStrategy::FromWorstToBest => orders.sort_by(|a, b| distance(b).cmp(&distance(a))),
                CancellationStrategy::FromBestToWorst => orders.sort_by(|a, b| distance(a).cmp(&distance(b))),
                CancellationStrategy::Unsorted => {}
            }
        }

        let mut picked = Vec::new();
        let mut cumulative = Decimal::ZERO;
        for order in orders {
            if cumulative >= amount {
                break;
            }
            let refund = resting_refund(order, maker_fee_rate);
            cumulative += refund;
            picked.push(OrderToCancel { hash: order.hash, refund });
        }
        Ok((picked, cumulative >= amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::interfaces::{BankKeeper, InMemoryBank, InMemoryInsurance, MockOracle};
    use crate::market::MarketParams;
    use crate::position::Position;
    use rust_decimal_macros::dec;

    const TRADER: SubaccountId = SubaccountId(1);
    const SELLER: SubaccountId = SubaccountId(2);

    fn engine() -> (Engine, MarketId) {
        let oracle = MockOracle::new();
        let params = MarketParams::btc_perp(MarketId(1));
        oracle.set_price(&params.oracle, dec!(100));
        let mut bank = InMemoryBank::new();
        bank.fund(TRADER, &params.quote_denom, dec!(10000));
        bank.fund(SELLER, &params.quote_denom, dec!(10000));
        let mut engine = Engine::new(
            EngineConfig::default(),
            Box::new(oracle),
            Box::new(InMemoryInsurance::new().with_fund(MarketId(1), dec!(1000))),
            Box::new(bank),
        );
        let id = engine.launch_perpetual_market(params).unwrap();
        (engine, id)
    }

    fn buy(price: Decimal, quantity: Decimal, margin: Decimal) -> OrderRequest {
        OrderRequest::new(MarketId(1), Side::Buy, OrderInfo::new(TRADER, price, quantity), margin)
    }

    fn available(engine: &Engine) -> Decimal {
        engine.bank().deposit(TRADER, "USDT").available
    }

    #[test]
    fn placement_charges_margin_and_taker_fee() {
        let (mut engine, id) = engine();
        let placed = engine.place_limit_order(buy(dec!(100), dec!(1), dec!(50))).unwrap();
        let taker = engine.market(id).unwrap().taker_fee_rate();
        assert_eq!(available(&engine), dec!(10000) - dec!(50) - dec!(100) * taker);
        assert_eq!(engine.market_state(id).unwrap().transient_limit_orders.len(), 1);
        assert_eq!(placed.quantity, dec!(1));
    }

    #[test]
    fn admission_rejections() {
        let (mut engine, _) = engine();
        assert!(matches!(
            engine.place_limit_order(buy(dec!(100), dec!(1), dec!(1))),
            Err(EngineError::Order(OrderError::InsufficientOrderMargin { .. }))
        ));
        assert!(matches!(
            engine.place_limit_order(buy(dec!(100.003), dec!(1), dec!(50))),
            Err(EngineError::Order(OrderError::InvalidPriceTick { .. }))
        ));
        assert!(matches!(
            engine.place_limit_order(buy(dec!(100), dec!(0), dec!(50))),
            Err(EngineError::Order(OrderError::NonPositiveAmount))
        ));
        assert!(matches!(
            engine.place_limit_order(buy(dec!(100), dec!(1000), dec!(50000))),
            Err(EngineError::Order(OrderError::InsufficientFunds { .. }))
        ));
        assert!(matches!(
            engine.place_market_order(OrderRequest::reduce_only(MarketId(1), Side::Sell, OrderInfo::new(TRADER, dec!(90), dec!(1)))),
            Err(EngineError::Order(OrderError::NoPositionForReduceOnly))
        ));
        assert_eq!(available(&engine), dec!(10000));
    }

    #[test]
    fn duplicate_client_id_is_rejected_until_cancelled() {
        let (mut engine, id) = engine();
        let request = OrderRequest::new(id, Side::Buy, OrderInfo::new(TRADER, dec!(100), dec!(1)).with_cid("a"), dec!(50));
        engine.place_limit_order(request.clone()).unwrap();
        assert!(matches!(
            engine.place_limit_order(request.clone()),
            Err(EngineError::Order(OrderError::DuplicateClientId(_)))
        ));
        engine.cancel_order_by_cid(id, TRADER, "a").unwrap();
        assert!(engine.place_limit_order(request).is_ok());
    }

    #[test]
    fn cancel_refunds_everything_held() {
        let (mut engine, id) = engine();
        let placed = engine.place_limit_order(buy(dec!(100), dec!(1), dec!(50))).unwrap();
        engine.cancel_order(id, TRADER, placed.hash).unwrap();
        assert_eq!(available(&engine), dec!(10000));
        assert!(matches!(
            engine.cancel_order(id, TRADER, placed.hash),
            Err(EngineError::Order(OrderError::NotFound(_)))
        ));
        let metadata = engine.market_state(id).unwrap().metadata(TRADER, Side::Buy);
        assert_eq!(metadata.vanilla_limit_order_count, 0);
    }

    #[test]
    fn reduce_only_market_order_cannot_exceed_position() {
        let (mut engine, id) = engine();
        let state = engine.state_mut(id).unwrap();
        let mut position = Position::new(true, Decimal::ZERO);
        position.quantity = dec!(2);
        position.entry_price = dec!(100);
        position.margin = dec!(100);
        state.set_position(TRADER, position);

        let sell = |quantity| OrderRequest::reduce_only(id, Side::Sell, OrderInfo::new(TRADER, dec!(99), quantity));
        assert!(matches!(
            engine.place_market_order(sell(dec!(3))),
            Err(EngineError::Order(OrderError::InsufficientPositionQuantity))
        ));
        assert!(engine.place_market_order(sell(dec!(2))).is_ok());
    }

    #[test]
    fn conditional_orders_need_a_direction() {
        let (mut engine, id) = engine();
        let at_mark = buy(dec!(100), dec!(1), dec!(50)).with_trigger(dec!(100));
        assert!(matches!(
            engine.place_conditional_order(at_mark, ConditionalKind::Limit),
            Err(EngineError::Order(OrderError::InvalidTriggerPrice { .. }))
        ));

        let stop = buy(dec!(110), dec!(1), dec!(60)).with_trigger(dec!(105));
        engine.place_conditional_order(stop.clone(), ConditionalKind::Market).unwrap();
        assert!(matches!(
            engine.place_conditional_order(stop, ConditionalKind::Market),
            Err(EngineError::Order(OrderError::ConditionalMarketOrderExists))
        ));
        assert_eq!(engine.market_state(id).unwrap().conditional.len(), 1);
    }

    #[test]
    fn cheapest_orders_are_picked_first_when_sorted() {
        let (mut engine, id) = engine();
        engine.place_limit_order(buy(dec!(90), dec!(1), dec!(45))).unwrap();
        engine.place_limit_order(buy(dec!(80), dec!(1), dec!(40))).unwrap();
        engine.end_block().unwrap();

        let (picked, covered) = engine
            .orders_to_cancel_up_to_amount(id, TRADER, Some(Side::Buy), CancellationStrategy::FromWorstToBest, Some(dec!(100)), dec!(30))
            .unwrap();
        assert!(covered);
        assert_eq!(picked.len(), 1);
        assert_eq!(engine.market_state(id).unwrap().resting.get(picked[0].hash).unwrap().price(), dec!(80));
    }

    fn resting_sell(engine: &mut Engine, id: MarketId, price: Decimal, quantity: Decimal) {
        let request = OrderRequest::new(id, Side::Sell, OrderInfo::new(SELLER, price, quantity), price * quantity);
        engine.place_limit_order(request).unwrap();
        engine.end_block().unwrap();
    }

    #[test]
    fn atomic_order_fills_at_once_with_multiplied_fee() {
        let (mut engine, id) = engine();
        resting_sell(&mut engine, id, dec!(100), dec!(2));

        let result = engine.place_atomic_market_order(buy(dec!(101), dec!(3), dec!(150))).unwrap();
        assert_eq!(result.filled_quantity, dec!(2));
        assert_eq!(result.price, dec!(100));
        // 2 × 100 × 0.001 × 2.5
        assert_eq!(result.fee, dec!(0.5));

        let position = engine.position(id, TRADER).unwrap();
        assert!(position.is_long);
        assert_eq!(position.quantity, dec!(2));
        // the unfilled 1 and its fee hold come back, nothing waits for the block
        assert_eq!(available(&engine), dec!(10000) - position.margin - dec!(0.5));
        let state = engine.market_state(id).unwrap();
        assert!(state.resting.is_empty());
        assert!(state.transient_market_orders.is_empty());
    }

    #[test]
    fn atomic_order_without_liquidity_is_rejected_and_refunded() {
        let (mut engine, id) = engine();
        resting_sell(&mut engine, id, dec!(102), dec!(2));

        assert!(matches!(
            engine.place_atomic_market_order(buy(dec!(101), dec!(1), dec!(60))),
            Err(EngineError::NoLiquidity(_))
        ));
        assert_eq!(available(&engine), dec!(10000));
        assert!(engine.position(id, TRADER).is_none());
        assert_eq!(engine.market_state(id).unwrap().resting.len(), 1);
    }

    #[test]
    fn atomic_order_ignores_orders_still_waiting_for_the_block() {
        let (mut engine, id) = engine();
        let request = OrderRequest::new(id, Side::Sell, OrderInfo::new(SELLER, dec!(100), dec!(1)), dec!(100));
        engine.place_limit_order(request).unwrap();
        assert!(matches!(
            engine.place_atomic_market_order(buy(dec!(101), dec!(1), dec!(60))),
            Err(EngineError::NoLiquidity(_))
        ));
        assert_eq!(engine.market_state(id).unwrap().transient_limit_orders.len(), 1);
    }
}
