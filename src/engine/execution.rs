// 8.3 engine/execution.rs: the block pipeline.
// begin_block: expired orders, scheduled settlements, expiry and binary options, hourly funding.
// end_block: conditional triggers, then per market a market-order pass and a limit pass,
// each computed against a snapshot and persisted only if the market can pay for it.

use super::core::Engine;
use super::results::{BlockSummary, EngineError};
use crate::batch::{BatchExecutionData, VwapData};
use crate::events::{CancelReason, EventPayload, FundingUpdateEvent};
use crate::expansion::ExpansionContext;
use crate::funding::accrue_vwap_premium;
use crate::matching::{limit_matching_execution_data, market_order_execution_data, LimitMatchingInput, MarketMatchingInput};
use crate::order::{DerivativeLimitOrder, DerivativeMarketOrder};
use crate::orderbook::MatchingSession;
use crate::position::PositionCache;
use crate::reduce_only::{transient_reduce_only_cancels, SubaccountOrder};
use crate::risk::open_notional;
use crate::types::{BlockContext, MarketId, OrderHash, Side};
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

/// What a pass took out of the transient queues, put back when the batch is discarded.
pub(super) enum TakenOrders {
    Limit(Vec<DerivativeLimitOrder>),
    Market(Vec<DerivativeMarketOrder>),
}

impl Engine {
    pub fn begin_block(&mut self, ctx: BlockContext) -> Result<BlockSummary, EngineError> {
        self.block = ctx;
        let mut summary = BlockSummary {
            cancelled_expired: self.cancel_expired_orders()?,
            ..BlockSummary::default()
        };
        summary.settled_markets.extend(self.process_scheduled_settlements()?);
        summary.settled_markets.extend(self.process_expiry_markets()?);
        summary.settled_markets.extend(self.process_binary_options()?);
        summary.funded_markets = self.process_hourly_funding()?;
        info!(
            height = ctx.height,
            time = %ctx.time,
            settled = summary.settled_markets.len(),
            funded = summary.funded_markets.len(),
            "block started"
        );
        Ok(summary)
    }

    pub fn end_block(&mut self) -> Result<BlockSummary, EngineError> {
        let mut summary = BlockSummary {
            triggered_orders: self.trigger_conditional_orders()?,
            ..BlockSummary::default()
        };

        for market_id in self.store.market_ids() {
            if !self.state(market_id)?.market.is_active() {
                self.cancel_all_transient_orders(market_id, true, CancelReason::MatchingValidation)?;
                continue;
            }

            let mut vwap = VwapData::default();
            let mut executed = false;
            match self.execute_market_orders(market_id)? {
                Some(batch_vwap) => {
                    executed = true;
                    merge_vwap(&mut vwap, &batch_vwap);
                }
                None if !self.state(market_id)?.market.is_active() => {
                    summary.insolvent_markets.push(market_id);
                    continue;
                }
                None => {}
            }

            self.cancel_excess_transient_reduce_only(market_id)?;
            match self.execute_limit_orders(market_id)? {
                Some(batch_vwap) => {
                    executed = true;
                    merge_vwap(&mut vwap, &batch_vwap);
                }
                None if !self.state(market_id)?.market.is_active() => {
                    summary.insolvent_markets.push(market_id);
                }
                None => {}
            }

            self.accrue_vwap(market_id, &vwap)?;
            self.state_mut(market_id)?.modified_by_market_orders.clear();
            if executed {
                summary.executed_markets.push(market_id);
            }
        }
        debug!(
            height = self.block.height,
            triggered = summary.triggered_orders,
            executed = summary.executed_markets.len(),
            "block ended"
        );
        Ok(summary)
    }

    // 8.3.1: market orders against the resting book. None when nothing ran or the batch was discarded.
    fn execute_market_orders(&mut self, market_id: MarketId) -> Result<Option<VwapData>, EngineError> {
        let mark_price = self.mark_price(market_id);
        let state = self.state_mut(market_id)?;
        if state.transient_market_orders.is_empty() {
            return Ok(None);
        }
        let (market_buys, market_sells) = state.take_transient_market_orders();
        let taken: Vec<DerivativeMarketOrder> = market_buys.iter().chain(market_sells.iter()).cloned().collect();
        let input = MarketMatchingInput {
            market_buys,
            market_sells,
            resting_buys: state.resting_side(Side::Buy),
            resting_sells: state.resting_side(Side::Sell),
            taker_fee_rate: None,
        };

        let state = self.state(market_id)?;
        let ctx = ExpansionContext {
            market: &state.market,
            discounts: &self.discounts,
            bank: self.bank.as_ref(),
            is_liquidation: false,
        };
        let positions = PositionCache::new(state.positions_snapshot(), state.market.funding().cloned());
        let session = MatchingSession::new(&state.market, mark_price, current_open_notional(state.open_interest, mark_price), positions);
        let data = market_order_execution_data(&ctx, session, input);
        let batch = BatchExecutionData::from_market_matching(&state.market, data, false);

        self.commit_batch(market_id, batch, TakenOrders::Market(taken), true)
    }

    // 8.3.2: the batch auction between this block's limit orders and the resting book.
    fn execute_limit_orders(&mut self, market_id: MarketId) -> Result<Option<VwapData>, EngineError> {
        let mark_price = self.mark_price(market_id);
        let state = self.state_mut(market_id)?;
        if state.transient_limit_orders.is_empty() {
            return Ok(None);
        }
        let (transient_buys, transient_sells) = state.take_transient_limit_orders();
        let taken: Vec<DerivativeLimitOrder> = transient_buys.iter().chain(transient_sells.iter()).cloned().collect();
        let input = LimitMatchingInput {
            resting_buys: state.resting_side(Side::Buy),
            resting_sells: state.resting_side(Side::Sell),
            transient_buys,
            transient_sells,
            resting_mid_price: state.resting.mid_price_or_best_price(),
        };

        let state = self.state(market_id)?;
        let ctx = ExpansionContext {
            market: &state.market,
            discounts: &self.discounts,
            bank: self.bank.as_ref(),
            is_liquidation: false,
        };
        let positions = PositionCache::new(state.positions_snapshot(), state.market.funding().cloned());
        let session = MatchingSession::new(&state.market, mark_price, current_open_notional(state.open_interest, mark_price), positions);
        let data = limit_matching_execution_data(&ctx, session, input);
        let batch = BatchExecutionData::from_limit_matching(&state.market, data);

        self.commit_batch(market_id, batch, TakenOrders::Limit(taken), false)
    }

    /// Persists `batch` when the market stays solvent. otherwise the taken orders go back to
    /// the transient queues and the market is paused for settlement, which cancels them.
    pub(super) fn commit_batch(
        &mut self,
        market_id: MarketId,
        batch: BatchExecutionData,
        taken: TakenOrders,
        from_market_orders: bool,
    ) -> Result<Option<VwapData>, EngineError> {
        if let Err(shortfall) = self.ensure_market_solvency(market_id, batch.market_balance_delta) {
            warn!(
                market = ?market_id,
                balance_delta = %batch.market_balance_delta,
                %shortfall,
                "batch would leave the market insolvent, discarding it"
            );
            let state = self.state_mut(market_id)?;
            match taken {
                TakenOrders::Limit(orders) => {
                    state.transient_limit_orders.extend(orders);
                    state.transient_limit_orders.sort_by_key(|o| o.hash);
                }
                TakenOrders::Market(orders) => {
                    state.transient_market_orders.extend(orders);
                    state.transient_market_orders.sort_by_key(|o| o.hash);
                }
            }
            self.pause_for_settlement(market_id, true, CancelReason::InsolventBatch)?;
            return Ok(None);
        }

        let vwap = batch.vwap;
        self.persist_batch(market_id, batch, from_market_orders)?;
        Ok(Some(vwap))
    }

    /// Err with the missing amount when the market cannot absorb `balance_delta`.
    pub(super) fn ensure_market_solvency(&self, market_id: MarketId, balance_delta: Decimal) -> Result<(), Decimal> {
        let balance = self.store.state(market_id).map(|s| s.balance).unwrap_or_default();
        let after = balance + balance_delta;
        if after < Decimal::ZERO {
            return Err(-after);
        }
        Ok(())
    }

    // 8.3.3: balance, open interest, deposits, positions, orders, events.
    pub(super) fn persist_batch(&mut self, market_id: MarketId, batch: BatchExecutionData, from_market_orders: bool) -> Result<(), EngineError> {
        let state = self.store.state_mut(market_id).ok_or(EngineError::MarketNotFound(market_id))?;
        state.balance += batch.market_balance_delta;
        state.open_interest += batch.open_interest_delta;

        let denom = state.market.quote_denom().to_string();
        for (subaccount_id, delta) in batch.deposit_deltas.iter() {
            if !delta.is_empty() {
                self.bank.update_deposit_with_delta(*subaccount_id, &denom, *delta);
            }
        }

        if from_market_orders {
            state
                .modified_by_market_orders
                .extend(batch.positions.iter().map(|p| p.subaccount_id));
        }
        state.set_positions(batch.positions);

        for fill in batch.resting_fills {
            let order = fill.order;
            let subaccount_id = order.subaccount_id();
            if !fill.fill_quantity.is_zero() {
                state
                    .metadata_mut(subaccount_id, order.side)
                    .reduce_fillable(order.is_reduce_only(), fill.fill_quantity);
            }
            if order.fillable.is_zero() {
                state.resting.remove(order.hash);
                state.metadata_mut(subaccount_id, order.side).remove_order(order.is_reduce_only(), Decimal::ZERO);
                state.release_cid(subaccount_id, order.info.cid.as_deref());
            } else if let Some(stored) = state.resting.get_mut(order.hash) {
                *stored = order;
            }
        }

        for fill in batch.transient_fills {
            let order = fill.order;
            let subaccount_id = order.subaccount_id();
            if !fill.fill_quantity.is_zero() {
                state
                    .metadata_mut(subaccount_id, order.side)
                    .reduce_fillable(order.is_reduce_only(), fill.fill_quantity);
            }
            if order.fillable.is_zero() {
                state.metadata_mut(subaccount_id, order.side).remove_order(order.is_reduce_only(), Decimal::ZERO);
                state.release_cid(subaccount_id, order.info.cid.as_deref());
            }
        }

        let mut cancelled: HashSet<OrderHash> = HashSet::new();
        for cancel in batch.limit_cancels {
            let order = cancel.order;
            if !cancelled.insert(order.hash) {
                continue;
            }
            if !cancel.is_transient {
                state.resting.remove(order.hash);
            }
            let subaccount_id = order.subaccount_id();
            state.metadata_mut(subaccount_id, order.side).remove_order(order.is_reduce_only(), order.fillable);
            state.release_cid(subaccount_id, order.info.cid.as_deref());
        }

        for order in batch.new_resting_orders {
            state.resting.insert(order);
        }

        debug!(
            market = ?market_id,
            balance = %state.balance,
            open_interest = %state.open_interest,
            market_cancels = batch.market_cancels.len(),
            "batch persisted"
        );
        self.emit_events(batch.events);
        Ok(())
    }

    // 8.3.4: transient reduce-only orders of subaccounts whose positions market orders just
    // changed, newest first, until the rest fit the position.
    fn cancel_excess_transient_reduce_only(&mut self, market_id: MarketId) -> Result<(), EngineError> {
        let state = self.state(market_id)?;
        let mut cancels = Vec::new();
        for subaccount_id in &state.modified_by_market_orders {
            for side in [Side::Buy, Side::Sell] {
                let reduce_only: Vec<SubaccountOrder> = state
                    .subaccount_transient_orders(*subaccount_id, side)
                    .iter()
                    .filter(|o| o.is_reduce_only())
                    .map(SubaccountOrder::from)
                    .collect();
                if reduce_only.is_empty() {
                    continue;
                }
                let metadata = state.metadata(*subaccount_id, side);
                cancels.extend(transient_reduce_only_cancels(state.position(*subaccount_id), side, &metadata, &reduce_only));
            }
        }
        for hash in cancels {
            self.cancel_transient_limit_order(market_id, hash, CancelReason::ReduceOnlyConflict)?;
        }
        Ok(())
    }

    // 8.3.5: one premium accrual per block from both passes' trades.
    pub(super) fn accrue_vwap(&mut self, market_id: MarketId, vwap: &VwapData) -> Result<(), EngineError> {
        if vwap.is_empty() {
            return Ok(());
        }
        let Some(mark_price) = self.mark_price(market_id) else {
            return Ok(());
        };
        let now = self.block.time;
        let state = self.state_mut(market_id)?;
        let Some(funding) = state.market.funding_mut() else {
            return Ok(());
        };
        if !accrue_vwap_premium(funding, vwap, mark_price, now) {
            return Ok(());
        }
        let event = FundingUpdateEvent {
            market_id,
            cumulative_funding: funding.cumulative_funding,
            cumulative_price: funding.cumulative_price,
            funding_rate: None,
            mark_price,
        };
        self.emit_event(EventPayload::PerpetualFundingUpdated(event));
        Ok(())
    }
}

pub(super) fn current_open_notional(open_interest: Decimal, mark_price: Option<Decimal>) -> Decimal {
    match mark_price {
        Some(mark_price) => open_notional(open_interest, mark_price),
        None => {
            if !open_interest.is_zero() {
                error!(%open_interest, "open notional unknown without a mark price");
            }
            Decimal::ZERO
        }
    }
}

fn merge_vwap(into: &mut VwapData, other: &VwapData) {
    if !other.is_empty() {
        into.apply_execution(Some(other.price), other.quantity);
    }
}
