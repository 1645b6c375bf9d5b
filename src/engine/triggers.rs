// 8.4 engine/triggers.rs: conditional orders whose trigger the mark price reached become
// ordinary transient orders of the current block.

use super::core::Engine;
use super::orders::OrderRequest;
use super::results::EngineError;
use crate::conditional::{find_triggered_orders, ConditionalKind, ConditionalOrder, ConditionalOrderBook};
use crate::events::{CancelReason, ConditionalTriggeredEvent, EventPayload, OrderCancelledEvent};
use crate::market::Market;
use crate::types::MarketId;
use rust_decimal::Decimal;
use tracing::{debug, info};

impl Engine {
    /// Returns how many conditional orders were converted.
    pub(super) fn trigger_conditional_orders(&mut self) -> Result<usize, EngineError> {
        let books: Vec<(&Market, &ConditionalOrderBook)> = self.store.states().map(|s| (&s.market, &s.conditional)).collect();
        let triggered = find_triggered_orders(&books, self.oracle.as_ref());

        let mut converted = 0;
        for market_triggers in triggered {
            let market_id = market_triggers.market_id;
            let mark_price = market_triggers.mark_price;
            debug!(market = ?market_id, %mark_price, count = market_triggers.len(), "conditional orders triggered");
            // market orders go first so they see the book before this block's limit orders
            for order in market_triggers.market_orders.into_iter().chain(market_triggers.limit_orders) {
                if self.trigger_order(market_id, order, mark_price)? {
                    converted += 1;
                }
            }
        }
        if converted > 0 {
            info!(converted, "conditional orders converted");
        }
        Ok(converted)
    }

    fn trigger_order(&mut self, market_id: MarketId, order: ConditionalOrder, mark_price: Decimal) -> Result<bool, EngineError> {
        let state = self.state_mut(market_id)?;
        if state.conditional.remove(order.hash).is_none() {
            return Ok(false);
        }
        let subaccount_id = order.subaccount_id();
        state.metadata_mut(subaccount_id, order.side).remove_conditional(order.is_reduce_only());
        state.release_cid(subaccount_id, order.info.cid.as_deref());
        let denom = state.market.quote_denom().to_string();
        let hold = order.hold(state.market.taker_fee_rate());

        // the hold is released and taken again by the normal placement path
        if !hold.is_zero() {
            self.bank.increment_available_balance_or_bank(subaccount_id, &denom, hold);
        }
        self.emit_event(EventPayload::ConditionalTriggered(ConditionalTriggeredEvent {
            market_id,
            order_hash: order.hash,
            is_limit: order.is_limit(),
            mark_price,
        }));

        let request = OrderRequest::new(market_id, order.side, order.info.clone(), order.margin);
        let placed = match order.kind {
            ConditionalKind::Limit => self.place_limit_order(request),
            ConditionalKind::Market => self.place_market_order(request),
        };
        match placed {
            Ok(placed) => {
                debug!(market = ?market_id, conditional = %order.hash, order = %placed.hash, "conditional order placed");
                Ok(true)
            }
            Err(EngineError::MarketNotFound(id)) => Err(EngineError::MarketNotFound(id)),
            Err(err) => {
                debug!(market = ?market_id, conditional = %order.hash, error = %err, "triggered order rejected");
                self.emit_event(EventPayload::OrderCancelled(OrderCancelledEvent {
                    market_id,
                    order_hash: order.hash,
                    subaccount_id,
                    is_limit: order.is_limit(),
                    cancel_quantity: order.quantity(),
                    refund: hold,
                    reason: CancelReason::MatchingValidation,
                }));
                Ok(false)
            }
        }
    }
}
