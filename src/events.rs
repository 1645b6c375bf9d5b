// 6: every externally visible outcome becomes an event.
// trade batches, cancellations, status changes, funding and settlement balances.
// the engine stamps id and block time; the EventSink decides where they go.

use crate::interfaces::EventSink;
use crate::market::MarketStatus;
use crate::position::PositionDelta;
use crate::types::{MarketId, OrderHash, SubaccountId, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub height: u64,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, height: u64, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            height,
            timestamp,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    // Trade events
    BatchDerivativeExecution(BatchExecutionEvent),
    NewOrders(NewOrdersEvent),
    OrderCancelled(OrderCancelledEvent),
    ConditionalTriggered(ConditionalTriggeredEvent),
    Liquidation(LiquidationEvent),

    // Market events
    MarketStatusChanged(MarketStatusEvent),
    MarketParamsUpdated(MarketParamsUpdatedEvent),
    PerpetualFundingUpdated(FundingUpdateEvent),
    ExpiryTwapStarted(ExpiryTwapStartedEvent),

    // Settlement events
    MarketPaused(MarketPausedEvent),
    SettledMarketBalance(MarketBalanceEvent),
    NotSettledMarketBalance(MarketBalanceEvent),
    AllPositionsHaircut(HaircutEvent),
    MarketBeyondBankruptcy(HaircutEvent),
}

/// How the trades of a batch came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionType {
    Market,
    LimitFill,
    LimitMatchRestingOrder,
    LimitMatchNewOrder,
    MarketLiquidation,
    ExpiryMarketSettlement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeLog {
    pub subaccount_id: SubaccountId,
    pub position_delta: PositionDelta,
    pub payout: Decimal,
    /// Fee as reported: the auction share when self-relayed, otherwise the full protocol fee
    pub fee: Decimal,
    pub order_hash: OrderHash,
    pub fee_recipient: SubaccountId,
    pub cid: Option<String>,
    pub pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchExecutionEvent {
    pub market_id: MarketId,
    pub is_buy: bool,
    pub execution_type: ExecutionType,
    pub is_liquidation: bool,
    /// Perpetuals only
    pub cumulative_funding: Option<Decimal>,
    pub trades: Vec<TradeLog>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrdersEvent {
    pub market_id: MarketId,
    pub buy_orders: Vec<OrderHash>,
    pub sell_orders: Vec<OrderHash>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancelReason {
    UserRequested,
    Expired,
    /// Failed a check while being matched
    MatchingValidation,
    /// Market order remainder after matching
    Unfilled,
    ReduceOnlyConflict,
    Liquidation,
    MarketSettlement,
    MarketDemolished,
    InsufficientFundsForFeeIncrease,
    InsolventBatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelledEvent {
    pub market_id: MarketId,
    pub order_hash: OrderHash,
    pub subaccount_id: SubaccountId,
    pub is_limit: bool,
    pub cancel_quantity: Decimal,
    pub refund: Decimal,
    pub reason: CancelReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalTriggeredEvent {
    pub market_id: MarketId,
    pub order_hash: OrderHash,
    pub is_limit: bool,
    pub mark_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub market_id: MarketId,
    pub subaccount_id: SubaccountId,
    pub liquidator: SubaccountId,
    pub executed_quantity: Decimal,
    /// Payout left after the close, negative when insurance covered a shortfall
    pub payout: Decimal,
    pub liquidator_reward: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketStatusEvent {
    pub market_id: MarketId,
    pub previous: MarketStatus,
    pub status: MarketStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketParamsUpdatedEvent {
    pub market_id: MarketId,
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,
    pub initial_margin_ratio: Decimal,
    pub maintenance_margin_ratio: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingUpdateEvent {
    pub market_id: MarketId,
    pub cumulative_funding: Decimal,
    pub cumulative_price: Decimal,
    /// Set on hourly settlement, None for continuous accrual
    pub funding_rate: Option<Decimal>,
    pub mark_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryTwapStartedEvent {
    pub market_id: MarketId,
    pub start_base_cumulative_price: Decimal,
    pub start_quote_cumulative_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketBalanceEvent {
    pub market_id: MarketId,
    pub amount: Decimal,
}

/// Deficit left after the insurance draw and the share of profits it took.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketPausedEvent {
    pub market_id: MarketId,
    /// None for a binary options refund
    pub settle_price: Option<Decimal>,
    pub total_missing_funds: Decimal,
    pub missing_funds_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaircutEvent {
    pub market_id: MarketId,
    pub settle_price: Option<Decimal>,
    pub missing_funds: Decimal,
    pub missing_funds_rate: Decimal,
}

/// Keeps every event in memory. the engine's default sink.
#[derive(Debug, Default)]
pub struct EventCollector {
    events: Vec<Event>,
    max_events: Option<usize>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest events are dropped past `max_events`.
    pub fn with_capacity_limit(max_events: usize) -> Self {
        Self {
            events: Vec::new(),
            max_events: Some(max_events),
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn drain(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

impl EventSink for EventCollector {
    fn emit(&mut self, event: Event) {
        self.events.push(event);
        if let Some(max) = self.max_events {
            if self.events.len() > max {
                let overflow = self.events.len() - max;
                self.events.drain(..overflow);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn balance_event(id: u64) -> Event {
        Event::new(
            EventId(id),
            1,
            Timestamp(1000),
            EventPayload::SettledMarketBalance(MarketBalanceEvent {
                market_id: MarketId(1),
                amount: dec!(10),
            }),
        )
    }

    #[test]
    fn collector_keeps_latest_events() {
        let mut collector = EventCollector::with_capacity_limit(2);
        for id in 1..=3 {
            collector.emit(balance_event(id));
        }
        let ids: Vec<_> = collector.events().iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![2, 3]);

        assert_eq!(collector.drain().len(), 2);
        assert!(collector.events().is_empty());
    }

    #[test]
    fn events_serialize_to_json() {
        let event = balance_event(7);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("SettledMarketBalance"));
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
