// 8.0.2: result types and errors for engine operations.

use crate::interfaces::CollaboratorError;
use crate::market::MarketError;
use crate::order::OrderError;
use crate::position::PositionError;
use crate::settlement::SettlementError;
use crate::types::{MarketId, OrderHash, SubaccountId};
use rust_decimal::Decimal;

/// What a successful placement left in the book.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub hash: OrderHash,
    /// Quantity after reduce-only resizing
    pub quantity: Decimal,
    /// Reduce-only orders cancelled to make room for this one
    pub cancelled_reduce_only: Vec<OrderHash>,
}

/// What an atomic market order traded before it returned.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomicOrderResult {
    pub hash: OrderHash,
    pub filled_quantity: Decimal,
    /// Average price over the resting orders it hit
    pub price: Decimal,
    /// Trader fee at the multiplied taker rate
    pub fee: Decimal,
    pub payout: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiquidationResult {
    pub market_id: MarketId,
    pub subaccount_id: SubaccountId,
    pub liquidator: SubaccountId,
    pub executed_quantity: Decimal,
    /// Trader payout of the closing trade, before it was split
    pub payout: Decimal,
    pub liquidator_reward: Decimal,
    /// Positive when the insurance fund received funds, negative when it paid
    pub insurance_delta: Decimal,
}

/// What one begin or end block step did, for logs and tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockSummary {
    pub cancelled_expired: usize,
    pub settled_markets: Vec<MarketId>,
    pub funded_markets: Vec<MarketId>,
    pub triggered_orders: usize,
    pub executed_markets: Vec<MarketId>,
    pub insolvent_markets: Vec<MarketId>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Market {0:?} not found")]
    MarketNotFound(MarketId),

    #[error("Market {0:?} already exists")]
    MarketExists(MarketId),

    #[error("No opposing liquidity in market {0:?}")]
    NoLiquidity(MarketId),

    #[error("Position of {subaccount_id:?} in market {market_id:?} is not liquidatable")]
    NotLiquidatable { market_id: MarketId, subaccount_id: SubaccountId },

    #[error("No position for {1:?} in market {0:?}")]
    PositionNotFound(MarketId, SubaccountId),

    #[error("No mark price available for market {0:?}")]
    NoMarkPrice(MarketId),

    #[error("Market {0:?} is in a terminal status")]
    TerminalMarket(MarketId),

    #[error("Market {0:?} already has a settlement scheduled")]
    SettlementAlreadyScheduled(MarketId),

    #[error("Market {0:?} cannot pay for the trade and was paused")]
    InsolventMarket(MarketId),

    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Position error: {0}")]
    Position(#[from] PositionError),

    #[error("Market error: {0}")]
    Market(#[from] MarketError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}
