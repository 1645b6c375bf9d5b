// derivatives-core: derivative market trading core.
// perpetuals, expiry futures and binary options share one deterministic matching path;
// settlement, funding and liquidation run around it once per block.
// no I/O: prices, balances and insurance come in through the traits in interfaces.rs.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: ids, sides, block time, deposit deltas
//   2.x  order.rs: limit and market orders, resting book, subaccount metadata
//   2.1x conditional.rs: trigger orders and the parallel trigger scan
//   2.2x reduce_only.rs: reduce-only resizing and cancels
//   3.x  margin.rs: order margin and mark price thresholds
//   4.0  position.rs: positions, payouts, haircuts
//   4.1  orderbook.rs, matching.rs: batch auction and market order passes
//   4.4  expansion.rs: fills into deposit, position and fee changes
//   4.6  settlement.rs: settlement and socialized loss
//   5.x  funding.rs: hourly funding, VWAP premium, expiry TWAP
//   6.x  interfaces.rs, events.rs: collaborators and emitted events
//   6.3  risk.rs: open notional cap
//   8.x  engine/: placement, block pipeline, settlement, liquidation, admin
//   11.x store.rs, batch.rs: exchange state and batch persistence data
//   12.x market.rs: market kinds, params, status

// core trading modules
pub mod engine;
pub mod market;
pub mod order;
pub mod position;
pub mod types;

// matching
pub mod batch;
pub mod expansion;
pub mod matching;
pub mod orderbook;

// risk and order rules
pub mod conditional;
pub mod margin;
pub mod reduce_only;
pub mod risk;

// settlement and funding
pub mod funding;
pub mod settlement;

// state and collaborators
pub mod events;
pub mod interfaces;
pub mod store;

// re exports for convenience
pub use engine::*;
pub use events::*;
pub use interfaces::*;
pub use market::*;
pub use order::*;
pub use types::*;
pub use batch::{BatchExecutionData, VwapData};
pub use conditional::{ConditionalKind, ConditionalOrder, TriggerDirection};
pub use expansion::FeeDiscounts;
pub use position::{Position, PositionState};
pub use settlement::{settle_market, SettlementError, SettlementOutcome, BINARY_OPTIONS_REFUND_FLAG};
pub use store::{ExchangeStore, MarketState};
