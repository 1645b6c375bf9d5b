// 8.0: the exchange engine. owns the store and drives the block lifecycle:
// placement between blocks, settlements and funding at the start of a block,
// triggers and batch matching at the end of it.
// deterministic; collaborators are reached only through their traits.

mod config;
mod core;
mod execution;
mod funding;
mod lifecycle;
mod liquidation;
mod orders;
mod results;
mod settlement;
mod triggers;

pub use config::EngineConfig;
pub use core::Engine;
pub use lifecycle::MarketParamsUpdate;
pub use orders::{CancellationStrategy, OrderRequest, OrderToCancel};
pub use results::{AtomicOrderResult, BlockSummary, EngineError, LiquidationResult, PlacedOrder};
