//! Hourly funding for perpetual markets.

use super::core::Engine;
use super::results::EngineError;
use crate::events::{EventPayload, FundingUpdateEvent};
use crate::funding::{apply_hourly_funding, is_funding_due};
use crate::market::Market;
use crate::types::MarketId;
use tracing::{info, warn};

impl Engine {
    /// Pays funding in every active perpetual market whose interval has elapsed.
    /// Returns the markets that paid.
    pub(super) fn process_hourly_funding(&mut self) -> Result<Vec<MarketId>, EngineError> {
        let now = self.block.time;
        let mut funded = Vec::new();

        for market_id in self.store.market_ids() {
            let mark_price = self.mark_price(market_id);
            let state = self.state_mut(market_id)?;
            if !state.market.is_active() {
                continue;
            }
            let Market::Perpetual { info, funding, .. } = &mut state.market else {
                continue;
            };
            if !is_funding_due(info, now) {
                continue;
            }
            let Some(mark_price) = mark_price else {
                warn!(market = ?market_id, "funding due but no mark price, skipping");
                continue;
            };

            let hourly = apply_hourly_funding(info, funding, mark_price);
            info!(
                market = ?market_id,
                rate = %hourly.funding_rate,
                twap = %hourly.twap,
                cumulative = %hourly.cumulative_funding,
                "funding paid"
            );
            let event = FundingUpdateEvent {
                market_id,
                cumulative_funding: hourly.cumulative_funding,
                cumulative_price: funding.cumulative_price,
                funding_rate: Some(hourly.funding_rate),
                mark_price,
            };
            self.emit_event(EventPayload::PerpetualFundingUpdated(event));
            funded.push(market_id);
        }
        Ok(funded)
    }
}
