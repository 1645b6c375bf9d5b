// 8.0 engine/core.rs: main engine. holds the store, the collaborators and the block clock.

use super::config::EngineConfig;
use super::results::EngineError;
use crate::events::{Event, EventCollector, EventId, EventPayload, MarketStatusEvent};
use crate::expansion::FeeDiscounts;
use crate::interfaces::{BankKeeper, EventSink, InsuranceFund, PriceOracle};
use crate::market::{Market, MarketParams, MarketStatus};
use crate::position::Position;
use crate::store::{ExchangeStore, MarketState};
use crate::types::{BlockContext, MarketId, SubaccountId, Timestamp};
use rust_decimal::Decimal;
use tracing::{debug, info};

/** 8.1: main engine struct. all exchange state lives in the store */
pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) store: ExchangeStore,
    pub(super) oracle: Box<dyn PriceOracle>,
    pub(super) insurance: Box<dyn InsuranceFund>,
    pub(super) bank: Box<dyn BankKeeper>,
    pub(super) discounts: FeeDiscounts,
    pub(super) events: EventCollector,
    pub(super) sink: Option<Box<dyn EventSink>>,
    pub(super) next_event_id: u64,
    pub(super) block: BlockContext,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        oracle: Box<dyn PriceOracle>,
        insurance: Box<dyn InsuranceFund>,
        bank: Box<dyn BankKeeper>,
    ) -> Self {
        let events = EventCollector::with_capacity_limit(config.max_events);
        Self {
            config,
            store: ExchangeStore::new(),
            oracle,
            insurance,
            bank,
            discounts: FeeDiscounts::new(),
            events,
            sink: None,
            next_event_id: 1,
            block: BlockContext::new(0, Timestamp(0)),
        }
    }

    /// Every event is forwarded to `sink` as well as kept in memory.
    pub fn with_sink(mut self, sink: Box<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn set_fee_discounts(&mut self, discounts: FeeDiscounts) {
        self.discounts = discounts;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn block(&self) -> BlockContext {
        self.block
    }

    pub fn time(&self) -> Timestamp {
        self.block.time
    }

    pub fn launch_perpetual_market(&mut self, params: MarketParams) -> Result<MarketId, EngineError> {
        let market = Market::perpetual(params, self.block.time, self.config.funding_interval_secs);
        self.launch_market(market)
    }

    pub fn launch_expiry_futures_market(
        &mut self,
        params: MarketParams,
        expiration: Timestamp,
        twap_window_secs: i64,
    ) -> Result<MarketId, EngineError> {
        self.launch_market(Market::expiry_futures(params, expiration, twap_window_secs))
    }

    pub fn launch_binary_options_market(
        &mut self,
        params: MarketParams,
        expiration: Timestamp,
        settlement: Timestamp,
    ) -> Result<MarketId, EngineError> {
        self.launch_market(Market::binary_options(params, expiration, settlement))
    }

    pub fn launch_market(&mut self, market: Market) -> Result<MarketId, EngineError> {
        let market_id = market.id();
        if self.store.contains_market(market_id) {
            return Err(EngineError::MarketExists(market_id));
        }
        market.validate()?;
        info!(market = ?market_id, ticker = %market.params().ticker, kind = ?market.kind(), "market launched");
        self.store.insert_market(market);
        Ok(market_id)
    }

    pub fn market(&self, market_id: MarketId) -> Option<&Market> {
        self.store.market(market_id)
    }

    pub fn market_state(&self, market_id: MarketId) -> Option<&MarketState> {
        self.store.state(market_id)
    }

    pub fn position(&self, market_id: MarketId, subaccount_id: SubaccountId) -> Option<&Position> {
        self.store.position(market_id, subaccount_id)
    }

    pub fn market_balance(&self, market_id: MarketId) -> Option<Decimal> {
        self.store.state(market_id).map(|s| s.balance)
    }

    pub fn open_interest(&self, market_id: MarketId) -> Option<Decimal> {
        self.store.state(market_id).map(|s| s.open_interest)
    }

    /// Oracle price of the market's pair, scaled by its oracle scale factor.
    pub fn mark_price(&self, market_id: MarketId) -> Option<Decimal> {
        let market = self.store.market(market_id)?;
        self.oracle.price(market.oracle()).map(|p| market.oracle().scaled_price(p))
    }

    pub fn scheduled_settlements(&self) -> Vec<MarketId> {
        self.store.scheduled_settlements().into_iter().map(|(id, _)| id).collect()
    }

    pub fn bank(&self) -> &dyn BankKeeper {
        self.bank.as_ref()
    }

    pub fn bank_mut(&mut self) -> &mut dyn BankKeeper {
        self.bank.as_mut()
    }

    pub fn insurance(&self) -> &dyn InsuranceFund {
        self.insurance.as_ref()
    }

    pub fn events(&self) -> &[Event] {
        self.events.events()
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        self.events.drain()
    }

    pub(super) fn state_mut(&mut self, market_id: MarketId) -> Result<&mut MarketState, EngineError> {
        self.store.state_mut(market_id).ok_or(EngineError::MarketNotFound(market_id))
    }

    pub(super) fn state(&self, market_id: MarketId) -> Result<&MarketState, EngineError> {
        self.store.state(market_id).ok_or(EngineError::MarketNotFound(market_id))
    }

    pub(super) fn set_market_status(&mut self, market_id: MarketId, status: MarketStatus) -> Result<(), EngineError> {
        let state = self.state_mut(market_id)?;
        let previous = state.market.status();
        if previous == status {
            return Ok(());
        }
        state.market.set_status(status);
        info!(market = ?market_id, ?previous, ?status, "market status changed");
        self.emit_event(EventPayload::MarketStatusChanged(MarketStatusEvent {
            market_id,
            previous,
            status,
        }));
        Ok(())
    }

    pub(super) fn emit_events(&mut self, payloads: Vec<EventPayload>) {
        for payload in payloads {
            self.emit_event(payload);
        }
    }

    pub(super) fn emit_event(&mut self, payload: EventPayload) {
        let event = Event::new(EventId(self.next_event_id), self.block.height, self.block.time, payload);
        self.next_event_id += 1;

        if self.config.verbose {
            debug!(id = event.id.0, payload = ?event.payload, "event");
        }

        if let Some(sink) = self.sink.as_mut() {
            sink.emit(event.clone());
        }
        self.events.emit(event);
    }
}
