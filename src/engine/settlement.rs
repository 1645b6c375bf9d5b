// 8.5 engine/settlement.rs: closing markets.
// scheduled settlements run at the start of a block; expiry futures settle at their TWAP,
// binary options at the oracle or admin price. a market that cannot be priced is paused
// and takes its insurance fund instead.

use super::core::Engine;
use super::results::EngineError;
use crate::events::{CancelReason, EventPayload, ExpiryTwapStartedEvent, MarketBalanceEvent};
use crate::funding::{expiry_step, expiry_twap_settlement_price, start_expiry_twap, ExpiryStep, TwapError};
use crate::market::{MarketError, MarketStatus, SettlementPrice};
use crate::settlement::{binary_settlement_price, calculate_market_balance, settle_market, BINARY_OPTIONS_REFUND_FLAG};
use crate::types::MarketId;
use rust_decimal::Decimal;
use tracing::{info, warn};

impl Engine {
    /// Pauses an active market and schedules its settlement at the current mark price.
    pub fn pause_and_schedule_settlement(&mut self, market_id: MarketId, cancel_market_orders: bool) -> Result<(), EngineError> {
        self.pause_for_settlement(market_id, cancel_market_orders, CancelReason::MarketSettlement)
    }

    pub(super) fn pause_for_settlement(&mut self, market_id: MarketId, cancel_market_orders: bool, reason: CancelReason) -> Result<(), EngineError> {
        let state = self.state(market_id)?;
        if state.market.status().is_terminal() {
            return Err(EngineError::TerminalMarket(market_id));
        }
        let is_binary = state.market.is_binary_options();
        let price = if is_binary {
            Some(self.binary_oracle_settlement_price(market_id)?)
        } else {
            self.mark_price(market_id).map(SettlementPrice::Price)
        };

        self.cancel_all_orders(market_id, cancel_market_orders, reason)?;
        let Some(price) = price else {
            return self.handle_failed_settlement(market_id);
        };

        self.store.schedule_settlement(market_id, price);
        let state = self.state_mut(market_id)?;
        if !is_binary {
            state.market.params_mut().mark_price_at_pausing = price.price();
        }
        warn!(market = ?market_id, ?price, "market paused for settlement");
        let status = if is_binary { MarketStatus::Demolished } else { MarketStatus::Paused };
        self.set_market_status(market_id, status)
    }

    /// No price to settle at: every order goes, the insurance fund is moved into the
    /// market and positions stay open until an admin settles them.
    fn handle_failed_settlement(&mut self, market_id: MarketId) -> Result<(), EngineError> {
        self.cancel_all_orders(market_id, true, CancelReason::MarketSettlement)?;

        let available = match self.insurance.balance(market_id) {
            Ok(balance) => balance,
            Err(err) => {
                warn!(market = ?market_id, error = %err, "no insurance fund to cover a failed settlement");
                Decimal::ZERO
            }
        };
        if available > Decimal::ZERO {
            self.insurance.withdraw(market_id, available)?;
        }

        let state = self.state_mut(market_id)?;
        state.balance += available;
        let balance = state.balance;
        let status = if state.market.is_binary_options() {
            MarketStatus::Demolished
        } else {
            MarketStatus::Paused
        };
        warn!(market = ?market_id, insurance = %available, %balance, "settlement failed, market not settled");
        self.set_market_status(market_id, status)?;
        self.emit_event(EventPayload::NotSettledMarketBalance(MarketBalanceEvent {
            market_id,
            amount: balance,
        }));
        Ok(())
    }

    /// Oracle probability clamped to [0, 1] and scaled. a refund when the oracle is silent.
    pub(super) fn binary_oracle_settlement_price(&self, market_id: MarketId) -> Result<SettlementPrice, EngineError> {
        let market = self.store.market(market_id).ok_or(EngineError::MarketNotFound(market_id))?;
        let price = self
            .oracle
            .price(market.oracle())
            .map(|p| SettlementPrice::Price(market.oracle().scaled_price(p.clamp(Decimal::ZERO, Decimal::ONE))))
            .unwrap_or(SettlementPrice::Refund);
        Ok(price)
    }

    pub(super) fn process_scheduled_settlements(&mut self) -> Result<Vec<MarketId>, EngineError> {
        let mut settled = Vec::new();
        for (market_id, scheduled) in self.store.scheduled_settlements() {
            let price = match scheduled {
                SettlementPrice::Price(p) if p.is_zero() => match self.mark_price(market_id) {
                    Some(mark) => SettlementPrice::Price(mark),
                    None => {
                        warn!(market = ?market_id, "no oracle price for scheduled settlement, retrying next block");
                        if self.state(market_id)?.market.is_active() {
                            self.set_market_status(market_id, MarketStatus::Paused)?;
                        }
                        continue;
                    }
                },
                price => price,
            };

            self.settle(market_id, price, Decimal::ZERO)?;
            self.store.remove_scheduled_settlement(market_id);

            let state = self.state_mut(market_id)?;
            let is_binary = state.market.is_binary_options();
            if let Some(info) = state.market.expiry_info_mut() {
                info.settlement_price = price.price();
            }
            if let Some(info) = state.market.binary_info_mut() {
                info.settlement_price.get_or_insert(price);
            }
            if state.market.is_active() {
                let status = if is_binary { MarketStatus::Demolished } else { MarketStatus::Paused };
                self.set_market_status(market_id, status)?;
            }
            settled.push(market_id);
        }
        Ok(settled)
    }

    // 8.5.1: close every position at `price`, paying out through deposit deltas.
    pub(super) fn settle(&mut self, market_id: MarketId, price: SettlementPrice, closing_fee_rate: Decimal) -> Result<(), EngineError> {
        self.cancel_all_orders(market_id, true, CancelReason::MarketSettlement)?;

        let state = self.store.state_mut(market_id).ok_or(EngineError::MarketNotFound(market_id))?;
        let positions = state.take_positions();
        let outcome = settle_market(&state.market, positions, state.balance, price, closing_fee_rate, self.insurance.as_mut());

        state.set_positions(outcome.positions);
        state.balance = outcome.market_balance.max(Decimal::ZERO);
        state.open_interest = Decimal::ZERO;
        let denom = state.market.quote_denom().to_string();
        for (subaccount_id, delta) in outcome.deposit_deltas.iter() {
            self.bank.update_deposit_with_delta(*subaccount_id, &denom, *delta);
        }
        info!(
            market = ?market_id,
            ?price,
            balance = %outcome.market_balance,
            insurance_withdrawn = %outcome.insurance_withdrawn,
            insurance_deposited = %outcome.insurance_deposited,
            "settlement applied"
        );
        self.emit_events(outcome.events);
        Ok(())
    }

    // 8.5.2: record the TWAP start, then settle at the TWAP once matured.
    pub(super) fn process_expiry_markets(&mut self) -> Result<Vec<MarketId>, EngineError> {
        let now = self.block.time;
        let mut settled = Vec::new();

        for market_id in self.store.market_ids() {
            let state = self.state(market_id)?;
            if !state.market.is_active() {
                continue;
            }
            let Some(info) = state.market.expiry_info().cloned() else {
                continue;
            };
            let oracle = state.market.oracle().clone();
            let taker_fee_rate = state.market.taker_fee_rate();

            match expiry_step(&info, now) {
                ExpiryStep::Premature | ExpiryStep::InWindow => {}
                ExpiryStep::StartTwap => match self.oracle.cumulative_price(&oracle) {
                    Some((base, quote)) => {
                        if let Some(info) = self.state_mut(market_id)?.market.expiry_info_mut() {
                            start_expiry_twap(info, now, base, quote);
                        }
                        info!(market = ?market_id, %base, %quote, "expiry TWAP window opened");
                        self.emit_event(EventPayload::ExpiryTwapStarted(ExpiryTwapStartedEvent {
                            market_id,
                            start_base_cumulative_price: base,
                            start_quote_cumulative_price: quote,
                        }));
                    }
                    None => {
                        warn!(market = ?market_id, "no cumulative price to open the TWAP window, pausing");
                        self.set_market_status(market_id, MarketStatus::Paused)?;
                    }
                },
                ExpiryStep::Matured => {
                    let spot = self.mark_price(market_id);
                    let zero_window = info.start_base_cumulative_price.is_none() && info.twap_start_timestamp == info.expiration_timestamp;
                    let price = if zero_window {
                        spot.ok_or(TwapError::MissingCumulativePrice)
                    } else {
                        self.oracle
                            .cumulative_price(&oracle)
                            .ok_or(TwapError::MissingCumulativePrice)
                            .and_then(|(base, quote)| expiry_twap_settlement_price(&info, &oracle, now, base, quote, spot))
                    };
                    match price {
                        Ok(price) if price > Decimal::ZERO => {
                            self.settle(market_id, SettlementPrice::Price(price), taker_fee_rate)?;
                            if let Some(info) = self.state_mut(market_id)?.market.expiry_info_mut() {
                                info.settlement_price = Some(price);
                            }
                            self.set_market_status(market_id, MarketStatus::Expired)?;
                            settled.push(market_id);
                        }
                        Ok(price) => {
                            warn!(market = ?market_id, %price, "expiry settlement price is not positive, pausing");
                            self.set_market_status(market_id, MarketStatus::Paused)?;
                        }
                        Err(err) => {
                            warn!(market = ?market_id, error = %err, "expiry settlement failed, pausing");
                            self.set_market_status(market_id, MarketStatus::Paused)?;
                        }
                    }
                }
            }
        }
        Ok(settled)
    }

    // 8.5.3: stop trading at expiration, settle at the settlement timestamp.
    pub(super) fn process_binary_options(&mut self) -> Result<Vec<MarketId>, EngineError> {
        let now = self.block.time;
        let mut settled = Vec::new();

        for market_id in self.store.market_ids() {
            let state = self.state(market_id)?;
            let Some(info) = state.market.binary_info().cloned() else {
                continue;
            };
            if state.market.status() == MarketStatus::Active && now >= info.expiration_timestamp {
                self.cancel_all_orders(market_id, true, CancelReason::MarketSettlement)?;
                self.set_market_status(market_id, MarketStatus::Expired)?;
            }

            let status = self.state(market_id)?.market.status();
            if !matches!(status, MarketStatus::Active | MarketStatus::Expired) || now < info.settlement_timestamp {
                continue;
            }
            let price = match info.settlement_price {
                Some(price) => price,
                None => self.binary_oracle_settlement_price(market_id)?,
            };
            self.settle(market_id, price, Decimal::ZERO)?;
            if let Some(info) = self.state_mut(market_id)?.market.binary_info_mut() {
                info.settlement_price = Some(price);
            }
            self.set_market_status(market_id, MarketStatus::Demolished)?;
            settled.push(market_id);
        }
        Ok(settled)
    }

    /// Admin settlement of a binary options market. `raw_price` is a probability in
    /// [0, 1], or the refund flag. Settles at the start of the next block.
    pub fn admin_settle_binary_options(&mut self, market_id: MarketId, raw_price: Decimal) -> Result<(), EngineError> {
        let state = self.state(market_id)?;
        // expired binary markets still wait for their outcome
        if state.market.status() == MarketStatus::Demolished {
            return Err(EngineError::TerminalMarket(market_id));
        }
        let price = binary_settlement_price(&state.market, raw_price)?;
        if let Some(info) = self.state_mut(market_id)?.market.binary_info_mut() {
            info.settlement_price = Some(price);
        }
        self.cancel_all_orders(market_id, true, CancelReason::MarketDemolished)?;
        self.store.schedule_settlement(market_id, price);
        info!(market = ?market_id, ?price, "binary options settlement scheduled");
        self.set_market_status(market_id, MarketStatus::Demolished)
    }

    /// Schedules settlement at `price`, or at the mark price recorded when the market
    /// was paused. Binary options markets take the admin path, `None` meaning refund.
    pub fn force_settle_market(&mut self, market_id: MarketId, price: Option<Decimal>) -> Result<(), EngineError> {
        let state = self.state(market_id)?;
        if state.market.is_binary_options() {
            return self.admin_settle_binary_options(market_id, price.unwrap_or(BINARY_OPTIONS_REFUND_FLAG));
        }
        if state.market.status().is_terminal() {
            return Err(EngineError::TerminalMarket(market_id));
        }
        if self.store.scheduled_settlement(market_id).is_some() {
            return Err(EngineError::SettlementAlreadyScheduled(market_id));
        }
        let price = match price {
            Some(price) if price > Decimal::ZERO => price,
            Some(price) => return Err(MarketError::InvalidSettlementPrice(price).into()),
            None => state
                .market
                .params()
                .mark_price_at_pausing
                .filter(|p| *p > Decimal::ZERO)
                .ok_or(EngineError::NoMarkPrice(market_id))?,
        };

        self.cancel_all_orders(market_id, true, CancelReason::MarketSettlement)?;
        self.store.schedule_settlement(market_id, SettlementPrice::Price(price));
        warn!(market = ?market_id, %price, "market force settled");
        self.set_market_status(market_id, MarketStatus::Paused)
    }

    /// What the market would owe its positions if they all closed at the mark price.
    pub fn calculate_market_balance(&self, market_id: MarketId) -> Result<Decimal, EngineError> {
        let state = self.state(market_id)?;
        let mark_price = self.mark_price(market_id).ok_or(EngineError::NoMarkPrice(market_id))?;
        Ok(calculate_market_balance(state.positions.values(), mark_price, state.market.funding()))
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::{Engine, EngineConfig, OrderRequest};
    use crate::events::EventPayload;
    use crate::interfaces::{BankKeeper, InMemoryBank, InMemoryInsurance, MockOracle};
    use crate::market::{MarketParams, MarketStatus, SettlementPrice};
    use crate::order::OrderInfo;
    use crate::types::{BlockContext, MarketId, Side, SubaccountId, Timestamp};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    const LONG: SubaccountId = SubaccountId(1);
    const SHORT: SubaccountId = SubaccountId(2);

    fn engine(oracle: &MockOracle, insurance: InMemoryInsurance) -> Engine {
        let mut bank = InMemoryBank::new();
        bank.fund(LONG, "USDT", dec!(1000));
        bank.fund(SHORT, "USDT", dec!(1000));
        Engine::new(EngineConfig::default(), Box::new(oracle.clone()), Box::new(insurance), Box::new(bank))
    }

    fn fee_free(mut params: MarketParams) -> MarketParams {
        params.maker_fee_rate = Decimal::ZERO;
        params.taker_fee_rate = Decimal::ZERO;
        params
    }

    fn open_pair(engine: &mut Engine, id: MarketId, price: Decimal, quantity: Decimal, long_margin: Decimal, short_margin: Decimal) {
        engine
            .place_limit_order(OrderRequest::new(id, Side::Buy, OrderInfo::new(LONG, price, quantity), long_margin))
            .unwrap();
        engine
            .place_limit_order(OrderRequest::new(id, Side::Sell, OrderInfo::new(SHORT, price, quantity), short_margin))
            .unwrap();
        engine.end_block().unwrap();
    }

    fn available(engine: &Engine, subaccount_id: SubaccountId) -> Decimal {
        engine.bank().deposit(subaccount_id, "USDT").available
    }

    #[test]
    fn expiry_futures_settle_at_twap() {
        let oracle = MockOracle::new();
        let params = fee_free(MarketParams::eth_futures(MarketId(2)));
        let pair = params.oracle.clone();
        oracle.set_price(&pair, dec!(100));
        let mut engine = engine(&oracle, InMemoryInsurance::new());
        let id = engine.launch_expiry_futures_market(params, Timestamp(1000), 100).unwrap();

        engine.begin_block(BlockContext::new(1, Timestamp(10))).unwrap();
        open_pair(&mut engine, id, dec!(100), dec!(1), dec!(100), dec!(100));
        assert_eq!(engine.market_balance(id), Some(dec!(200)));

        oracle.set_cumulative_price(&pair, dec!(1000), dec!(10));
        engine.begin_block(BlockContext::new(2, Timestamp(900))).unwrap();
        let info = engine.market(id).unwrap().expiry_info().unwrap().clone();
        assert_eq!(info.start_base_cumulative_price, Some(dec!(1000)));

        // average of 110 over the window
        oracle.set_cumulative_price(&pair, dec!(12000), dec!(110));
        let summary = engine.begin_block(BlockContext::new(3, Timestamp(1000))).unwrap();
        assert_eq!(summary.settled_markets, vec![id]);

        let market = engine.market(id).unwrap();
        assert_eq!(market.status(), MarketStatus::Expired);
        assert_eq!(market.expiry_info().unwrap().settlement_price, Some(dec!(110)));
        assert_eq!(available(&engine, LONG), dec!(1010));
        assert_eq!(available(&engine, SHORT), dec!(990));
        assert_eq!(engine.market_balance(id), Some(Decimal::ZERO));
        assert_eq!(engine.open_interest(id), Some(Decimal::ZERO));
        assert!(engine.position(id, LONG).is_none());
    }

    #[test]
    fn binary_options_expire_then_settle() {
        let oracle = MockOracle::new();
        let params = fee_free(MarketParams::binary_option(MarketId(3), 0));
        let pair = params.oracle.clone();
        oracle.set_price(&pair, dec!(0.6));
        let mut engine = engine(&oracle, InMemoryInsurance::new());
        let id = engine.launch_binary_options_market(params, Timestamp(100), Timestamp(200)).unwrap();

        engine.begin_block(BlockContext::new(1, Timestamp(10))).unwrap();
        open_pair(&mut engine, id, dec!(0.6), dec!(10), dec!(6), dec!(4));
        engine
            .place_limit_order(OrderRequest::new(id, Side::Buy, OrderInfo::new(LONG, dec!(0.5), dec!(2)), dec!(1)))
            .unwrap();
        engine.end_block().unwrap();
        assert_eq!(available(&engine, LONG), dec!(993));

        engine.begin_block(BlockContext::new(2, Timestamp(100))).unwrap();
        assert_eq!(engine.market(id).unwrap().status(), MarketStatus::Expired);
        assert!(engine.market_state(id).unwrap().resting.is_empty());
        assert_eq!(available(&engine, LONG), dec!(994));

        oracle.set_price(&pair, dec!(1.3));
        let summary = engine.begin_block(BlockContext::new(3, Timestamp(200))).unwrap();
        assert_eq!(summary.settled_markets, vec![id]);
        assert_eq!(engine.market(id).unwrap().status(), MarketStatus::Demolished);
        // clamped to 1: the long collects the full payout
        assert_eq!(available(&engine, LONG), dec!(1004));
        assert_eq!(available(&engine, SHORT), dec!(996));
        assert_eq!(
            engine.market(id).unwrap().binary_info().unwrap().settlement_price,
            Some(SettlementPrice::Price(Decimal::ONE))
        );
    }

    #[test]
    fn expired_binary_market_takes_the_admin_outcome() {
        let oracle = MockOracle::new();
        let params = fee_free(MarketParams::binary_option(MarketId(3), 0));
        oracle.set_price(&params.oracle, dec!(0.6));
        let mut engine = engine(&oracle, InMemoryInsurance::new());
        let id = engine.launch_binary_options_market(params, Timestamp(100), Timestamp(200)).unwrap();

        engine.begin_block(BlockContext::new(1, Timestamp(10))).unwrap();
        open_pair(&mut engine, id, dec!(0.6), dec!(10), dec!(6), dec!(4));
        engine.begin_block(BlockContext::new(2, Timestamp(100))).unwrap();
        assert_eq!(engine.market(id).unwrap().status(), MarketStatus::Expired);

        engine.admin_settle_binary_options(id, Decimal::ONE).unwrap();
        assert_eq!(engine.market(id).unwrap().status(), MarketStatus::Demolished);
        let summary = engine.begin_block(BlockContext::new(3, Timestamp(150))).unwrap();
        assert_eq!(summary.settled_markets, vec![id]);
        assert_eq!(available(&engine, LONG), dec!(1004));
        assert_eq!(available(&engine, SHORT), dec!(996));

        assert!(matches!(
            engine.admin_settle_binary_options(id, Decimal::ZERO),
            Err(crate::engine::EngineError::TerminalMarket(_))
        ));
    }

    #[test]
    fn force_settlement_uses_mark_at_pausing() {
        let oracle = MockOracle::new();
        let params = fee_free(MarketParams::btc_perp(MarketId(1)));
        let pair = params.oracle.clone();
        oracle.set_price(&pair, dec!(100));
        let mut engine = engine(&oracle, InMemoryInsurance::new());
        let id = engine.launch_perpetual_market(params).unwrap();
        engine.begin_block(BlockContext::new(1, Timestamp(10))).unwrap();
        open_pair(&mut engine, id, dec!(100), dec!(1), dec!(50), dec!(50));

        engine.force_pause_market(id).unwrap();
        oracle.set_price(&pair, dec!(120));
        engine.force_settle_market(id, None).unwrap();
        assert!(matches!(engine.force_settle_market(id, None), Err(crate::engine::EngineError::SettlementAlreadyScheduled(_))));
        assert_eq!(engine.scheduled_settlements(), vec![id]);

        engine.begin_block(BlockContext::new(2, Timestamp(20))).unwrap();
        assert!(engine.scheduled_settlements().is_empty());
        assert_eq!(available(&engine, LONG), dec!(1000));
        assert_eq!(available(&engine, SHORT), dec!(1000));
        assert_eq!(engine.market(id).unwrap().status(), MarketStatus::Paused);
    }

    #[test]
    fn unpriced_pause_takes_the_insurance_fund() {
        let oracle = MockOracle::new();
        let params = MarketParams::btc_perp(MarketId(1));
        let mut engine = engine(&oracle, InMemoryInsurance::new().with_fund(MarketId(1), dec!(250)));
        let id = engine.launch_perpetual_market(params).unwrap();

        engine.pause_and_schedule_settlement(id, true).unwrap();
        assert_eq!(engine.market(id).unwrap().status(), MarketStatus::Paused);
        assert_eq!(engine.market_balance(id), Some(dec!(250)));
        assert_eq!(engine.insurance().balance(id).unwrap(), Decimal::ZERO);
        assert!(engine.scheduled_settlements().is_empty());
        assert!(engine
            .events()
            .iter()
            .any(|e| matches!(&e.payload, EventPayload::NotSettledMarketBalance(b) if b.amount == dec!(250))));
    }

    #[test]
    fn market_balance_at_mark() {
        let oracle = MockOracle::new();
        let params = fee_free(MarketParams::btc_perp(MarketId(1)));
        let pair = params.oracle.clone();
        oracle.set_price(&pair, dec!(100));
        let mut engine = engine(&oracle, InMemoryInsurance::new());
        let id = engine.launch_perpetual_market(params).unwrap();
        engine.begin_block(BlockContext::new(1, Timestamp(10))).unwrap();
        open_pair(&mut engine, id, dec!(100), dec!(2), dec!(40), dec!(40));

        oracle.set_price(&pair, dec!(105));
        // long: 40 + 10, short: 40 - 10
        assert_eq!(engine.calculate_market_balance(id).unwrap(), dec!(80));
    }
}
