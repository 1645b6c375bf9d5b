// 8.6 engine/lifecycle.rs: admin changes to a live market.
// fee changes are swept through open orders so every hold matches the new rates.

use super::core::Engine;
use super::orders::CancellationStrategy;
use super::results::EngineError;
use crate::events::{CancelReason, EventPayload, MarketParamsUpdatedEvent};
use crate::funding::reschedule_funding;
use crate::market::{Market, MarketStatus, OpenNotionalCap};
use crate::types::{MarketId, OrderHash, SubaccountId, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Parameters to change. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketParamsUpdate {
    pub maker_fee_rate: Option<Decimal>,
    pub taker_fee_rate: Option<Decimal>,
    pub relayer_fee_share_rate: Option<Decimal>,
    pub initial_margin_ratio: Option<Decimal>,
    pub maintenance_margin_ratio: Option<Decimal>,
    pub min_price_tick_size: Option<Decimal>,
    pub min_quantity_tick_size: Option<Decimal>,
    pub min_notional: Option<Decimal>,
    pub open_notional_cap: Option<OpenNotionalCap>,
    pub status: Option<MarketStatus>,
    /// Perpetuals only
    pub hourly_funding_rate_cap: Option<Decimal>,
    /// Perpetuals only
    pub hourly_interest_rate: Option<Decimal>,
    /// Perpetuals only, in seconds
    pub funding_interval: Option<i64>,
}

impl MarketParamsUpdate {
    fn apply_to(&self, market: &mut Market, now: Timestamp) {
        let params = market.params_mut();
        set_if_some(&mut params.maker_fee_rate, self.maker_fee_rate);
        set_if_some(&mut params.taker_fee_rate, self.taker_fee_rate);
        set_if_some(&mut params.relayer_fee_share_rate, self.relayer_fee_share_rate);
        set_if_some(&mut params.initial_margin_ratio, self.initial_margin_ratio);
        set_if_some(&mut params.maintenance_margin_ratio, self.maintenance_margin_ratio);
        set_if_some(&mut params.min_price_tick_size, self.min_price_tick_size);
        set_if_some(&mut params.min_quantity_tick_size, self.min_quantity_tick_size);
        set_if_some(&mut params.min_notional, self.min_notional);
        set_if_some(&mut params.open_notional_cap, self.open_notional_cap);

        if let Some(info) = market.perpetual_info_mut() {
            set_if_some(&mut info.hourly_funding_rate_cap, self.hourly_funding_rate_cap);
            set_if_some(&mut info.hourly_interest_rate, self.hourly_interest_rate);
            if let Some(interval) = self.funding_interval {
                reschedule_funding(info, now, interval);
            }
        }
    }
}

fn set_if_some<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

/// Hold difference of `price × quantity` between two fee rates. rebates hold nothing.
fn fee_hold_delta(price: Decimal, quantity: Decimal, previous_rate: Decimal, new_rate: Decimal) -> Decimal {
    price * quantity * (new_rate.max(Decimal::ZERO) - previous_rate.max(Decimal::ZERO))
}

impl Engine {
    pub fn update_market_params(&mut self, market_id: MarketId, update: MarketParamsUpdate) -> Result<(), EngineError> {
        let now = self.block.time;
        let state = self.state(market_id)?;
        if state.market.status().is_terminal() {
            return Err(EngineError::TerminalMarket(market_id));
        }
        let mut updated = state.market.clone();
        update.apply_to(&mut updated, now);
        updated.validate()?;

        let (previous_maker, previous_taker) = (state.market.maker_fee_rate(), state.market.taker_fee_rate());
        let (new_maker, new_taker) = (updated.maker_fee_rate(), updated.taker_fee_rate());
        // sweeps cancel at the previous rates, so they run before the new ones apply
        if new_maker != previous_maker {
            self.sweep_maker_fee_change(market_id, previous_maker, new_maker)?;
        }
        if new_taker != previous_taker {
            self.sweep_taker_fee_change(market_id, previous_taker, new_taker)?;
        }

        let state = self.state_mut(market_id)?;
        update.apply_to(&mut state.market, now);
        let event = MarketParamsUpdatedEvent {
            market_id,
            maker_fee_rate: state.market.maker_fee_rate(),
            taker_fee_rate: state.market.taker_fee_rate(),
            initial_margin_ratio: state.market.initial_margin_ratio(),
            maintenance_margin_ratio: state.market.maintenance_margin_ratio(),
        };
        info!(market = ?market_id, maker = %event.maker_fee_rate, taker = %event.taker_fee_rate, "market params updated");

        if let Some(status) = update.status {
            self.apply_admin_status(market_id, status)?;
        }
        self.emit_event(EventPayload::MarketParamsUpdated(event));
        Ok(())
    }

    fn apply_admin_status(&mut self, market_id: MarketId, status: MarketStatus) -> Result<(), EngineError> {
        let state = self.state(market_id)?;
        if state.market.status() == status {
            return Ok(());
        }
        let is_binary = state.market.is_binary_options();
        match status {
            MarketStatus::Paused | MarketStatus::Expired => {
                self.cancel_all_orders(market_id, true, CancelReason::MarketSettlement)?;
            }
            MarketStatus::Demolished => {
                self.cancel_all_orders(market_id, true, CancelReason::MarketDemolished)?;
                if is_binary && self.store.scheduled_settlement(market_id).is_none() {
                    let recorded = self.state(market_id)?.market.binary_info().and_then(|i| i.settlement_price);
                    let price = match recorded {
                        Some(price) => price,
                        None => self.binary_oracle_settlement_price(market_id)?,
                    };
                    self.store.schedule_settlement(market_id, price);
                }
            }
            MarketStatus::Active | MarketStatus::ForcePaused => {}
        }
        self.set_market_status(market_id, status)
    }

    // 8.6.1: resting vanilla orders hold the maker fee of their open quantity.
    fn sweep_maker_fee_change(&mut self, market_id: MarketId, previous_rate: Decimal, new_rate: Decimal) -> Result<(), EngineError> {
        let state = self.state(market_id)?;
        let denom = state.market.quote_denom().to_string();
        let reference_price = state.resting.mid_price_or_best_price().or_else(|| self.mark_price(market_id));

        let mut increases: BTreeMap<SubaccountId, Vec<(OrderHash, Decimal)>> = BTreeMap::new();
        let mut refunds: Vec<(SubaccountId, Decimal)> = Vec::new();
        for order in state.resting.iter().filter(|o| o.is_vanilla()) {
            let delta = fee_hold_delta(order.price(), order.fillable, previous_rate, new_rate);
            if delta > Decimal::ZERO {
                increases.entry(order.subaccount_id()).or_default().push((order.hash, delta));
            } else if delta < Decimal::ZERO {
                refunds.push((order.subaccount_id(), -delta));
            }
        }

        for (subaccount_id, refund) in refunds {
            self.bank.increment_available_balance_or_bank(subaccount_id, &denom, refund);
        }

        for (subaccount_id, orders) in increases {
            let mut required: Decimal = orders.iter().map(|(_, delta)| *delta).sum();
            let spendable = self.bank.spendable_funds(subaccount_id, &denom);
            if spendable < required {
                let (picks, _) = self.orders_to_cancel_up_to_amount(
                    market_id,
                    subaccount_id,
                    None,
                    CancellationStrategy::FromWorstToBest,
                    reference_price,
                    required - spendable,
                )?;
                for pick in picks {
                    if let Some((_, delta)) = orders.iter().find(|(hash, _)| *hash == pick.hash) {
                        required -= *delta;
                    }
                    warn!(market = ?market_id, order = %pick.hash, "cannot pay the raised maker fee, cancelling");
                    self.cancel_resting_order(market_id, pick.hash, CancelReason::InsufficientFundsForFeeIncrease)?;
                }
            }
            self.charge(subaccount_id, &denom, required)?;
        }
        Ok(())
    }

    // 8.6.2: conditional and transient limit orders hold the taker fee.
    fn sweep_taker_fee_change(&mut self, market_id: MarketId, previous_rate: Decimal, new_rate: Decimal) -> Result<(), EngineError> {
        let state = self.state(market_id)?;
        let denom = state.market.quote_denom().to_string();
        let conditional: Vec<(OrderHash, SubaccountId, Decimal)> = state
            .conditional
            .iter()
            .filter(|o| !o.is_reduce_only())
            .map(|o| (o.hash, o.subaccount_id(), fee_hold_delta(o.price(), o.quantity(), previous_rate, new_rate)))
            .collect();
        let transient: Vec<(OrderHash, SubaccountId, Decimal)> = state
            .transient_limit_orders
            .iter()
            .filter(|o| o.is_vanilla())
            .map(|o| (o.hash, o.subaccount_id(), fee_hold_delta(o.price(), o.fillable, previous_rate, new_rate)))
            .collect();

        for (is_conditional, orders) in [(true, conditional), (false, transient)] {
            for (hash, subaccount_id, delta) in orders {
                if delta < Decimal::ZERO {
                    self.bank.increment_available_balance_or_bank(subaccount_id, &denom, -delta);
                    continue;
                }
                if self.bank.spendable_funds(subaccount_id, &denom) >= delta {
                    self.charge(subaccount_id, &denom, delta)?;
                    continue;
                }
                warn!(market = ?market_id, order = %hash, "cannot pay the raised taker fee, cancelling");
                if is_conditional {
                    self.cancel_conditional_order(market_id, hash, CancelReason::InsufficientFundsForFeeIncrease)?;
                } else {
                    self.cancel_transient_limit_order(market_id, hash, CancelReason::InsufficientFundsForFeeIncrease)?;
                }
            }
        }
        Ok(())
    }

    /// Halts trading without touching orders or positions. The mark price is recorded
    /// so the market can later be force settled at it.
    pub fn force_pause_market(&mut self, market_id: MarketId) -> Result<(), EngineError> {
        let mark_price = self.mark_price(market_id);
        let state = self.state_mut(market_id)?;
        if state.market.status().is_terminal() {
            return Err(EngineError::TerminalMarket(market_id));
        }
        state.market.params_mut().mark_price_at_pausing = mark_price;
        warn!(market = ?market_id, mark_price = ?mark_price, "market force paused");
        self.set_market_status(market_id, MarketStatus::ForcePaused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, OrderRequest};
    use crate::interfaces::{BankKeeper, InMemoryBank, InMemoryInsurance, MockOracle};
    use crate::market::MarketParams;
    use crate::order::OrderInfo;
    use crate::types::{BlockContext, Side};
    use rust_decimal_macros::dec;

    const TRADER: SubaccountId = SubaccountId(4);

    fn engine(funds: Decimal) -> (Engine, MarketId) {
        let oracle = MockOracle::new();
        let params = MarketParams::btc_perp(MarketId(1));
        oracle.set_price(&params.oracle, dec!(100));
        let mut bank = InMemoryBank::new();
        bank.fund(TRADER, "USDT", funds);
        let mut engine = Engine::new(
            EngineConfig::default(),
            Box::new(oracle),
            Box::new(InMemoryInsurance::new()),
            Box::new(bank),
        );
        let id = engine.launch_perpetual_market(params).unwrap();
        engine.begin_block(BlockContext::new(1, Timestamp(10))).unwrap();
        (engine, id)
    }

    fn rest_buy(engine: &mut Engine, id: MarketId, price: Decimal, margin: Decimal) {
        engine
            .place_limit_order(OrderRequest::new(id, Side::Buy, OrderInfo::new(TRADER, price, dec!(1)), margin))
            .unwrap();
        engine.end_block().unwrap();
    }

    fn available(engine: &Engine) -> Decimal {
        engine.bank().deposit(TRADER, "USDT").available
    }

    #[test]
    fn lower_maker_fee_refunds_resting_orders() {
        let (mut engine, id) = engine(dec!(1000));
        rest_buy(&mut engine, id, dec!(100), dec!(10));
        let before = available(&engine);

        let update = MarketParamsUpdate {
            maker_fee_rate: Some(dec!(0.0001)),
            ..MarketParamsUpdate::default()
        };
        engine.update_market_params(id, update).unwrap();
        assert_eq!(available(&engine) - before, dec!(0.04));
        assert_eq!(engine.market(id).unwrap().maker_fee_rate(), dec!(0.0001));
    }

    #[test]
    fn raised_maker_fee_cancels_worst_orders_first() {
        let (mut engine, id) = engine(dec!(20));
        rest_buy(&mut engine, id, dec!(100), dec!(10));
        rest_buy(&mut engine, id, dec!(90), dec!(9));

        let update = MarketParamsUpdate {
            maker_fee_rate: Some(dec!(0.05)),
            taker_fee_rate: Some(dec!(0.05)),
            ..MarketParamsUpdate::default()
        };
        engine.update_market_params(id, update).unwrap();

        let state = engine.market_state(id).unwrap();
        assert_eq!(state.resting.len(), 1);
        assert_eq!(state.resting.best_price(Side::Buy), Some(dec!(100)));
        assert!(engine.events().iter().any(|e| matches!(
            &e.payload,
            EventPayload::OrderCancelled(c) if c.reason == CancelReason::InsufficientFundsForFeeIncrease
        )));
    }

    #[test]
    fn invalid_update_changes_nothing() {
        let (mut engine, id) = engine(dec!(1000));
        let update = MarketParamsUpdate {
            maker_fee_rate: Some(dec!(0.01)),
            ..MarketParamsUpdate::default()
        };
        assert!(matches!(engine.update_market_params(id, update), Err(EngineError::Market(_))));
        assert_eq!(engine.market(id).unwrap().maker_fee_rate(), dec!(0.0005));
    }

    #[test]
    fn pausing_through_params_cancels_orders() {
        let (mut engine, id) = engine(dec!(1000));
        rest_buy(&mut engine, id, dec!(100), dec!(10));
        let update = MarketParamsUpdate {
            status: Some(MarketStatus::Paused),
            funding_interval: Some(60),
            ..MarketParamsUpdate::default()
        };
        engine.update_market_params(id, update).unwrap();

        let market = engine.market(id).unwrap();
        assert_eq!(market.status(), MarketStatus::Paused);
        assert_eq!(market.perpetual_info().unwrap().funding_interval, 60);
        assert_eq!(market.perpetual_info().unwrap().next_funding_timestamp, Timestamp(60));
        assert!(engine.market_state(id).unwrap().resting.is_empty());
        assert_eq!(available(&engine), dec!(1000));
    }

    #[test]
    fn force_pause_keeps_orders() {
        let (mut engine, id) = engine(dec!(1000));
        rest_buy(&mut engine, id, dec!(100), dec!(10));
        engine.force_pause_market(id).unwrap();
        assert_eq!(engine.market(id).unwrap().status(), MarketStatus::ForcePaused);
        assert_eq!(engine.market(id).unwrap().params().mark_price_at_pausing, Some(dec!(100)));
        assert_eq!(engine.market_state(id).unwrap().resting.len(), 1);
    }
}
