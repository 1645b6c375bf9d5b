// 8.7 engine/liquidation.rs: closing positions below maintenance margin.
// the position is sold into the resting book as a reduce-only market order no worse
// than its bankruptcy price. what is left of its margin goes to the liquidator and
// the insurance fund; a shortfall is drawn from insurance.

use super::core::Engine;
use super::results::{EngineError, LiquidationResult};
use crate::batch::BatchExecutionData;
use crate::events::{CancelReason, EventPayload, LiquidationEvent};
use crate::expansion::ExpansionContext;
use crate::matching::{market_order_execution_data, MarketMatchingInput};
use crate::order::{DerivativeLimitOrder, DerivativeMarketOrder, OrderError, OrderInfo};
use crate::orderbook::MatchingSession;
use crate::position::PositionCache;
use crate::risk::open_notional;
use crate::types::{round_amount, MarketId, OrderHash, Side, SubaccountId};
use rust_decimal::Decimal;
use tracing::{info, warn};

impl Engine {
    pub fn liquidate_position(
        &mut self,
        market_id: MarketId,
        subaccount_id: SubaccountId,
        liquidator: SubaccountId,
    ) -> Result<LiquidationResult, EngineError> {
        let mark_price = self.mark_price(market_id).ok_or(EngineError::NoMarkPrice(market_id))?;
        let state = self.state(market_id)?;
        if !state.market.is_active() {
            return Err(OrderError::MarketNotActive(market_id).into());
        }
        if state.market.is_binary_options() {
            return Err(EngineError::NotLiquidatable { market_id, subaccount_id });
        }
        let mut position = state
            .position(subaccount_id)
            .cloned()
            .ok_or(EngineError::PositionNotFound(market_id, subaccount_id))?;
        position.apply_funding(state.market.funding());
        if !position.is_liquidatable(mark_price, state.market.maintenance_margin_ratio()) {
            return Err(EngineError::NotLiquidatable { market_id, subaccount_id });
        }

        let worst_price = position.bankruptcy_price_with_added_margin(Decimal::ZERO).max(Decimal::ZERO);
        let side = Side::from_is_buy(!position.is_long);
        let quantity = position.quantity;
        let order = DerivativeMarketOrder {
            hash: self.store.next_order_hash(),
            market_id,
            side,
            info: OrderInfo::new(subaccount_id, worst_price, quantity).with_fee_recipient(liquidator),
            margin: Decimal::ZERO,
            margin_hold: Decimal::ZERO,
        };

        let mut batch = self.liquidation_batch(market_id, order, mark_price)?;
        let executed_quantity = batch.positions.iter().find(|p| p.subaccount_id == subaccount_id).map_or(Decimal::ZERO, |p| quantity - p.position.quantity);
        if executed_quantity.is_zero() {
            return Err(EngineError::NoLiquidity(market_id));
        }

        // the trader's payout is split instead of credited
        let payout = batch.deposit_deltas.remove(subaccount_id).map_or(Decimal::ZERO, |d| d.total);
        let mut covered = Decimal::ZERO;
        let mut uncovered = Decimal::ZERO;
        if payout < Decimal::ZERO {
            let available = self.insurance.balance(market_id).unwrap_or_default();
            covered = available.min(-payout);
            uncovered = -payout - covered;
            batch.market_balance_delta -= uncovered;
        }
        if let Err(shortfall) = self.ensure_market_solvency(market_id, batch.market_balance_delta) {
            warn!(market = ?market_id, %shortfall, "liquidation would leave the market insolvent");
            self.pause_for_settlement(market_id, true, CancelReason::InsolventBatch)?;
            return Err(EngineError::InsolventMarket(market_id));
        }

        self.cancel_subaccount_orders(market_id, subaccount_id, CancelReason::Liquidation)?;

        let mut liquidator_reward = Decimal::ZERO;
        let mut insurance_delta = Decimal::ZERO;
        if payout > Decimal::ZERO {
            liquidator_reward = round_amount(payout * self.config.liquidator_reward_share);
            batch.deposit_deltas.add_both(liquidator, liquidator_reward);
            let remainder = payout - liquidator_reward;
            match self.insurance.deposit(market_id, remainder) {
                Ok(()) => insurance_delta = remainder,
                Err(err) => {
                    warn!(market = ?market_id, %remainder, error = %err, "insurance refused liquidation proceeds, crediting auction subaccount");
                    batch.deposit_deltas.add_both(SubaccountId::AUCTION, remainder);
                }
            }
        } else if covered > Decimal::ZERO {
            self.insurance.withdraw(market_id, covered)?;
            insurance_delta = -covered;
        }

        self.persist_batch(market_id, batch, false)?;
        info!(
            market = ?market_id,
            subaccount = ?subaccount_id,
            liquidator = ?liquidator,
            %executed_quantity,
            %payout,
            %liquidator_reward,
            "position liquidated"
        );
        self.emit_event(EventPayload::Liquidation(LiquidationEvent {
            market_id,
            subaccount_id,
            liquidator,
            executed_quantity,
            payout,
            liquidator_reward,
        }));

        if uncovered > Decimal::ZERO {
            warn!(market = ?market_id, %uncovered, "insurance cannot cover the liquidation, settling market");
            self.pause_and_schedule_settlement(market_id, true)?;
        }

        Ok(LiquidationResult {
            market_id,
            subaccount_id,
            liquidator,
            executed_quantity,
            payout,
            liquidator_reward,
            insurance_delta,
        })
    }

    /// Matches the closing order against everyone's resting orders but the trader's own.
    fn liquidation_batch(&self, market_id: MarketId, order: DerivativeMarketOrder, mark_price: Decimal) -> Result<BatchExecutionData, EngineError> {
        let state = self.state(market_id)?;
        let subaccount_id = order.subaccount_id();
        let others = |side: Side| -> Vec<DerivativeLimitOrder> {
            state
                .resting_side(side)
                .into_iter()
                .filter(|o| o.subaccount_id() != subaccount_id)
                .collect()
        };
        let (market_buys, market_sells) = if order.is_buy() { (vec![order], Vec::new()) } else { (Vec::new(), vec![order]) };
        let input = MarketMatchingInput {
            market_buys,
            market_sells,
            resting_buys: others(Side::Buy),
            resting_sells: others(Side::Sell),
            taker_fee_rate: None,
        };

        let ctx = ExpansionContext {
            market: &state.market,
            discounts: &self.discounts,
            bank: self.bank.as_ref(),
            is_liquidation: true,
        };
        let positions = PositionCache::new(state.positions_snapshot(), state.market.funding().cloned());
        let session = MatchingSession::new(&state.market, Some(mark_price), open_notional(state.open_interest, mark_price), positions);
        let data = market_order_execution_data(&ctx, session, input);
        Ok(BatchExecutionData::from_market_matching(&state.market, data, true))
    }

    fn cancel_subaccount_orders(&mut self, market_id: MarketId, subaccount_id: SubaccountId, reason: CancelReason) -> Result<(), EngineError> {
        let state = self.state(market_id)?;
        let resting: Vec<OrderHash> = state.resting.iter().filter(|o| o.subaccount_id() == subaccount_id).map(|o| o.hash).collect();
        let transient: Vec<OrderHash> = state
            .transient_limit_orders
            .iter()
            .filter(|o| o.subaccount_id() == subaccount_id)
            .map(|o| o.hash)
            .collect();
        let conditional: Vec<OrderHash> = state.conditional.by_subaccount(subaccount_id).iter().map(|o| o.hash).collect();

        for hash in resting {
            self.cancel_resting_order(market_id, hash, reason)?;
        }
        for hash in transient {
            self.cancel_transient_limit_order(market_id, hash, reason)?;
        }
        for hash in conditional {
            self.cancel_conditional_order(market_id, hash, reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::{Engine, EngineConfig, EngineError, OrderRequest};
    use crate::interfaces::{BankKeeper, InMemoryBank, InMemoryInsurance, MockOracle};
    use crate::market::{MarketParams, OracleRef};
    use crate::order::OrderInfo;
    use crate::types::{BlockContext, MarketId, Side, SubaccountId, Timestamp};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    const TRADER: SubaccountId = SubaccountId(1);
    const COUNTERPARTY: SubaccountId = SubaccountId(2);
    const LIQUIDATOR: SubaccountId = SubaccountId(3);

    fn setup(insurance: InMemoryInsurance) -> (Engine, MockOracle, OracleRef, MarketId) {
        let oracle = MockOracle::new();
        let mut params = MarketParams::btc_perp(MarketId(1));
        params.maker_fee_rate = Decimal::ZERO;
        params.taker_fee_rate = Decimal::ZERO;
        let pair = params.oracle.clone();
        oracle.set_price(&pair, dec!(100));
        let mut bank = InMemoryBank::new();
        for subaccount_id in [TRADER, COUNTERPARTY, LIQUIDATOR] {
            bank.fund(subaccount_id, "USDT", dec!(1000));
        }
        let mut engine = Engine::new(EngineConfig::default(), Box::new(oracle.clone()), Box::new(insurance), Box::new(bank));
        let id = engine.launch_perpetual_market(params).unwrap();
        engine.begin_block(BlockContext::new(1, Timestamp(10))).unwrap();

        // trader long 1 at 100 on 10 margin: bankrupt at 90
        engine
            .place_limit_order(OrderRequest::new(id, Side::Buy, OrderInfo::new(TRADER, dec!(100), dec!(1)), dec!(10)))
            .unwrap();
        engine
            .place_limit_order(OrderRequest::new(id, Side::Sell, OrderInfo::new(COUNTERPARTY, dec!(100), dec!(1)), dec!(100)))
            .unwrap();
        engine.end_block().unwrap();
        (engine, oracle, pair, id)
    }

    fn bid(engine: &mut Engine, id: MarketId, price: Decimal) {
        engine
            .place_limit_order(OrderRequest::new(id, Side::Buy, OrderInfo::new(LIQUIDATOR, price, dec!(1)), price))
            .unwrap();
        engine.end_block().unwrap();
    }

    #[test]
    fn healthy_positions_are_not_liquidated() {
        let (mut engine, _, _, id) = setup(InMemoryInsurance::new());
        assert!(matches!(
            engine.liquidate_position(id, TRADER, LIQUIDATOR),
            Err(EngineError::NotLiquidatable { .. })
        ));
    }

    #[test]
    fn empty_book_leaves_position_open() {
        let (mut engine, oracle, pair, id) = setup(InMemoryInsurance::new());
        oracle.set_price(&pair, dec!(92));
        assert!(matches!(engine.liquidate_position(id, TRADER, LIQUIDATOR), Err(EngineError::NoLiquidity(_))));
        assert_eq!(engine.position(id, TRADER).unwrap().quantity, dec!(1));
    }

    #[test]
    fn remaining_margin_is_split_with_insurance() {
        let (mut engine, oracle, pair, id) = setup(InMemoryInsurance::new().with_fund(MarketId(1), Decimal::ZERO));
        bid(&mut engine, id, dec!(91));
        oracle.set_price(&pair, dec!(92));

        let result = engine.liquidate_position(id, TRADER, LIQUIDATOR).unwrap();
        assert_eq!(result.executed_quantity, dec!(1));
        // 10 margin - 9 loss
        assert_eq!(result.payout, dec!(1));
        assert_eq!(result.liquidator_reward, dec!(0.5));
        assert_eq!(result.insurance_delta, dec!(0.5));

        assert!(engine.position(id, TRADER).is_none());
        let taken = engine.position(id, LIQUIDATOR).unwrap();
        assert!(taken.is_long);
        assert_eq!(taken.entry_price, dec!(91));
        assert_eq!(engine.bank().deposit(TRADER, "USDT").total, dec!(990));
        assert_eq!(engine.bank().deposit(LIQUIDATOR, "USDT").available, dec!(909.5));
        assert_eq!(engine.insurance().balance(id).unwrap(), dec!(0.5));
        assert_eq!(engine.market_balance(id), Some(dec!(200)));
    }

    #[test]
    fn refused_insurance_share_goes_to_auction() {
        let mut insurance = InMemoryInsurance::new().with_fund(MarketId(1), Decimal::ZERO);
        insurance.set_reject_deposits(true);
        let (mut engine, oracle, pair, id) = setup(insurance);
        bid(&mut engine, id, dec!(91));
        oracle.set_price(&pair, dec!(92));

        let result = engine.liquidate_position(id, TRADER, LIQUIDATOR).unwrap();
        assert_eq!(result.insurance_delta, Decimal::ZERO);
        assert_eq!(engine.bank().deposit(SubaccountId::AUCTION, "USDT").total, dec!(0.5));
    }
}
