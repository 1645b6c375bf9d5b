//! Market settlement and socialized loss.
//!
//! Settling closes every position of a market at one price. Before the
//! closes, the market checks whether its balance can pay all of them:
//!
//! 1. A surplus (binary options refunds only) goes to the insurance fund,
//!    or to the auction subaccount when the fund refuses it.
//! 2. A deficit is drawn from the insurance fund, bounded by its balance.
//! 3. What the fund cannot cover is taken from profitable positions,
//!    pro rata to their profit.
//! 4. If profits are not enough, every positive payout is cut pro rata.
//! 5. If payouts are not enough either, the market is beyond bankruptcy:
//!    positions with a positive payout close with nothing.
//!
//! Everything here works on owned positions and returns balance changes and
//! events. The engine persists the outcome.

use crate::events::{
    BatchExecutionEvent, EventPayload, ExecutionType, HaircutEvent, MarketBalanceEvent, MarketPausedEvent, TradeLog,
};
use crate::funding::TwapError;
use crate::interfaces::{CollaboratorError, InsuranceFund};
use crate::market::{Market, MarketError, PerpetualFunding, SettlementPrice};
use crate::position::{DeltaOutcome, Position, PositionDelta, PositionState};
use crate::types::{round_amount, DepositDeltas, MarketId, OrderHash, SubaccountId};
use rust_decimal::Decimal;
use tracing::{info, warn};

/// Raw price an admin passes to ask for a binary options refund.
pub const BINARY_OPTIONS_REFUND_FLAG: Decimal = Decimal::NEGATIVE_ONE;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettlementError {
    #[error("Insurance fund: {0}")]
    Insurance(#[from] CollaboratorError),

    #[error("Expiry TWAP: {0}")]
    Twap(#[from] TwapError),

    #[error("No oracle price for market {0:?}")]
    MissingOraclePrice(MarketId),

    #[error("Market {market_id:?} balance {balance} is negative after settlement")]
    NegativeMarketBalance { market_id: MarketId, balance: Decimal },
}

/// Where one position stands if closed at the settlement price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionFundsStatus {
    pub is_profitable: bool,
    /// Profit counted toward haircuts, net of negative margin
    pub profit: Decimal,
    /// How far the payout is below zero
    pub deficit: Decimal,
    pub payout: Decimal,
}

pub fn position_funds_status(position: &Position, settlement_price: Decimal, closing_fee_rate: Decimal) -> PositionFundsStatus {
    let payout = position.payout_if_fully_closing(settlement_price, closing_fee_rate);
    let mut status = PositionFundsStatus {
        is_profitable: payout.is_profitable,
        profit: Decimal::ZERO,
        deficit: Decimal::ZERO,
        payout: payout.payout,
    };
    if payout.is_profitable {
        status.profit = payout.pnl + position.margin.min(Decimal::ZERO);
    } else if payout.payout < Decimal::ZERO {
        status.deficit = payout.payout.abs();
    }
    status
}

/// A position that cannot pay for its own close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeficitPosition {
    pub subaccount_id: SubaccountId,
    pub deficit: Decimal,
}

/// How a market's balance compares to what its positions are owed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocializedLossData {
    /// Positions that give up part of their profit (or margin, for refunds)
    pub positions_receiving_haircut: Vec<SubaccountId>,
    pub deficit_positions: Vec<DeficitPosition>,
    pub deficit_amount: Decimal,
    pub surplus_amount: Decimal,
    pub total_profits: Decimal,
    pub total_positive_payouts: Decimal,
}

// 4.6: the deficit is the larger of what losing positions cannot pay and what
// positive payouts exceed the market balance by.
pub fn derivative_socialized_loss_data(
    positions: &mut [PositionState],
    funding: Option<&PerpetualFunding>,
    settlement_price: Decimal,
    closing_fee_rate: Decimal,
    market_balance: Decimal,
) -> SocializedLossData {
    let mut data = SocializedLossData::default();
    for state in positions.iter_mut() {
        state.position.apply_funding(funding);
        let status = position_funds_status(&state.position, settlement_price, closing_fee_rate);
        data.total_profits += status.profit;
        data.deficit_amount += status.deficit;
        if status.payout > Decimal::ZERO {
            data.total_positive_payouts += status.payout;
        }

        if status.is_profitable {
            data.positions_receiving_haircut.push(state.subaccount_id);
        } else if status.deficit > Decimal::ZERO {
            data.deficit_positions.push(DeficitPosition {
                subaccount_id: state.subaccount_id,
                deficit: status.deficit,
            });
        }
    }

    let deficit_from_market_balance = data.total_positive_payouts - market_balance;
    data.deficit_amount = data.deficit_amount.max(deficit_from_market_balance);
    data
}

/// Refund settlement of a binary options market. Liabilities are the margins,
/// assets are half a contract payout per unit held.
pub fn binary_refund_socialized_loss_data(positions: &[PositionState], oracle_scale: Decimal, market_balance: Decimal) -> SocializedLossData {
    let liabilities: Decimal = positions.iter().map(|s| s.position.margin).sum();
    let total_quantity: Decimal = positions.iter().map(|s| s.position.quantity).sum();
    let assets = total_quantity * oracle_scale / Decimal::TWO;

    let mut deficit = (liabilities - assets).max(Decimal::ZERO);
    let mut surplus = (assets - liabilities).max(Decimal::ZERO);
    let deficit_from_market_balance = surplus + liabilities - market_balance;
    deficit = deficit.max(deficit_from_market_balance);
    if deficit > Decimal::ZERO {
        surplus = Decimal::ZERO;
    }

    SocializedLossData {
        positions_receiving_haircut: positions.iter().map(|s| s.subaccount_id).collect(),
        deficit_positions: Vec::new(),
        deficit_amount: deficit,
        surplus_amount: surplus,
        total_profits: liabilities,
        total_positive_payouts: Decimal::ZERO,
    }
}

/// `Σ(margin + pnl at mark)` over funding-adjusted positions: what the market
/// would owe if it closed at `mark_price`.
pub fn calculate_market_balance<'a>(
    positions: impl IntoIterator<Item = &'a Position>,
    mark_price: Decimal,
    funding: Option<&PerpetualFunding>,
) -> Decimal {
    positions
        .into_iter()
        .map(|position| {
            let mut position = position.clone();
            position.apply_funding(funding);
            position.margin + position.unrealized_pnl(mark_price)
        })
        .sum()
}

/// Parses an admin-provided binary options price: the refund flag, or a
/// probability in [0, 1] scaled by the oracle scale factor.
pub fn binary_settlement_price(market: &Market, raw_price: Decimal) -> Result<SettlementPrice, MarketError> {
    if !market.is_binary_options() {
        return Err(MarketError::NotBinaryOptions(market.id()));
    }
    if raw_price == BINARY_OPTIONS_REFUND_FLAG {
        return Ok(SettlementPrice::Refund);
    }
    if raw_price < Decimal::ZERO || raw_price > Decimal::ONE {
        return Err(MarketError::InvalidSettlementPrice(raw_price));
    }
    Ok(SettlementPrice::Price(market.oracle().scaled_price(raw_price)))
}

/// Draws up to `deficit` from the market's insurance fund. returns the amount withdrawn.
pub fn pay_deficit_from_insurance(
    insurance: &mut dyn InsuranceFund,
    market_id: MarketId,
    deficit: Decimal,
) -> Result<Decimal, SettlementError> {
    if deficit <= Decimal::ZERO {
        return Ok(Decimal::ZERO);
    }
    let withdrawal = insurance.balance(market_id)?.min(deficit);
    if withdrawal <= Decimal::ZERO {
        return Ok(Decimal::ZERO);
    }
    insurance.withdraw(market_id, withdrawal)?;
    Ok(withdrawal)
}

/// Everything a settlement wants persisted.
#[derive(Debug, Clone, Default)]
pub struct SettlementOutcome {
    pub market_id: MarketId,
    /// Closed positions, sorted by subaccount
    pub positions: Vec<PositionState>,
    pub deposit_deltas: DepositDeltas,
    pub market_balance: Decimal,
    pub insurance_withdrawn: Decimal,
    pub insurance_deposited: Decimal,
    /// Surplus credited to the auction subaccount after the insurance fund refused it
    pub auction_surplus: Decimal,
    pub events: Vec<EventPayload>,
}

impl SettlementOutcome {
    /// Sum of payouts credited to traders and the auction subaccount.
    pub fn total_credited(&self) -> Decimal {
        self.deposit_deltas.iter().map(|(_, d)| d.total).sum()
    }
}

struct Settlement<'a> {
    market: &'a Market,
    price: SettlementPrice,
    closing_fee_rate: Decimal,
    positions: Vec<PositionState>,
    outcome: SettlementOutcome,
}

// 4.6: settle at `price`, closing every position. `market_balance` is what the
// market holds for its positions before settling.
pub fn settle_market(
    market: &Market,
    positions: Vec<PositionState>,
    market_balance: Decimal,
    price: SettlementPrice,
    closing_fee_rate: Decimal,
    insurance: &mut dyn InsuranceFund,
) -> SettlementOutcome {
    let mut settlement = Settlement {
        market,
        price,
        closing_fee_rate,
        positions,
        outcome: SettlementOutcome {
            market_id: market.id(),
            market_balance,
            deposit_deltas: DepositDeltas::new(),
            ..SettlementOutcome::default()
        },
    };
    settlement.positions.sort_by_key(|s| s.subaccount_id);

    let deficit_positions = settlement.socialize_loss(insurance);
    settlement.close_all_positions(&deficit_positions);
    settlement.outcome.positions = settlement.positions;
    settlement.outcome
}

impl Settlement<'_> {
    fn socialize_loss(&mut self, insurance: &mut dyn InsuranceFund) -> Vec<DeficitPosition> {
        let market_id = self.market.id();
        let data = match self.price {
            SettlementPrice::Refund => {
                binary_refund_socialized_loss_data(&self.positions, self.market.oracle_scale(), self.outcome.market_balance)
            }
            SettlementPrice::Price(price) => derivative_socialized_loss_data(
                &mut self.positions,
                self.market.funding(),
                price,
                self.closing_fee_rate,
                self.outcome.market_balance,
            ),
        };

        if data.surplus_amount > Decimal::ZERO {
            self.move_surplus(insurance, data.surplus_amount);
            return data.deficit_positions;
        }

        let withdrawn = match pay_deficit_from_insurance(insurance, market_id, data.deficit_amount) {
            Ok(withdrawn) => withdrawn,
            Err(err) => {
                warn!(market = ?market_id, deficit = %data.deficit_amount, error = %err, "insurance draw failed during settlement");
                Decimal::ZERO
            }
        };
        self.outcome.insurance_withdrawn = withdrawn;
        self.outcome.market_balance += withdrawn;
        let remaining_deficit = data.deficit_amount - withdrawn;

        if remaining_deficit <= Decimal::ZERO {
            self.emit_paused(Decimal::ZERO, Decimal::ZERO);
            return data.deficit_positions;
        }

        warn!(market = ?market_id, missing = %remaining_deficit, total_profits = %data.total_profits, "market settles with a deficit");
        match self.price {
            SettlementPrice::Refund => self.haircut_refund(&data, remaining_deficit),
            SettlementPrice::Price(price) => self.haircut_payouts(&data, remaining_deficit, price),
        }
        data.deficit_positions
    }

    fn move_surplus(&mut self, insurance: &mut dyn InsuranceFund, surplus: Decimal) {
        let market_id = self.market.id();
        self.outcome.market_balance -= surplus;
        match insurance.deposit(market_id, surplus) {
            Ok(()) => {
                info!(market = ?market_id, surplus = %surplus, "settlement surplus moved to insurance");
                self.outcome.insurance_deposited = surplus;
            }
            Err(err) => {
                warn!(market = ?market_id, surplus = %surplus, error = %err, "insurance refused surplus, crediting auction subaccount");
                self.outcome.auction_surplus = surplus;
                self.outcome.deposit_deltas.add_both(SubaccountId::AUCTION, surplus);
            }
        }
    }

    /// Refunds lose margin pro rata until the market can pay.
    fn haircut_refund(&mut self, data: &SocializedLossData, remaining_deficit: Decimal) {
        let total_margin = data.total_profits;
        let taken = remaining_deficit.min(total_margin);
        for state in &mut self.positions {
            state.position.apply_margin_haircut(taken, total_margin);
        }
        let rate = if total_margin.is_zero() { Decimal::ZERO } else { taken / total_margin };
        self.emit_paused(remaining_deficit, rate);
    }

    fn haircut_payouts(&mut self, data: &SocializedLossData, remaining_deficit: Decimal, price: Decimal) {
        let mut rate = Decimal::ZERO;
        if data.total_profits > Decimal::ZERO {
            let taken = remaining_deficit.min(data.total_profits);
            for state in &mut self.positions {
                if data.positions_receiving_haircut.contains(&state.subaccount_id) {
                    state.position.apply_profit_haircut(taken, data.total_profits, price);
                }
            }
            rate = remaining_deficit / data.total_profits;
        }
        self.emit_paused(remaining_deficit, rate);

        if data.total_profits >= remaining_deficit {
            return;
        }

        let deficit_after_profits = remaining_deficit - data.total_profits;
        let remaining_payouts = data.total_positive_payouts - data.total_profits;
        let fee_rate = self.closing_fee_rate;
        let has_positive_payout = |p: &Position| p.payout_if_fully_closing(price, fee_rate).payout > Decimal::ZERO;

        if remaining_payouts >= deficit_after_profits && remaining_payouts > Decimal::ZERO {
            for state in &mut self.positions {
                if has_positive_payout(&state.position) {
                    state.position.apply_total_payout_haircut(deficit_after_profits, remaining_payouts, price, fee_rate);
                }
            }
            let rate = deficit_after_profits / remaining_payouts;
            warn!(market = ?self.market.id(), rate = %rate, "haircutting all positive payouts");
            self.outcome.events.push(EventPayload::AllPositionsHaircut(HaircutEvent {
                market_id: self.market.id(),
                settle_price: Some(price),
                missing_funds: deficit_after_profits,
                missing_funds_rate: rate,
            }));
            return;
        }

        for state in &mut self.positions {
            if has_positive_payout(&state.position) {
                state.position.close_position_without_payouts(price);
            }
        }
        let missing = deficit_after_profits - remaining_payouts;
        warn!(market = ?self.market.id(), missing = %missing, "market is beyond bankruptcy");
        self.outcome.events.push(EventPayload::MarketBeyondBankruptcy(HaircutEvent {
            market_id: self.market.id(),
            settle_price: Some(price),
            missing_funds: missing,
            missing_funds_rate: Decimal::ONE,
        }));
    }

    fn emit_paused(&mut self, missing: Decimal, rate: Decimal) {
        self.outcome.events.push(EventPayload::MarketPaused(MarketPausedEvent {
            market_id: self.market.id(),
            settle_price: self.price.price(),
            total_missing_funds: missing,
            missing_funds_rate: rate,
        }));
    }

    fn close_position(&self, position: &mut Position) -> (DeltaOutcome, Decimal, PositionDelta) {
        match self.price {
            SettlementPrice::Refund => {
                let (outcome, delta) = position.close_by_refunding();
                (outcome, Decimal::ZERO, delta)
            }
            SettlementPrice::Price(price) => position.close_with_settle_price(price, self.closing_fee_rate),
        }
    }

    fn close_all_positions(&mut self, deficit_positions: &[DeficitPosition]) {
        let market_id = self.market.id();
        let mut deltas = DepositDeltas::new();
        let mut balance_delta = Decimal::ZERO;
        let mut buy_trades = Vec::new();
        let mut sell_trades = Vec::new();

        let mut positions = std::mem::take(&mut self.positions);
        for state in &mut positions {
            let was_long = state.position.is_long;
            if let SettlementPrice::Price(price) = self.price {
                if self.closing_fee_rate > Decimal::ZERO && price > Decimal::ZERO {
                    let auction_fee = round_amount(price * state.position.quantity * self.closing_fee_rate);
                    deltas.add_both(SubaccountId::AUCTION, auction_fee);
                    balance_delta -= auction_fee;
                }
            }

            let (outcome, fee, delta) = self.close_position(&mut state.position);
            balance_delta -= outcome.payout;
            deltas.add_both(state.subaccount_id, outcome.payout);

            let trade = TradeLog {
                subaccount_id: state.subaccount_id,
                position_delta: delta,
                payout: outcome.payout,
                fee,
                order_hash: OrderHash::default(),
                fee_recipient: SubaccountId::AUCTION,
                cid: None,
                pnl: outcome.pnl,
            };
            if was_long {
                sell_trades.push(trade);
            } else {
                buy_trades.push(trade);
            }
        }
        self.positions = positions;

        for deficit in deficit_positions {
            deltas.add_both(deficit.subaccount_id, deficit.deficit);
            balance_delta -= deficit.deficit;
        }

        self.outcome.market_balance += balance_delta;
        let balance = self.outcome.market_balance;
        self.outcome.events.push(EventPayload::SettledMarketBalance(MarketBalanceEvent {
            market_id,
            amount: balance,
        }));

        if balance < Decimal::ZERO {
            let err = SettlementError::NegativeMarketBalance { market_id, balance };
            warn!(market = ?market_id, error = %err, "skipping settlement balance updates");
            return;
        }

        let is_liquidation = self.closing_fee_rate.is_zero() && !self.market.is_binary_options();
        let execution_type = if is_liquidation {
            ExecutionType::MarketLiquidation
        } else {
            ExecutionType::ExpiryMarketSettlement
        };
        for (is_buy, trades) in [(true, buy_trades), (false, sell_trades)] {
            if trades.is_empty() {
                continue;
            }
            self.outcome.events.push(EventPayload::BatchDerivativeExecution(BatchExecutionEvent {
                market_id,
                is_buy,
                execution_type,
                is_liquidation,
                cumulative_funding: self.market.funding().map(|f| f.cumulative_funding),
                trades,
            }));
        }
        self.outcome.deposit_deltas.merge(deltas);
        info!(market = ?market_id, balance = %balance, positions = self.positions.len(), "market settled");
    }
}
