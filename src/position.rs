// 4.0: positions. quantity is never negative; direction lives in is_long.
// 4.1 apply_position_delta is the only way a trade changes a position.
// 4.2 settlement helpers: payouts, haircuts, forced closes.
// 4.3 PositionCache: per-pass arena of funding-adjusted working copies.

use crate::margin::pro_rata;
use crate::market::PerpetualFunding;
use crate::types::{round_amount, SubaccountId, AMOUNT_DP};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Haircuts round against the position, so dust stays in the market.
fn round_haircut(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(AMOUNT_DP, RoundingStrategy::AwayFromZero)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub is_long: bool,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub margin: Decimal,
    pub cumulative_funding_entry: Decimal,
}

/// One execution against a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionDelta {
    pub is_long: bool,
    pub execution_quantity: Decimal,
    pub execution_margin: Decimal,
    pub execution_price: Decimal,
}

impl PositionDelta {
    pub fn new(is_long: bool, execution_quantity: Decimal, execution_margin: Decimal, execution_price: Decimal) -> Self {
        Self {
            is_long,
            execution_quantity,
            execution_margin,
            execution_price,
        }
    }
}

/// Result of applying a delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaOutcome {
    /// Returned to the trader from closed quantity (pnl plus released margin)
    pub payout: Decimal,
    /// Part of the execution margin that closed quantity rather than opening it
    pub close_execution_margin: Decimal,
    /// Execution margin that became position margin
    pub collateralization_margin: Decimal,
    pub pnl: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionPayout {
    pub payout: Decimal,
    pub pnl: Decimal,
    pub is_profitable: bool,
}

impl Position {
    pub fn new(is_long: bool, cumulative_funding_entry: Decimal) -> Self {
        Self {
            is_long,
            quantity: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            margin: Decimal::ZERO,
            cumulative_funding_entry,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.quantity.is_zero()
    }

    pub fn is_short(&self) -> bool {
        !self.is_long
    }

    /// Positive for longs, negative for shorts.
    pub fn signed_quantity(&self) -> Decimal {
        if self.is_long {
            self.quantity
        } else {
            -self.quantity
        }
    }

    /// Settles funding accrued since the position last observed the index.
    pub fn apply_funding(&mut self, funding: Option<&PerpetualFunding>) {
        let Some(funding) = funding else {
            return;
        };
        if self.quantity.is_zero() {
            self.cumulative_funding_entry = funding.cumulative_funding;
            return;
        }
        let diff = funding.cumulative_funding - self.cumulative_funding_entry;
        // longs pay positive funding, shorts receive it
        let payment = if self.is_long { -self.quantity * diff } else { self.quantity * diff };
        self.margin += payment;
        self.cumulative_funding_entry = funding.cumulative_funding;
    }

    pub fn pnl_at(&self, price: Decimal, quantity: Decimal) -> Decimal {
        if self.is_long {
            quantity * (price - self.entry_price)
        } else {
            quantity * (self.entry_price - price)
        }
    }

    pub fn unrealized_pnl(&self, mark_price: Decimal) -> Decimal {
        self.pnl_at(mark_price, self.quantity)
    }

    fn weighted_entry_price(&self, quantity: Decimal, price: Decimal) -> Decimal {
        let total = self.quantity + quantity;
        if total.is_zero() {
            return price;
        }
        round_amount((self.entry_price * self.quantity + price * quantity) / total)
    }

    // 4.1: net a fill into the position. same direction adds; opposite direction closes
    // then flips with whatever quantity is left.
    pub fn apply_position_delta(&mut self, delta: &PositionDelta, trader_fee: Decimal) -> DeltaOutcome {
        let mut outcome = DeltaOutcome::default();
        if delta.execution_quantity.is_zero() {
            return outcome;
        }
        if self.quantity.is_zero() {
            self.is_long = delta.is_long;
        }

        if self.is_long == delta.is_long {
            self.entry_price = self.weighted_entry_price(delta.execution_quantity, delta.execution_price);
            self.quantity += delta.execution_quantity;
            self.margin += delta.execution_margin;
            outcome.collateralization_margin = delta.execution_margin;
            return outcome;
        }

        let closing_quantity = self.quantity.min(delta.execution_quantity);
        outcome.close_execution_margin = pro_rata(delta.execution_margin, closing_quantity, delta.execution_quantity);

        let mut pnl = round_amount(self.pnl_at(delta.execution_price, closing_quantity));
        // reduce-only fills pay their fee out of the closed pnl
        if delta.execution_margin.is_zero() {
            pnl -= pro_rata(trader_fee, closing_quantity, delta.execution_quantity);
        }
        let position_closing_margin = pro_rata(self.margin, closing_quantity, self.quantity);

        outcome.pnl = pnl;
        outcome.payout = pnl + position_closing_margin;
        self.quantity -= closing_quantity;
        self.margin -= position_closing_margin;

        let flip_quantity = delta.execution_quantity - closing_quantity;
        if flip_quantity > Decimal::ZERO {
            self.is_long = !self.is_long;
            self.entry_price = delta.execution_price;
            self.quantity = flip_quantity;
            self.margin = delta.execution_margin - outcome.close_execution_margin;
            outcome.collateralization_margin = self.margin;
        }
        outcome
    }

    /// Price at which the position plus `added_margin` is worth exactly zero.
    pub fn bankruptcy_price_with_added_margin(&self, added_margin: Decimal) -> Decimal {
        if self.quantity.is_zero() {
            return self.entry_price;
        }
        let per_unit = (self.margin + added_margin) / self.quantity;
        if self.is_long {
            self.entry_price - per_unit
        } else {
            self.entry_price + per_unit
        }
    }

    /// A closing order must leave enough to pay its fee at `close_price`.
    pub fn check_valid_position_to_reduce(
        &self,
        close_price: Decimal,
        is_buy_order: bool,
        fee_rate: Decimal,
        close_margin: Decimal,
        is_binary_options: bool,
    ) -> Result<(), PositionError> {
        if is_buy_order == self.is_long {
            return Err(PositionError::InvalidReduceDirection);
        }
        if is_binary_options {
            return Ok(());
        }
        let bankruptcy_price = self.bankruptcy_price_with_added_margin(close_margin);
        if self.is_long {
            let divisor = Decimal::ONE - fee_rate;
            if divisor <= Decimal::ZERO {
                return Err(PositionError::InvalidFeeRate(fee_rate));
            }
            let threshold = bankruptcy_price / divisor;
            if close_price < threshold {
                return Err(PositionError::PriceSurpassesBankruptcyPrice { price: close_price, threshold });
            }
        } else {
            let threshold = bankruptcy_price / (Decimal::ONE + fee_rate);
            if close_price > threshold {
                return Err(PositionError::PriceSurpassesBankruptcyPrice { price: close_price, threshold });
            }
        }
        Ok(())
    }

    /// Equity below maintenance requirement at mark.
    pub fn is_liquidatable(&self, mark_price: Decimal, maintenance_margin_ratio: Decimal) -> bool {
        if self.quantity.is_zero() {
            return false;
        }
        let equity = self.margin + self.unrealized_pnl(mark_price);
        equity < self.quantity * mark_price * maintenance_margin_ratio
    }

    // 4.2: what the position would receive if closed entirely at `price`.
    pub fn payout_if_fully_closing(&self, price: Decimal, closing_fee_rate: Decimal) -> PositionPayout {
        let is_profitable = (self.is_long && self.entry_price < price) || (!self.is_long && self.entry_price > price);
        let pnl = round_amount(self.pnl_at(price, self.quantity));
        let fee = round_amount(price * self.quantity * closing_fee_rate);
        PositionPayout {
            payout: pnl + self.margin - fee,
            pnl,
            is_profitable,
        }
    }

    /// Moves the entry price against the position so its profit shrinks by
    /// `profit × taken / total_profits`.
    pub fn apply_profit_haircut(&mut self, taken: Decimal, total_profits: Decimal, settlement_price: Decimal) {
        if self.quantity.is_zero() || total_profits.is_zero() {
            return;
        }
        let profit = self.pnl_at(settlement_price, self.quantity);
        if profit <= Decimal::ZERO {
            return;
        }
        let haircut = round_haircut(profit * taken / total_profits);
        self.shift_entry_against(haircut);
    }

    /// Cuts `payout × remaining_deficit / remaining_payouts`, margin first.
    pub fn apply_total_payout_haircut(
        &mut self,
        remaining_deficit: Decimal,
        remaining_payouts: Decimal,
        settlement_price: Decimal,
        closing_fee_rate: Decimal,
    ) {
        if self.quantity.is_zero() || remaining_payouts.is_zero() {
            return;
        }
        let payout = self.payout_if_fully_closing(settlement_price, closing_fee_rate).payout;
        if payout <= Decimal::ZERO {
            return;
        }
        let haircut = round_haircut(payout * remaining_deficit / remaining_payouts);
        if self.margin >= haircut {
            self.margin -= haircut;
            return;
        }
        let rest = haircut - self.margin.max(Decimal::ZERO);
        self.margin = self.margin.min(Decimal::ZERO);
        self.shift_entry_against(rest);
    }

    /// Binary options refunds lose a share of margin instead of profit.
    pub fn apply_margin_haircut(&mut self, taken: Decimal, total_margin: Decimal) {
        if total_margin.is_zero() {
            return;
        }
        self.margin -= round_haircut(self.margin * taken / total_margin);
    }

    fn shift_entry_against(&mut self, amount: Decimal) {
        if self.quantity.is_zero() {
            return;
        }
        let per_unit = round_haircut(amount / self.quantity);
        if self.is_long {
            self.entry_price += per_unit;
        } else {
            self.entry_price -= per_unit;
        }
    }

    /// Beyond bankruptcy: the position will close with nothing owed either way.
    pub fn close_position_without_payouts(&mut self, settlement_price: Decimal) {
        self.entry_price = settlement_price;
        self.margin = Decimal::ZERO;
    }

    /// Closes the full quantity at `price`. returns the outcome, the fee charged and the delta.
    pub fn close_with_settle_price(&mut self, price: Decimal, closing_fee_rate: Decimal) -> (DeltaOutcome, Decimal, PositionDelta) {
        let fee = round_amount(price * self.quantity * closing_fee_rate);
        let delta = PositionDelta::new(!self.is_long, self.quantity, Decimal::ZERO, price);
        let outcome = self.apply_position_delta(&delta, fee);
        (outcome, fee, delta)
    }

    /// Returns margin and nothing else.
    pub fn close_by_refunding(&mut self) -> (DeltaOutcome, PositionDelta) {
        let delta = PositionDelta::new(!self.is_long, self.quantity, Decimal::ZERO, self.entry_price);
        let outcome = DeltaOutcome {
            payout: self.margin,
            ..DeltaOutcome::default()
        };
        self.quantity = Decimal::ZERO;
        self.margin = Decimal::ZERO;
        (outcome, delta)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PositionError {
    #[error("Closing order must oppose the position direction")]
    InvalidReduceDirection,

    #[error("Close price {price} surpasses fee-adjusted bankruptcy price {threshold}")]
    PriceSurpassesBankruptcyPrice { price: Decimal, threshold: Decimal },

    #[error("Fee rate {0} makes the position impossible to close")]
    InvalidFeeRate(Decimal),
}

/// A working copy of one subaccount's position.
#[derive(Debug, Clone)]
pub struct PositionState {
    pub subaccount_id: SubaccountId,
    pub position: Position,
}

// 4.3: arena of positions touched during one matching pass. fills index into
// `states` so the same position is never aliased.
#[derive(Debug, Clone, Default)]
pub struct PositionCache {
    funding: Option<PerpetualFunding>,
    stored: HashMap<SubaccountId, Position>,
    states: Vec<PositionState>,
    index: HashMap<SubaccountId, usize>,
}

impl PositionCache {
    pub fn new(stored: HashMap<SubaccountId, Position>, funding: Option<PerpetualFunding>) -> Self {
        Self {
            funding,
            stored,
            states: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn load(&mut self, subaccount_id: SubaccountId) -> Option<usize> {
        if let Some(&idx) = self.index.get(&subaccount_id) {
            return Some(idx);
        }
        let mut position = self.stored.remove(&subaccount_id)?;
        position.apply_funding(self.funding.as_ref());
        Some(self.push(subaccount_id, position))
    }

    fn push(&mut self, subaccount_id: SubaccountId, position: Position) -> usize {
        let idx = self.states.len();
        self.states.push(PositionState { subaccount_id, position });
        self.index.insert(subaccount_id, idx);
        idx
    }

    /// Funding-adjusted position, if the subaccount has one.
    pub fn get(&mut self, subaccount_id: SubaccountId) -> Option<&Position> {
        let idx = self.load(subaccount_id)?;
        Some(&self.states[idx].position)
    }

    pub fn get_mut(&mut self, subaccount_id: SubaccountId) -> Option<&mut Position> {
        let idx = self.load(subaccount_id)?;
        Some(&mut self.states[idx].position)
    }

    /// Loads the position or opens an empty one for the first fill.
    pub fn get_or_create(&mut self, subaccount_id: SubaccountId, is_long: bool) -> &mut Position {
        let idx = match self.load(subaccount_id) {
            Some(idx) => idx,
            None => {
                let cumulative = self.funding.as_ref().map(|f| f.cumulative_funding).unwrap_or_default();
                self.push(subaccount_id, Position::new(is_long, cumulative))
            }
        };
        &mut self.states[idx].position
    }

    /// Detached copy for what-if checks. the arena is not touched for subaccounts without a position.
    pub fn snapshot(&mut self, subaccount_id: SubaccountId, is_long: bool) -> Position {
        if let Some(position) = self.get(subaccount_id) {
            return position.clone();
        }
        let cumulative = self.funding.as_ref().map(|f| f.cumulative_funding).unwrap_or_default();
        Position::new(is_long, cumulative)
    }

    /// Signed quantity, zero when there is no position.
    pub fn signed_quantity(&mut self, subaccount_id: SubaccountId) -> Decimal {
        self.get(subaccount_id).map(|p| p.signed_quantity()).unwrap_or_default()
    }

    pub fn touched_len(&self) -> usize {
        self.states.len()
    }

    /// Every touched position, sorted by subaccount.
    pub fn into_touched(self) -> Vec<PositionState> {
        let mut states = self.states;
        states.sort_by_key(|s| s.subaccount_id);
        states
    }
}
