// 6: collaborators the engine talks to but does not own.
// the engine only sees these traits. in-memory implementations back the binary and the tests.

use crate::events::Event;
use crate::market::OracleRef;
use crate::types::{DepositDelta, MarketId, SubaccountId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Insufficient funds for {subaccount_id:?}: required {required}, available {available}")]
    InsufficientFunds {
        subaccount_id: SubaccountId,
        required: Decimal,
        available: Decimal,
    },

    #[error("No insurance fund for market {0:?}")]
    NoInsuranceFund(MarketId),

    #[error("Insurance fund for market {market_id:?} holds {balance}, cannot withdraw {amount}")]
    InsufficientInsurance {
        market_id: MarketId,
        balance: Decimal,
        amount: Decimal,
    },

    #[error("Insurance fund for market {0:?} rejected the deposit")]
    DepositRejected(MarketId),

    #[error("Negative amount {0}")]
    NegativeAmount(Decimal),
}

/// Oracle prices. `Sync` because trigger scans read it from worker threads.
pub trait PriceOracle: Send + Sync {
    fn price(&self, oracle: &OracleRef) -> Option<Decimal>;

    /// Cumulative (base, quote) prices used for expiry TWAPs.
    fn cumulative_price(&self, oracle: &OracleRef) -> Option<(Decimal, Decimal)>;
}

pub trait InsuranceFund: Send {
    fn balance(&self, market_id: MarketId) -> Result<Decimal, CollaboratorError>;

    fn withdraw(&mut self, market_id: MarketId, amount: Decimal) -> Result<(), CollaboratorError>;

    fn deposit(&mut self, market_id: MarketId, amount: Decimal) -> Result<(), CollaboratorError>;
}

/// A subaccount's balance in one denom.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub total: Decimal,
    pub available: Decimal,
}

pub trait BankKeeper: Send {
    /// Moves `amount` out of available balance into order holds.
    fn charge_account(&mut self, subaccount_id: SubaccountId, denom: &str, amount: Decimal) -> Result<(), CollaboratorError>;

    fn increment_available_balance_or_bank(&mut self, subaccount_id: SubaccountId, denom: &str, amount: Decimal);

    fn update_deposit_with_delta(&mut self, subaccount_id: SubaccountId, denom: &str, delta: DepositDelta);

    fn spendable_funds(&self, subaccount_id: SubaccountId, denom: &str) -> Decimal;

    fn has_sufficient_funds(&self, subaccount_id: SubaccountId, denom: &str, amount: Decimal) -> bool {
        self.spendable_funds(subaccount_id, denom) >= amount
    }

    fn deposit(&self, subaccount_id: SubaccountId, denom: &str) -> Deposit;
}

pub trait EventSink: Send {
    fn emit(&mut self, event: Event);
}

#[derive(Debug, Default)]
struct OracleState {
    prices: HashMap<(String, String), Decimal>,
    cumulative: HashMap<(String, String), (Decimal, Decimal)>,
}

/// Settable oracle. clones share the same prices, so tests keep a handle after giving one away.
#[derive(Debug, Clone, Default)]
pub struct MockOracle {
    state: Arc<RwLock<OracleState>>,
}

fn pair(oracle: &OracleRef) -> (String, String) {
    (oracle.base.clone(), oracle.quote.clone())
}

impl MockOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, oracle: &OracleRef, price: Decimal) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.prices.insert(pair(oracle), price);
    }

    pub fn clear_price(&self, oracle: &OracleRef) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.prices.remove(&pair(oracle));
    }

    pub fn set_cumulative_price(&self, oracle: &OracleRef, base: Decimal, quote: Decimal) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.cumulative.insert(pair(oracle), (base, quote));
    }
}

impl PriceOracle for MockOracle {
    fn price(&self, oracle: &OracleRef) -> Option<Decimal> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.prices.get(&pair(oracle)).copied()
    }

    fn cumulative_price(&self, oracle: &OracleRef) -> Option<(Decimal, Decimal)> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.cumulative.get(&pair(oracle)).copied()
    }
}

/// Per-market insurance balances.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInsurance {
    balances: HashMap<MarketId, Decimal>,
    reject_deposits: bool,
}

impl InMemoryInsurance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fund(mut self, market_id: MarketId, balance: Decimal) -> Self {
        self.balances.insert(market_id, balance);
        self
    }

    /// Makes every deposit fail, to exercise the auction fallback.
    pub fn set_reject_deposits(&mut self, reject: bool) {
        self.reject_deposits = reject;
    }
}

impl InsuranceFund for InMemoryInsurance {
    fn balance(&self, market_id: MarketId) -> Result<Decimal, CollaboratorError> {
        self.balances.get(&market_id).copied().ok_or(CollaboratorError::NoInsuranceFund(market_id))
    }

    fn withdraw(&mut self, market_id: MarketId, amount: Decimal) -> Result<(), CollaboratorError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(CollaboratorError::NegativeAmount(amount));
        }
        let balance = self.balances.get_mut(&market_id).ok_or(CollaboratorError::NoInsuranceFund(market_id))?;
        if *balance < amount {
            return Err(CollaboratorError::InsufficientInsurance {
                market_id,
                balance: *balance,
                amount,
            });
        }
        *balance -= amount;
        Ok(())
    }

    fn deposit(&mut self, market_id: MarketId, amount: Decimal) -> Result<(), CollaboratorError> {
        if self.reject_deposits {
            return Err(CollaboratorError::DepositRejected(market_id));
        }
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(CollaboratorError::NegativeAmount(amount));
        }
        let balance = self.balances.get_mut(&market_id).ok_or(CollaboratorError::NoInsuranceFund(market_id))?;
        *balance += amount;
        Ok(())
    }
}

/// Subaccount balances keyed by (subaccount, denom).
#[derive(Debug, Clone, Default)]
pub struct InMemoryBank {
    deposits: HashMap<(SubaccountId, String), Deposit>,
}

impl InMemoryBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credits both total and available.
    pub fn fund(&mut self, subaccount_id: SubaccountId, denom: &str, amount: Decimal) {
        let deposit = self.deposits.entry((subaccount_id, denom.to_string())).or_default();
        deposit.total += amount;
        deposit.available += amount;
    }
}

impl BankKeeper for InMemoryBank {
    fn charge_account(&mut self, subaccount_id: SubaccountId, denom: &str, amount: Decimal) -> Result<(), CollaboratorError> {
        let deposit = self.deposits.entry((subaccount_id, denom.to_string())).or_default();
        if deposit.available < amount {
            return Err(CollaboratorError::InsufficientFunds {
                subaccount_id,
                required: amount,
                available: deposit.available,
            });
        }
        deposit.available -= amount;
        Ok(())
    }

    fn increment_available_balance_or_bank(&mut self, subaccount_id: SubaccountId, denom: &str, amount: Decimal) {
        let deposit = self.deposits.entry((subaccount_id, denom.to_string())).or_default();
        deposit.available += amount;
    }

    fn update_deposit_with_delta(&mut self, subaccount_id: SubaccountId, denom: &str, delta: DepositDelta) {
        let deposit = self.deposits.entry((subaccount_id, denom.to_string())).or_default();
        deposit.total += delta.total;
        deposit.available += delta.available;
    }

    fn spendable_funds(&self, subaccount_id: SubaccountId, denom: &str) -> Decimal {
        self.deposit(subaccount_id, denom).available
    }

    fn deposit(&self, subaccount_id: SubaccountId, denom: &str) -> Deposit {
        self.deposits.get(&(subaccount_id, denom.to_string())).copied().unwrap_or_default()
    }
}
