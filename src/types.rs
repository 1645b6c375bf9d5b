// 1.0: the primitives. ids, sides, block time, balance deltas.
// prices and quantities are plain Decimal in human-readable units; ids are newtypes so they never mix.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MarketId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubaccountId(pub u64);

impl SubaccountId {
    /// Receives exchange fees and market surpluses that have nowhere else to go.
    pub const AUCTION: SubaccountId = SubaccountId(0);
}

/// Zero for trades that did not come from an order (settlement closes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderHash(pub u64);

impl fmt::Display for OrderHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }

    pub fn from_is_buy(is_buy: bool) -> Self {
        if is_buy {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    /// True if `a` is a strictly better price than `b` from this side's point of view.
    pub fn is_better_price(&self, a: Decimal, b: Decimal) -> bool {
        match self {
            Side::Buy => a > b,
            Side::Sell => a < b,
        }
    }
}

/// Decimal places every stored amount and derived price is rounded to.
pub const AMOUNT_DP: u32 = 18;

/// Rounds the result of a division so later sums and differences stay exact.
pub fn round_amount(amount: Decimal) -> Decimal {
    amount.round_dp(AMOUNT_DP)
}

// 1.1: block time in unix seconds. funding and expiry math works in whole seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    pub fn as_secs(&self) -> i64 {
        self.0
    }

    pub fn add_secs(&self, secs: i64) -> Self {
        Self(self.0 + secs)
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.0, 0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%SZ")),
            None => write!(f, "{}s", self.0),
        }
    }
}

/// Height and time of the block being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockContext {
    pub height: u64,
    pub time: Timestamp,
}

impl BlockContext {
    pub fn new(height: u64, time: Timestamp) -> Self {
        Self { height, time }
    }
}

// 1.2: signed change to a subaccount deposit. total tracks everything owned,
// available excludes what is locked as order margin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositDelta {
    pub total: Decimal,
    pub available: Decimal,
}

impl DepositDelta {
    pub fn new(total: Decimal, available: Decimal) -> Self {
        Self { total, available }
    }

    pub fn is_empty(&self) -> bool {
        self.total.is_zero() && self.available.is_zero()
    }

    pub fn add_available(&mut self, amount: Decimal) {
        self.available += amount;
    }

    pub fn add_total(&mut self, amount: Decimal) {
        self.total += amount;
    }

    pub fn add_both(&mut self, amount: Decimal) {
        self.total += amount;
        self.available += amount;
    }
}

/// Balance changes of one pass, keyed and iterated in subaccount order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositDeltas(BTreeMap<SubaccountId, DepositDelta>);

impl DepositDeltas {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn apply(&mut self, subaccount_id: SubaccountId, delta: DepositDelta) {
        let entry = self.0.entry(subaccount_id).or_default();
        entry.total += delta.total;
        entry.available += delta.available;
    }

    pub fn add_available(&mut self, subaccount_id: SubaccountId, amount: Decimal) {
        self.0.entry(subaccount_id).or_default().add_available(amount);
    }

    pub fn add_both(&mut self, subaccount_id: SubaccountId, amount: Decimal) {
        self.0.entry(subaccount_id).or_default().add_both(amount);
    }

    pub fn get(&self, subaccount_id: SubaccountId) -> Option<&DepositDelta> {
        self.0.get(&subaccount_id)
    }

    pub fn remove(&mut self, subaccount_id: SubaccountId) -> Option<DepositDelta> {
        self.0.remove(&subaccount_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SubaccountId, &DepositDelta)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn merge(&mut self, other: DepositDeltas) {
        for (subaccount_id, delta) in other.0 {
            self.apply(subaccount_id, delta);
        }
    }
}
