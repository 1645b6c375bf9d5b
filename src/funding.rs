// 5.0: perpetual funding. trades accrue a time-weighted premium of VWAP over mark;
// once an interval the premium becomes a capped funding rate and is paid through cumulative funding.
// 5.1 hourly settlement. 5.2 continuous accrual. 5.3 expiry futures TWAP.

use crate::batch::VwapData;
use crate::market::{next_funding_timestamp, ExpiryFuturesMarketInfo, OracleRef, PerpetualFunding, PerpetualMarketInfo};
use crate::types::{round_amount, Timestamp};
use rust_decimal::Decimal;

/// Hours in the day the premium is averaged against.
const HOURS_PER_DAY: i64 = 24;

pub fn cap_funding_rate(rate: Decimal, cap: Decimal) -> Decimal {
    if rate.abs() > cap {
        if rate.is_sign_negative() {
            return -cap;
        }
        return cap;
    }
    rate
}

/// `cumulative_price / (time_interval × 24)`, zero when nothing traded in the interval.
pub fn hourly_twap(cumulative_price: Decimal, time_interval: i64) -> Decimal {
    if time_interval == 0 {
        return Decimal::ZERO;
    }
    cumulative_price / (Decimal::from(time_interval) * Decimal::from(HOURS_PER_DAY))
}

/// One funding payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourlyFunding {
    pub twap: Decimal,
    pub funding_rate: Decimal,
    /// `funding_rate × mark` per unit of position, added to cumulative funding
    pub payment: Decimal,
    pub cumulative_funding: Decimal,
    /// Timestamp the payment is for
    pub funding_timestamp: Timestamp,
}

pub fn is_funding_due(info: &PerpetualMarketInfo, now: Timestamp) -> bool {
    now >= info.next_funding_timestamp
}

// 5.1: the interval covered is from the previous boundary to the last trade accrual.
pub fn compute_hourly_funding(info: &PerpetualMarketInfo, funding: &PerpetualFunding, mark_price: Decimal) -> HourlyFunding {
    let funding_timestamp = info.next_funding_timestamp;
    let time_interval = funding.last_timestamp.as_secs() + info.funding_interval - funding_timestamp.as_secs();
    let twap = hourly_twap(funding.cumulative_price, time_interval);
    let funding_rate = cap_funding_rate(twap + info.hourly_interest_rate, info.hourly_funding_rate_cap);
    // rounded per unit, so every position's share is exact and longs pay what shorts receive
    let payment = round_amount(funding_rate * mark_price);
    HourlyFunding {
        twap,
        funding_rate,
        payment,
        cumulative_funding: funding.cumulative_funding + payment,
        funding_timestamp,
    }
}

/// Pays funding and opens the next interval.
pub fn apply_hourly_funding(info: &mut PerpetualMarketInfo, funding: &mut PerpetualFunding, mark_price: Decimal) -> HourlyFunding {
    let hourly = compute_hourly_funding(info, funding, mark_price);
    info.next_funding_timestamp = hourly.funding_timestamp.add_secs(info.funding_interval);
    funding.cumulative_funding = hourly.cumulative_funding;
    funding.cumulative_price = Decimal::ZERO;
    funding.last_timestamp = hourly.funding_timestamp;
    hourly
}

/// Realigns the schedule after the interval changed.
pub fn reschedule_funding(info: &mut PerpetualMarketInfo, now: Timestamp, funding_interval: i64) {
    info.funding_interval = funding_interval;
    info.next_funding_timestamp = next_funding_timestamp(now, funding_interval);
}

/// Premium of the block's trades over mark, per unit of mark.
pub fn synthetic_vwap_unit_delta(vwap: &VwapData, mark_price: Decimal) -> Option<Decimal> {
    if mark_price.is_zero() || vwap.is_empty() {
        return None;
    }
    Some((vwap.price - mark_price) / mark_price)
}

// 5.2: cumulative_price += Δt × (vwap − mark) / mark. returns false when nothing accrued.
pub fn accrue_vwap_premium(funding: &mut PerpetualFunding, vwap: &VwapData, mark_price: Decimal, now: Timestamp) -> bool {
    let Some(unit_delta) = synthetic_vwap_unit_delta(vwap, mark_price) else {
        return false;
    };
    let elapsed = Decimal::from(now.as_secs() - funding.last_timestamp.as_secs());
    funding.cumulative_price += elapsed * unit_delta;
    funding.last_timestamp = now;
    true
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TwapError {
    #[error("No cumulative price from the oracle")]
    MissingCumulativePrice,

    #[error("TWAP window was never opened")]
    MissingStartCumulativePrice,

    #[error("Base cumulative price decreased by {0}")]
    NegativeBaseDelta(Decimal),

    #[error("Quote cumulative price delta {0} is not positive")]
    NonPositiveQuoteDelta(Decimal),

    #[error("TWAP settlement price {0} is not positive")]
    NonPositivePrice(Decimal),
}

/// What the expiry schedule asks for at a given block time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryStep {
    Premature,
    /// Record the starting cumulative prices
    StartTwap,
    /// Waiting inside the TWAP window
    InWindow,
    Matured,
}

pub fn expiry_step(info: &ExpiryFuturesMarketInfo, now: Timestamp) -> ExpiryStep {
    if info.is_premature(now) {
        ExpiryStep::Premature
    } else if info.is_starting_maturation(now) {
        ExpiryStep::StartTwap
    } else if info.is_matured(now) {
        ExpiryStep::Matured
    } else {
        ExpiryStep::InWindow
    }
}

/// Opens the TWAP window at `now`.
pub fn start_expiry_twap(info: &mut ExpiryFuturesMarketInfo, now: Timestamp, base_cumulative: Decimal, quote_cumulative: Decimal) {
    info.twap_start_timestamp = now;
    info.start_base_cumulative_price = Some(base_cumulative);
    info.start_quote_cumulative_price = Some(quote_cumulative);
}

// 5.3: (Δbase / Δquote) scaled. a window of zero length settles at `spot`.
pub fn expiry_twap_settlement_price(
    info: &ExpiryFuturesMarketInfo,
    oracle: &OracleRef,
    now: Timestamp,
    base_cumulative: Decimal,
    quote_cumulative: Decimal,
    spot: Option<Decimal>,
) -> Result<Decimal, TwapError> {
    if now == info.twap_start_timestamp {
        return spot.ok_or(TwapError::MissingCumulativePrice);
    }
    let (Some(start_base), Some(start_quote)) = (info.start_base_cumulative_price, info.start_quote_cumulative_price) else {
        return Err(TwapError::MissingStartCumulativePrice);
    };

    let base_delta = base_cumulative - start_base;
    let quote_delta = quote_cumulative - start_quote;
    if base_delta.is_sign_negative() && !base_delta.is_zero() {
        return Err(TwapError::NegativeBaseDelta(base_delta));
    }
    if quote_delta <= Decimal::ZERO {
        return Err(TwapError::NonPositiveQuoteDelta(quote_delta));
    }

    let price = round_amount(oracle.scaled_price(base_delta / quote_delta));
    if price <= Decimal::ZERO {
        return Err(TwapError::NonPositivePrice(price));
    }
    Ok(price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn info() -> PerpetualMarketInfo {
        PerpetualMarketInfo {
            hourly_funding_rate_cap: dec!(0.000625),
            hourly_interest_rate: dec!(0.00000416666),
            next_funding_timestamp: Timestamp(7200),
            funding_interval: 3600,
        }
    }

    #[test]
    fn rate_is_clamped_both_ways() {
        assert_eq!(cap_funding_rate(dec!(0.01), dec!(0.000625)), dec!(0.000625));
        assert_eq!(cap_funding_rate(dec!(-0.01), dec!(0.000625)), dec!(-0.000625));
        assert_eq!(cap_funding_rate(dec!(0.0001), dec!(0.000625)), dec!(0.0001));
    }

    #[test]
    fn no_trades_pays_interest_only() {
        let funding = PerpetualFunding::new(Timestamp(3600));
        // last trade accrual at the previous boundary: empty interval
        let hourly = compute_hourly_funding(&info(), &funding, dec!(100));
        assert_eq!(hourly.twap, Decimal::ZERO);
        assert_eq!(hourly.funding_rate, dec!(0.00000416666));
        assert_eq!(hourly.payment, dec!(0.000416666));
    }

    #[test]
    fn hourly_settlement_resets_accumulator() {
        let mut info = info();
        let mut funding = PerpetualFunding {
            cumulative_funding: dec!(1),
            cumulative_price: dec!(36),
            last_timestamp: Timestamp(7200),
        };
        let hourly = apply_hourly_funding(&mut info, &mut funding, dec!(100));
        // 36 / (3600 × 24) = 0.000416.., plus interest, under the cap
        assert!(hourly.funding_rate < dec!(0.000625));
        assert!(hourly.payment.scale() <= crate::types::AMOUNT_DP);
        assert_eq!(funding.cumulative_funding, dec!(1) + hourly.payment);
        assert_eq!(funding.cumulative_price, Decimal::ZERO);
        assert_eq!(funding.last_timestamp, Timestamp(7200));
        assert_eq!(info.next_funding_timestamp, Timestamp(10800));
    }

    #[test]
    fn vwap_premium_accrues_over_time() {
        let mut funding = PerpetualFunding::new(Timestamp(100));
        let vwap = VwapData {
            price: dec!(101),
            quantity: dec!(2),
        };
        assert!(accrue_vwap_premium(&mut funding, &vwap, dec!(100), Timestamp(160)));
        assert_eq!(funding.cumulative_price, dec!(0.6));
        assert_eq!(funding.last_timestamp, Timestamp(160));

        assert!(!accrue_vwap_premium(&mut funding, &VwapData::default(), dec!(100), Timestamp(200)));
        assert!(!accrue_vwap_premium(&mut funding, &vwap, Decimal::ZERO, Timestamp(200)));
        assert_eq!(funding.last_timestamp, Timestamp(160));
    }

    #[test]
    fn expiry_twap_settles_on_cumulative_deltas() {
        let mut info = ExpiryFuturesMarketInfo::new(Timestamp(1000), 100);
        assert_eq!(expiry_step(&info, Timestamp(900)), ExpiryStep::StartTwap);
        start_expiry_twap(&mut info, Timestamp(900), dec!(1000), dec!(10));
        assert_eq!(expiry_step(&info, Timestamp(950)), ExpiryStep::InWindow);
        assert_eq!(expiry_step(&info, Timestamp(1000)), ExpiryStep::Matured);

        let oracle = OracleRef::new("ETH", "USDT");
        let price = expiry_twap_settlement_price(&info, &oracle, Timestamp(1000), dec!(21000), dec!(110), None).unwrap();
        assert_eq!(price, dec!(200));

        assert_eq!(
            expiry_twap_settlement_price(&info, &oracle, Timestamp(1000), dec!(900), dec!(110), None),
            Err(TwapError::NegativeBaseDelta(dec!(-100)))
        );
        assert_eq!(
            expiry_twap_settlement_price(&info, &oracle, Timestamp(1000), dec!(21000), dec!(10), None),
            Err(TwapError::NonPositiveQuoteDelta(Decimal::ZERO))
        );
        assert_eq!(
            expiry_twap_settlement_price(&info, &oracle, Timestamp(1000), dec!(1000), dec!(110), None),
            Err(TwapError::NonPositivePrice(Decimal::ZERO))
        );
    }
}
