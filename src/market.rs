//! Market configuration and lifecycle state.
//!
//! A market is one of three kinds that share a single matching path:
//! perpetuals (funded hourly), expiry futures (settled at a TWAP) and
//! binary options (settled at an admin-provided price or refunded).

use crate::types::{MarketId, Timestamp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Market status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketStatus {
    /// Open for trading
    Active,
    /// Halted, usually with a settlement scheduled
    Paused,
    /// Halted by an operator, orders and positions left untouched
    ForcePaused,
    /// Binary options market that has been settled or refunded
    Demolished,
    /// Expiry futures market settled at its TWAP
    Expired,
}

impl MarketStatus {
    /// Settlement already happened. nothing left to close.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MarketStatus::Demolished | MarketStatus::Expired)
    }
}

impl Default for MarketStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// Ceiling on aggregate open notional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenNotionalCap {
    Uncapped,
    Capped(Decimal),
}

impl OpenNotionalCap {
    pub fn is_capped(&self) -> bool {
        matches!(self, OpenNotionalCap::Capped(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketKind {
    Perpetual,
    ExpiryFutures,
    BinaryOptions,
}

/// Oracle reference for a market.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OracleRef {
    pub base: String,
    pub quote: String,
    /// Prices are multiplied by 10^scale_factor before use.
    pub scale_factor: u32,
}

impl OracleRef {
    pub fn new(base: &str, quote: &str) -> Self {
        Self {
            base: base.to_string(),
            quote: quote.to_string(),
            scale_factor: 0,
        }
    }

    pub fn scale(&self) -> Decimal {
        Decimal::from(10u64.pow(self.scale_factor))
    }

    /// Applies the oracle scale factor to a raw price.
    pub fn scaled_price(&self, price: Decimal) -> Decimal {
        price * self.scale()
    }
}

/// Parameters shared by every market kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketParams {
    pub id: MarketId,
    /// Human-readable ticker (e.g., "BTC/USDT PERP")
    pub ticker: String,
    /// Denom margin and payouts are settled in
    pub quote_denom: String,
    pub oracle: OracleRef,
    /// Fee rate charged to resting orders. may be negative (rebate)
    pub maker_fee_rate: Decimal,
    /// Fee rate charged to orders that take liquidity
    pub taker_fee_rate: Decimal,
    /// Share of a positive trade fee paid to the order's fee recipient
    pub relayer_fee_share_rate: Decimal,
    pub initial_margin_ratio: Decimal,
    pub maintenance_margin_ratio: Decimal,
    pub min_price_tick_size: Decimal,
    pub min_quantity_tick_size: Decimal,
    pub min_notional: Decimal,
    pub open_notional_cap: OpenNotionalCap,
    pub status: MarketStatus,
    /// Mark price captured when the market was force paused
    #[serde(default)]
    pub mark_price_at_pausing: Option<Decimal>,
}

impl MarketParams {
    /// BTC perpetual with 5% initial and 2.5% maintenance margin.
    pub fn btc_perp(id: MarketId) -> Self {
        Self {
            id,
            ticker: "BTC/USDT PERP".to_string(),
            quote_denom: "USDT".to_string(),
            oracle: OracleRef::new("BTC", "USDT"),
            maker_fee_rate: dec!(0.0005),
            taker_fee_rate: dec!(0.001),
            relayer_fee_share_rate: dec!(0.4),
            initial_margin_ratio: dec!(0.05),
            maintenance_margin_ratio: dec!(0.025),
            min_price_tick_size: dec!(0.01),
            min_quantity_tick_size: dec!(0.001),
            min_notional: Decimal::ZERO,
            open_notional_cap: OpenNotionalCap::Uncapped,
            status: MarketStatus::Active,
            mark_price_at_pausing: None,
        }
    }

    pub fn eth_futures(id: MarketId) -> Self {
        Self {
            ticker: "ETH/USDT FUT".to_string(),
            oracle: OracleRef::new("ETH", "USDT"),
            ..Self::btc_perp(id)
        }
    }

    /// Binary options pay out 10^scale_factor per contract to the winning side.
    pub fn binary_option(id: MarketId, scale_factor: u32) -> Self {
        Self {
            ticker: "YES/USDT BO".to_string(),
            oracle: OracleRef {
                base: "YES".to_string(),
                quote: "USDT".to_string(),
                scale_factor,
            },
            initial_margin_ratio: Decimal::ZERO,
            maintenance_margin_ratio: Decimal::ZERO,
            min_quantity_tick_size: Decimal::ONE,
            ..Self::btc_perp(id)
        }
    }

    pub fn validate(&self) -> Result<(), MarketError> {
        if self.maker_fee_rate > self.taker_fee_rate {
            return Err(MarketError::InvalidFeeRates {
                maker: self.maker_fee_rate,
                taker: self.taker_fee_rate,
            });
        }
        // a rebate can never exceed what the exchange keeps from the taker
        if self.maker_fee_rate.is_sign_negative()
            && self.maker_fee_rate.abs() > self.taker_fee_rate * (Decimal::ONE - self.relayer_fee_share_rate)
        {
            return Err(MarketError::InvalidFeeRates {
                maker: self.maker_fee_rate,
                taker: self.taker_fee_rate,
            });
        }
        if self.relayer_fee_share_rate < Decimal::ZERO || self.relayer_fee_share_rate > Decimal::ONE {
            return Err(MarketError::InvalidRelayerShare(self.relayer_fee_share_rate));
        }
        if self.min_price_tick_size <= Decimal::ZERO || self.min_quantity_tick_size <= Decimal::ZERO {
            return Err(MarketError::InvalidTickSize);
        }
        if let OpenNotionalCap::Capped(cap) = self.open_notional_cap {
            if cap.is_sign_negative() {
                return Err(MarketError::InvalidOpenNotionalCap(cap));
            }
        }
        Ok(())
    }

    fn validate_margin_ratios(&self) -> Result<(), MarketError> {
        if self.maintenance_margin_ratio <= Decimal::ZERO
            || self.initial_margin_ratio <= self.maintenance_margin_ratio
            || self.initial_margin_ratio >= Decimal::ONE
        {
            return Err(MarketError::InvalidMarginRatios {
                initial: self.initial_margin_ratio,
                maintenance: self.maintenance_margin_ratio,
            });
        }
        Ok(())
    }
}

/// Perpetual funding parameters and schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerpetualMarketInfo {
    pub hourly_funding_rate_cap: Decimal,
    pub hourly_interest_rate: Decimal,
    pub next_funding_timestamp: Timestamp,
    /// Seconds between funding payments
    pub funding_interval: i64,
}

impl PerpetualMarketInfo {
    pub fn new(now: Timestamp, funding_interval: i64) -> Self {
        Self {
            hourly_funding_rate_cap: dec!(0.000625),
            hourly_interest_rate: dec!(0.00000416666),
            next_funding_timestamp: next_funding_timestamp(now, funding_interval),
            funding_interval,
        }
    }
}

/// First interval boundary strictly after `now`.
pub fn next_funding_timestamp(now: Timestamp, funding_interval: i64) -> Timestamp {
    if funding_interval <= 0 {
        return now;
    }
    Timestamp(now.0 - now.0.rem_euclid(funding_interval) + funding_interval)
}

/// Running funding accumulators of a perpetual.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerpetualFunding {
    /// Sum of all funding payments per unit of position
    pub cumulative_funding: Decimal,
    /// Time-weighted premium of trade VWAP over mark since the last payment
    pub cumulative_price: Decimal,
    pub last_timestamp: Timestamp,
}

impl PerpetualFunding {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            cumulative_funding: Decimal::ZERO,
            cumulative_price: Decimal::ZERO,
            last_timestamp: timestamp,
        }
    }
}

/// Expiry schedule and TWAP capture of a futures market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiryFuturesMarketInfo {
    pub expiration_timestamp: Timestamp,
    /// Start of the settlement TWAP window
    pub twap_start_timestamp: Timestamp,
    pub start_base_cumulative_price: Option<Decimal>,
    pub start_quote_cumulative_price: Option<Decimal>,
    pub settlement_price: Option<Decimal>,
}

impl ExpiryFuturesMarketInfo {
    pub fn new(expiration_timestamp: Timestamp, twap_window_secs: i64) -> Self {
        Self {
            expiration_timestamp,
            twap_start_timestamp: expiration_timestamp.add_secs(-twap_window_secs),
            start_base_cumulative_price: None,
            start_quote_cumulative_price: None,
            settlement_price: None,
        }
    }

    pub fn is_premature(&self, now: Timestamp) -> bool {
        now < self.twap_start_timestamp
    }

    pub fn is_starting_maturation(&self, now: Timestamp) -> bool {
        now >= self.twap_start_timestamp
            && now < self.expiration_timestamp
            && self.start_base_cumulative_price.is_none()
    }

    pub fn is_matured(&self, now: Timestamp) -> bool {
        now >= self.expiration_timestamp
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryOptionsInfo {
    pub expiration_timestamp: Timestamp,
    pub settlement_timestamp: Timestamp,
    pub settlement_price: Option<SettlementPrice>,
}

/// Price a market is closed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementPrice {
    Price(Decimal),
    /// Binary options only: every position is closed at its margin
    Refund,
}

impl SettlementPrice {
    pub fn price(&self) -> Option<Decimal> {
        match self {
            SettlementPrice::Price(p) => Some(*p),
            SettlementPrice::Refund => None,
        }
    }
}

/// 12.0: a derivative market. one matching path, kind-specific settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Market {
    Perpetual {
        params: MarketParams,
        info: PerpetualMarketInfo,
        funding: PerpetualFunding,
    },
    ExpiryFutures {
        params: MarketParams,
        info: ExpiryFuturesMarketInfo,
    },
    BinaryOptions {
        params: MarketParams,
        info: BinaryOptionsInfo,
    },
}

impl Market {
    pub fn perpetual(params: MarketParams, now: Timestamp, funding_interval: i64) -> Self {
        Market::Perpetual {
            params,
            info: PerpetualMarketInfo::new(now, funding_interval),
            funding: PerpetualFunding::new(now),
        }
    }

    pub fn expiry_futures(params: MarketParams, expiration: Timestamp, twap_window_secs: i64) -> Self {
        Market::ExpiryFutures {
            params,
            info: ExpiryFuturesMarketInfo::new(expiration, twap_window_secs),
        }
    }

    pub fn binary_options(params: MarketParams, expiration: Timestamp, settlement: Timestamp) -> Self {
        Market::BinaryOptions {
            params,
            info: BinaryOptionsInfo {
                expiration_timestamp: expiration,
                settlement_timestamp: settlement,
                settlement_price: None,
            },
        }
    }

    pub fn params(&self) -> &MarketParams {
        match self {
            Market::Perpetual { params, .. }
            | Market::ExpiryFutures { params, .. }
            | Market::BinaryOptions { params, .. } => params,
        }
    }

    pub fn params_mut(&mut self) -> &mut MarketParams {
        match self {
            Market::Perpetual { params, .. }
            | Market::ExpiryFutures { params, .. }
            | Market::BinaryOptions { params, .. } => params,
        }
    }

    pub fn id(&self) -> MarketId {
        self.params().id
    }

    pub fn kind(&self) -> MarketKind {
        match self {
            Market::Perpetual { .. } => MarketKind::Perpetual,
            Market::ExpiryFutures { .. } => MarketKind::ExpiryFutures,
            Market::BinaryOptions { .. } => MarketKind::BinaryOptions,
        }
    }

    pub fn status(&self) -> MarketStatus {
        self.params().status
    }

    pub fn set_status(&mut self, status: MarketStatus) {
        self.params_mut().status = status;
    }

    pub fn is_active(&self) -> bool {
        self.status() == MarketStatus::Active
    }

    pub fn is_perpetual(&self) -> bool {
        matches!(self, Market::Perpetual { .. })
    }

    pub fn is_binary_options(&self) -> bool {
        matches!(self, Market::BinaryOptions { .. })
    }

    pub fn maker_fee_rate(&self) -> Decimal {
        self.params().maker_fee_rate
    }

    pub fn taker_fee_rate(&self) -> Decimal {
        self.params().taker_fee_rate
    }

    pub fn relayer_fee_share_rate(&self) -> Decimal {
        self.params().relayer_fee_share_rate
    }

    pub fn initial_margin_ratio(&self) -> Decimal {
        self.params().initial_margin_ratio
    }

    pub fn maintenance_margin_ratio(&self) -> Decimal {
        self.params().maintenance_margin_ratio
    }

    pub fn open_notional_cap(&self) -> OpenNotionalCap {
        self.params().open_notional_cap
    }

    pub fn quote_denom(&self) -> &str {
        &self.params().quote_denom
    }

    pub fn oracle(&self) -> &OracleRef {
        &self.params().oracle
    }

    /// 10^scale_factor for binary options, the payout of one winning contract.
    pub fn oracle_scale(&self) -> Decimal {
        self.params().oracle.scale()
    }

    pub fn funding(&self) -> Option<&PerpetualFunding> {
        match self {
            Market::Perpetual { funding, .. } => Some(funding),
            _ => None,
        }
    }

    pub fn funding_mut(&mut self) -> Option<&mut PerpetualFunding> {
        match self {
            Market::Perpetual { funding, .. } => Some(funding),
            _ => None,
        }
    }

    pub fn perpetual_info(&self) -> Option<&PerpetualMarketInfo> {
        match self {
            Market::Perpetual { info, .. } => Some(info),
            _ => None,
        }
    }

    pub fn expiry_info(&self) -> Option<&ExpiryFuturesMarketInfo> {
        match self {
            Market::ExpiryFutures { info, .. } => Some(info),
            _ => None,
        }
    }

    pub fn binary_info(&self) -> Option<&BinaryOptionsInfo> {
        match self {
            Market::BinaryOptions { info, .. } => Some(info),
            _ => None,
        }
    }

    pub fn perpetual_info_mut(&mut self) -> Option<&mut PerpetualMarketInfo> {
        match self {
            Market::Perpetual { info, .. } => Some(info),
            _ => None,
        }
    }

    pub fn expiry_info_mut(&mut self) -> Option<&mut ExpiryFuturesMarketInfo> {
        match self {
            Market::ExpiryFutures { info, .. } => Some(info),
            _ => None,
        }
    }

    pub fn binary_info_mut(&mut self) -> Option<&mut BinaryOptionsInfo> {
        match self {
            Market::BinaryOptions { info, .. } => Some(info),
            _ => None,
        }
    }

    /// Validates parameters for this market's kind.
    pub fn validate(&self) -> Result<(), MarketError> {
        let params = self.params();
        params.validate()?;
        if !self.is_binary_options() {
            params.validate_margin_ratios()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarketError {
    #[error("Market {0:?} not found")]
    NotFound(MarketId),

    #[error("Market {0:?} is not active")]
    NotActive(MarketId),

    #[error("Invalid fee rates: maker {maker}, taker {taker}")]
    InvalidFeeRates { maker: Decimal, taker: Decimal },

    #[error("Invalid relayer fee share {0}")]
    InvalidRelayerShare(Decimal),

    #[error("Invalid margin ratios: initial {initial}, maintenance {maintenance}")]
    InvalidMarginRatios { initial: Decimal, maintenance: Decimal },

    #[error("Tick sizes must be positive")]
    InvalidTickSize,

    #[error("Invalid open notional cap {0}")]
    InvalidOpenNotionalCap(Decimal),

    #[error("Market {0:?} is not a binary options market")]
    NotBinaryOptions(MarketId),

    #[error("Invalid settlement price {0}")]
    InvalidSettlementPrice(Decimal),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_markets_validate() {
        let perp = Market::perpetual(MarketParams::btc_perp(MarketId(1)), Timestamp(0), 3600);
        assert!(perp.validate().is_ok());
        assert!(perp.is_perpetual());
        assert_eq!(perp.funding().unwrap().cumulative_funding, Decimal::ZERO);

        let bo = Market::binary_options(MarketParams::binary_option(MarketId(2), 6), Timestamp(10), Timestamp(20));
        assert!(bo.validate().is_ok());
        assert_eq!(bo.oracle_scale(), dec!(1000000));
    }

    #[test]
    fn margin_ratio_validation() {
        let mut params = MarketParams::btc_perp(MarketId(1));
        params.initial_margin_ratio = dec!(0.02);
        let market = Market::perpetual(params, Timestamp(0), 3600);
        assert!(matches!(market.validate(), Err(MarketError::InvalidMarginRatios { .. })));
    }

    #[test]
    fn rebate_bounded_by_taker_share() {
        let mut params = MarketParams::btc_perp(MarketId(1));
        params.maker_fee_rate = dec!(-0.0007);
        // 0.001 * (1 - 0.4) = 0.0006 < 0.0007
        assert!(params.validate().is_err());
        params.maker_fee_rate = dec!(-0.0005);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn funding_schedule_aligns_to_interval() {
        assert_eq!(next_funding_timestamp(Timestamp(0), 3600), Timestamp(3600));
        assert_eq!(next_funding_timestamp(Timestamp(5000), 3600), Timestamp(7200));
    }

    #[test]
    fn expiry_maturation_phases() {
        let info = ExpiryFuturesMarketInfo::new(Timestamp(1000), 100);
        assert!(info.is_premature(Timestamp(899)));
        assert!(info.is_starting_maturation(Timestamp(900)));
        assert!(!info.is_matured(Timestamp(999)));
        assert!(info.is_matured(Timestamp(1000)));
    }

    #[test]
    fn status_terminality() {
        assert!(MarketStatus::Expired.is_terminal());
        assert!(MarketStatus::Demolished.is_terminal());
        assert!(!MarketStatus::Paused.is_terminal());
    }
}
