//! Engine configuration options.

use crate::market::MarketKind;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Engine configuration. Missing fields take their defaults when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of events to retain in memory.
    pub max_events: usize,
    /// Log every emitted event.
    pub verbose: bool,
    /// Funding interval given to newly launched perpetual markets, in seconds.
    pub funding_interval_secs: i64,
    /// Share of a positive liquidation payout paid to the liquidator. The rest goes to the insurance fund.
    pub liquidator_reward_share: Decimal,
    /// Taker fee multiplier for atomic market orders in perpetual and expiry futures markets.
    pub derivative_atomic_fee_multiplier: Decimal,
    /// Taker fee multiplier for atomic market orders in binary options markets.
    pub binary_options_atomic_fee_multiplier: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
            verbose: false,
            funding_interval_secs: 3600,
            liquidator_reward_share: dec!(0.5),
            derivative_atomic_fee_multiplier: dec!(2.5),
            binary_options_atomic_fee_multiplier: dec!(2.5),
        }
    }
}

impl EngineConfig {
    pub fn atomic_fee_multiplier(&self, kind: MarketKind) -> Decimal {
        match kind {
            MarketKind::Perpetual | MarketKind::ExpiryFutures => self.derivative_atomic_fee_multiplier,
            MarketKind::BinaryOptions => self.binary_options_atomic_fee_multiplier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{ "verbose": true, "funding_interval_secs": 60 }"#).unwrap();
        assert!(config.verbose);
        assert_eq!(config.funding_interval_secs, 60);
        assert_eq!(config.max_events, 100_000);
        assert_eq!(config.liquidator_reward_share, dec!(0.5));
        assert_eq!(config.derivative_atomic_fee_multiplier, dec!(2.5));
    }

    #[test]
    fn atomic_multiplier_follows_market_kind() {
        let config: EngineConfig = serde_json::from_str(r#"{ "binary_options_atomic_fee_multiplier": "1.5" }"#).unwrap();
        assert_eq!(config.atomic_fee_multiplier(MarketKind::Perpetual), dec!(2.5));
        assert_eq!(config.atomic_fee_multiplier(MarketKind::ExpiryFutures), dec!(2.5));
        assert_eq!(config.atomic_fee_multiplier(MarketKind::BinaryOptions), dec!(1.5));
    }
}
