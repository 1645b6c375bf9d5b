//! Property-based tests for the pricing and fee math.
//!
//! These tests verify invariants hold under random inputs.

use derivatives_core::expansion::{order_fees_and_refunds, TradeFeeData};
use derivatives_core::funding::{cap_funding_rate, compute_hourly_funding};
use derivatives_core::matching::clearing_price;
use derivatives_core::position::PositionDelta;
use derivatives_core::*;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// Strategies for generating test data
fn price_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..1_000_000i64).prop_map(|x| Decimal::new(x, 2)) // 0.01 to 10,000
}

fn size_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..100_000i64).prop_map(|x| Decimal::new(x, 3)) // 0.001 to 100
}

fn fee_rate_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..=50i64).prop_map(|x| Decimal::new(x, 4)) // 0 to 0.5%
}

fn share_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..=100i64).prop_map(|x| Decimal::new(x, 2))
}

proptest! {
    /// The clearing price of a crossed book lies between the last crossing prices.
    #[test]
    fn clearing_price_within_crossing_pair(
        sell in price_strategy(),
        spread in 0i64..10_000i64,
        mark in proptest::option::of(price_strategy()),
        mid in proptest::option::of(price_strategy()),
    ) {
        let buy = sell + Decimal::new(spread, 2);
        let price = clearing_price(buy, sell, mark, mid);
        prop_assert!(
            price >= sell && price <= buy,
            "clearing price {} outside [{}, {}] (mark {:?}, mid {:?})", price, sell, buy, mark, mid
        );
    }

    /// Capped funding keeps its sign and never exceeds the cap.
    #[test]
    fn funding_rate_respects_cap(
        rate in (-10_000i64..=10_000i64).prop_map(|x| Decimal::new(x, 5)),
        cap in (0i64..=1_000i64).prop_map(|x| Decimal::new(x, 5)),
    ) {
        let capped = cap_funding_rate(rate, cap);
        prop_assert!(capped.abs() <= cap);
        prop_assert!(capped.is_zero() || capped.is_sign_negative() == rate.is_sign_negative());
        if rate.abs() <= cap {
            prop_assert_eq!(capped, rate);
        }
    }

    /// Whatever premium accrued, the hourly rate stays inside the market cap.
    #[test]
    fn hourly_funding_within_cap(
        cumulative_price in (-1_000_000i64..=1_000_000i64).prop_map(|x| Decimal::new(x, 2)),
        elapsed in 1i64..3600i64,
        mark in price_strategy(),
    ) {
        let info = PerpetualMarketInfo::new(Timestamp(0), 3600);
        let funding = PerpetualFunding {
            cumulative_funding: Decimal::ZERO,
            cumulative_price,
            last_timestamp: Timestamp(elapsed),
        };
        let hourly = compute_hourly_funding(&info, &funding, mark);
        prop_assert!(hourly.funding_rate.abs() <= info.hourly_funding_rate_cap);
        prop_assert_eq!(hourly.payment, round_amount(hourly.funding_rate * mark));
    }

    /// Relayer reward and auction share add up to what the trader pays.
    #[test]
    fn trade_fee_splits_are_complete(
        quantity in size_strategy(),
        price in price_strategy(),
        rate in (-50i64..=50i64).prop_map(|x| Decimal::new(x, 4)),
        share in share_strategy(),
    ) {
        let fee = TradeFeeData::new(quantity, price, rate, share);
        prop_assert_eq!(fee.fee_recipient_reward + fee.auction_fee_reward, fee.trader_fee);
        prop_assert!(fee.fee_recipient_reward >= Decimal::ZERO);
        if rate.is_sign_negative() {
            // the auction subaccount funds the rebate
            prop_assert!(fee.auction_fee_reward <= Decimal::ZERO);
        }
    }

    /// A market order's held fee is fully accounted for: refunds plus what was paid.
    #[test]
    fn held_fee_is_reconciled(
        quantity in size_strategy(),
        filled_ratio in 0i64..=100i64,
        order_price in price_strategy(),
        improvement in 0i64..=100i64,
        rate in fee_rate_strategy(),
        discount in (0i64..=50i64).prop_map(|x| Decimal::new(x, 2)),
    ) {
        let fill = quantity * Decimal::new(filled_ratio, 2);
        let execution_price = order_price * (Decimal::ONE - Decimal::new(improvement, 3));
        let discounted = rate * (Decimal::ONE - discount);
        let fee = TradeFeeData::new(fill, execution_price, discounted, dec!(0.4));

        let parts = order_fees_and_refunds(quantity, order_price, false, fill, execution_price, rate, rate, &fee);
        let held = quantity * order_price * rate;
        prop_assert_eq!(
            parts.unmatched_fee_refund + parts.matched_fee_refund_or_charge + parts.fee_charge,
            held,
            "held {} != {:?}", held, parts
        );
    }

    /// Reduce-only orders hold no fee, so nothing comes back.
    #[test]
    fn reduce_only_orders_get_no_fee_refunds(
        quantity in size_strategy(),
        price in price_strategy(),
        rate in fee_rate_strategy(),
    ) {
        let fee = TradeFeeData::new(quantity, price, rate, dec!(0.4));
        let parts = order_fees_and_refunds(quantity, price, true, quantity, price, rate, rate, &fee);
        prop_assert_eq!(parts.unmatched_fee_refund, Decimal::ZERO);
        prop_assert_eq!(parts.matched_fee_refund_or_charge, Decimal::ZERO);
        prop_assert_eq!(parts.fee_charge, Decimal::ZERO);
    }

    /// Opening and fully closing a position pays back margin plus pnl.
    #[test]
    fn round_trip_pays_margin_plus_pnl(
        is_long in any::<bool>(),
        quantity in size_strategy(),
        entry in price_strategy(),
        exit in price_strategy(),
        margin in price_strategy(),
    ) {
        let mut position = Position::new(is_long, Decimal::ZERO);
        let open = PositionDelta::new(is_long, quantity, margin, entry);
        let opened = position.apply_position_delta(&open, Decimal::ZERO);
        prop_assert_eq!(opened.collateralization_margin, margin);

        let close = PositionDelta::new(!is_long, quantity, margin, exit);
        let closed = position.apply_position_delta(&close, Decimal::ZERO);
        let pnl = if is_long { quantity * (exit - entry) } else { quantity * (entry - exit) };
        prop_assert_eq!(closed.pnl, pnl);
        prop_assert_eq!(closed.payout, margin + pnl);
        prop_assert!(position.is_empty());
    }

    /// Pnl is zero at entry and has the direction's sign away from it.
    #[test]
    fn pnl_sign_follows_direction(
        quantity in size_strategy(),
        entry in price_strategy(),
        delta in -500i64..=500i64,
    ) {
        let mut long = Position::new(true, Decimal::ZERO);
        long.apply_position_delta(&PositionDelta::new(true, quantity, entry * quantity, entry), Decimal::ZERO);
        let mut short = Position::new(false, Decimal::ZERO);
        short.apply_position_delta(&PositionDelta::new(false, quantity, entry * quantity, entry), Decimal::ZERO);

        prop_assert_eq!(long.unrealized_pnl(entry), Decimal::ZERO);
        let mark = entry + Decimal::new(delta, 2);
        prop_assert_eq!(long.unrealized_pnl(mark), -short.unrealized_pnl(mark));
        if mark > entry {
            prop_assert!(long.unrealized_pnl(mark) > Decimal::ZERO, "long should profit when mark > entry");
        } else if mark < entry {
            prop_assert!(short.unrealized_pnl(mark) > Decimal::ZERO, "short should profit when mark < entry");
        }
    }

    /// Funding only moves margin between the two sides.
    #[test]
    fn funding_is_zero_sum(
        quantity in size_strategy(),
        entry in price_strategy(),
        cumulative in (-10_000i64..=10_000i64).prop_map(|x| Decimal::new(x, 4)),
    ) {
        let mut long = Position::new(true, Decimal::ZERO);
        long.apply_position_delta(&PositionDelta::new(true, quantity, entry * quantity, entry), Decimal::ZERO);
        let mut short = Position::new(false, Decimal::ZERO);
        short.apply_position_delta(&PositionDelta::new(false, quantity, entry * quantity, entry), Decimal::ZERO);
        let before = long.margin + short.margin;

        let funding = PerpetualFunding {
            cumulative_funding: cumulative,
            ..PerpetualFunding::default()
        };
        long.apply_funding(Some(&funding));
        short.apply_funding(Some(&funding));
        prop_assert_eq!(long.margin + short.margin, before);
        prop_assert_eq!(long.cumulative_funding_entry, cumulative);
    }
}
