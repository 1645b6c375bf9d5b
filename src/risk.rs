// 6.3: open notional admission control.
// open interest counts both sides (Σ |position quantity|); open notional is that times mark.
// fills that shrink exposure are always admitted.

use crate::market::OpenNotionalCap;
use rust_decimal::Decimal;

/// Exposure change of one fill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotionalCapValues {
    pub notional_delta: Decimal,
    pub quantity_delta: Decimal,
}

pub fn open_notional(open_interest: Decimal, mark_price: Decimal) -> Decimal {
    open_interest * mark_price
}

/// How a fill of `quantity` moves the subaccount's absolute exposure, given its signed position.
pub fn values_for_notional_cap_checks(is_buy: bool, quantity: Decimal, mark_price: Decimal, signed_position: Decimal) -> NotionalCapValues {
    let is_closing = !signed_position.is_zero() && is_buy == signed_position.is_sign_negative();
    let new_position = if is_buy { signed_position + quantity } else { signed_position - quantity };

    let quantity_delta = if is_closing && quantity > signed_position.abs() {
        // flips: only the overshoot past zero adds exposure
        new_position.abs() - signed_position.abs()
    } else if is_closing {
        -quantity
    } else {
        quantity
    };

    NotionalCapValues {
        notional_delta: quantity_delta * mark_price,
        quantity_delta,
    }
}

/// Returns (breaches, notional to reserve). uncapped markets reserve nothing.
pub fn does_breach_open_notional_cap(cap: OpenNotionalCap, notional_delta: Decimal, total_open_notional: Decimal) -> (bool, Decimal) {
    let OpenNotionalCap::Capped(cap_value) = cap else {
        return (false, Decimal::ZERO);
    };
    if notional_delta.is_sign_negative() {
        return (false, notional_delta);
    }
    (total_open_notional + notional_delta > cap_value, notional_delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn opening_closing_and_flipping() {
        let open = values_for_notional_cap_checks(true, dec!(2), dec!(10), Decimal::ZERO);
        assert_eq!(open.quantity_delta, dec!(2));
        assert_eq!(open.notional_delta, dec!(20));

        let close = values_for_notional_cap_checks(false, dec!(1), dec!(10), dec!(3));
        assert_eq!(close.quantity_delta, dec!(-1));

        // short 1 buys 3: closes 1, opens 2
        let flip = values_for_notional_cap_checks(true, dec!(3), dec!(10), dec!(-1));
        assert_eq!(flip.quantity_delta, dec!(1));
        assert_eq!(flip.notional_delta, dec!(10));
    }

    #[test]
    fn cap_admission() {
        let cap = OpenNotionalCap::Capped(dec!(100));
        assert_eq!(does_breach_open_notional_cap(cap, dec!(30), dec!(70)), (false, dec!(30)));
        assert_eq!(does_breach_open_notional_cap(cap, dec!(31), dec!(70)), (true, dec!(31)));
        assert_eq!(does_breach_open_notional_cap(cap, dec!(-50), dec!(500)), (false, dec!(-50)));
        assert_eq!(
            does_breach_open_notional_cap(OpenNotionalCap::Uncapped, dec!(1_000_000), dec!(0)),
            (false, Decimal::ZERO)
        );
    }
}
