//! Order margin requirements.
//!
//! A vanilla order locks margin of at least `price × quantity × initialMarginRatio`,
//! and the mark price must sit on the safe side of the order's mark-price
//! threshold so the position does not open already below initial margin.
//! Binary options lock the worst-case loss instead.

use crate::market::Market;
use crate::order::{binary_options_order_margin, OrderError};
use crate::types::round_amount;
use rust_decimal::Decimal;

pub fn initial_margin_requirement(price: Decimal, quantity: Decimal, initial_margin_ratio: Decimal) -> Decimal {
    price * quantity * initial_margin_ratio
}

/// Mark price at which a fresh fill at `price` sits exactly at initial margin.
pub fn mark_price_threshold(is_buy: bool, price: Decimal, quantity: Decimal, margin: Decimal, initial_margin_ratio: Decimal) -> Option<Decimal> {
    let notional = price * quantity;
    let (numerator, denominator) = if is_buy {
        (margin - notional, (initial_margin_ratio - Decimal::ONE) * quantity)
    } else {
        (margin + notional, (initial_margin_ratio + Decimal::ONE) * quantity)
    };
    if denominator.is_zero() {
        return None;
    }
    Some(numerator / denominator)
}

/// Buys need mark ≥ threshold, sells need mark ≤ threshold.
pub fn check_initial_margin_mark_price_threshold(
    is_buy: bool,
    price: Decimal,
    quantity: Decimal,
    margin: Decimal,
    initial_margin_ratio: Decimal,
    mark_price: Decimal,
) -> Result<(), OrderError> {
    let Some(threshold) = mark_price_threshold(is_buy, price, quantity, margin, initial_margin_ratio) else {
        return Err(OrderError::MarkPriceThresholdBreached { mark_price });
    };
    let breached = if is_buy { mark_price < threshold } else { mark_price > threshold };
    if breached {
        return Err(OrderError::MarkPriceThresholdBreached { mark_price });
    }
    Ok(())
}

/// `amount × part / whole` rounded to [`AMOUNT_DP`](crate::types::AMOUNT_DP), zero when
/// `whole` is zero. the whole share is returned as is.
pub fn pro_rata(amount: Decimal, part: Decimal, whole: Decimal) -> Decimal {
    if whole.is_zero() {
        return Decimal::ZERO;
    }
    if part == whole {
        return amount;
    }
    round_amount(amount * part / whole)
}

/// Fee locked with an order so it can always pay at `fee_rate`.
pub fn order_fee_hold(price: Decimal, quantity: Decimal, fee_rate: Decimal) -> Decimal {
    price * quantity * fee_rate.max(Decimal::ZERO)
}

// 3.1: margin check at placement. reduce-only orders carry no margin.
pub fn validate_order_margin(
    market: &Market,
    is_buy: bool,
    price: Decimal,
    quantity: Decimal,
    margin: Decimal,
    mark_price: Option<Decimal>,
) -> Result<(), OrderError> {
    if margin.is_sign_negative() {
        return Err(OrderError::InsufficientOrderMargin {
            provided: margin,
            required: Decimal::ZERO,
        });
    }
    if margin.is_zero() {
        return Ok(());
    }

    if market.is_binary_options() {
        let scale = market.oracle_scale();
        if price <= Decimal::ZERO || price >= scale {
            return Err(OrderError::InvalidBinaryOptionsPrice(price));
        }
        let required = binary_options_order_margin(price, quantity, is_buy, false, scale);
        if margin != required {
            return Err(OrderError::InsufficientOrderMargin { provided: margin, required });
        }
        return Ok(());
    }

    let required = initial_margin_requirement(price, quantity, market.initial_margin_ratio());
    if margin < required {
        return Err(OrderError::InsufficientOrderMargin { provided: margin, required });
    }
    let mark_price = mark_price.ok_or(OrderError::NoMarkPrice(market.id()))?;
    check_initial_margin_mark_price_threshold(is_buy, price, quantity, margin, market.initial_margin_ratio(), mark_price)
}
