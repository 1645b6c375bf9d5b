//! Reduce-only conflict resolution.
//!
//! A reduce-only order may never flip a position. When a new order on the
//! closing side would let the subaccount's open orders exceed the position,
//! a new reduce-only order is shrunk to what is left and the worst-priced
//! existing reduce-only orders are cancelled until no flip remains.

use crate::order::{DerivativeLimitOrder, OrderError, SubaccountOrderbookMetadata};
use crate::position::Position;
use crate::types::{OrderHash, Side};
use rust_decimal::Decimal;

/// The parts of an open limit order conflict resolution looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubaccountOrder {
    pub hash: OrderHash,
    pub price: Decimal,
    /// Open quantity
    pub quantity: Decimal,
    pub is_reduce_only: bool,
}

impl From<&DerivativeLimitOrder> for SubaccountOrder {
    fn from(order: &DerivativeLimitOrder) -> Self {
        Self {
            hash: order.hash,
            price: order.price(),
            quantity: order.fillable,
            is_reduce_only: order.is_reduce_only(),
        }
    }
}

/// Orders priced equal to or better than a reference price.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EqualOrBetterOrders {
    pub orders: Vec<SubaccountOrder>,
    pub reduce_only_quantity: Decimal,
    pub vanilla_quantity: Decimal,
    /// Reduce-only quantity at strictly better prices
    pub better_reduce_only_quantity: Decimal,
}

/// `orders` must be one side of the subaccount's book, best first.
pub fn equal_or_better_orders(orders: &[SubaccountOrder], side: Side, price: Decimal) -> EqualOrBetterOrders {
    let mut result = EqualOrBetterOrders::default();
    for order in orders.iter().take_while(|o| !side.is_better_price(price, o.price)) {
        if order.is_reduce_only {
            result.reduce_only_quantity += order.quantity;
            if order.price != price {
                result.better_reduce_only_quantity += order.quantity;
            }
        } else {
            result.vanilla_quantity += order.quantity;
        }
        result.orders.push(*order);
    }
    result
}

/// Quantity a new reduce-only order may keep. `None` when it fits as placed.
pub fn resize_new_reduce_only(position_quantity: Decimal, order_quantity: Decimal, eob: &EqualOrBetterOrders) -> Result<Option<Decimal>, OrderError> {
    let reducible = position_quantity - (eob.reduce_only_quantity + eob.vanilla_quantity);
    if reducible <= Decimal::ZERO {
        return Err(OrderError::InsufficientPositionQuantity);
    }
    if reducible >= order_quantity {
        return Ok(None);
    }
    Ok(Some(reducible))
}

/// Orders from the best down to the worst reduce-only one, then sorted worst first
/// with reduce-only ahead of vanilla at the same price.
fn worst_reduce_only_and_better(orders: &[SubaccountOrder], side: Side, total_reduce_only: Decimal, new_price: Option<Decimal>) -> (Vec<SubaccountOrder>, Decimal) {
    let mut found_reduce_only = Decimal::ZERO;
    let mut worst_reduce_only_price = None;
    let mut total = Decimal::ZERO;
    let mut selected = Vec::new();

    for order in orders {
        let is_equal_or_better = new_price.is_some_and(|p| !side.is_better_price(p, order.price));
        // same-priced vanillas may match before the worst reduce-only, keep them
        if !is_equal_or_better && found_reduce_only >= total_reduce_only && worst_reduce_only_price != Some(order.price) {
            break;
        }
        total += order.quantity;
        if order.is_reduce_only {
            found_reduce_only += order.quantity;
            worst_reduce_only_price = Some(order.price);
        }
        selected.push(*order);
    }

    selected.sort_by(|a, b| {
        if a.price == b.price {
            return b.is_reduce_only.cmp(&a.is_reduce_only);
        }
        if side.is_better_price(a.price, b.price) {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Less
        }
    });
    (selected, total)
}

/// Worst-priced reduce-only orders whose cancellation keeps the side from flipping the position.
pub fn minimum_reduce_only_cancels(
    orders: &[SubaccountOrder],
    side: Side,
    metadata: &SubaccountOrderbookMetadata,
    position_quantity: Decimal,
    new_order: Option<(Decimal, Decimal)>,
) -> Vec<OrderHash> {
    let new_price = new_order.map(|(price, _)| price);
    let (candidates, total) = worst_reduce_only_and_better(orders, side, metadata.aggregate_reduce_only_quantity, new_price);

    let mut flipping = total - position_quantity;
    if let Some((_, quantity)) = new_order {
        flipping += quantity;
    }
    if flipping <= Decimal::ZERO {
        return Vec::new();
    }

    let mut checked = Decimal::ZERO;
    let mut cancels = Vec::new();
    for order in candidates {
        // orders better than the new one match first and cannot be the flip
        if new_price.is_some_and(|p| side.is_better_price(order.price, p)) {
            break;
        }
        if order.is_reduce_only {
            cancels.push(order.hash);
        }
        checked += order.quantity;
        if checked >= flipping {
            break;
        }
    }
    cancels
}

/// What placing a new order does to the subaccount's reduce-only orders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReduceOnlyResolution {
    /// New quantity for the incoming reduce-only order
    pub resized_quantity: Option<Decimal>,
    pub cancels: Vec<OrderHash>,
}

/// New order: (side, price, quantity, is reduce-only). `orders` is the subaccount's
/// open limit orders on that side, best first.
pub fn resolve_reduce_only_conflicts(
    position: Option<&Position>,
    side: Side,
    price: Decimal,
    quantity: Decimal,
    is_reduce_only: bool,
    metadata: &SubaccountOrderbookMetadata,
    orders: &[SubaccountOrder],
) -> Result<ReduceOnlyResolution, OrderError> {
    let mut resolution = ReduceOnlyResolution::default();
    let Some(position) = position.filter(|p| !p.is_empty() && p.is_long != side.is_buy()) else {
        return Ok(resolution);
    };

    let cumulative = quantity + metadata.aggregate_reduce_only_quantity + metadata.aggregate_vanilla_quantity;
    if position.quantity >= cumulative {
        return Ok(resolution);
    }

    let eob = equal_or_better_orders(orders, side, price);
    let mut quantity = quantity;
    if is_reduce_only {
        if let Some(resized) = resize_new_reduce_only(position.quantity, quantity, &eob)? {
            resolution.resized_quantity = Some(resized);
            quantity = resized;
        }
    }

    let cancellable = metadata.aggregate_reduce_only_quantity - eob.better_reduce_only_quantity;
    if cancellable > Decimal::ZERO {
        resolution.cancels = minimum_reduce_only_cancels(orders, side, metadata, position.quantity, Some((price, quantity)));
    }
    Ok(resolution)
}

/// This block's reduce-only orders on `side` that the position can no longer absorb,
/// newest first. All of them when the position is gone or points the same way.
pub fn transient_reduce_only_cancels(
    position: Option<&Position>,
    side: Side,
    metadata: &SubaccountOrderbookMetadata,
    transient_reduce_only: &[SubaccountOrder],
) -> Vec<OrderHash> {
    let valid_position = position.filter(|p| !p.is_empty() && p.is_long != side.is_buy());
    let Some(position) = valid_position else {
        return transient_reduce_only.iter().map(|o| o.hash).collect();
    };

    let mut excess = metadata.aggregate_reduce_only_quantity + metadata.aggregate_vanilla_quantity - position.quantity;
    let mut cancels = Vec::new();
    for order in transient_reduce_only.iter().rev() {
        if excess <= Decimal::ZERO {
            break;
        }
        cancels.push(order.hash);
        excess -= order.quantity;
    }
    cancels
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(hash: u64, price: Decimal, quantity: Decimal, is_reduce_only: bool) -> SubaccountOrder {
        SubaccountOrder {
            hash: OrderHash(hash),
            price,
            quantity,
            is_reduce_only,
        }
    }

    fn long(quantity: Decimal) -> Position {
        Position {
            is_long: true,
            quantity,
            entry_price: dec!(100),
            margin: dec!(10),
            cumulative_funding_entry: Decimal::ZERO,
        }
    }

    fn metadata(reduce_only: Decimal, vanilla: Decimal) -> SubaccountOrderbookMetadata {
        SubaccountOrderbookMetadata {
            aggregate_reduce_only_quantity: reduce_only,
            aggregate_vanilla_quantity: vanilla,
            ..SubaccountOrderbookMetadata::default()
        }
    }

    #[test]
    fn equal_or_better_stops_at_worse_prices() {
        // sells, best (lowest) first
        let orders = [
            order(1, dec!(100), dec!(1), true),
            order(2, dec!(101), dec!(2), false),
            order(3, dec!(101), dec!(1), true),
            order(4, dec!(103), dec!(5), true),
        ];
        let eob = equal_or_better_orders(&orders, Side::Sell, dec!(101));
        assert_eq!(eob.orders.len(), 3);
        assert_eq!(eob.reduce_only_quantity, dec!(2));
        assert_eq!(eob.vanilla_quantity, dec!(2));
        assert_eq!(eob.better_reduce_only_quantity, dec!(1));
    }

    #[test]
    fn new_reduce_only_is_resized_to_what_is_left() {
        let orders = [order(1, dec!(100), dec!(3), true)];
        let position = long(dec!(5));
        let resolution =
            resolve_reduce_only_conflicts(Some(&position), Side::Sell, dec!(102), dec!(4), true, &metadata(dec!(3), Decimal::ZERO), &orders).unwrap();
        assert_eq!(resolution.resized_quantity, Some(dec!(2)));
        assert!(resolution.cancels.is_empty());
    }

    #[test]
    fn reduce_only_without_room_is_rejected() {
        let orders = [order(1, dec!(100), dec!(5), false)];
        let position = long(dec!(5));
        assert_eq!(
            resolve_reduce_only_conflicts(Some(&position), Side::Sell, dec!(101), dec!(1), true, &metadata(Decimal::ZERO, dec!(5)), &orders),
            Err(OrderError::InsufficientPositionQuantity)
        );
    }

    #[test]
    fn better_vanilla_cancels_worst_reduce_only() {
        let orders = [order(1, dec!(105), dec!(3), true), order(2, dec!(110), dec!(2), true)];
        let position = long(dec!(5));
        // a vanilla sell at 100 for 2 jumps ahead of both
        let resolution =
            resolve_reduce_only_conflicts(Some(&position), Side::Sell, dec!(100), dec!(2), false, &metadata(dec!(5), Decimal::ZERO), &orders).unwrap();
        assert_eq!(resolution.resized_quantity, None);
        assert_eq!(resolution.cancels, vec![OrderHash(2)]);
    }

    #[test]
    fn no_conflict_when_position_covers_everything() {
        let position = long(dec!(10));
        let resolution =
            resolve_reduce_only_conflicts(Some(&position), Side::Sell, dec!(100), dec!(2), false, &metadata(dec!(3), dec!(1)), &[]).unwrap();
        assert_eq!(resolution, ReduceOnlyResolution::default());

        // same direction never conflicts
        let resolution = resolve_reduce_only_conflicts(Some(&position), Side::Buy, dec!(100), dec!(20), false, &metadata(dec!(3), dec!(1)), &[]).unwrap();
        assert_eq!(resolution, ReduceOnlyResolution::default());
    }

    #[test]
    fn transient_filter_cancels_newest_first() {
        let transient = [order(1, dec!(100), dec!(1), true), order(2, dec!(100), dec!(2), true)];
        let position = long(dec!(2));
        let cancels = transient_reduce_only_cancels(Some(&position), Side::Sell, &metadata(dec!(3), Decimal::ZERO), &transient);
        assert_eq!(cancels, vec![OrderHash(2)]);

        let cancels = transient_reduce_only_cancels(None, Side::Sell, &metadata(dec!(3), Decimal::ZERO), &transient);
        assert_eq!(cancels.len(), 2);
        let cancels = transient_reduce_only_cancels(Some(&position), Side::Buy, &metadata(dec!(3), Decimal::ZERO), &transient);
        assert_eq!(cancels.len(), 2);
    }
}
