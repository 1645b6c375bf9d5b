//! Solvency invariant tests.
//!
//! Random books are pushed through full blocks; whatever matches, the exchange
//! must neither create nor lose funds.

use derivatives_core::*;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const FUNDING: Decimal = dec!(1_000_000);
const MARK: Decimal = dec!(100);

/// One trader's order: side, price offset from mark, quantity.
fn order_strategy() -> impl Strategy<Value = (bool, i64, i64)> {
    (any::<bool>(), -5i64..=5i64, 1i64..=5i64)
}

struct Exchange {
    engine: Engine,
    oracle: MockOracle,
    market_id: MarketId,
    traders: Vec<SubaccountId>,
}

impl Exchange {
    fn new(params: MarketParams, traders: usize, insurance: Decimal) -> Self {
        let oracle = MockOracle::new();
        oracle.set_price(&params.oracle, MARK);
        let market_id = params.id;
        let traders: Vec<SubaccountId> = (1..=traders as u64).map(SubaccountId).collect();
        let mut bank = InMemoryBank::new();
        for trader in &traders {
            bank.fund(*trader, "USDT", FUNDING);
        }
        let mut engine = Engine::new(
            EngineConfig::default(),
            Box::new(oracle.clone()),
            Box::new(InMemoryInsurance::new().with_fund(market_id, insurance)),
            Box::new(bank),
        );
        engine.launch_perpetual_market(params).unwrap();
        engine.begin_block(BlockContext::new(1, Timestamp(10))).unwrap();
        Self {
            engine,
            oracle,
            market_id,
            traders,
        }
    }

    /// Every quote denom balance the exchange is responsible for.
    fn total_funds(&self) -> Decimal {
        let bank = self.engine.bank();
        let traders: Decimal = self.traders.iter().map(|t| bank.deposit(*t, "USDT").total).sum();
        let auction = bank.deposit(SubaccountId::AUCTION, "USDT").total;
        let insurance = self.engine.insurance().balance(self.market_id).unwrap_or_default();
        traders + auction + insurance + self.engine.market_balance(self.market_id).unwrap_or_default()
    }

    fn place(&mut self, trader: SubaccountId, (is_buy, offset, quantity): (bool, i64, i64), margin_ratio: Decimal, market: bool) -> bool {
        let price = MARK + Decimal::from(offset);
        let quantity = Decimal::from(quantity);
        let request = OrderRequest::new(
            self.market_id,
            Side::from_is_buy(is_buy),
            OrderInfo::new(trader, price, quantity),
            price * quantity * margin_ratio,
        );
        let placed = if market {
            self.engine.place_market_order(request)
        } else {
            self.engine.place_limit_order(request)
        };
        placed.is_ok()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Open interest must balance. Total long quantity equals total short quantity.
    #[test]
    fn open_interest_always_balanced(
        limits in proptest::collection::vec(order_strategy(), 2..16),
        markets in proptest::collection::vec(order_strategy(), 0..6),
    ) {
        let traders = limits.len() + markets.len();
        let mut exchange = Exchange::new(MarketParams::btc_perp(MarketId(1)), traders, Decimal::ZERO);
        let initial = exchange.total_funds();

        for (i, order) in limits.iter().enumerate() {
            let trader = exchange.traders[i];
            prop_assert!(exchange.place(trader, *order, Decimal::ONE, false), "limit order {:?} rejected", order);
        }
        exchange.engine.end_block().unwrap();

        exchange.engine.begin_block(BlockContext::new(2, Timestamp(20))).unwrap();
        for (i, order) in markets.iter().enumerate() {
            let trader = exchange.traders[limits.len() + i];
            prop_assert!(exchange.place(trader, *order, Decimal::ONE, true), "market order {:?} rejected", order);
        }
        exchange.engine.end_block().unwrap();

        let id = exchange.market_id;
        let state = exchange.engine.market_state(id).unwrap();
        let (long, short) = state.position_totals();
        prop_assert_eq!(long, short, "OI imbalanced: long={}, short={}", long, short);
        prop_assert_eq!(exchange.engine.open_interest(id), Some(long + short));

        // nothing left crossed after the auction
        if let (Some(bid), Some(ask)) = (state.resting.best_price(Side::Buy), state.resting.best_price(Side::Sell)) {
            prop_assert!(bid < ask, "book crossed after matching: bid {} ask {}", bid, ask);
        }

        let after = exchange.total_funds();
        prop_assert_eq!(after, initial, "funds created or lost: {} -> {}", initial, after);
        let market_balance = exchange.engine.market_balance(id).unwrap();
        prop_assert!(market_balance >= Decimal::ZERO);
    }

    /// Limit orders never execute worse than their own price.
    #[test]
    fn fills_respect_limit_prices(
        limits in proptest::collection::vec(order_strategy(), 2..16),
    ) {
        let mut exchange = Exchange::new(MarketParams::btc_perp(MarketId(1)), limits.len(), Decimal::ZERO);
        for (i, order) in limits.iter().enumerate() {
            let trader = exchange.traders[i];
            prop_assert!(exchange.place(trader, *order, Decimal::ONE, false));
        }
        exchange.engine.end_block().unwrap();

        for (i, (is_buy, offset, _)) in limits.iter().enumerate() {
            let trader = exchange.traders[i];
            let Some(position) = exchange.engine.position(exchange.market_id, trader) else {
                continue;
            };
            let limit = MARK + Decimal::from(*offset);
            prop_assert_eq!(position.is_long, *is_buy);
            if *is_buy {
                prop_assert!(position.entry_price <= limit, "buy at {} filled at {}", limit, position.entry_price);
            } else {
                prop_assert!(position.entry_price >= limit, "sell at {} filled at {}", limit, position.entry_price);
            }
        }
    }

    /// Settling at any price only moves funds between traders, the market and the insurance fund.
    #[test]
    fn settlement_is_zero_sum(
        limits in proptest::collection::vec(order_strategy(), 2..16),
        settle_price in 50i64..=150i64,
        insurance in 0i64..=200i64,
    ) {
        let mut params = MarketParams::btc_perp(MarketId(1));
        params.maker_fee_rate = Decimal::ZERO;
        params.taker_fee_rate = Decimal::ZERO;
        let mut exchange = Exchange::new(params, limits.len(), Decimal::from(insurance));
        let initial = exchange.total_funds();

        // 5x leverage, so far settlement prices leave losers bankrupt
        for (i, order) in limits.iter().enumerate() {
            let trader = exchange.traders[i];
            prop_assert!(exchange.place(trader, *order, dec!(0.2), false));
        }
        exchange.engine.end_block().unwrap();

        let id = exchange.market_id;
        exchange.engine.force_settle_market(id, Some(Decimal::from(settle_price))).unwrap();
        let summary = exchange.engine.begin_block(BlockContext::new(2, Timestamp(20))).unwrap();
        prop_assert_eq!(summary.settled_markets, vec![id]);

        prop_assert!(exchange.engine.market_balance(id).unwrap() >= Decimal::ZERO);
        prop_assert_eq!(exchange.engine.open_interest(id), Some(Decimal::ZERO));
        let after = exchange.total_funds();
        prop_assert_eq!(after, initial, "settlement at {} created or lost funds", settle_price);

        // nothing is held for orders any more
        for trader in &exchange.traders {
            prop_assert!(exchange.engine.position(id, *trader).is_none());
            let deposit = exchange.engine.bank().deposit(*trader, "USDT");
            prop_assert_eq!(deposit.total, deposit.available);
        }
    }

    /// A mark move that triggers funding keeps the market's obligations intact.
    #[test]
    fn funding_preserves_market_balance(
        limits in proptest::collection::vec(order_strategy(), 2..12),
        mark_move in -3i64..=3i64,
    ) {
        let mut exchange = Exchange::new(MarketParams::btc_perp(MarketId(1)), limits.len(), Decimal::ZERO);
        for (i, order) in limits.iter().enumerate() {
            let trader = exchange.traders[i];
            prop_assert!(exchange.place(trader, *order, Decimal::ONE, false));
        }
        exchange.engine.end_block().unwrap();

        let id = exchange.market_id;
        let pair = MarketParams::btc_perp(id).oracle;
        exchange.oracle.set_price(&pair, MARK + Decimal::from(mark_move));
        let before = exchange.engine.calculate_market_balance(id).unwrap();
        let next = exchange.engine.market(id).unwrap().perpetual_info().unwrap().next_funding_timestamp;
        exchange.engine.begin_block(BlockContext::new(2, next)).unwrap();
        let after = exchange.engine.calculate_market_balance(id).unwrap();
        prop_assert_eq!(before, after);
    }
}
