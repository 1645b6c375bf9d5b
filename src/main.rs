//! Derivative market core simulation.
//!
//! Walks one perpetual, one expiry future and one binary options market through
//! their lifecycles: batch matching, funding, liquidation and settlement.
//! Set RUST_LOG=derivatives_core=info (or debug) to see the engine's logs.

use derivatives_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing_subscriber::EnvFilter;

type SimResult = Result<(), EngineError>;

const ALICE: SubaccountId = SubaccountId(1);
const BOB: SubaccountId = SubaccountId(2);
const CAROL: SubaccountId = SubaccountId(3);
const KEEPER: SubaccountId = SubaccountId(9);

fn main() -> SimResult {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    println!("Derivative Market Core Simulation");
    println!("Batch auctions, funding, liquidation and settlement\n");

    scenario_1_batch_auction()?;
    scenario_2_market_order_sweep()?;
    scenario_3_funding()?;
    scenario_4_liquidation()?;
    scenario_5_expiry_settlement()?;
    scenario_6_binary_options()?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

fn funded_bank(amount: Decimal) -> InMemoryBank {
    let mut bank = InMemoryBank::new();
    for trader in [ALICE, BOB, CAROL] {
        bank.fund(trader, "USDT", amount);
    }
    bank
}

fn fee_free(mut params: MarketParams) -> MarketParams {
    params.maker_fee_rate = Decimal::ZERO;
    params.taker_fee_rate = Decimal::ZERO;
    params
}

fn limit(market_id: MarketId, trader: SubaccountId, side: Side, price: Decimal, quantity: Decimal, margin: Decimal) -> OrderRequest {
    OrderRequest::new(market_id, side, OrderInfo::new(trader, price, quantity), margin)
}

fn perp_engine(oracle: &MockOracle, mark: Decimal, insurance: Decimal) -> Result<(Engine, MarketId), EngineError> {
    let params = MarketParams::btc_perp(MarketId(1));
    oracle.set_price(&params.oracle, mark);
    let mut engine = Engine::new(
        EngineConfig::default(),
        Box::new(oracle.clone()),
        Box::new(InMemoryInsurance::new().with_fund(MarketId(1), insurance)),
        Box::new(funded_bank(dec!(10000))),
    );
    let id = engine.launch_perpetual_market(params)?;
    engine.begin_block(BlockContext::new(1, Timestamp(10)))?;
    Ok((engine, id))
}

fn print_position(engine: &Engine, market_id: MarketId, name: &str, trader: SubaccountId) {
    match engine.position(market_id, trader) {
        Some(p) => println!(
            "    {}: {} {} @ {} (margin {})",
            name,
            if p.is_long { "long" } else { "short" },
            p.quantity,
            p.entry_price,
            p.margin
        ),
        None => println!("    {}: flat", name),
    }
}

fn print_balance(engine: &Engine, name: &str, trader: SubaccountId) {
    let deposit = engine.bank().deposit(trader, "USDT");
    println!("    {}: total {}, available {}", name, deposit.total, deposit.available);
}

/// Crossing limit orders clear at one price per block.
fn scenario_1_batch_auction() -> SimResult {
    println!("Scenario 1: Batch Auction\n");

    let oracle = MockOracle::new();
    let (mut engine, id) = perp_engine(&oracle, dec!(97), dec!(1000))?;

    engine.place_limit_order(limit(id, ALICE, Side::Buy, dec!(100), dec!(5), dec!(500)))?;
    engine.place_limit_order(limit(id, BOB, Side::Sell, dec!(95), dec!(3), dec!(285)))?;
    println!("  Alice bids 5 @ 100, Bob offers 3 @ 95, mark 97");

    let summary = engine.end_block()?;
    println!("  Markets executed: {}", summary.executed_markets.len());
    print_position(&engine, id, "Alice", ALICE);
    print_position(&engine, id, "Bob", BOB);

    let state = engine.market_state(id).ok_or(EngineError::MarketNotFound(id))?;
    println!(
        "  Resting orders: {}, best bid {:?}, open interest {:?}\n",
        state.resting.len(),
        state.resting.best_price(Side::Buy),
        engine.open_interest(id)
    );
    Ok(())
}

/// A market order walks the resting book level by level.
fn scenario_2_market_order_sweep() -> SimResult {
    println!("Scenario 2: Market Order Sweep\n");

    let oracle = MockOracle::new();
    let (mut engine, id) = perp_engine(&oracle, dec!(97), dec!(1000))?;

    engine.place_limit_order(limit(id, BOB, Side::Sell, dec!(95), dec!(4), dec!(380)))?;
    engine.place_limit_order(limit(id, CAROL, Side::Sell, dec!(98), dec!(6), dec!(588)))?;
    engine.end_block()?;
    println!("  Book: 4 @ 95 (Bob), 6 @ 98 (Carol)");

    engine.begin_block(BlockContext::new(2, Timestamp(20)))?;
    engine.place_market_order(limit(id, ALICE, Side::Buy, dec!(100), dec!(10), dec!(1000)))?;
    engine.end_block()?;
    println!("  Alice market buys 10, worst price 100");
    print_position(&engine, id, "Alice", ALICE);
    print_balance(&engine, "Alice", ALICE);

    let fee_events = engine
        .events()
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::BatchDerivativeExecution(_)))
        .count();
    println!("  Execution events: {}\n", fee_events);
    Ok(())
}

/// Trades above mark accrue a premium that longs pay at the next interval.
fn scenario_3_funding() -> SimResult {
    println!("Scenario 3: Hourly Funding\n");

    let oracle = MockOracle::new();
    let (mut engine, id) = perp_engine(&oracle, dec!(100), dec!(1000))?;

    engine.place_limit_order(limit(id, ALICE, Side::Buy, dec!(100.5), dec!(2), dec!(201)))?;
    engine.place_limit_order(limit(id, BOB, Side::Sell, dec!(100.5), dec!(2), dec!(201)))?;
    engine.end_block()?;

    let next = engine
        .market(id)
        .and_then(Market::perpetual_info)
        .map(|info| info.next_funding_timestamp)
        .ok_or(EngineError::MarketNotFound(id))?;
    println!("  Both sides open 2 @ 100.5 against mark 100, next funding at {}", next);

    engine.begin_block(BlockContext::new(2, Timestamp(1800)))?;
    engine.place_limit_order(limit(id, CAROL, Side::Buy, dec!(101), dec!(1), dec!(101)))?;
    engine.place_limit_order(limit(id, BOB, Side::Sell, dec!(101), dec!(1), dec!(101)))?;
    engine.end_block()?;

    let summary = engine.begin_block(BlockContext::new(3, next))?;
    let funding = engine.market(id).and_then(Market::funding).ok_or(EngineError::MarketNotFound(id))?;
    println!(
        "  Funding paid in {} market(s), cumulative funding {}",
        summary.funded_markets.len(),
        funding.cumulative_funding
    );
    println!("  Market balance at mark: {}\n", engine.calculate_market_balance(id)?);
    Ok(())
}

/// An undercollateralized long is closed into the bid, the rest of its margin is split.
fn scenario_4_liquidation() -> SimResult {
    println!("Scenario 4: Liquidation\n");

    let oracle = MockOracle::new();
    let (mut engine, id) = perp_engine(&oracle, dec!(100), dec!(1000))?;
    let pair = MarketParams::btc_perp(id).oracle;

    engine.place_limit_order(limit(id, ALICE, Side::Buy, dec!(100), dec!(1), dec!(10)))?;
    engine.place_limit_order(limit(id, BOB, Side::Sell, dec!(100), dec!(1), dec!(100)))?;
    engine.place_limit_order(limit(id, CAROL, Side::Buy, dec!(91), dec!(1), dec!(91)))?;
    engine.end_block()?;
    println!("  Alice opens 1 long @ 100 with 10 margin, Carol bids 1 @ 91");

    for mark in [dec!(95), dec!(91)] {
        oracle.set_price(&pair, mark);
        match engine.liquidate_position(id, ALICE, KEEPER) {
            Ok(result) => {
                println!(
                    "  Mark {}: liquidated {}, payout {}, keeper reward {}, insurance {}",
                    mark, result.executed_quantity, result.payout, result.liquidator_reward, result.insurance_delta
                );
            }
            Err(err) => println!("  Mark {}: {}", mark, err),
        }
    }
    print_position(&engine, id, "Alice", ALICE);
    print_position(&engine, id, "Carol", CAROL);
    print_balance(&engine, "Keeper", KEEPER);
    println!("  Insurance fund: {:?}\n", engine.insurance().balance(id));
    Ok(())
}

/// Expiry futures settle at the oracle TWAP over the last window.
fn scenario_5_expiry_settlement() -> SimResult {
    println!("Scenario 5: Expiry Futures\n");

    let oracle = MockOracle::new();
    let params = fee_free(MarketParams::eth_futures(MarketId(2)));
    let pair = params.oracle.clone();
    oracle.set_price(&pair, dec!(100));
    let mut engine = Engine::new(
        EngineConfig::default(),
        Box::new(oracle.clone()),
        Box::new(InMemoryInsurance::new().with_fund(MarketId(2), Decimal::ZERO)),
        Box::new(funded_bank(dec!(1000))),
    );
    let id = engine.launch_expiry_futures_market(params, Timestamp(1000), 100)?;

    engine.begin_block(BlockContext::new(1, Timestamp(10)))?;
    engine.place_limit_order(limit(id, ALICE, Side::Buy, dec!(100), dec!(1), dec!(100)))?;
    engine.place_limit_order(limit(id, BOB, Side::Sell, dec!(100), dec!(1), dec!(100)))?;
    engine.end_block()?;
    println!("  Alice long 1 @ 100, Bob short 1 @ 100, expiry at t=1000");

    oracle.set_cumulative_price(&pair, dec!(1000), dec!(10));
    engine.begin_block(BlockContext::new(2, Timestamp(900)))?;
    oracle.set_cumulative_price(&pair, dec!(12000), dec!(110));
    let summary = engine.begin_block(BlockContext::new(3, Timestamp(1000)))?;

    let market = engine.market(id).ok_or(EngineError::MarketNotFound(id))?;
    println!(
        "  Settled {} market(s) at {:?}, status {:?}",
        summary.settled_markets.len(),
        market.expiry_info().and_then(|i| i.settlement_price),
        market.status()
    );
    print_balance(&engine, "Alice", ALICE);
    print_balance(&engine, "Bob", BOB);
    println!();
    Ok(())
}

/// Binary options pay the scaled admin price, or refund margins.
fn scenario_6_binary_options() -> SimResult {
    println!("Scenario 6: Binary Options\n");

    let oracle = MockOracle::new();
    let params = fee_free(MarketParams::binary_option(MarketId(3), 0));
    oracle.set_price(&params.oracle, dec!(0.6));
    let mut engine = Engine::new(
        EngineConfig::default(),
        Box::new(oracle.clone()),
        Box::new(InMemoryInsurance::new().with_fund(MarketId(3), Decimal::ZERO)),
        Box::new(funded_bank(dec!(1000))),
    );
    let id = engine.launch_binary_options_market(params, Timestamp(100), Timestamp(200))?;

    engine.begin_block(BlockContext::new(1, Timestamp(10)))?;
    engine.place_limit_order(limit(id, ALICE, Side::Buy, dec!(0.6), dec!(10), dec!(6)))?;
    engine.place_limit_order(limit(id, BOB, Side::Sell, dec!(0.6), dec!(10), dec!(4)))?;
    engine.end_block()?;
    println!("  Alice buys 10 YES @ 0.6 from Bob");

    engine.admin_settle_binary_options(id, dec!(1))?;
    engine.begin_block(BlockContext::new(2, Timestamp(150)))?;
    let status = engine.market(id).map(Market::status);
    println!("  Resolved YES, status {:?}", status);
    print_balance(&engine, "Alice", ALICE);
    print_balance(&engine, "Bob", BOB);
    println!("  Events generated: {}", engine.events().len());
    Ok(())
}
