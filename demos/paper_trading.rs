use std::env;
use std::sync::Arc;
use std::time::Duration;

use log::LevelFilter;
use rust_decimal::prelude::*;
use strategy_scheduler::paper::{sine_path, PaperExchange};
use strategy_scheduler::settings::{InMemorySettingsStore, MarketSettings, ScalpingSettings};
use strategy_scheduler::strategies::{SettingsStores, StrategyDeps};
use strategy_scheduler::trading_api::{Exchange, Network, OrderGateway, Timeframe};
use strategy_scheduler::{
    SchedulerConfig, StrategyRegistry, StrategyScheduler, TaskLifecycleManager,
};

const SYMBOL: &str = "BTCUSDT";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    let ticks: usize = match args.get(1) {
        Some(raw) => raw.parse()?,
        None => 200,
    };

    let paper = PaperExchange::default();
    let path = sine_path(Decimal::from(30_000), Decimal::from(600), 40, 60 + ticks);
    paper.push_prices(SYMBOL, path[..60].iter().copied()).await;

    let market = MarketSettings {
        exchange: Exchange::Paper,
        network: Network::Testnet,
        symbol: SYMBOL.to_owned(),
        timeframe: Timeframe::M1,
        order_amount: Decimal::from_str("0.01")?,
        poll_interval_ms: 20,
        max_consecutive_errors: 5,
    };
    let mut settings = SettingsStores::in_memory();
    settings.scalping = Arc::new(InMemorySettingsStore::with_defaults(ScalpingSettings {
        market: market.clone(),
        spread_bps: 20,
        max_position: Decimal::from_str("0.05")?,
    }));

    let registry = StrategyRegistry::with_defaults(&StrategyDeps::paper(&paper), &settings)?;
    let tasks = TaskLifecycleManager::new(SchedulerConfig::from_env()?);
    let scheduler = StrategyScheduler::new(Arc::new(registry), Arc::new(tasks));

    println!("available strategies:");
    for (strategy_type, label) in scheduler.available_strategies() {
        println!("  {:<16} {}", strategy_type, label);
    }

    scheduler.start_strategy(1, "SCALPING")?;
    scheduler.start_strategy(1, "MA_CROSSOVER")?;
    scheduler.start_strategy(2, "scalping")?;
    // duplicate start is a no-op
    scheduler.start_strategy(2, "SCALPING")?;

    for price in path[60..].iter().copied() {
        paper.push_price(SYMBOL, price).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for tenant in [1, 2] {
        println!(
            "tenant {}: active {:?}, position {}",
            tenant,
            scheduler.active_strategies(tenant),
            paper.position(tenant, SYMBOL, None).await?
        );
    }

    scheduler.stop_strategy(1, "SCALPING")?;
    let stopped = scheduler.shutdown();
    // let the aborted bodies record their exits
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!("--- paper trading summary ---");
    println!("ticks: {}", ticks);
    println!("fills executed: {}", paper.fill_count().await);
    println!("strategies stopped at shutdown: {}", stopped);
    for tenant in [1, 2] {
        println!(
            "tenant {} scalping exit: {:?}",
            tenant,
            scheduler.last_exit(tenant, "SCALPING")
        );
    }

    Ok(())
}
