//! Built-in strategy bodies.
//!
//! Every body is a periodic loop: reload the tenant's settings, read the
//! market, act, then sleep for `poll_interval` or until stopped.

pub mod bollinger_bands;
pub mod fibonacci_grid;
pub mod ma_crossover;
pub mod rsi_ema;
pub mod scalping;

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::prelude::*;

use crate::error::StrategyError;
use crate::instance::{StopSignal, Strategy};
use crate::paper::PaperExchange;
use crate::settings::{
    BollingerSettings, FibonacciGridSettings, InMemorySettingsStore, MaCrossoverSettings,
    MarketSettings, RsiEmaSettings, ScalpingSettings, SettingsStore, StrategySettings,
};
use crate::strategy_type::TenantId;
use crate::trading_api::{MarketData, Order, OrderGateway, OrderRequest, OrderSide};

pub use bollinger_bands::BollingerBandsStrategy;
pub use fibonacci_grid::FibonacciGridStrategy;
pub use ma_crossover::MaCrossoverStrategy;
pub use rsi_ema::RsiEmaStrategy;
pub use scalping::ScalpingStrategy;

/// Exchange-facing collaborators shared by every body.
#[derive(Clone)]
pub struct StrategyDeps {
    pub market: Arc<dyn MarketData>,
    pub orders: Arc<dyn OrderGateway>,
}

impl StrategyDeps {
    pub fn new(market: Arc<dyn MarketData>, orders: Arc<dyn OrderGateway>) -> Self {
        Self { market, orders }
    }

    pub fn paper(exchange: &PaperExchange) -> Self {
        Self {
            market: Arc::new(exchange.clone()),
            orders: Arc::new(exchange.clone()),
        }
    }
}

/// One settings store per strategy type.
#[derive(Clone)]
pub struct SettingsStores {
    pub scalping: Arc<dyn SettingsStore<ScalpingSettings>>,
    pub fibonacci_grid: Arc<dyn SettingsStore<FibonacciGridSettings>>,
    pub rsi_ema: Arc<dyn SettingsStore<RsiEmaSettings>>,
    pub ma_crossover: Arc<dyn SettingsStore<MaCrossoverSettings>>,
    pub bollinger_bands: Arc<dyn SettingsStore<BollingerSettings>>,
}

impl SettingsStores {
    pub fn in_memory() -> Self {
        Self {
            scalping: Arc::new(InMemorySettingsStore::<ScalpingSettings>::new()),
            fibonacci_grid: Arc::new(InMemorySettingsStore::<FibonacciGridSettings>::new()),
            rsi_ema: Arc::new(InMemorySettingsStore::<RsiEmaSettings>::new()),
            ma_crossover: Arc::new(InMemorySettingsStore::<MaCrossoverSettings>::new()),
            bollinger_bands: Arc::new(InMemorySettingsStore::<BollingerSettings>::new()),
        }
    }
}

/// The five built-in bodies wired to shared collaborators, in menu order.
pub fn builtin_strategies(deps: &StrategyDeps, settings: &SettingsStores) -> Vec<Arc<dyn Strategy>> {
    vec![
        Arc::new(ScalpingStrategy::new(deps.clone(), settings.scalping.clone())),
        Arc::new(FibonacciGridStrategy::new(
            deps.clone(),
            settings.fibonacci_grid.clone(),
        )),
        Arc::new(RsiEmaStrategy::new(deps.clone(), settings.rsi_ema.clone())),
        Arc::new(MaCrossoverStrategy::new(
            deps.clone(),
            settings.ma_crossover.clone(),
        )),
        Arc::new(BollingerBandsStrategy::new(
            deps.clone(),
            settings.bollinger_bands.clone(),
        )),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

/// One iteration of a periodic body.
#[async_trait]
pub(crate) trait Periodic: Send + Sync + 'static {
    type Settings: StrategySettings;
    type State: Default + Send;

    fn store(&self) -> &Arc<dyn SettingsStore<Self::Settings>>;

    async fn tick(
        &self,
        tenant: TenantId,
        settings: &Self::Settings,
        state: &mut Self::State,
    ) -> Result<(), StrategyError>;

    /// Runs once after the stop flag is observed. Not reached when the task
    /// is aborted first.
    async fn wind_down(
        &self,
        _tenant: TenantId,
        _settings: &Self::Settings,
        _state: &mut Self::State,
    ) -> Result<(), StrategyError> {
        Ok(())
    }
}

/// Drive `body` until `stop` is raised or it fails.
///
/// Exchange errors are retried on the next iteration until
/// `max_consecutive_errors` is reached. Settings errors end the run at once.
pub(crate) async fn drive<P: Periodic>(
    body: &P,
    tenant: TenantId,
    stop: &StopSignal,
) -> Result<(), StrategyError> {
    let mut state = P::State::default();
    let mut consecutive_errors = 0u32;
    let mut last_settings = None;

    while !stop.is_stopped() {
        let settings = body.store().get_or_create(tenant).await?;
        settings.validate()?;
        let market = settings.market();

        match body.tick(tenant, &settings, &mut state).await {
            Ok(()) => consecutive_errors = 0,
            Err(StrategyError::InsufficientData { needed, got }) => {
                log::debug!(
                    "tenant {}: waiting for data on {} ({}/{})",
                    tenant,
                    market.symbol,
                    got,
                    needed
                );
            }
            Err(err @ (StrategyError::MarketData(_) | StrategyError::Order(_))) => {
                consecutive_errors += 1;
                log::warn!(
                    "tenant {}: iteration failed ({}/{}): {}",
                    tenant,
                    consecutive_errors,
                    market.max_consecutive_errors,
                    err
                );
                if consecutive_errors >= market.max_consecutive_errors {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }

        let interval = market.poll_interval();
        last_settings = Some(settings);
        if !stop.sleep(interval).await {
            break;
        }
    }

    if let Some(settings) = last_settings {
        if let Err(err) = body.wind_down(tenant, &settings, &mut state).await {
            log::warn!("tenant {}: cleanup after stop failed: {}", tenant, err);
        }
    }
    Ok(())
}

/// Turn a signal into at most one market order tagged `tag`: buy one lot
/// when flat, sell the whole position when holding. Only inventory bought
/// under `tag` counts as held.
pub(crate) async fn act_on_signal(
    deps: &StrategyDeps,
    tenant: TenantId,
    tag: &str,
    market: &MarketSettings,
    signal: Signal,
) -> Result<Option<Order>, StrategyError> {
    if signal == Signal::Hold {
        return Ok(None);
    }
    let position = deps
        .orders
        .position(tenant, &market.symbol, Some(tag))
        .await
        .map_err(StrategyError::Order)?;

    let request = match signal {
        Signal::Buy if position < market.order_amount => {
            OrderRequest::market(&market.symbol, OrderSide::Buy, market.order_amount)
        }
        Signal::Sell if position > Decimal::ZERO => {
            OrderRequest::market(&market.symbol, OrderSide::Sell, position)
        }
        _ => return Ok(None),
    }
    .tagged(tag);

    log::info!(
        "tenant {} ({}): {:?} signal, {} {} {}",
        tenant,
        tag,
        signal,
        request.side,
        request.amount,
        market.symbol
    );
    let order = deps
        .orders
        .place_order(tenant, request)
        .await
        .map_err(StrategyError::Order)?;
    Ok(Some(order))
}

/// Closing prices of the most recent `needed` candles.
pub(crate) async fn recent_closes(
    deps: &StrategyDeps,
    tenant: TenantId,
    market: &MarketSettings,
    needed: usize,
) -> Result<Vec<f64>, StrategyError> {
    let candles = deps
        .market
        .candles(tenant, &market.symbol, market.timeframe, needed)
        .await
        .map_err(StrategyError::MarketData)?;
    if candles.len() < needed {
        return Err(StrategyError::InsufficientData {
            needed,
            got: candles.len(),
        });
    }
    Ok(crate::indicators::closes(&candles))
}

pub(crate) fn to_price(value: f64) -> Option<Decimal> {
    Decimal::from_f64(value).map(|d| d.round_dp(2))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::strategy_type::StrategyType;

    #[test]
    fn builtins_cover_every_type_in_menu_order() {
        let paper = PaperExchange::default();
        let strategies = builtin_strategies(&StrategyDeps::paper(&paper), &SettingsStores::in_memory());
        let types: Vec<StrategyType> = strategies.iter().map(|s| s.strategy_type()).collect();
        assert_eq!(types, StrategyType::ALL.to_vec());
    }

    #[tokio::test]
    async fn signals_respect_position() {
        let paper = PaperExchange::default();
        paper.push_price("BTCUSDT", dec("100")).await;
        let deps = StrategyDeps::paper(&paper);
        let market = fast_market();

        let act = |signal| act_on_signal(&deps, 1, "RSI_EMA", &market, signal);

        assert!(act(Signal::Sell).await.unwrap().is_none());
        assert!(act(Signal::Buy).await.unwrap().is_some());
        // already holding one lot
        assert!(act(Signal::Buy).await.unwrap().is_none());
        assert!(act(Signal::Hold).await.unwrap().is_none());

        let sold = act(Signal::Sell).await.unwrap().unwrap();
        assert_eq!(sold.amount, dec("1"));
        assert_eq!(sold.client_tag.as_deref(), Some("RSI_EMA"));
        assert_eq!(paper.position(1, "BTCUSDT", None).await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn sell_signal_leaves_other_strategies_inventory() {
        let paper = PaperExchange::default();
        paper.push_price("BTCUSDT", dec("100")).await;
        let deps = StrategyDeps::paper(&paper);
        let market = fast_market();

        act_on_signal(&deps, 1, "RSI_EMA", &market, Signal::Buy).await.unwrap();
        act_on_signal(&deps, 1, "MA_CROSSOVER", &market, Signal::Buy).await.unwrap();
        assert_eq!(paper.position(1, "BTCUSDT", None).await.unwrap(), dec("2"));

        let sold = act_on_signal(&deps, 1, "MA_CROSSOVER", &market, Signal::Sell)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sold.amount, dec("1"));
        assert_eq!(paper.position(1, "BTCUSDT", Some("RSI_EMA")).await.unwrap(), dec("1"));
        assert_eq!(
            paper.position(1, "BTCUSDT", Some("MA_CROSSOVER")).await.unwrap(),
            Decimal::ZERO
        );
        // nothing left to sell under this tag
        assert!(act_on_signal(&deps, 1, "MA_CROSSOVER", &market, Signal::Sell)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn recent_closes_reports_missing_candles() {
        let paper = PaperExchange::default();
        paper.push_prices("BTCUSDT", [dec("1"), dec("2")]).await;
        let deps = StrategyDeps::paper(&paper);

        let err = recent_closes(&deps, 1, &fast_market(), 5).await.unwrap_err();
        assert!(matches!(
            err,
            StrategyError::InsufficientData { needed: 5, got: 2 }
        ));
        assert_eq!(
            recent_closes(&deps, 1, &fast_market(), 2).await.unwrap(),
            vec![1.0, 2.0]
        );
    }
}
