use std::sync::Arc;

use async_trait::async_trait;

use super::{act_on_signal, drive, recent_closes, Periodic, Signal, StrategyDeps};
use crate::error::StrategyError;
use crate::indicators::{sma_cross, Cross};
use crate::instance::{StopSignal, Strategy};
use crate::settings::{MaCrossoverSettings, SettingsStore};
use crate::strategy_type::{StrategyType, TenantId};

/// Trades the fast/slow SMA crossover on the last closed candle.
pub struct MaCrossoverStrategy {
    deps: StrategyDeps,
    settings: Arc<dyn SettingsStore<MaCrossoverSettings>>,
}

impl MaCrossoverStrategy {
    pub fn new(deps: StrategyDeps, settings: Arc<dyn SettingsStore<MaCrossoverSettings>>) -> Self {
        Self { deps, settings }
    }
}

pub fn signal(settings: &MaCrossoverSettings, closes: &[f64]) -> Result<Signal, StrategyError> {
    let needed = settings.slow_period + 1;
    if closes.len() < needed {
        return Err(StrategyError::InsufficientData {
            needed,
            got: closes.len(),
        });
    }
    Ok(
        match sma_cross(closes, settings.fast_period, settings.slow_period) {
            Some(Cross::Above) => Signal::Buy,
            Some(Cross::Below) => Signal::Sell,
            None => Signal::Hold,
        },
    )
}

#[async_trait]
impl Periodic for MaCrossoverStrategy {
    type Settings = MaCrossoverSettings;
    type State = ();

    fn store(&self) -> &Arc<dyn SettingsStore<MaCrossoverSettings>> {
        &self.settings
    }

    async fn tick(
        &self,
        tenant: TenantId,
        settings: &MaCrossoverSettings,
        _state: &mut (),
    ) -> Result<(), StrategyError> {
        let closes =
            recent_closes(&self.deps, tenant, &settings.market, settings.slow_period + 1).await?;
        let signal = signal(settings, &closes)?;
        let tag = self.strategy_type().as_str();
        act_on_signal(&self.deps, tenant, tag, &settings.market, signal).await?;
        Ok(())
    }
}

#[async_trait]
impl Strategy for MaCrossoverStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::MaCrossover
    }

    async fn run(&self, tenant: TenantId, stop: StopSignal) -> Result<(), StrategyError> {
        drive(self, tenant, &stop).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::paper::PaperExchange;
    use crate::settings::InMemorySettingsStore;
    use crate::strategies::test_support::*;
    use crate::trading_api::OrderGateway;

    fn settings() -> MaCrossoverSettings {
        MaCrossoverSettings {
            market: fast_market(),
            fast_period: 2,
            slow_period: 5,
        }
    }

    #[test]
    fn crossing_up_buys_and_down_sells() {
        let mut up = vec![10.0; 6];
        up.push(20.0);
        assert_eq!(signal(&settings(), &up).unwrap(), Signal::Buy);

        let mut down = vec![10.0; 6];
        down.push(1.0);
        assert_eq!(signal(&settings(), &down).unwrap(), Signal::Sell);

        assert_eq!(signal(&settings(), &[10.0; 6]).unwrap(), Signal::Hold);
    }

    #[test]
    fn needs_one_more_candle_than_slow_period() {
        assert!(matches!(
            signal(&settings(), &[10.0; 5]),
            Err(StrategyError::InsufficientData { needed: 6, got: 5 })
        ));
    }

    #[tokio::test]
    async fn buys_on_crossover_against_paper_exchange() {
        let paper = PaperExchange::default();
        paper.push_prices("BTCUSDT", vec![dec("10"); 6]).await;
        let store = Arc::new(InMemorySettingsStore::with_defaults(settings()));
        let strategy = Arc::new(MaCrossoverStrategy::new(StrategyDeps::paper(&paper), store));
        let stop = StopSignal::new();

        let handle = {
            let strategy = strategy.clone();
            let stop = stop.clone();
            tokio::spawn(async move { strategy.run(1, stop).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        let own = Some("MA_CROSSOVER");
        assert_eq!(paper.position(1, "BTCUSDT", own).await.unwrap(), dec("0"));

        paper.push_price("BTCUSDT", dec("20")).await;
        for _ in 0..400 {
            if paper.position(1, "BTCUSDT", own).await.unwrap() > dec("0") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(paper.position(1, "BTCUSDT", own).await.unwrap(), dec("1"));

        stop.stop();
        handle.await.unwrap().unwrap();
    }
}
