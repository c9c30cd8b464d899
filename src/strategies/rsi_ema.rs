use std::sync::Arc;

use async_trait::async_trait;

use super::{act_on_signal, drive, recent_closes, Periodic, Signal, StrategyDeps};
use crate::error::StrategyError;
use crate::indicators::{ema, rsi};
use crate::instance::{StopSignal, Strategy};
use crate::settings::{RsiEmaSettings, SettingsStore};
use crate::strategy_type::{StrategyType, TenantId};

/// Buys oversold dips while the price holds above its EMA. Sells when the
/// RSI is overbought or the price loses the EMA.
pub struct RsiEmaStrategy {
    deps: StrategyDeps,
    settings: Arc<dyn SettingsStore<RsiEmaSettings>>,
}

impl RsiEmaStrategy {
    pub fn new(deps: StrategyDeps, settings: Arc<dyn SettingsStore<RsiEmaSettings>>) -> Self {
        Self { deps, settings }
    }
}

pub fn required_candles(settings: &RsiEmaSettings) -> usize {
    (settings.rsi_period + 1).max(settings.ema_period)
}

pub fn signal(settings: &RsiEmaSettings, closes: &[f64]) -> Result<Signal, StrategyError> {
    let insufficient = || StrategyError::InsufficientData {
        needed: required_candles(settings),
        got: closes.len(),
    };
    let rsi = rsi(closes, settings.rsi_period).ok_or_else(insufficient)?;
    let ema = ema(closes, settings.ema_period).ok_or_else(insufficient)?;
    let last = *closes.last().ok_or_else(insufficient)?;

    Ok(if rsi < settings.oversold && last > ema {
        Signal::Buy
    } else if rsi > settings.overbought || last < ema {
        Signal::Sell
    } else {
        Signal::Hold
    })
}

#[async_trait]
impl Periodic for RsiEmaStrategy {
    type Settings = RsiEmaSettings;
    type State = ();

    fn store(&self) -> &Arc<dyn SettingsStore<RsiEmaSettings>> {
        &self.settings
    }

    async fn tick(
        &self,
        tenant: TenantId,
        settings: &RsiEmaSettings,
        _state: &mut (),
    ) -> Result<(), StrategyError> {
        // extra history lets the Wilder smoothing settle
        let needed = required_candles(settings) * 3;
        let closes = match recent_closes(&self.deps, tenant, &settings.market, needed).await {
            Err(StrategyError::InsufficientData { .. }) => {
                recent_closes(&self.deps, tenant, &settings.market, required_candles(settings))
                    .await?
            }
            other => other?,
        };
        let signal = signal(settings, &closes)?;
        let tag = self.strategy_type().as_str();
        act_on_signal(&self.deps, tenant, tag, &settings.market, signal).await?;
        Ok(())
    }
}

#[async_trait]
impl Strategy for RsiEmaStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::RsiEma
    }

    async fn run(&self, tenant: TenantId, stop: StopSignal) -> Result<(), StrategyError> {
        drive(self, tenant, &stop).await
    }
}
