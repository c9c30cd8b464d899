use std::sync::Arc;

use async_trait::async_trait;

use super::{act_on_signal, drive, recent_closes, Periodic, Signal, StrategyDeps};
use crate::error::StrategyError;
use crate::indicators::bollinger;
use crate::instance::{StopSignal, Strategy};
use crate::settings::{BollingerSettings, SettingsStore};
use crate::strategy_type::{StrategyType, TenantId};

/// Mean reversion: buy a close under the lower band, sell one over the
/// upper band.
pub struct BollingerBandsStrategy {
    deps: StrategyDeps,
    settings: Arc<dyn SettingsStore<BollingerSettings>>,
}

impl BollingerBandsStrategy {
    pub fn new(deps: StrategyDeps, settings: Arc<dyn SettingsStore<BollingerSettings>>) -> Self {
        Self { deps, settings }
    }
}

pub fn signal(settings: &BollingerSettings, closes: &[f64]) -> Result<Signal, StrategyError> {
    let bands = bollinger(closes, settings.period, settings.width).ok_or(
        StrategyError::InsufficientData {
            needed: settings.period,
            got: closes.len(),
        },
    )?;
    let last = closes[closes.len() - 1];

    Ok(if last < bands.lower {
        Signal::Buy
    } else if last > bands.upper {
        Signal::Sell
    } else {
        Signal::Hold
    })
}

#[async_trait]
impl Periodic for BollingerBandsStrategy {
    type Settings = BollingerSettings;
    type State = ();

    fn store(&self) -> &Arc<dyn SettingsStore<BollingerSettings>> {
        &self.settings
    }

    async fn tick(
        &self,
        tenant: TenantId,
        settings: &BollingerSettings,
        _state: &mut (),
    ) -> Result<(), StrategyError> {
        let closes = recent_closes(&self.deps, tenant, &settings.market, settings.period).await?;
        let signal = signal(settings, &closes)?;
        let tag = self.strategy_type().as_str();
        act_on_signal(&self.deps, tenant, tag, &settings.market, signal).await?;
        Ok(())
    }
}

#[async_trait]
impl Strategy for BollingerBandsStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::BollingerBands
    }

    async fn run(&self, tenant: TenantId, stop: StopSignal) -> Result<(), StrategyError> {
        drive(self, tenant, &stop).await
    }
}
