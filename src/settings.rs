use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::StrategyError;
use crate::strategy_type::TenantId;
use crate::trading_api::{Exchange, Network, Timeframe};

/// Per-tenant parameter storage for one strategy type.
#[async_trait]
pub trait SettingsStore<S>: Send + Sync + 'static {
    /// Load the tenant's settings, creating defaults on first access.
    async fn get_or_create(&self, tenant: TenantId) -> Result<S, StrategyError>;

    async fn save(&self, tenant: TenantId, settings: &S) -> Result<(), StrategyError>;
}

pub trait StrategySettings:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn market(&self) -> &MarketSettings;

    fn validate(&self) -> Result<(), StrategyError> {
        self.market().validate()
    }
}

/// Market and cadence parameters every strategy shares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketSettings {
    pub exchange: Exchange,
    pub network: Network,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub order_amount: Decimal,
    /// Delay between two iterations of the run loop. The stop flag is only
    /// checked between iterations, so a stop is noticed within one poll
    /// interval plus the duration of the iteration in flight, exchange
    /// latency included.
    pub poll_interval_ms: u64,
    /// Consecutive exchange errors tolerated before the run ends.
    pub max_consecutive_errors: u32,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            exchange: Exchange::Bybit,
            network: Network::Mainnet,
            symbol: "BTCUSDT".to_owned(),
            timeframe: Timeframe::M5,
            order_amount: Decimal::new(1, 3),
            poll_interval_ms: 5_000,
            max_consecutive_errors: 5,
        }
    }
}

impl MarketSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.symbol.is_empty() {
            return Err(StrategyError::InvalidSettings("symbol is empty".to_owned()));
        }
        if self.order_amount <= Decimal::ZERO {
            return Err(StrategyError::InvalidSettings(format!(
                "order amount must be positive, got {}",
                self.order_amount
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(StrategyError::InvalidSettings(
                "poll interval must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalpingSettings {
    pub market: MarketSettings,
    /// Quote distance from the last price, in basis points.
    pub spread_bps: u32,
    /// Maximum base amount held before only sells are quoted.
    pub max_position: Decimal,
}

impl Default for ScalpingSettings {
    fn default() -> Self {
        Self {
            market: MarketSettings::default(),
            spread_bps: 10,
            max_position: Decimal::new(5, 3),
        }
    }
}

impl StrategySettings for ScalpingSettings {
    fn market(&self) -> &MarketSettings {
        &self.market
    }

    fn validate(&self) -> Result<(), StrategyError> {
        self.market.validate()?;
        if self.spread_bps == 0 || self.spread_bps >= 10_000 {
            return Err(StrategyError::InvalidSettings(format!(
                "spread_bps must be in 1..10000, got {}",
                self.spread_bps
            )));
        }
        if self.max_position < self.market.order_amount {
            return Err(StrategyError::InvalidSettings(
                "max_position is smaller than one order".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FibonacciGridSettings {
    pub market: MarketSettings,
    /// Candles used to find the swing high and low.
    pub lookback: usize,
    /// Resting orders kept on each side of the price.
    pub levels_per_side: usize,
}

impl Default for FibonacciGridSettings {
    fn default() -> Self {
        Self {
            market: MarketSettings {
                timeframe: Timeframe::H1,
                ..MarketSettings::default()
            },
            lookback: 48,
            levels_per_side: 2,
        }
    }
}

impl StrategySettings for FibonacciGridSettings {
    fn market(&self) -> &MarketSettings {
        &self.market
    }

    fn validate(&self) -> Result<(), StrategyError> {
        self.market.validate()?;
        if self.lookback < 2 || self.levels_per_side == 0 {
            return Err(StrategyError::InvalidSettings(
                "lookback must be >= 2 and levels_per_side >= 1".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RsiEmaSettings {
    pub market: MarketSettings,
    pub rsi_period: usize,
    pub ema_period: usize,
    pub oversold: f64,
    pub overbought: f64,
}

impl Default for RsiEmaSettings {
    fn default() -> Self {
        Self {
            market: MarketSettings::default(),
            rsi_period: 14,
            ema_period: 50,
            oversold: 30.0,
            overbought: 70.0,
        }
    }
}

impl StrategySettings for RsiEmaSettings {
    fn market(&self) -> &MarketSettings {
        &self.market
    }

    fn validate(&self) -> Result<(), StrategyError> {
        self.market.validate()?;
        if self.rsi_period == 0 || self.ema_period == 0 {
            return Err(StrategyError::InvalidSettings("periods must be positive".to_owned()));
        }
        if !(0.0..=100.0).contains(&self.oversold)
            || !(0.0..=100.0).contains(&self.overbought)
            || self.oversold >= self.overbought
        {
            return Err(StrategyError::InvalidSettings(format!(
                "need 0 <= oversold ({}) < overbought ({}) <= 100",
                self.oversold, self.overbought
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaCrossoverSettings {
    pub market: MarketSettings,
    pub fast_period: usize,
    pub slow_period: usize,
}

impl Default for MaCrossoverSettings {
    fn default() -> Self {
        Self {
            market: MarketSettings::default(),
            fast_period: 9,
            slow_period: 21,
        }
    }
}

impl StrategySettings for MaCrossoverSettings {
    fn market(&self) -> &MarketSettings {
        &self.market
    }

    fn validate(&self) -> Result<(), StrategyError> {
        self.market.validate()?;
        if self.fast_period == 0 || self.fast_period >= self.slow_period {
            return Err(StrategyError::InvalidSettings(format!(
                "need 0 < fast_period ({}) < slow_period ({})",
                self.fast_period, self.slow_period
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BollingerSettings {
    pub market: MarketSettings,
    pub period: usize,
    pub width: f64,
}

impl Default for BollingerSettings {
    fn default() -> Self {
        Self {
            market: MarketSettings::default(),
            period: 20,
            width: 2.0,
        }
    }
}

impl StrategySettings for BollingerSettings {
    fn market(&self) -> &MarketSettings {
        &self.market
    }

    fn validate(&self) -> Result<(), StrategyError> {
        self.market.validate()?;
        if self.period < 2 || self.width <= 0.0 {
            return Err(StrategyError::InvalidSettings(
                "period must be >= 2 and width positive".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Settings kept in process memory. Lost on restart.
pub struct InMemorySettingsStore<S> {
    defaults: S,
    entries: Mutex<HashMap<TenantId, S>>,
}

impl<S: StrategySettings> Default for InMemorySettingsStore<S> {
    fn default() -> Self {
        Self::with_defaults(S::default())
    }
}

impl<S: StrategySettings> InMemorySettingsStore<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// New tenants start from `defaults` instead of `S::default()`.
    pub fn with_defaults(defaults: S) -> Self {
        Self {
            defaults,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Dump every tenant's settings, keyed by tenant id.
    pub async fn to_json(&self) -> Result<serde_json::Value, StrategyError> {
        let entries = self.entries.lock().await;
        let map: HashMap<String, &S> = entries.iter().map(|(k, v)| (k.to_string(), v)).collect();
        serde_json::to_value(map).map_err(|e| StrategyError::Settings(e.to_string()))
    }

    /// Replace the tenant's settings from a JSON document. Missing fields
    /// take their defaults.
    pub async fn load_json(&self, tenant: TenantId, raw: &str) -> Result<S, StrategyError> {
        let settings: S =
            serde_json::from_str(raw).map_err(|e| StrategyError::Settings(e.to_string()))?;
        settings.validate()?;
        self.entries.lock().await.insert(tenant, settings.clone());
        Ok(settings)
    }
}

#[async_trait]
impl<S: StrategySettings> SettingsStore<S> for InMemorySettingsStore<S> {
    async fn get_or_create(&self, tenant: TenantId) -> Result<S, StrategyError> {
        let mut entries = self.entries.lock().await;
        Ok(entries
            .entry(tenant)
            .or_insert_with(|| self.defaults.clone())
            .clone())
    }

    async fn save(&self, tenant: TenantId, settings: &S) -> Result<(), StrategyError> {
        settings.validate()?;
        self.entries.lock().await.insert(tenant, settings.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ScalpingSettings::default().validate().is_ok());
        assert!(FibonacciGridSettings::default().validate().is_ok());
        assert!(RsiEmaSettings::default().validate().is_ok());
        assert!(MaCrossoverSettings::default().validate().is_ok());
        assert!(BollingerSettings::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_periods() {
        let settings = MaCrossoverSettings {
            fast_period: 30,
            slow_period: 10,
            ..MaCrossoverSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(StrategyError::InvalidSettings(_))
        ));
    }

    #[tokio::test]
    async fn get_or_create_returns_defaults_once() {
        let store = InMemorySettingsStore::<RsiEmaSettings>::new();
        let mut settings = store.get_or_create(1).await.unwrap();
        assert_eq!(settings, RsiEmaSettings::default());

        settings.oversold = 25.0;
        store.save(1, &settings).await.unwrap();
        assert_eq!(store.get_or_create(1).await.unwrap().oversold, 25.0);
        // other tenants are independent
        assert_eq!(store.get_or_create(2).await.unwrap().oversold, 30.0);
    }

    #[tokio::test]
    async fn save_rejects_invalid_settings() {
        let store = InMemorySettingsStore::<ScalpingSettings>::new();
        let mut settings = store.get_or_create(1).await.unwrap();
        settings.spread_bps = 0;
        assert!(store.save(1, &settings).await.is_err());
        assert_eq!(store.get_or_create(1).await.unwrap().spread_bps, 10);
    }

    #[tokio::test]
    async fn json_round_trip_with_partial_document() {
        let store = InMemorySettingsStore::<BollingerSettings>::new();
        let loaded = store
            .load_json(7, r#"{"period": 10, "market": {"symbol": "ETHUSDT"}}"#)
            .await
            .unwrap();
        assert_eq!(loaded.period, 10);
        assert_eq!(loaded.width, 2.0);
        assert_eq!(loaded.market.symbol, "ETHUSDT");
        assert_eq!(loaded.market.poll_interval_ms, 5_000);

        let dump = store.to_json().await.unwrap();
        assert_eq!(dump["7"]["market"]["symbol"], "ETHUSDT");
    }
}
