use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::prelude::*;

use super::{drive, to_price, Periodic, StrategyDeps};
use crate::error::StrategyError;
use crate::indicators::fibonacci_levels;
use crate::instance::{StopSignal, Strategy};
use crate::order_manager::{cancel_all, reconcile_orders, WantedOrder};
use crate::settings::{FibonacciGridSettings, SettingsStore};
use crate::strategy_type::{StrategyType, TenantId};
use crate::trading_api::{Candle, OrderSide};

/// Rests limit orders on the Fibonacci retracement levels of the recent
/// swing: buys below the price, sells above it while inventory lasts.
pub struct FibonacciGridStrategy {
    deps: StrategyDeps,
    settings: Arc<dyn SettingsStore<FibonacciGridSettings>>,
}

impl FibonacciGridStrategy {
    pub fn new(
        deps: StrategyDeps,
        settings: Arc<dyn SettingsStore<FibonacciGridSettings>>,
    ) -> Self {
        Self { deps, settings }
    }
}

/// Grid for the swing spanned by `candles`, around `last`.
pub fn grid(
    settings: &FibonacciGridSettings,
    candles: &[Candle],
    last: Decimal,
    position: Decimal,
) -> Vec<WantedOrder> {
    let high = candles.iter().map(|c| c.high).max();
    let low = candles.iter().map(|c| c.low).min();
    let (Some(high), Some(low)) = (high, low) else {
        return Vec::new();
    };
    if high <= low {
        return Vec::new();
    }
    let (Some(high), Some(low)) = (high.to_f64(), low.to_f64()) else {
        return Vec::new();
    };

    let lot = settings.market.order_amount;
    let levels: Vec<Decimal> = fibonacci_levels(high, low)
        .into_iter()
        .filter_map(to_price)
        .collect();

    // levels run highest first
    let buys = levels
        .iter()
        .filter(|p| **p < last)
        .take(settings.levels_per_side)
        .map(|p| WantedOrder::new(OrderSide::Buy, lot, *p));

    let sellable = if lot.is_zero() {
        0
    } else {
        (position / lot).floor().to_usize().unwrap_or(0)
    };
    let sells = levels
        .iter()
        .rev()
        .filter(|p| **p > last)
        .take(settings.levels_per_side.min(sellable))
        .map(|p| WantedOrder::new(OrderSide::Sell, lot, *p));

    buys.chain(sells).collect()
}

#[async_trait]
impl Periodic for FibonacciGridStrategy {
    type Settings = FibonacciGridSettings;
    type State = ();

    fn store(&self) -> &Arc<dyn SettingsStore<FibonacciGridSettings>> {
        &self.settings
    }

    async fn tick(
        &self,
        tenant: TenantId,
        settings: &FibonacciGridSettings,
        _state: &mut (),
    ) -> Result<(), StrategyError> {
        let market = &settings.market;
        let tag = self.strategy_type().as_str();
        let candles = self
            .deps
            .market
            .candles(tenant, &market.symbol, market.timeframe, settings.lookback)
            .await
            .map_err(StrategyError::MarketData)?;
        if candles.len() < settings.lookback {
            return Err(StrategyError::InsufficientData {
                needed: settings.lookback,
                got: candles.len(),
            });
        }
        let last = self
            .deps
            .market
            .last_price(market.exchange, &market.symbol, market.network)
            .await
            .map_err(StrategyError::MarketData)?;
        let position = self
            .deps
            .orders
            .position(tenant, &market.symbol, Some(tag))
            .await
            .map_err(StrategyError::Order)?;

        let wanted = grid(settings, &candles, last, position);
        reconcile_orders(self.deps.orders.clone(), tenant, &market.symbol, tag, wanted)
            .await
            .map_err(StrategyError::Order)?;
        Ok(())
    }

    async fn wind_down(
        &self,
        tenant: TenantId,
        settings: &FibonacciGridSettings,
        _state: &mut (),
    ) -> Result<(), StrategyError> {
        cancel_all(
            self.deps.orders.clone(),
            tenant,
            &settings.market.symbol,
            self.strategy_type().as_str(),
        )
        .await
        .map_err(StrategyError::Order)?;
        Ok(())
    }
}

#[async_trait]
impl Strategy for FibonacciGridStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::FibonacciGrid
    }

    async fn run(&self, tenant: TenantId, stop: StopSignal) -> Result<(), StrategyError> {
        drive(self, tenant, &stop).await
    }
}
