use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::{drive, Periodic, StrategyDeps};
use crate::error::StrategyError;
use crate::instance::{StopSignal, Strategy};
use crate::order_manager::{cancel_all, reconcile_orders, WantedOrder};
use crate::settings::{ScalpingSettings, SettingsStore};
use crate::strategy_type::{StrategyType, TenantId};
use crate::trading_api::OrderSide;

/// Quotes a post-only bid and ask around the last price and re-quotes
/// every iteration.
pub struct ScalpingStrategy {
    deps: StrategyDeps,
    settings: Arc<dyn SettingsStore<ScalpingSettings>>,
}

impl ScalpingStrategy {
    pub fn new(deps: StrategyDeps, settings: Arc<dyn SettingsStore<ScalpingSettings>>) -> Self {
        Self { deps, settings }
    }
}

/// Orders the book should hold for the given last price and position.
pub fn quotes(settings: &ScalpingSettings, last: Decimal, position: Decimal) -> Vec<WantedOrder> {
    let lot = settings.market.order_amount;
    let offset = last * Decimal::from(settings.spread_bps) / Decimal::from(10_000);
    let bid = (last - offset).round_dp(2);
    let ask = (last + offset).round_dp(2);

    let can_buy = position + lot <= settings.max_position;
    let can_sell = position >= lot;

    let mut wanted = Vec::new();
    if can_buy {
        wanted.push(WantedOrder::new(OrderSide::Buy, lot, bid));
    }
    if can_sell {
        wanted.push(WantedOrder::new(OrderSide::Sell, lot, ask));
    }
    wanted
}

#[async_trait]
impl Periodic for ScalpingStrategy {
    type Settings = ScalpingSettings;
    type State = ();

    fn store(&self) -> &Arc<dyn SettingsStore<ScalpingSettings>> {
        &self.settings
    }

    async fn tick(
        &self,
        tenant: TenantId,
        settings: &ScalpingSettings,
        _state: &mut (),
    ) -> Result<(), StrategyError> {
        let market = &settings.market;
        let tag = self.strategy_type().as_str();
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

        let wanted = quotes(settings, last, position);
        log::debug!(
            "tenant {}: last {}, position {}, wanted {:?}",
            tenant,
            last,
            position,
            wanted
        );
        reconcile_orders(self.deps.orders.clone(), tenant, &market.symbol, tag, wanted)
            .await
            .map_err(StrategyError::Order)?;
        Ok(())
    }

    async fn wind_down(
        &self,
        tenant: TenantId,
        settings: &ScalpingSettings,
        _state: &mut (),
    ) -> Result<(), StrategyError> {
        let canceled = cancel_all(
            self.deps.orders.clone(),
            tenant,
            &settings.market.symbol,
            self.strategy_type().as_str(),
        )
        .await
        .map_err(StrategyError::Order)?;
        log::info!("tenant {}: withdrew {} quotes", tenant, canceled);
        Ok(())
    }
}

#[async_trait]
impl Strategy for ScalpingStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Scalping
    }

    async fn run(&self, tenant: TenantId, stop: StopSignal) -> Result<(), StrategyError> {
        drive(self, tenant, &stop).await
    }
}
