use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use rust_decimal::prelude::*;
use tokio::sync::Mutex;

use crate::error::ExchangeError;
use crate::strategy_type::TenantId;
use crate::trading_api::{
    Candle, Exchange, MarketData, Network, Order, OrderGateway, OrderRequest, OrderSide,
    OrderStatus, OrderType, Timeframe,
};

#[derive(Clone, Debug)]
pub struct PaperConfig {
    /// Simulated per-request latency (round trip).
    pub request_latency: Duration,
    /// Candles kept per symbol. Older ones are dropped.
    pub history: usize,
    /// Spacing between the open times of generated candles.
    pub candle_interval: Duration,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            request_latency: Duration::from_millis(0),
            history: 500,
            candle_interval: Timeframe::M1.duration(),
        }
    }
}

impl PaperConfig {
    pub fn builder() -> PaperConfigBuilder {
        PaperConfigBuilder {
            config: PaperConfig::default(),
        }
    }
}

pub struct PaperConfigBuilder {
    config: PaperConfig,
}

impl PaperConfigBuilder {
    pub fn request_latency(mut self, latency: Duration) -> Self {
        self.config.request_latency = latency;
        self
    }

    pub fn history(mut self, candles: usize) -> Self {
        self.config.history = candles.max(1);
        self
    }

    pub fn candle_interval(mut self, interval: Duration) -> Self {
        self.config.candle_interval = interval;
        self
    }

    pub fn build(self) -> PaperConfig {
        self.config
    }
}

/// In-process exchange driven by a scripted price path. Limit orders rest
/// until a pushed price crosses them; market orders fill at the last price.
/// Prices are shared by every tenant, orders and positions are per tenant.
#[derive(Clone)]
pub struct PaperExchange {
    inner: Arc<PaperInner>,
}

struct PaperInner {
    state: Mutex<PaperState>,
    config: PaperConfig,
}

struct SymbolFeed {
    candles: VecDeque<Candle>,
    next_open_time: i64,
}

#[derive(Default)]
struct PaperState {
    feeds: HashMap<String, SymbolFeed>,
    next_order_id: u64,
    orders: HashMap<u64, (TenantId, Order)>,
    /// Keyed by tenant, symbol and the client tag of the filled orders.
    positions: HashMap<(TenantId, String, Option<String>), Decimal>,
    failing: HashMap<TenantId, String>,
    fills: usize,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new(PaperConfig::default())
    }
}

impl PaperExchange {
    pub fn new(config: PaperConfig) -> Self {
        Self {
            inner: Arc::new(PaperInner {
                state: Mutex::new(PaperState {
                    next_order_id: 1,
                    ..PaperState::default()
                }),
                config,
            }),
        }
    }

    /// Replace the candle history of `symbol`. The last close becomes the
    /// current price.
    pub async fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        let interval = self.inner.config.candle_interval.as_millis() as i64;
        let mut state = self.inner.state.lock().await;
        let next_open_time = candles.last().map_or(0, |c| c.open_time + interval);
        let mut candles: VecDeque<Candle> = candles.into();
        while candles.len() > self.inner.config.history {
            candles.pop_front();
        }
        state.feeds.insert(
            symbol.to_owned(),
            SymbolFeed {
                candles,
                next_open_time,
            },
        );
    }

    /// Append one flat candle at `price` and fill every resting order it
    /// crosses.
    pub async fn push_price(&self, symbol: &str, price: Decimal) {
        let interval = self.inner.config.candle_interval.as_millis() as i64;
        let history = self.inner.config.history;
        let mut state = self.inner.state.lock().await;
        let feed = state
            .feeds
            .entry(symbol.to_owned())
            .or_insert_with(|| SymbolFeed {
                candles: VecDeque::new(),
                next_open_time: 0,
            });
        let open = feed.candles.back().map_or(price, |c| c.close);
        feed.candles.push_back(Candle {
            open_time: feed.next_open_time,
            open,
            high: open.max(price),
            low: open.min(price),
            close: price,
            volume: Decimal::ONE,
        });
        feed.next_open_time += interval;
        while feed.candles.len() > history {
            feed.candles.pop_front();
        }
        state.match_resting(symbol, price);
    }

    /// Push a whole path in order.
    pub async fn push_prices(&self, symbol: &str, prices: impl IntoIterator<Item = Decimal>) {
        for price in prices {
            self.push_price(symbol, price).await;
        }
    }

    /// Every call made on behalf of `tenant` fails until [`heal_tenant`]
    /// is called.
    ///
    /// [`heal_tenant`]: PaperExchange::heal_tenant
    pub async fn fail_tenant(&self, tenant: TenantId, reason: impl Into<String>) {
        self.inner
            .state
            .lock()
            .await
            .failing
            .insert(tenant, reason.into());
    }

    pub async fn heal_tenant(&self, tenant: TenantId) {
        self.inner.state.lock().await.failing.remove(&tenant);
    }

    /// Orders filled since creation, all tenants.
    pub async fn fill_count(&self) -> usize {
        self.inner.state.lock().await.fills
    }

    pub async fn order_count(&self, tenant: TenantId) -> usize {
        self.inner
            .state
            .lock()
            .await
            .orders
            .values()
            .filter(|(owner, _)| *owner == tenant)
            .count()
    }

    async fn simulate_latency(&self) {
        if self.inner.config.request_latency.is_zero() {
            return;
        }
        tokio::time::sleep(self.inner.config.request_latency).await;
    }
}

impl PaperState {
    fn check_tenant(&self, tenant: TenantId) -> Result<(), ExchangeError> {
        match self.failing.get(&tenant) {
            Some(reason) => Err(ExchangeError::Injected(reason.clone())),
            None => Ok(()),
        }
    }

    fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.feeds
            .get(symbol)
            .and_then(|feed| feed.candles.back())
            .map(|c| c.close)
            .ok_or_else(|| ExchangeError::UnknownSymbol {
                symbol: symbol.to_owned(),
            })
    }

    fn match_resting(&mut self, symbol: &str, price: Decimal) {
        let crossed: Vec<(u64, Decimal)> = self
            .orders
            .values()
            .filter(|(_, o)| o.symbol == symbol && o.status.is_open())
            .filter_map(|(_, o)| {
                let limit = o.price?;
                let hit = match o.side {
                    OrderSide::Buy => price <= limit,
                    OrderSide::Sell => price >= limit,
                };
                hit.then_some((o.order_id, limit))
            })
            .collect();

        for (order_id, fill_price) in crossed {
            self.fill(order_id, fill_price);
        }
    }

    fn fill(&mut self, order_id: u64, fill_price: Decimal) {
        let Some((tenant, order)) = self.orders.get_mut(&order_id) else {
            return;
        };
        let qty = order.remaining_amount();
        order.executed_amount = order.amount;
        order.average_price = Some(fill_price);
        order.status = OrderStatus::FullyFilled;

        let signed = match order.side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };
        let key = (*tenant, order.symbol.clone(), order.client_tag.clone());
        debug!(
            "paper fill: tenant={} order={} tag={:?} {} {} @ {}",
            key.0, order_id, key.2, order.side, qty, fill_price
        );
        *self.positions.entry(key).or_insert(Decimal::ZERO) += signed;
        self.fills += 1;
    }

    fn owned_mut(&mut self, tenant: TenantId, order_id: u64) -> Result<&mut Order, ExchangeError> {
        match self.orders.get_mut(&order_id) {
            Some((owner, order)) if *owner == tenant => Ok(order),
            _ => Err(ExchangeError::UnknownOrder { order_id }),
        }
    }
}

#[async_trait]
impl MarketData for PaperExchange {
    async fn last_price(
        &self,
        _exchange: Exchange,
        symbol: &str,
        _network: Network,
    ) -> Result<Decimal, ExchangeError> {
        self.simulate_latency().await;
        self.inner.state.lock().await.last_price(symbol)
    }

    async fn candles(
        &self,
        tenant: TenantId,
        symbol: &str,
        _timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.simulate_latency().await;
        let state = self.inner.state.lock().await;
        state.check_tenant(tenant)?;
        let feed = state
            .feeds
            .get(symbol)
            .ok_or_else(|| ExchangeError::UnknownSymbol {
                symbol: symbol.to_owned(),
            })?;
        let skip = feed.candles.len().saturating_sub(limit);
        Ok(feed.candles.iter().skip(skip).cloned().collect())
    }
}

#[async_trait]
impl OrderGateway for PaperExchange {
    async fn place_order(
        &self,
        tenant: TenantId,
        request: OrderRequest,
    ) -> Result<Order, ExchangeError> {
        self.simulate_latency().await;
        let mut state = self.inner.state.lock().await;
        state.check_tenant(tenant)?;
        let last = state.last_price(&request.symbol)?;

        let price = match request.order_type {
            OrderType::Limit => Some(request.price.ok_or(ExchangeError::MissingPrice)?),
            OrderType::Market => None,
        };
        let order_id = state.next_order_id;
        state.next_order_id += 1;
        trace!(
            "paper order: tenant={} id={} {:?} {} {} @ {:?}",
            tenant,
            order_id,
            request.order_type,
            request.side,
            request.amount,
            price
        );

        let order = Order {
            order_id,
            symbol: request.symbol,
            side: request.side,
            order_type: request.order_type,
            price,
            amount: request.amount,
            executed_amount: Decimal::ZERO,
            average_price: None,
            status: OrderStatus::Unfilled,
            client_tag: request.client_tag,
        };
        state.orders.insert(order_id, (tenant, order));

        match price {
            None => state.fill(order_id, last),
            Some(limit) => {
                let marketable = match request.side {
                    OrderSide::Buy => last <= limit,
                    OrderSide::Sell => last >= limit,
                };
                // post-only orders that would take are left resting
                if marketable && !request.post_only {
                    state.fill(order_id, last);
                }
            }
        }

        state
            .orders
            .get(&order_id)
            .map(|(_, o)| o.clone())
            .ok_or(ExchangeError::UnknownOrder { order_id })
    }

    async fn cancel_order(
        &self,
        tenant: TenantId,
        _symbol: &str,
        order_id: u64,
    ) -> Result<Order, ExchangeError> {
        self.simulate_latency().await;
        let mut state = self.inner.state.lock().await;
        state.check_tenant(tenant)?;
        let order = state.owned_mut(tenant, order_id)?;
        if order.status.is_open() {
            order.status = OrderStatus::Canceled;
        }
        Ok(order.clone())
    }

    async fn get_order(
        &self,
        tenant: TenantId,
        _symbol: &str,
        order_id: u64,
    ) -> Result<Order, ExchangeError> {
        self.simulate_latency().await;
        let mut state = self.inner.state.lock().await;
        state.check_tenant(tenant)?;
        Ok(state.owned_mut(tenant, order_id)?.clone())
    }

    async fn open_orders(&self, tenant: TenantId, symbol: &str) -> Result<Vec<Order>, ExchangeError> {
        self.simulate_latency().await;
        let state = self.inner.state.lock().await;
        state.check_tenant(tenant)?;
        let mut open: Vec<Order> = state
            .orders
            .values()
            .filter(|(owner, o)| *owner == tenant && o.symbol == symbol && o.status.is_open())
            .map(|(_, o)| o.clone())
            .collect();
        open.sort_by_key(|o| o.order_id);
        Ok(open)
    }

    async fn position(
        &self,
        tenant: TenantId,
        symbol: &str,
        tag: Option<&str>,
    ) -> Result<Decimal, ExchangeError> {
        self.simulate_latency().await;
        let state = self.inner.state.lock().await;
        state.check_tenant(tenant)?;
        Ok(state
            .positions
            .iter()
            .filter(|((owner, s, order_tag), _)| {
                *owner == tenant && s == symbol && (tag.is_none() || order_tag.as_deref() == tag)
            })
            .map(|(_, amount)| *amount)
            .sum())
    }
}

/// Deterministic sine-shaped price path around `base`, rounded to cents.
pub fn sine_path(base: Decimal, amplitude: Decimal, period: usize, len: usize) -> Vec<Decimal> {
    let base_f = base.to_f64().unwrap_or_default();
    let amp_f = amplitude.to_f64().unwrap_or_default();
    let period = period.max(1) as f64;
    (0..len)
        .filter_map(|i| {
            let value = base_f + amp_f * (2.0 * PI * i as f64 / period).sin();
            Decimal::from_f64(value).map(|d| d.round_dp(2))
        })
        .collect()
}
