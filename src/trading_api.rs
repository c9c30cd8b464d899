use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;
use crate::strategy_type::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Bybit,
    Paper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn duration(&self) -> Duration {
        let minutes = match self {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
        };
        Duration::from_secs(minutes * 60)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// unix timestamp (milliseconds)
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => f.write_str("buy"),
            OrderSide::Sell => f.write_str("sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Unfilled,
    PartiallyFilled,
    FullyFilled,
    Canceled,
}

impl OrderStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::Unfilled | OrderStatus::PartiallyFilled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: Decimal,
    /// Required for limit orders.
    pub price: Option<Decimal>,
    pub post_only: bool,
    /// Client-side label identifying the strategy that placed the order.
    /// Carried on the resulting [`Order`] and its fills.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_tag: Option<String>,
}

impl OrderRequest {
    pub fn limit(symbol: impl Into<String>, side: OrderSide, amount: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            amount,
            price: Some(price),
            post_only: true,
            client_tag: None,
        }
    }

    pub fn market(symbol: impl Into<String>, side: OrderSide, amount: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            amount,
            price: None,
            post_only: false,
            client_tag: None,
        }
    }

    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.client_tag = Some(tag.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub executed_amount: Decimal,
    pub average_price: Option<Decimal>,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_tag: Option<String>,
}

impl Order {
    pub fn remaining_amount(&self) -> Decimal {
        self.amount - self.executed_amount
    }
}

/// Price and candle source consumed by strategy run bodies.
#[async_trait]
pub trait MarketData: Send + Sync + 'static {
    async fn last_price(
        &self,
        exchange: Exchange,
        symbol: &str,
        network: Network,
    ) -> Result<Decimal, ExchangeError>;

    /// Most recent `limit` candles, oldest first.
    async fn candles(
        &self,
        tenant: TenantId,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;
}

/// Order placement on behalf of a tenant. The live exchange client and the
/// paper exchange both implement this so strategies never care which one
/// they talk to.
#[async_trait]
pub trait OrderGateway: Send + Sync + 'static {
    async fn place_order(&self, tenant: TenantId, request: OrderRequest)
        -> Result<Order, ExchangeError>;

    async fn cancel_order(
        &self,
        tenant: TenantId,
        symbol: &str,
        order_id: u64,
    ) -> Result<Order, ExchangeError>;

    async fn get_order(
        &self,
        tenant: TenantId,
        symbol: &str,
        order_id: u64,
    ) -> Result<Order, ExchangeError>;

    async fn open_orders(&self, tenant: TenantId, symbol: &str) -> Result<Vec<Order>, ExchangeError>;

    /// Base asset held by the tenant for `symbol`, net of fills. With a
    /// `tag`, only fills of orders carrying that client tag count.
    async fn position(
        &self,
        tenant: TenantId,
        symbol: &str,
        tag: Option<&str>,
    ) -> Result<Decimal, ExchangeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_serde_and_duration() {
        let tf: Timeframe = serde_json::from_str("\"15m\"").unwrap();
        assert_eq!(tf, Timeframe::M15);
        assert_eq!(tf.duration(), Duration::from_secs(900));
        assert_eq!(serde_json::to_string(&Timeframe::H4).unwrap(), "\"4h\"");
    }

    #[test]
    fn open_statuses() {
        assert!(OrderStatus::Unfilled.is_open());
        assert!(OrderStatus::PartiallyFilled.is_open());
        assert!(!OrderStatus::FullyFilled.is_open());
        assert!(!OrderStatus::Canceled.is_open());
    }
}
