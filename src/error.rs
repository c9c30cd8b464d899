use crate::strategy_type::{StrategyType, TenantId};

/// Errors surfaced synchronously by the scheduling surface.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// No implementation is registered for the requested identifier. This is
    /// a deployment/build mismatch, never retried.
    #[error("unknown strategy type: {0}")]
    UnknownStrategyType(String),
    #[error("strategy type {0} registered more than once")]
    DuplicateStrategyType(StrategyType),
    #[error("task limit reached for tenant {tenant}: {running} running, limit {limit}")]
    TaskLimitReached {
        tenant: TenantId,
        running: usize,
        limit: usize,
    },
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),
    /// `start` was called outside a tokio runtime, or the runtime is shutting
    /// down. Nothing was registered.
    #[error("no tokio runtime available to run strategy tasks")]
    NoRuntime,
}

/// Errors raised inside a strategy run body. They never leave the task that
/// produced them.
#[derive(thiserror::Error, Debug)]
pub enum StrategyError {
    #[error("settings error: {0}")]
    Settings(String),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("market data error: {0}")]
    MarketData(#[source] ExchangeError),
    #[error("order error: {0}")]
    Order(#[source] ExchangeError),
    #[error("not enough candles: needed {needed}, got {got}")]
    InsufficientData { needed: usize, got: usize },
}

/// Errors returned by market data and order gateway implementations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("unknown symbol {symbol}")]
    UnknownSymbol { symbol: String },
    #[error("unknown order id {order_id}")]
    UnknownOrder { order_id: u64 },
    #[error("price not provided for limit order")]
    MissingPrice,
    #[error("injected failure: {0}")]
    Injected(String),
}
