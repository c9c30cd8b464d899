use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::error::StrategyError;
use crate::strategy_type::{StrategyKey, StrategyType, TenantId};

/// Cooperative stop flag shared between a run body and whoever stops it.
/// Cloning yields a handle to the same flag.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`Self::stop`] has been called.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    /// Sleep for `duration` unless stopped first. Returns `true` when the full
    /// duration elapsed, `false` when the sleep was cut short by a stop.
    pub async fn sleep(&self, duration: Duration) -> bool {
        select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// A runnable strategy implementation. One value serves every tenant: the
/// tenant and its stop signal are handed to [`Strategy::run`] per execution.
///
/// `run` performs the strategy's read-signal/decide/act loop and must check
/// `stop` at every loop boundary. Returning (with `Ok` or `Err`) ends the
/// task and frees the tenant's slot.
#[async_trait]
pub trait Strategy: Send + Sync + 'static {
    fn strategy_type(&self) -> StrategyType;

    async fn run(&self, tenant: TenantId, stop: StopSignal) -> Result<(), StrategyError>;
}

/// One strategy for one tenant.
pub struct StrategyInstance {
    key: StrategyKey,
    strategy_type: StrategyType,
    strategy: Arc<dyn Strategy>,
    stop: StopSignal,
    running: AtomicBool,
}

impl StrategyInstance {
    pub fn new(tenant_id: TenantId, strategy: Arc<dyn Strategy>) -> Self {
        let strategy_type = strategy.strategy_type();
        Self {
            key: StrategyKey::new(tenant_id, strategy_type.as_str()),
            strategy_type,
            strategy,
            stop: StopSignal::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &StrategyKey {
        &self.key
    }

    pub fn tenant_id(&self) -> TenantId {
        self.key.tenant_id
    }

    pub fn strategy_name(&self) -> &str {
        &self.key.strategy_name
    }

    pub fn strategy_type(&self) -> StrategyType {
        self.strategy_type
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Ask the run body to exit at its next poll point. Safe to call any
    /// number of times, from any task.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Whether the run body is currently executing, as seen by the instance
    /// itself.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Execute the run body. The running flag is cleared on every exit path,
    /// including a panic in the body or the future being dropped by an abort.
    pub async fn run(&self) -> Result<(), StrategyError> {
        let _flag = RunningFlag::raise(&self.running);
        if self.stop.is_stopped() {
            log::debug!("{} stopped before its body started", self.key);
            return Ok(());
        }
        self.strategy
            .run(self.key.tenant_id, self.stop.clone())
            .await
    }
}

impl fmt::Debug for StrategyInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyInstance")
            .field("key", &self.key)
            .field("stopped", &self.stop.is_stopped())
            .field("running", &self.is_running())
            .finish()
    }
}

struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
