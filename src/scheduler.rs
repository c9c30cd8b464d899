use std::sync::Arc;

use crate::error::SchedulerError;
use crate::instance::StrategyInstance;
use crate::registry::StrategyRegistry;
use crate::strategy_type::{StrategyKey, StrategyType, TenantId};
use crate::task_manager::{StartOutcome, StopOutcome, TaskExit, TaskLifecycleManager};

/// Entry point for the rest of the bot: start, stop and query strategies by
/// tenant and strategy name.
///
/// Names are matched case-insensitively (`"scalping"`, `"RSI-EMA"`), and
/// every accepted spelling maps to the same canonical key.
#[derive(Clone)]
pub struct StrategyScheduler {
    registry: Arc<StrategyRegistry>,
    tasks: Arc<TaskLifecycleManager>,
}

impl StrategyScheduler {
    pub fn new(registry: Arc<StrategyRegistry>, tasks: Arc<TaskLifecycleManager>) -> Self {
        Self { registry, tasks }
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn tasks(&self) -> &TaskLifecycleManager {
        &self.tasks
    }

    /// Start `name` for `tenant`. A second start while the first is still
    /// registered is a no-op returning [`StartOutcome::AlreadyRunning`].
    pub fn start_strategy(
        &self,
        tenant: TenantId,
        name: &str,
    ) -> Result<StartOutcome, SchedulerError> {
        let strategy = self.registry.resolve(name)?;
        let instance = StrategyInstance::new(tenant, strategy);
        self.tasks.start(instance)
    }

    /// Request a stop and return immediately. The body may still be winding
    /// down; poll [`is_strategy_active`] to observe the end.
    ///
    /// [`is_strategy_active`]: StrategyScheduler::is_strategy_active
    pub fn stop_strategy(&self, tenant: TenantId, name: &str) -> Result<StopOutcome, SchedulerError> {
        let key = self.key(tenant, name)?;
        Ok(self.tasks.stop_key(&key))
    }

    /// Unknown names are never active.
    pub fn is_strategy_active(&self, tenant: TenantId, name: &str) -> bool {
        match self.key(tenant, name) {
            Ok(key) => self.tasks.is_running_key(&key),
            Err(_) => false,
        }
    }

    /// Strategies currently registered for `tenant`, in menu order.
    pub fn active_strategies(&self, tenant: TenantId) -> Vec<StrategyType> {
        let running = self.tasks.running_for_tenant(tenant);
        StrategyType::ALL
            .into_iter()
            .filter(|t| running.iter().any(|key| key.strategy_name == t.as_str()))
            .collect()
    }

    pub fn stop_all(&self, tenant: TenantId) -> usize {
        self.tasks.stop_tenant(tenant)
    }

    pub fn last_exit(&self, tenant: TenantId, name: &str) -> Option<TaskExit> {
        let key = self.key(tenant, name).ok()?;
        self.tasks.last_exit(&key)
    }

    pub fn available_strategies(&self) -> Vec<(StrategyType, &'static str)> {
        self.registry.descriptors()
    }

    pub fn shutdown(&self) -> usize {
        self.tasks.shutdown()
    }

    fn key(&self, tenant: TenantId, name: &str) -> Result<StrategyKey, SchedulerError> {
        let strategy_type: StrategyType = name.parse()?;
        // only registered types can ever have been started
        self.registry.get(strategy_type)?;
        Ok(StrategyKey::new(tenant, strategy_type.as_str()))
    }
}
