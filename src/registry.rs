use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SchedulerError;
use crate::instance::Strategy;
use crate::strategies::{builtin_strategies, SettingsStores, StrategyDeps};
use crate::strategy_type::StrategyType;

/// A registered strategy implementation together with its menu label.
#[derive(Clone)]
pub struct StrategyTypeDescriptor {
    pub strategy_type: StrategyType,
    pub label: &'static str,
    pub implementation: Arc<dyn Strategy>,
}

/// Immutable lookup table from [`StrategyType`] to its implementation.
/// Built once at startup and shared read-only.
pub struct StrategyRegistry {
    descriptors: HashMap<StrategyType, StrategyTypeDescriptor>,
}

impl StrategyRegistry {
    /// Build the table. Registering the same type twice is a configuration
    /// error and must abort startup.
    pub fn new(
        implementations: impl IntoIterator<Item = Arc<dyn Strategy>>,
    ) -> Result<Self, SchedulerError> {
        let mut descriptors = HashMap::new();
        for implementation in implementations {
            let strategy_type = implementation.strategy_type();
            let descriptor = StrategyTypeDescriptor {
                strategy_type,
                label: strategy_type.label(),
                implementation,
            };
            if descriptors.insert(strategy_type, descriptor).is_some() {
                return Err(SchedulerError::DuplicateStrategyType(strategy_type));
            }
        }

        for missing in StrategyType::ALL
            .iter()
            .filter(|t| !descriptors.contains_key(t))
        {
            log::warn!("no implementation registered for strategy type {}", missing);
        }

        Ok(Self { descriptors })
    }

    /// Registry of the built-in bodies sharing `deps` and `settings`.
    pub fn with_defaults(
        deps: &StrategyDeps,
        settings: &SettingsStores,
    ) -> Result<Self, SchedulerError> {
        Self::new(builtin_strategies(deps, settings))
    }

    pub fn get(&self, strategy_type: StrategyType) -> Result<Arc<dyn Strategy>, SchedulerError> {
        self.descriptors
            .get(&strategy_type)
            .map(|d| d.implementation.clone())
            .ok_or_else(|| SchedulerError::UnknownStrategyType(strategy_type.to_string()))
    }

    /// Resolve a user-supplied name such as `"SCALPING"`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Strategy>, SchedulerError> {
        self.get(name.parse()?)
    }

    /// Registered types and labels, in menu order.
    pub fn descriptors(&self) -> Vec<(StrategyType, &'static str)> {
        StrategyType::ALL
            .into_iter()
            .filter_map(|t| self.descriptors.get(&t))
            .map(|d| (d.strategy_type, d.label))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
