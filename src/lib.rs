pub mod config;
pub mod error;
pub mod indicators;
pub mod instance;
pub mod order_manager;
pub mod paper;
pub mod registry;
pub mod scheduler;
pub mod settings;
pub mod strategies;
pub mod strategy_type;
pub mod task_manager;
pub mod trading_api;

pub use config::SchedulerConfig;
pub use error::{ExchangeError, SchedulerError, StrategyError};
pub use instance::{StopSignal, Strategy, StrategyInstance};
pub use registry::StrategyRegistry;
pub use scheduler::StrategyScheduler;
pub use strategy_type::{StrategyKey, StrategyType, TenantId};
pub use task_manager::{StartOutcome, StopOutcome, TaskExit, TaskLifecycleManager};
