use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

pub const ENV_ABORT_GRACE_MS: &str = "STRATEGY_ABORT_GRACE_MS";
pub const ENV_MAX_PER_TENANT: &str = "STRATEGY_MAX_PER_TENANT";
pub const ENV_MAX_TOTAL: &str = "STRATEGY_MAX_TOTAL";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Delay between raising the stop flag and aborting the task. Zero aborts
    /// right after the flag is raised.
    #[serde(with = "duration_millis")]
    pub abort_grace: Duration,
    /// Concurrent strategies allowed per tenant. `None` is unbounded.
    pub max_tasks_per_tenant: Option<usize>,
    /// Concurrent strategies allowed process-wide. `None` is unbounded.
    pub max_tasks_total: Option<usize>,
}

impl SchedulerConfig {
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder {
            config: SchedulerConfig::default(),
        }
    }

    /// Read overrides from `STRATEGY_*` environment variables on top of the
    /// defaults. Unset variables keep the default.
    pub fn from_env() -> Result<Self, SchedulerError> {
        let mut config = SchedulerConfig::default();
        if let Some(ms) = read_env::<u64>(ENV_ABORT_GRACE_MS)? {
            config.abort_grace = Duration::from_millis(ms);
        }
        if let Some(limit) = read_env::<usize>(ENV_MAX_PER_TENANT)? {
            config.max_tasks_per_tenant = Some(limit);
        }
        if let Some(limit) = read_env::<usize>(ENV_MAX_TOTAL)? {
            config.max_tasks_total = Some(limit);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_tasks_per_tenant == Some(0) || self.max_tasks_total == Some(0) {
            return Err(SchedulerError::InvalidConfig(
                "task limits must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

fn read_env<T: FromStr>(name: &str) -> Result<Option<T>, SchedulerError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| SchedulerError::InvalidConfig(format!("{}={:?} is not valid", name, raw))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(SchedulerError::InvalidConfig(format!(
            "{} is not valid unicode",
            name
        ))),
    }
}

pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    pub fn abort_grace(mut self, grace: Duration) -> Self {
        self.config.abort_grace = grace;
        self
    }

    pub fn max_tasks_per_tenant(mut self, limit: usize) -> Self {
        self.config.max_tasks_per_tenant = Some(limit);
        self
    }

    pub fn max_tasks_total(mut self, limit: usize) -> Self {
        self.config.max_tasks_total = Some(limit);
        self
    }

    pub fn build(self) -> Result<SchedulerConfig, SchedulerError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
