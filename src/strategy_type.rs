use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Chat identifier owning a set of strategies.
pub type TenantId = i64;

/// Unique identity of a schedulable unit. At most one task runs per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrategyKey {
    pub tenant_id: TenantId,
    pub strategy_name: String,
}

impl StrategyKey {
    pub fn new(tenant_id: TenantId, strategy_name: impl Into<String>) -> Self {
        Self {
            tenant_id,
            strategy_name: strategy_name.into(),
        }
    }
}

impl fmt::Display for StrategyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.strategy_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyType {
    Scalping,
    FibonacciGrid,
    RsiEma,
    MaCrossover,
    BollingerBands,
}

impl StrategyType {
    /// Menu order.
    pub const ALL: [StrategyType; 5] = [
        StrategyType::Scalping,
        StrategyType::FibonacciGrid,
        StrategyType::RsiEma,
        StrategyType::MaCrossover,
        StrategyType::BollingerBands,
    ];

    /// Canonical identifier, also used as the strategy name in [`StrategyKey`].
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyType::Scalping => "SCALPING",
            StrategyType::FibonacciGrid => "FIBONACCI_GRID",
            StrategyType::RsiEma => "RSI_EMA",
            StrategyType::MaCrossover => "MA_CROSSOVER",
            StrategyType::BollingerBands => "BOLLINGER_BANDS",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StrategyType::Scalping => "Scalping",
            StrategyType::FibonacciGrid => "Fibonacci grid",
            StrategyType::RsiEma => "RSI + EMA",
            StrategyType::MaCrossover => "Moving average crossover",
            StrategyType::BollingerBands => "Bollinger bands",
        }
    }
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        StrategyType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| SchedulerError::UnknownStrategyType(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_identifiers() {
        for t in StrategyType::ALL {
            assert_eq!(t.as_str().parse::<StrategyType>(), Ok(t));
        }
    }

    #[test]
    fn parsing_is_case_insensitive_and_accepts_dashes() {
        assert_eq!("rsi-ema".parse::<StrategyType>(), Ok(StrategyType::RsiEma));
        assert_eq!(
            " Fibonacci_Grid ".parse::<StrategyType>(),
            Ok(StrategyType::FibonacciGrid)
        );
    }

    #[test]
    fn unknown_identifier_is_rejected() {
        assert_eq!(
            "UNKNOWN".parse::<StrategyType>(),
            Err(SchedulerError::UnknownStrategyType("UNKNOWN".to_owned()))
        );
    }

    #[test]
    fn serde_uses_canonical_identifiers() {
        let json = serde_json::to_string(&StrategyType::MaCrossover).unwrap();
        assert_eq!(json, "\"MA_CROSSOVER\"");
        let back: StrategyType = serde_json::from_str("\"BOLLINGER_BANDS\"").unwrap();
        assert_eq!(back, StrategyType::BollingerBands);
    }

    #[test]
    fn key_display() {
        assert_eq!(StrategyKey::new(7, "SCALPING").to_string(), "7/SCALPING");
    }
}
