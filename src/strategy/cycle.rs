use crate::config::StrategyStep;
use crate::error::BotError;
use crate::Result;
use std::fmt;

/// Where a pair's strategy currently stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyState {
    /// Flat, waiting for an entry signal
    Initial,
    /// In a position opened under the given strategy key
    Holding(String),
}

impl fmt::Display for StrategyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyState::Initial => write!(f, "INITIAL"),
            StrategyState::Holding(key) => write!(f, "{}", key),
        }
    }
}

/// Round-robin cursor over the configured strategy steps
#[derive(Debug, Clone)]
pub struct StrategyCycle {
    steps: Vec<StrategyStep>,
    cursor: usize,
}

impl StrategyCycle {
    pub fn new(steps: Vec<StrategyStep>) -> Result<Self> {
        if steps.is_empty() {
            return Err(BotError::Config("at least one strategy step is required".into()));
        }
        Ok(Self { steps, cursor: 0 })
    }

    /// Return the step at the cursor and move to the next one, wrapping around
    pub fn advance(&mut self) -> &StrategyStep {
        let index = self.cursor;
        self.cursor = (self.cursor + 1) % self.steps.len();
        &self.steps[index]
    }

    /// Back to the first step
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.steps.iter().any(|step| step.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn step(key: &str) -> StrategyStep {
        StrategyStep {
            key: key.to_string(),
            target_fraction: Decimal::ZERO,
            sell_fraction: Decimal::ZERO,
        }
    }

    #[test]
    fn test_cycle_wraps_in_order() {
        let mut cycle = StrategyCycle::new(vec![step("A"), step("B"), step("C")]).unwrap();
        let keys: Vec<String> = (0..5).map(|_| cycle.advance().key.clone()).collect();
        assert_eq!(keys, vec!["A", "B", "C", "A", "B"]);
    }

    #[test]
    fn test_rewind_restarts_at_first_step() {
        let mut cycle = StrategyCycle::new(vec![step("A"), step("B")]).unwrap();
        cycle.advance();
        cycle.rewind();
        assert_eq!(cycle.advance().key, "A");
    }

    #[test]
    fn test_empty_cycle_rejected() {
        assert!(StrategyCycle::new(Vec::new()).is_err());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(StrategyState::Initial.to_string(), "INITIAL");
        assert_eq!(StrategyState::Holding("FIRST_STEP".into()).to_string(), "FIRST_STEP");
    }
}
