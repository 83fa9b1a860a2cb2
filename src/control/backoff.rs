use crate::config::ControlSettings;
use std::time::Duration;

/// Capped exponential reconnect delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): `min(base * 2^(attempt-1), max_delay)`
    ///
    /// `None` once the attempts are used up.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let delay = 2u32
            .checked_pow(attempt - 1)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }

    /// Every delay in order
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..).map_while(|attempt| self.delay(attempt))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::from(&ControlSettings::default())
    }
}

impl From<&ControlSettings> for BackoffPolicy {
    fn from(settings: &ControlSettings) -> Self {
        Self {
            base: Duration::from_secs(settings.backoff_base_secs),
            max_delay: Duration::from_secs(settings.backoff_max_secs),
            max_attempts: settings.max_reconnect_attempts,
        }
    }
}
