//! Exponential backoff for retried batch submissions.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            multiplier: 2.0,
            max_ms: 30_000,
        }
    }
}

/// Delay sequence for one retried operation: base, base*m, base*m^2, ... capped at max.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current_ms: u64,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            config: config.clone(),
            current_ms: config.base_ms.min(config.max_ms),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_ms;
        self.current_ms = ((self.current_ms as f64 * self.config.multiplier) as u64)
            .max(self.current_ms)
            .min(self.config.max_ms);
        Duration::from_millis(delay)
    }
}
