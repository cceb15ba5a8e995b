use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the reconnect delay evolves between attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackoffMode {
    /// Same delay for every attempt.
    Fixed,
    /// Delay doubles per attempt up to the configured cap.
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    mode: BackoffMode,
}

impl ReconnectPolicy {
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            mode: BackoffMode::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            mode: BackoffMode::Exponential,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn mode(&self) -> BackoffMode {
        self.mode
    }

    /// Whether another automatic attempt fits in the budget.
    pub fn allows(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_attempts
    }

    /// Delay before the 1-based `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.mode {
            BackoffMode::Fixed => Duration::from_millis(self.base_delay_ms),
            BackoffMode::Exponential => {
                let shift = attempt.saturating_sub(1).min(20);
                let multiplier = 1_u64 << shift;
                let calculated = self.base_delay_ms.saturating_mul(multiplier);
                Duration::from_millis(calculated.min(self.max_delay_ms))
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(5, 3_000)
    }
}
