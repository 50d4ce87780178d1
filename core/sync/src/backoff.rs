//! Exponential backoff for triggered sync passes.

use std::time::Duration;

/// Debounce delay policy for triggered passes.
///
/// With no failures the delay is the base delay. After `n` successive
/// unclassified failures it is `base * min(2^n, max_multiplier)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerBackoff {
    /// Delay used when the last pass succeeded.
    pub base_delay: Duration,
    /// Cap for the exponential multiplier.
    pub max_multiplier: u32,
}

impl TriggerBackoff {
    /// Create a backoff policy with the given base delay.
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_multiplier: 60,
        }
    }

    /// Set the multiplier cap.
    pub fn with_max_multiplier(mut self, max_multiplier: u32) -> Self {
        self.max_multiplier = max_multiplier.max(1);
        self
    }

    /// Multiplier applied after `failures` successive failures.
    pub fn multiplier(&self, failures: u32) -> u32 {
        if failures == 0 {
            return 1;
        }
        let exponential = 1u64.checked_shl(failures).unwrap_or(u64::MAX);
        exponential.min(u64::from(self.max_multiplier)) as u32
    }

    /// Debounce delay after `failures` successive failures.
    ///
    /// Saturates at `Duration::MAX`.
    pub fn delay_for_failures(&self, failures: u32) -> Duration {
        self.base_delay
            .checked_mul(self.multiplier(failures))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for TriggerBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}
