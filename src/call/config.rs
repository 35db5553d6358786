//! Controller configuration.

use crate::call::subscription::DebounceUrgency;
use std::time::Duration;

/// Quiescence windows per debounce urgency class.
#[derive(Debug, Clone, Copy)]
pub struct DebounceWindows {
    pub fast: Duration,
    pub medium: Duration,
    pub slow: Duration,
}

impl DebounceWindows {
    pub fn window(&self, urgency: DebounceUrgency) -> Duration {
        match urgency {
            DebounceUrgency::Immediate => Duration::ZERO,
            DebounceUrgency::Fast => self.fast,
            DebounceUrgency::Medium => self.medium,
            DebounceUrgency::Slow => self.slow,
        }
    }
}

impl Default for DebounceWindows {
    fn default() -> Self {
        Self {
            fast: Duration::from_millis(100),
            medium: Duration::from_millis(600),
            slow: Duration::from_millis(1200),
        }
    }
}

/// Configuration for one call handle.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Retry budget shared by join retries and automatic rejoins.
    pub max_reconnect_attempts: u32,
    /// How long to wait for the SFU connection to become ready.
    pub ready_timeout: Duration,
    /// How long to wait for the server's join acknowledgment.
    pub join_ack_timeout: Duration,
    /// First retry delay; doubles per attempt up to `backoff_cap`.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub debounce: DebounceWindows,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            ready_timeout: Duration::from_secs(10),
            join_ack_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(10),
            debounce: DebounceWindows::default(),
        }
    }
}

impl CallConfig {
    /// Delay before retry number `attempt` (1-based), capped exponential.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(1u32 << exponent);
        delay.min(self.backoff_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = CallConfig {
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(4),
            ..Default::default()
        };

        assert_eq!(config.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(4), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(10), Duration::from_secs(4));
        // Large attempt counts must not overflow the shift.
        assert_eq!(config.backoff_delay(u32::MAX), Duration::from_secs(4));
    }
}
