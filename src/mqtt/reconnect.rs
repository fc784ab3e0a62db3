use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for a broker link that failed to connect or dropped.
///
/// Delays double from `initial_delay_ms` up to `max_delay_ms`. After
/// `max_attempts` consecutive failures the link gives up and reports
/// `Failed`; `None` retries forever. A successful ConnAck resets the count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// Policy under which the first failure is final.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Whether retry number `attempt` (1-based) may be made.
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempt <= max)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let millis = self
            .initial_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}
