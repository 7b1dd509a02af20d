//! Bounded client reconnection schedule.
//!
//! The server never reconnects anybody; this is the policy clients are
//! expected to follow after a transport drop, and the one `/info` advertises.

use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    #[serde(rename = "initialDelayMs", serialize_with = "as_millis")]
    pub initial_delay: Duration,
    #[serde(rename = "maxDelayMs", serialize_with = "as_millis")]
    pub max_delay: Duration,
    pub factor: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` once the
    /// attempts are exhausted and the client should give up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let multiplier = self.factor.saturating_pow(attempt - 1);
        let delay = self.initial_delay.saturating_mul(multiplier);
        Some(delay.min(self.max_delay))
    }

    /// Full schedule, mostly useful for display and tests.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_attempts)
            .filter_map(|attempt| self.delay_for(attempt))
            .collect()
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}
