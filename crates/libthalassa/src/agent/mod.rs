pub mod acp;
mod bridge;
mod session;
mod transcript;

pub use bridge::{AgentBridge, BridgeConfig, ReconnectConfig};
pub use session::{PendingReply, SessionHandle};
pub use transcript::prune_transcripts;

use std::time::Duration;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let capped = attempt.min(31);
        let mult = 1u64 << capped.saturating_sub(1);
        let millis = self.base_delay.as_millis() as u64;
        let raw = millis.saturating_mul(mult);
        Duration::from_millis(raw.min(self.max_delay.as_millis() as u64))
    }

    /// Upper bound on the time spent backing off before giving up.
    pub fn total_backoff(&self) -> Duration {
        (1..=self.max_attempts).map(|n| self.backoff_delay(n)).sum()
    }
}
