//! Reconnect backoff policy.
//!
//! One-shot REST calls never retry. Only the push channel of a live session
//! re-establishes itself, and this policy decides how long to wait between
//! attempts and when to give up.

use std::time::Duration;

/// Exponential backoff without jitter: `base_delay * 2^(attempt - 1)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnects scheduled after consecutive failures before the session
    /// gives up.
    pub max_attempts: u32,
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

    /// Computes the delay before the given reconnect attempt.
    ///
    /// `attempt` is 1-based; `0` is treated as `1`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Returns `true` when `scheduled` reconnects have already been spent, so
    /// the next failure is terminal.
    pub fn is_exhausted(&self, scheduled: u32) -> bool {
        scheduled >= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            base_delay: Self::DEFAULT_BASE_DELAY,
        }
    }
}
