// Exponential backoff with jitter, shared by the cloud session loop and
// the Home Assistant client reconnect loop.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 60s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retries: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnection attempt number `attempt` (0-based).
    ///
    /// `initial * 2^attempt`, capped at `max_delay`, then spread by a random
    /// factor in `[0.75, 1.25]` so a fleet of bridges does not reconnect in
    /// lockstep after a cloud outage.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.min(31);
        let base = self.initial_delay.as_secs_f64() * f64::from(1_u32 << exp);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jitter_factor = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_secs_f64((capped * jitter_factor).max(0.0))
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_retries.is_none_or(|max| attempt < max)
    }
}
