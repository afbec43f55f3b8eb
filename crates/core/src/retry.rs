use std::time::Duration;

use rand::Rng;

/// Exponential backoff shared by every dependency we (re)connect to.
///
/// `max_attempts` counts every try, the first one included, so a policy with
/// `max_attempts = 7` sleeps at most six times: `initial_delay * 2^i` for
/// `i = 0..=5`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Option<Duration>,
    pub jitter: bool,
}

impl BackoffPolicy {
    pub fn store_connect() -> Self {
        Self {
            max_attempts: 7,
            initial_delay: Duration::from_secs(1),
            max_delay: None,
            jitter: false,
        }
    }

    pub fn immediate(max_attempts: u32) -> Self {
        Self { max_attempts, initial_delay: Duration::ZERO, max_delay: None, jitter: false }
    }

    /// Delay to wait after failed attempt `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let mut delay = self.initial_delay.saturating_mul(1_u32 << exponent);
        if let Some(cap) = self.max_delay {
            delay = delay.min(cap);
        }

        if self.jitter && !delay.is_zero() {
            let spread = delay.as_millis().min(u128::from(u64::MAX)) as u64 / 2;
            let extra = rand::thread_rng().gen_range(0..=spread);
            delay = delay.saturating_add(Duration::from_millis(extra));
        }

        delay
    }

    /// Whether another attempt is allowed after `attempt` (zero based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }
}
