use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Outcome of a single attempt.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Success(T),
    /// Transient failure, try again after backing off.
    Retry(E),
    /// Terminal failure, give up now.
    Stop(E),
}

/// Exponential backoff with jitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_interval: Duration::from_secs(30),
        }
    }
}

/// Progress of one retry loop.
#[derive(Clone, Copy, Debug)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_interval: Duration,
}

impl RetryState {
    fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            max_attempts: policy.max_attempts.max(1),
            base_interval: policy.base_interval,
        }
    }

    fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// `base * 2^(attempt-1)`, saturating.
    pub fn backoff(&self) -> Duration {
        let exp = self.attempt.saturating_sub(1).min(31);
        self.base_interval.saturating_mul(1u32 << exp)
    }

    /// Uniform in `[0, base)`.
    fn jitter(&self) -> Duration {
        let base = u64::try_from(self.base_interval.as_nanos()).unwrap_or(u64::MAX);
        if base == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..base))
    }

    fn delay(&self) -> Duration {
        self.backoff().saturating_add(self.jitter())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_interval: Duration) -> Self {
        Self {
            max_attempts,
            base_interval,
        }
    }

    /// Run `action` until it succeeds, stops, or runs out of attempts.
    ///
    /// A stop returns its cause at once. Running out of attempts returns
    /// the last transient cause. No sleep follows the final attempt.
    pub async fn execute<I, T, E, F, Fut>(&self, input: I, mut action: F) -> Result<T, E>
    where
        I: Clone,
        E: Display,
        F: FnMut(I) -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
    {
        let mut state = RetryState::new(self);
        loop {
            state.attempt += 1;
            match action(input.clone()).await {
                Attempt::Success(value) => return Ok(value),
                Attempt::Stop(cause) => {
                    debug!(attempt = state.attempt, error = %cause, "terminal failure, not retrying");
                    return Err(cause);
                }
                Attempt::Retry(cause) => {
                    if state.exhausted() {
                        return Err(cause);
                    }
                    let delay = state.delay();
                    warn!(
                        attempt = state.attempt,
                        max_attempts = state.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %cause,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
