use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, warn};

use crate::backend::RemoteResult;
use crate::config::AppConfig;
use crate::status::StatusChannel;

const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempt budget. Zero behaves like one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Upper bound (exclusive) of the random delay added to every backoff.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_retries: config.retry_max_attempts,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            jitter: Duration::from_millis(config.retry_jitter_ms),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Deterministic part of the delay after failed attempt `attempt` (0-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(MAX_BACKOFF_EXPONENT);
        self.initial_delay.saturating_mul(1 << exponent)
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Runs remote operations, absorbing transient capacity failures with
/// exponential backoff and reporting everything else once.
#[derive(Clone)]
pub struct RemoteCaller {
    policy: RetryPolicy,
    status: Arc<dyn StatusChannel>,
    sleeper: Arc<dyn Sleeper>,
    jitter_rng: Arc<Mutex<StdRng>>,
}

impl RemoteCaller {
    pub fn new(policy: RetryPolicy, status: Arc<dyn StatusChannel>) -> Self {
        Self {
            policy,
            status,
            sleeper: Arc::new(ThreadSleeper),
            jitter_rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.jitter_rng = Arc::new(Mutex::new(rng));
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn status(&self) -> &Arc<dyn StatusChannel> {
        &self.status
    }

    /// Returns the operation's value, or `None` after a permanent failure or
    /// once the attempt budget is spent. Exactly one fatal notice is emitted
    /// on every `None` path.
    pub fn call<T, F>(&self, label: &str, mut operation: F) -> Option<T>
    where
        F: FnMut() -> RemoteResult<T>,
    {
        let attempts = self.policy.attempts();
        let mut attempt = 0;
        loop {
            match operation() {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(target: "retry", label, attempt, "remote call recovered");
                    }
                    return Some(value);
                }
                Err(err) if !err.is_transient() => {
                    warn!(target: "retry", label, error = %err, "remote call failed permanently");
                    self.status.fatal(format!("{label} failed: {err}"));
                    return None;
                }
                Err(err) if attempt + 1 < attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        target: "retry",
                        label,
                        attempt,
                        error = %err,
                        "remote capacity exhausted; retrying after {:?}",
                        delay
                    );
                    self.sleeper.sleep(delay);
                    self.status.warning(format!(
                        "{label}: request limit reached, retrying in {:.1}s (attempt {} of {attempts})",
                        delay.as_secs_f64(),
                        attempt + 2,
                    ));
                    attempt += 1;
                }
                Err(err) => {
                    warn!(target: "retry", label, attempts, error = %err, "retry budget exhausted");
                    self.status.fatal(format!(
                        "{label} failed: request limit still exceeded after {attempts} attempt(s)"
                    ));
                    return None;
                }
            }
        }
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.policy.base_delay(attempt);
        let jitter = if self.policy.jitter.is_zero() {
            Duration::ZERO
        } else {
            let fraction: f64 = self.jitter_rng.lock().gen();
            self.policy.jitter.mul_f64(fraction)
        };
        base.saturating_add(jitter)
    }
}
