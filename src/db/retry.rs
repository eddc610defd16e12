//! Retry policy with exponential backoff and jitter.
//!
//! The policy is stateless: the attempt counter lives in the caller's loop, so one
//! policy value can be shared across targets and used concurrently.

use crate::config::{
    DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MAX_DELAY_MS,
};
use crate::error::{DbError, DbResult};
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryPolicy {
    /// Total tries, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Randomize each delay into [delay/2, delay]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// One failed try inside a retry loop. Only lives for logging.
#[derive(Debug)]
pub struct RetryAttempt<'a> {
    pub attempt: u32,
    pub delay: Duration,
    pub error: &'a DbError,
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Validate the policy and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry max attempts must be greater than 0".to_string());
        }
        if self.base_delay > self.max_delay {
            return Err(format!(
                "retry base delay ({}ms) cannot exceed max delay ({}ms)",
                self.base_delay.as_millis(),
                self.max_delay.as_millis()
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err("retry multiplier must be a finite number >= 1.0".to_string());
        }
        Ok(())
    }

    /// Whether a failure on `attempt` (1-based) should be retried.
    pub fn should_retry(&self, attempt: u32, error: &DbError) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    /// Exponential delay before the try after `attempt`, without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay to sleep after a failed `attempt`, jittered when enabled, never above the cap.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_backoff(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
    }
}

/// Run `op` under `policy`, sleeping the thread between tries.
///
/// The last error is returned unchanged once the budget is spent or the error is
/// not retryable.
pub fn retry_blocking<T, F>(policy: &RetryPolicy, target: &str, mut op: F) -> DbResult<T>
where
    F: FnMut(u32) -> DbResult<T>,
{
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(error) if policy.should_retry(attempt, &error) => {
                let delay = policy.next_delay(attempt);
                log_retry(target, policy, &RetryAttempt { attempt, delay, error: &error });
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(error) => {
                log_give_up(target, attempt, &error);
                return Err(error);
            }
        }
    }
}

/// Run `op` under `policy`, suspending the task between tries.
pub async fn retry_async<T, F, Fut>(policy: &RetryPolicy, target: &str, mut op: F) -> DbResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if policy.should_retry(attempt, &error) => {
                let delay = policy.next_delay(attempt);
                log_retry(target, policy, &RetryAttempt { attempt, delay, error: &error });
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                log_give_up(target, attempt, &error);
                return Err(error);
            }
        }
    }
}

/// Like [`retry_async`], but every try shares one time budget.
///
/// `op` receives the attempt number and the time left. A zero budget means each
/// try is non-blocking; the policy still decides how often to try. With a nonzero
/// budget, no retry starts once its backoff would overrun the budget.
pub async fn retry_async_within<T, F, Fut>(
    policy: &RetryPolicy,
    target: &str,
    budget: Duration,
    mut op: F,
) -> DbResult<T>
where
    F: FnMut(u32, Duration) -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let start = Instant::now();
    let mut attempt = 1;
    loop {
        let remaining = budget.saturating_sub(start.elapsed());
        match op(attempt, remaining).await {
            Ok(value) => return Ok(value),
            Err(error) if policy.should_retry(attempt, &error) => {
                let delay = policy.next_delay(attempt);
                if !fits_budget(budget, start, delay) {
                    log_give_up(target, attempt, &error);
                    return Err(error);
                }
                log_retry(target, policy, &RetryAttempt { attempt, delay, error: &error });
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                log_give_up(target, attempt, &error);
                return Err(error);
            }
        }
    }
}

/// Blocking counterpart of [`retry_async_within`].
pub fn retry_blocking_within<T, F>(
    policy: &RetryPolicy,
    target: &str,
    budget: Duration,
    mut op: F,
) -> DbResult<T>
where
    F: FnMut(u32, Duration) -> DbResult<T>,
{
    let start = Instant::now();
    let mut attempt = 1;
    loop {
        let remaining = budget.saturating_sub(start.elapsed());
        match op(attempt, remaining) {
            Ok(value) => return Ok(value),
            Err(error) if policy.should_retry(attempt, &error) => {
                let delay = policy.next_delay(attempt);
                if !fits_budget(budget, start, delay) {
                    log_give_up(target, attempt, &error);
                    return Err(error);
                }
                log_retry(target, policy, &RetryAttempt { attempt, delay, error: &error });
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(error) => {
                log_give_up(target, attempt, &error);
                return Err(error);
            }
        }
    }
}

fn fits_budget(budget: Duration, start: Instant, delay: Duration) -> bool {
    budget.is_zero() || start.elapsed() + delay < budget
}

fn log_retry(target: &str, policy: &RetryPolicy, attempt: &RetryAttempt<'_>) {
    warn!(
        target_name = %target,
        attempt = attempt.attempt,
        max_attempts = policy.max_attempts,
        delay_ms = attempt.delay.as_millis() as u64,
        error = %attempt.error,
        "Retrying after transient failure"
    );
}

fn log_give_up(target: &str, attempt: u32, error: &DbError) {
    if attempt > 1 {
        warn!(target_name = %target, attempts = attempt, error = %error, "Retry budget exhausted");
    } else {
        debug!(target_name = %target, error = %error, "Operation failed without retry");
    }
}
