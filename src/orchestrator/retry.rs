//! Retry policy shared by every orchestrated operation.

use std::future::Future;
use std::time::Duration;

use crate::config::{BackoffKind, Defaults};
use crate::executor::{CredentialExecutor, ExecutorError};

/// Upper bound for a single backoff delay.
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Attempt ceiling and delay schedule for calls against one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: BackoffKind,
}

/// Final result of a retried call and how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, ExecutorError>,
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_defaults(&Defaults::default())
    }
}

impl RetryPolicy {
    pub fn from_defaults(defaults: &Defaults) -> Self {
        Self {
            max_attempts: defaults.max_attempts.max(1),
            base_delay: Duration::from_millis(defaults.retry_backoff_base_ms),
            backoff: defaults.backoff,
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            backoff: BackoffKind::Fixed,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(MAX_DELAY)
    }

    /// Run `operation` until it succeeds, fails permanently, or the ceiling
    /// is reached.
    ///
    /// The first authentication failure resets the executor's session and
    /// earns one immediate extra attempt on top of the ceiling. Later
    /// authentication failures count like any other transient error.
    pub async fn run<T, F, Fut>(
        &self,
        executor: &dyn CredentialExecutor,
        mut operation: F,
    ) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExecutorError>>,
    {
        let backend = executor.backend().name.as_str();
        let mut attempts = 0;
        let mut reauthenticated = false;

        loop {
            attempts += 1;
            let error = match operation().await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts,
                    }
                }
                Err(e) => e,
            };

            let first_auth_failure = error.is_authentication() && !reauthenticated;
            let ceiling = self.max_attempts + u32::from(reauthenticated);
            if !error.is_retryable() || (attempts >= ceiling && !first_auth_failure) {
                tracing::warn!(backend = %backend, attempt = attempts, error = %error, "Giving up");
                return Attempted {
                    result: Err(error),
                    attempts,
                };
            }

            if first_auth_failure {
                reauthenticated = true;
                executor.reset_session();
                tracing::info!(backend = %backend, attempt = attempts, "Re-authenticating");
                continue;
            }

            let delay = self.delay_for(attempts);
            tracing::debug!(
                backend = %backend,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
