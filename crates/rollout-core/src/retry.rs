//! Bounded retry for activity calls.
//!
//! Every side-effecting call the coordinator makes (diff query, artifact
//! fetch, device apply) runs through [`run_activity`]. Each attempt is capped
//! by `start_to_close_secs`; the whole sequence of attempts, including
//! backoff sleeps, is capped by `schedule_to_close_secs`. Activities are
//! executed at least once and possibly more, so they must be safe to repeat.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, RolloutError};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts including the first. `0` means unlimited within
    /// the schedule-to-close deadline.
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "default_start_to_close")]
    pub start_to_close_secs: u64,
    #[serde(default = "default_schedule_to_close")]
    pub schedule_to_close_secs: u64,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_start_to_close() -> u64 {
    60
}

fn default_schedule_to_close() -> u64 {
    300
}

fn default_initial_backoff() -> u64 {
    1_000
}

fn default_backoff_coefficient() -> f64 {
    2.0
}

fn default_max_backoff() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            start_to_close_secs: default_start_to_close(),
            schedule_to_close_secs: default_schedule_to_close(),
            initial_backoff_ms: default_initial_backoff(),
            backoff_coefficient: default_backoff_coefficient(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryPolicy {
    pub fn start_to_close(&self) -> Duration {
        Duration::from_secs(self.start_to_close_secs)
    }

    pub fn schedule_to_close(&self) -> Duration {
        Duration::from_secs(self.schedule_to_close_secs)
    }

    /// Sleep before attempt `attempt + 1`, where `attempt` is 1-indexed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let ms = self.initial_backoff_ms as f64 * self.backoff_coefficient.max(1.0).powi(exp);
        Duration::from_millis((ms as u64).min(self.max_backoff_ms))
    }
}

// ---------------------------------------------------------------------------
// run_activity
// ---------------------------------------------------------------------------

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted.
///
/// `op` receives the 1-indexed attempt number.
pub async fn run_activity<T, F, Fut>(name: &str, policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + policy.schedule_to_close();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let budget = remaining.min(policy.start_to_close());

        let err = match tokio::time::timeout(budget, op(attempt)).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!(activity = name, attempt, "activity succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(e)) if !e.is_retryable() => return Err(e),
            Ok(Err(e)) => e,
            Err(_) => RolloutError::ActivityTimeout {
                activity: name.to_string(),
                timeout_secs: budget.as_secs(),
            },
        };

        let exhausted = |attempts: u32, last: &RolloutError| RolloutError::RetriesExhausted {
            activity: name.to_string(),
            attempts,
            last: last.to_string(),
        };

        if policy.max_attempts > 0 && attempt >= policy.max_attempts {
            warn!(activity = name, attempt, error = %err, "activity out of attempts");
            return Err(exhausted(attempt, &err));
        }
        let backoff = policy.backoff(attempt);
        if Instant::now() + backoff >= deadline {
            warn!(activity = name, attempt, error = %err, "activity past schedule-to-close");
            return Err(exhausted(attempt, &err));
        }

        warn!(
            activity = name,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "activity failed, retrying"
        );
        tokio::time::sleep(backoff).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
