//! Retry policy: what happens to a job after a failed execution.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{Job, StatusUpdate};

/// Longest `last_error` kept on a row, in characters.
pub const MAX_ERROR_LEN: usize = 2048;

/// Shortest delay ever applied, so `run_at` lands strictly after the failure.
const MIN_DELAY: Duration = Duration::from_micros(1);

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Linear backoff: delay * attempt
    Linear,
    /// Exponential backoff: delay * 2^(attempt-1)
    Exponential,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown backoff strategy: {other}")),
        }
    }
}

/// Retry delay configuration. The attempt budget lives on each job
/// (`max_attempts`), not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay (cap for linear/exponential backoff)
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Retry as soon as possible (tests).
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self
                .base_delay
                .saturating_mul(attempt.max(1))
                .min(self.max_delay),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor).min(self.max_delay)
            }
        };
        delay.max(MIN_DELAY)
    }

    /// Decide the fate of `job` after the execution that started with its
    /// current claim failed at `failed_at`.
    pub fn on_failure(
        &self,
        job: &Job,
        error: impl Into<String>,
        failed_at: DateTime<Utc>,
    ) -> RetryDecision {
        let attempts = job.attempts.saturating_add(1);
        let error = truncate_error(error.into());

        if attempts >= job.max_attempts {
            return RetryDecision::Exhausted { attempts, error };
        }

        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempts))
            .unwrap_or(chrono::Duration::MAX);
        let run_at = failed_at
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        RetryDecision::Reschedule {
            attempts,
            run_at,
            error,
        }
    }
}

/// Outcome of [`RetryPolicy::on_failure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `pending`, due at `run_at`.
    Reschedule {
        attempts: u32,
        run_at: DateTime<Utc>,
        error: String,
    },
    /// Attempt budget spent; the job becomes `failed`.
    Exhausted { attempts: u32, error: String },
}

impl RetryDecision {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryDecision::Reschedule { attempts, .. } | RetryDecision::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    /// The conditional update that records this decision for `job`'s claim.
    pub fn into_update(self, job: &Job) -> StatusUpdate {
        match self {
            RetryDecision::Reschedule {
                attempts,
                run_at,
                error,
            } => StatusUpdate::rescheduled(job, attempts, run_at, error),
            RetryDecision::Exhausted { attempts, error } => {
                StatusUpdate::failed(job, attempts, error)
            }
        }
    }
}

fn truncate_error(mut error: String) -> String {
    if let Some((idx, _)) = error.char_indices().nth(MAX_ERROR_LEN) {
        error.truncate(idx);
    }
    error
}
