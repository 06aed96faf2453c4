//! Backoff policy for listener retries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay for every attempt.
    #[default]
    Linear,
    /// delay * multiplier^attempt
    Exponential,
}

/// Maps a retry attempt count to a delay, plus a retry limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    /// Base delay in seconds.
    pub delay_secs: f64,
    /// Growth factor (exponential only).
    pub multiplier: f64,
    /// Maximum attempts before escalation stops (0 = no limit).
    pub limit: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            delay_secs: 5.0,
            multiplier: 2.0,
            limit: 0,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with a constant delay.
    pub fn linear(delay_secs: f64, limit: u32) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            delay_secs,
            limit,
            ..Default::default()
        }
    }

    /// Create a policy with exponential growth.
    pub fn exponential(delay_secs: f64, multiplier: f64, limit: u32) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            delay_secs,
            multiplier,
            limit,
        }
    }

    /// Delay in seconds before the retry following `attempt` (0-indexed)
    /// failures.
    pub fn delay_seconds(&self, attempt: u32) -> f64 {
        match self.strategy {
            BackoffStrategy::Linear => self.delay_secs,
            BackoffStrategy::Exponential => {
                let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
                self.delay_secs * self.multiplier.powi(exp)
            }
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = self.delay_seconds(attempt);
        if secs.is_finite() && secs > 0.0 {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        } else if secs.is_infinite() {
            Duration::MAX
        } else {
            Duration::ZERO
        }
    }

    /// Whether escalation should stop at `attempt`.
    ///
    /// A limit of zero is read as "no limit" so a listener is never parked
    /// without a retry.
    pub fn has_reached_limit(&self, attempt: u32) -> bool {
        self.limit != 0 && attempt >= self.limit
    }
}
