//! Retry scheduling after a failed dispatch.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use changewatch_core::{BackoffPolicy, ListenerRecord};

use crate::scheduling::{Scheduling, SchedulingError};

/// What the retry scheduler did with a failed listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-armed for `dirty_at`; `attempt` is the new `retries` value.
    Delayed { dirty_at: DateTime<Utc>, attempt: u32 },
    /// Limit reached: `retries` cleared, eligible on the next sweep.
    Exhausted,
}

/// Re-arms a listener after a recoverable dispatch failure without losing
/// its resume position.
#[derive(Debug, Clone)]
pub struct RetryScheduler<H> {
    scheduling: H,
    policy: BackoffPolicy,
}

impl<H: Scheduling> RetryScheduler<H> {
    pub fn new(scheduling: H, policy: BackoffPolicy) -> Self {
        Self { scheduling, policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub async fn schedule_retry(
        &self,
        listener: &ListenerRecord,
    ) -> Result<RetryDecision, SchedulingError> {
        let attempt = listener.retries;
        let mut record = listener.clone();
        record.dirty = true;
        self.scheduling.touch_updated_at(&mut record);

        if self.policy.has_reached_limit(attempt) {
            record.retries = 0;
            record.dirty_at = None;
            self.scheduling.persist(&record, true).await?;

            warn!(
                listener_id = %record.id,
                db_name = %record.db_name,
                attempts = attempt,
                "retry limit reached, clearing backoff"
            );
            return Ok(RetryDecision::Exhausted);
        }

        let delay = chrono::Duration::from_std(self.policy.delay_for_attempt(attempt))
            .unwrap_or(chrono::Duration::MAX);
        let dirty_at = record
            .updated_at
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.scheduling.set_dirty_at(&mut record, dirty_at);
        record.retries = attempt.saturating_add(1);
        self.scheduling.persist(&record, true).await?;
        self.scheduling.notify_wakeup_at(dirty_at).await;

        info!(
            listener_id = %record.id,
            db_name = %record.db_name,
            retries = record.retries,
            dirty_at = %dirty_at,
            "listener retry scheduled"
        );

        Ok(RetryDecision::Delayed {
            dirty_at,
            attempt: record.retries,
        })
    }
}
