//! Batch engine: drive one listener through one page of its change feed.
//!
//! ```text
//! poll page since last_seq
//!   ↓
//! dispatch each change, strictly in feed order
//!   ↓
//! join every outbound operation (any order)
//!   ↓
//! ok:     re-read record → advance last_seq unless re-dirtied meanwhile
//!         (conditional write; a conflict re-runs the check)
//! failed: retry scheduler (backoff, last_seq untouched)
//! ```
//!
//! The re-dirty check compares the record's `updated_at` against the value
//! captured when the batch started, not the revision.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use changewatch_core::{ListenerConfig, ListenerId, ListenerPatch, ListenerRecord, Seq};
use changewatch_events::{Change, ChangeDispatcher, DispatchError, PendingOps, PollOptions};

use crate::retry::{RetryDecision, RetryScheduler};
use crate::scheduling::{Scheduling, SchedulingError};
use crate::store::{ListenerStore, StoreError};

/// Conditional advance writes tried before the batch gives up and leaves
/// the record dirty.
const ADVANCE_ATTEMPTS: usize = 5;

/// Failures a batch cannot absorb by itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchError {
    /// The watched database is gone; the caller should retire the listener.
    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    /// The listener record could not be re-read between batches.
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every operation succeeded and `last_seq` moved to the page cursor.
    Advanced { last_seq: Seq },
    /// Every operation succeeded but the record was re-dirtied during the
    /// batch; `last_seq` was kept so the page is processed again.
    Replayed,
    /// A dispatch failed; the retry scheduler re-armed the listener.
    RetryScheduled(RetryDecision),
    /// Unexpected failure, already reported; the record stays dirty.
    LeftDirty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub listener_id: ListenerId,
    /// Decoded database name (escaped form if decoding failed).
    pub db_name: String,
    /// Changes in the polled page.
    pub changes: usize,
    pub outcome: BatchOutcome,
    /// Store signalled further pages.
    pub pending: bool,
    /// Latest known state of the listener record after the batch.
    pub record: ListenerRecord,
}

impl BatchReport {
    /// Whether the caller should run another batch right away.
    pub fn more_pending(&self) -> bool {
        self.pending
            && matches!(
                self.outcome,
                BatchOutcome::Advanced { .. } | BatchOutcome::Replayed
            )
    }
}

#[derive(Debug, Clone)]
pub struct BatchEngine<S, D, H> {
    store: S,
    dispatcher: D,
    scheduling: H,
    retry: RetryScheduler<H>,
    batch_size: usize,
}

impl<S, D, H> BatchEngine<S, D, H>
where
    S: ListenerStore,
    D: ChangeDispatcher,
    H: Scheduling + Clone,
{
    pub fn new(store: S, dispatcher: D, scheduling: H, config: &ListenerConfig) -> Self {
        let retry = RetryScheduler::new(scheduling.clone(), config.backoff_policy());
        Self {
            store,
            dispatcher,
            scheduling,
            retry,
            batch_size: config.batch_size.max(1),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn scheduling(&self) -> &H {
        &self.scheduling
    }

    pub fn retry_scheduler(&self) -> &RetryScheduler<H> {
        &self.retry
    }

    /// Run one batch; `true` means another batch should be scheduled.
    pub async fn process_one_batch(&self, listener: &ListenerRecord) -> Result<bool, BatchError> {
        Ok(self.run_batch(listener).await?.more_pending())
    }

    pub async fn run_batch(&self, listener: &ListenerRecord) -> Result<BatchReport, BatchError> {
        let marker = listener.updated_at;
        let mut report = BatchReport {
            listener_id: listener.id.clone(),
            db_name: listener.db_name.to_string(),
            changes: 0,
            outcome: BatchOutcome::LeftDirty,
            pending: false,
            record: listener.clone(),
        };

        report.db_name = match listener.db_name.decode() {
            Ok(name) => name,
            Err(err) => {
                self.scheduling.report_error("decode database name", &err);
                return Ok(report);
            }
        };

        let options = PollOptions::since(listener.last_seq.clone(), self.batch_size);
        let page = match self.store.poll_changes(&report.db_name, &options).await {
            Ok(page) => page,
            Err(StoreError::NotFound(_)) => {
                warn!(
                    listener_id = %listener.id,
                    db_name = %report.db_name,
                    "watched database no longer exists"
                );
                return Err(BatchError::DatabaseNotFound(report.db_name));
            }
            Err(err) => {
                self.scheduling.report_error("poll changes", &err);
                return Ok(report);
            }
        };
        report.changes = page.results.len();
        report.pending = page.pending;

        debug!(
            listener_id = %listener.id,
            db_name = %report.db_name,
            changes = report.changes,
            pending = page.pending,
            "dispatching batch"
        );

        if let Err(err) = self.dispatch_page(&page.results, &report.db_name).await {
            warn!(
                listener_id = %listener.id,
                db_name = %report.db_name,
                retries = listener.retries,
                error = %err,
                "dispatch failed, scheduling retry"
            );
            report.outcome = match self.retry.schedule_retry(listener).await {
                Ok(decision) => BatchOutcome::RetryScheduled(decision),
                Err(err) => {
                    self.scheduling.report_error("schedule retry", &err);
                    BatchOutcome::LeftDirty
                }
            };
            return Ok(report);
        }

        let (record, outcome) = self.settle(listener, marker, &page.last_seq).await;
        report.record = record;
        report.outcome = outcome;
        Ok(report)
    }

    /// Record a successful page.
    ///
    /// The cursor only moves through a write conditioned on the revision
    /// that passed the re-dirty check. A conflict means a claimer may have
    /// re-dirtied the record in between, so the check runs again on the new
    /// revision.
    async fn settle(
        &self,
        listener: &ListenerRecord,
        marker: DateTime<Utc>,
        last_seq: &Seq,
    ) -> (ListenerRecord, BatchOutcome) {
        let mut latest = listener.clone();
        for _ in 0..ADVANCE_ATTEMPTS {
            let current = match self.store.get(&listener.id).await {
                Ok(Some(current)) => current,
                Ok(None) => {
                    let err = StoreError::NotFound(format!("listener {}", listener.id));
                    self.scheduling.report_error("re-read listener", &err);
                    return (latest, BatchOutcome::LeftDirty);
                }
                Err(err) => {
                    self.scheduling.report_error("re-read listener", &err);
                    return (latest, BatchOutcome::LeftDirty);
                }
            };

            if current.dirtied_since(marker) {
                return self.replay(current).await;
            }

            let advanced = BatchOutcome::Advanced {
                last_seq: last_seq.clone(),
            };
            if current.last_seq.as_ref() == Some(last_seq) && current.retries == 0 {
                return (current, advanced);
            }

            let mut next = current.clone();
            ListenerPatch::advance(last_seq.clone()).apply_to(&mut next);
            match self.scheduling.persist(&next, false).await {
                Ok(written) => return (written, advanced),
                Err(SchedulingError::Conflict(_)) => {
                    debug!(listener_id = %listener.id, "advance conflicted, re-checking record");
                    latest = current;
                }
                Err(err) => {
                    self.scheduling.report_error("advance listener", &err);
                    return (current, BatchOutcome::LeftDirty);
                }
            }
        }

        let err = SchedulingError::Conflict(listener.id.clone());
        self.scheduling.report_error("advance listener", &err);
        (latest, BatchOutcome::LeftDirty)
    }

    /// Keep `last_seq` so the page is processed again.
    async fn replay(&self, current: ListenerRecord) -> (ListenerRecord, BatchOutcome) {
        debug!(
            listener_id = %current.id,
            "listener re-dirtied during batch, keeping last_seq for replay"
        );
        if current.retries == 0 {
            return (current, BatchOutcome::Replayed);
        }
        match self
            .store
            .merge_upsert(&current.id, &ListenerPatch::reset_retries())
            .await
        {
            Ok(merged) => (merged, BatchOutcome::Replayed),
            Err(err) => {
                self.scheduling.report_error("reset retries", &err);
                (current, BatchOutcome::LeftDirty)
            }
        }
    }

    /// Hand every change to the dispatcher in order, then wait for all the
    /// outbound work it produced. Operations already issued are awaited even
    /// when a later dispatch call fails.
    async fn dispatch_page(
        &self,
        changes: &[Change],
        db_name: &str,
    ) -> Result<(), DispatchError> {
        let mut pending = PendingOps::new();
        let mut handoff = Ok(());
        for change in changes {
            if let Err(err) = self.dispatcher.dispatch(change, db_name, &mut pending).await {
                handoff = Err(err);
                break;
            }
        }

        let joined = pending.join_all().await;
        handoff?;
        joined.map(|_| ())
    }
}
