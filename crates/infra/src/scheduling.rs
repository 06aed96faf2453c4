//! Scheduling collaborator: the process-level capabilities the listener core
//! relies on but does not own.
//!
//! - timestamp bookkeeping (`touch_updated_at`, `set_dirty_at`)
//! - conditional persistence of a listener record
//! - wakeup notification when a record becomes due in the future
//! - error reporting
//! - installing/removing the listener index
//!
//! These are composed into the claim protocol, batch engine and retry
//! scheduler rather than inherited.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

use changewatch_core::{ListenerId, ListenerPatch, ListenerRecord};

use crate::store::{ListenerStore, StoreError, ViewDefinition, WriteOutcome};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulingError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The record changed since it was read and the caller asked not to retry.
    #[error("listener {0} was modified concurrently")]
    Conflict(ListenerId),
}

#[async_trait]
pub trait Scheduling: Send + Sync {
    /// Refresh the `updated_at` scheduling marker.
    fn touch_updated_at(&self, record: &mut ListenerRecord);

    /// Defer eligibility of `record` until `at`.
    fn set_dirty_at(&self, record: &mut ListenerRecord, at: DateTime<Utc>);

    /// Write `record` conditioned on its revision.
    ///
    /// With `retry_on_conflict`, a stale revision is resolved by carrying
    /// the record's scheduling fields onto the current revision; otherwise
    /// the conflict is returned.
    async fn persist(
        &self,
        record: &ListenerRecord,
        retry_on_conflict: bool,
    ) -> Result<ListenerRecord, SchedulingError>;

    /// Guarantee a future sweep no earlier than `at`.
    async fn notify_wakeup_at(&self, at: DateTime<Utc>);

    fn report_error(&self, context: &str, err: &(dyn std::error::Error + Send + Sync));

    async fn install_views(&self) -> Result<(), SchedulingError>;

    async fn uninstall_views(&self) -> Result<(), SchedulingError>;
}

#[async_trait]
impl<H> Scheduling for Arc<H>
where
    H: Scheduling + ?Sized,
{
    fn touch_updated_at(&self, record: &mut ListenerRecord) {
        (**self).touch_updated_at(record)
    }

    fn set_dirty_at(&self, record: &mut ListenerRecord, at: DateTime<Utc>) {
        (**self).set_dirty_at(record, at)
    }

    async fn persist(
        &self,
        record: &ListenerRecord,
        retry_on_conflict: bool,
    ) -> Result<ListenerRecord, SchedulingError> {
        (**self).persist(record, retry_on_conflict).await
    }

    async fn notify_wakeup_at(&self, at: DateTime<Utc>) {
        (**self).notify_wakeup_at(at).await
    }

    fn report_error(&self, context: &str, err: &(dyn std::error::Error + Send + Sync)) {
        (**self).report_error(context, err)
    }

    async fn install_views(&self) -> Result<(), SchedulingError> {
        (**self).install_views().await
    }

    async fn uninstall_views(&self) -> Result<(), SchedulingError> {
        (**self).uninstall_views().await
    }
}

/// Earliest requested wakeup, published on a `watch` channel.
///
/// An event-driven sweeper subscribes and sleeps until the published instant;
/// a later request never postpones an earlier pending one.
#[derive(Debug)]
pub struct WakeupNotifier {
    tx: watch::Sender<Option<DateTime<Utc>>>,
}

impl Default for WakeupNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeupNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.tx.subscribe()
    }

    /// Request a wakeup at `at`. Returns whether the pending wakeup moved.
    pub fn notify(&self, at: DateTime<Utc>) -> bool {
        let now = Utc::now();
        self.tx.send_if_modified(|pending| match *pending {
            Some(current) if current > now && current <= at => false,
            _ => {
                *pending = Some(at);
                true
            }
        })
    }

    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        *self.tx.borrow()
    }

    /// Consume the pending wakeup (a sweep ran).
    pub fn take(&self) -> Option<DateTime<Utc>> {
        let mut taken = None;
        self.tx.send_if_modified(|pending| {
            taken = pending.take();
            taken.is_some()
        });
        taken
    }
}

/// [`Scheduling`] backed by a [`ListenerStore`].
#[derive(Debug)]
pub struct StoreScheduling<S> {
    store: S,
    wakeups: WakeupNotifier,
    view: ViewDefinition,
    errors_reported: AtomicU64,
}

impl<S: ListenerStore> StoreScheduling<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            wakeups: WakeupNotifier::new(),
            view: ViewDefinition::listeners(),
            errors_reported: AtomicU64::new(0),
        }
    }

    pub fn arc(store: S) -> Arc<Self> {
        Arc::new(Self::new(store))
    }

    pub fn wakeups(&self) -> &WakeupNotifier {
        &self.wakeups
    }

    pub fn errors_reported(&self) -> u64 {
        self.errors_reported.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<S: ListenerStore> Scheduling for StoreScheduling<S> {
    fn touch_updated_at(&self, record: &mut ListenerRecord) {
        record.updated_at = Utc::now();
    }

    fn set_dirty_at(&self, record: &mut ListenerRecord, at: DateTime<Utc>) {
        record.dirty_at = Some(at);
    }

    async fn persist(
        &self,
        record: &ListenerRecord,
        retry_on_conflict: bool,
    ) -> Result<ListenerRecord, SchedulingError> {
        let mut results = self.store.bulk_upsert(vec![record.clone()]).await?;
        let result = results
            .pop()
            .ok_or_else(|| StoreError::storage("bulk upsert returned no result"))?;

        match result.outcome {
            WriteOutcome::Written(revision) => {
                let mut written = record.clone();
                written.revision = Some(revision);
                Ok(written)
            }
            WriteOutcome::Conflict if retry_on_conflict => {
                debug!(
                    listener_id = %record.id,
                    "persist conflicted, merging onto current revision"
                );
                let merged = self
                    .store
                    .merge_upsert(&record.id, &ListenerPatch::scheduling_of(record))
                    .await?;
                Ok(merged)
            }
            WriteOutcome::Conflict => Err(SchedulingError::Conflict(record.id.clone())),
            WriteOutcome::Failed(message) => Err(StoreError::Storage(message).into()),
        }
    }

    async fn notify_wakeup_at(&self, at: DateTime<Utc>) {
        if self.wakeups.notify(at) {
            debug!(wakeup_at = %at, "wakeup scheduled");
        }
    }

    fn report_error(&self, context: &str, err: &(dyn std::error::Error + Send + Sync)) {
        self.errors_reported.fetch_add(1, Ordering::Relaxed);
        error!(context, error = %err, "listener error");
    }

    async fn install_views(&self) -> Result<(), SchedulingError> {
        self.store.create_or_update(&self.view).await?;
        info!(design_id = %self.view.id, "listener views installed");
        Ok(())
    }

    async fn uninstall_views(&self) -> Result<(), SchedulingError> {
        let removed = self.store.get_and_destroy(&self.view.id).await?;
        info!(design_id = %self.view.id, removed, "listener views uninstalled");
        Ok(())
    }
}
