//! Listener driver: run batches for one listener until its feed is drained.
//!
//! This is the minimal caller of the batch engine. Picking which listeners
//! to drain, and how many at once, stays with the surrounding scheduler.

use tracing::{debug, info};

use changewatch_core::ListenerRecord;
use changewatch_events::ChangeDispatcher;

use crate::batch::{BatchEngine, BatchError, BatchOutcome};
use crate::scheduling::{Scheduling, SchedulingError};
use crate::store::ListenerStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub batches: u32,
    pub changes: usize,
    pub last_outcome: Option<BatchOutcome>,
    /// Stopped at the per-drain batch cap with pages still pending.
    pub exhausted_budget: bool,
    /// The listener was marked clean and unlocked afterwards.
    pub released: bool,
}

#[derive(Debug)]
pub struct ListenerDriver<'a, S, D, H> {
    engine: &'a BatchEngine<S, D, H>,
    max_batches: u32,
}

impl<'a, S, D, H> ListenerDriver<'a, S, D, H>
where
    S: ListenerStore,
    D: ChangeDispatcher,
    H: Scheduling + Clone,
{
    pub fn new(engine: &'a BatchEngine<S, D, H>, max_batches: u32) -> Self {
        Self {
            engine,
            max_batches: max_batches.max(1),
        }
    }

    /// Run batches back to back while the store reports more pages.
    ///
    /// When the last batch advanced and nothing is pending, the listener is
    /// released (`dirty=false`, lock cleared) with a conditional write; a
    /// claimer that slipped in first wins and the listener stays dirty.
    pub async fn drain(&self, listener: &ListenerRecord) -> Result<DrainSummary, BatchError> {
        let mut summary = DrainSummary::default();
        let mut current = listener.clone();

        loop {
            let report = self.engine.run_batch(&current).await?;
            summary.batches += 1;
            summary.changes += report.changes;
            let more = report.more_pending();
            summary.last_outcome = Some(report.outcome.clone());

            if !more {
                if matches!(report.outcome, BatchOutcome::Advanced { .. }) {
                    summary.released = self.release(&report.record).await;
                }
                break;
            }
            if summary.batches >= self.max_batches {
                summary.exhausted_budget = true;
                debug!(
                    listener_id = %listener.id,
                    batches = summary.batches,
                    "drain budget exhausted, leaving listener dirty"
                );
                break;
            }

            current = match report.outcome {
                BatchOutcome::Advanced { .. } => report.record,
                _ => match self.engine.store().get(&listener.id).await? {
                    Some(record) => record,
                    None => break,
                },
            };
        }

        info!(
            listener_id = %listener.id,
            batches = summary.batches,
            changes = summary.changes,
            released = summary.released,
            "listener drained"
        );
        Ok(summary)
    }

    async fn release(&self, record: &ListenerRecord) -> bool {
        let mut idle = record.clone();
        idle.dirty = false;
        idle.locked_at = None;

        match self.engine.scheduling().persist(&idle, false).await {
            Ok(_) => true,
            Err(SchedulingError::Conflict(id)) => {
                debug!(listener_id = %id, "listener re-dirtied before release");
                false
            }
            Err(err) => {
                self.engine.scheduling().report_error("release listener", &err);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;

    use changewatch_core::{DbName, ListenerConfig, Seq};

    use super::*;
    use crate::scheduling::StoreScheduling;
    use crate::store::InMemoryListenerStore;
    use crate::test_support::RecordingDispatcher;

    fn setup(
        changes: usize,
        batch_size: usize,
    ) -> (
        Arc<InMemoryListenerStore>,
        BatchEngine<
            Arc<InMemoryListenerStore>,
            Arc<RecordingDispatcher>,
            Arc<StoreScheduling<Arc<InMemoryListenerStore>>>,
        >,
        ListenerRecord,
    ) {
        let store = InMemoryListenerStore::arc();
        store.create_database("orders").unwrap();
        for i in 0..changes {
            store
                .record_change("orders", &format!("doc-{i}"), json!({ "i": i }))
                .unwrap();
        }
        let listener = store
            .insert_listener(ListenerRecord::new_dirty(DbName::escape("orders"), Utc::now()))
            .unwrap();
        let config = ListenerConfig::default().with_batch_size(batch_size);
        let engine = BatchEngine::new(
            store.clone(),
            RecordingDispatcher::arc(),
            StoreScheduling::arc(store.clone()),
            &config,
        );
        (store, engine, listener)
    }

    #[tokio::test]
    async fn drains_all_pages_then_releases() {
        let (store, engine, listener) = setup(5, 2);

        let summary = ListenerDriver::new(&engine, 10).drain(&listener).await.unwrap();

        assert_eq!(summary.batches, 3);
        assert_eq!(summary.changes, 5);
        assert!(summary.released);
        let after = store.get(&listener.id).await.unwrap().unwrap();
        assert!(!after.dirty);
        assert_eq!(after.last_seq, Some(Seq::from(5)));
    }

    #[tokio::test]
    async fn stops_at_batch_budget() {
        let (store, engine, listener) = setup(5, 1);

        let summary = ListenerDriver::new(&engine, 2).drain(&listener).await.unwrap();

        assert_eq!(summary.batches, 2);
        assert!(summary.exhausted_budget);
        assert!(!summary.released);
        let after = store.get(&listener.id).await.unwrap().unwrap();
        assert!(after.dirty);
        assert_eq!(after.last_seq, Some(Seq::from(2)));
    }

    #[tokio::test]
    async fn missing_database_propagates() {
        let (_store, engine, listener) = setup(0, 10);
        engine.store().drop_database("orders").unwrap();

        let err = ListenerDriver::new(&engine, 10).drain(&listener).await.unwrap_err();
        assert_eq!(err, BatchError::DatabaseNotFound("orders".to_string()));
    }
}
