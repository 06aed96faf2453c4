//! Claim protocol: mark listeners dirty when their databases change.
//!
//! Runs on every burst of write notifications, so it works in bulk:
//!
//! ```text
//! db names (deduplicated)
//!   ↓
//! 1. query_by_keys (one round-trip for the whole burst)
//!   ↓
//! 2. partition: clean → dirty, locked → dirty, queued → skip, missing → create dirty
//!   ↓
//! 3. bulk_upsert (conditioned on each record's revision)
//!   ↓
//! 4. conflicted names → next round (same steps, that subset only)
//! ```
//!
//! A held lock never exempts a record: its session may be working from a
//! stale revision and must be forced to re-check.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use changewatch_core::{DbName, ListenerConfig, ListenerRecord};

use crate::scheduling::Scheduling;
use crate::store::{ListenerStore, StoreError, WriteOutcome, LISTENERS_BY_DB_NAME};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClaimError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Conflicts kept recurring for these names after `rounds` attempts.
    #[error("claim did not converge after {rounds} rounds for {} database(s)", db_names.len())]
    Unconverged { db_names: Vec<DbName>, rounds: u32 },
}

/// Counts from one claim call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimReport {
    /// New listener records written.
    pub created: usize,
    /// Existing records flipped (or re-flipped) to dirty.
    pub dirtied: usize,
    /// Already dirty and unlocked, left alone.
    pub skipped: usize,
    /// Writes that lost a race and were retried.
    pub conflicts: usize,
    pub rounds: u32,
}

#[derive(Debug, Clone)]
pub struct ClaimProtocol<S, H> {
    store: S,
    scheduling: H,
    max_rounds: u32,
    retry_base: Duration,
}

impl<S, H> ClaimProtocol<S, H>
where
    S: ListenerStore,
    H: Scheduling,
{
    pub fn new(store: S, scheduling: H, config: &ListenerConfig) -> Self {
        Self {
            store,
            scheduling,
            max_rounds: config.claim_max_rounds.max(1),
            retry_base: config.claim_retry_base(),
        }
    }

    /// Ensure every named database has a dirty listener record.
    ///
    /// Idempotent: duplicates collapse, already-queued records are skipped.
    pub async fn dirty_if_clean_or_locked<I>(&self, db_names: I) -> Result<ClaimReport, ClaimError>
    where
        I: IntoIterator<Item = DbName>,
    {
        let mut worklist: BTreeSet<DbName> = db_names.into_iter().collect();
        let mut report = ClaimReport::default();

        while !worklist.is_empty() {
            if report.rounds == self.max_rounds {
                warn!(
                    rounds = report.rounds,
                    remaining = worklist.len(),
                    "claim gave up on persistent conflicts"
                );
                return Err(ClaimError::Unconverged {
                    db_names: worklist.into_iter().collect(),
                    rounds: report.rounds,
                });
            }
            if report.rounds > 0 {
                tokio::time::sleep(self.pause_before(report.rounds)).await;
            }
            report.rounds += 1;

            let conflicted = self.claim_round(&worklist, &mut report).await?;
            if !conflicted.is_empty() {
                debug!(
                    round = report.rounds,
                    conflicted = conflicted.len(),
                    "claim round hit conflicts, retrying subset"
                );
            }
            report.conflicts += conflicted.len();
            worklist = conflicted;
        }

        Ok(report)
    }

    async fn claim_round(
        &self,
        worklist: &BTreeSet<DbName>,
        report: &mut ClaimReport,
    ) -> Result<BTreeSet<DbName>, ClaimError> {
        let keys: Vec<DbName> = worklist.iter().cloned().collect();
        let existing = self.store.query_by_keys(LISTENERS_BY_DB_NAME, &keys).await?;

        let mut by_name: HashMap<DbName, ListenerRecord> = HashMap::with_capacity(existing.len());
        for record in existing {
            by_name.entry(record.db_name.clone()).or_insert(record);
        }

        let mut docs = Vec::with_capacity(keys.len());
        let mut created = Vec::with_capacity(keys.len());
        for name in keys {
            let (mut record, is_new) = match by_name.remove(&name) {
                Some(record) if record.is_claimable() => (record, false),
                Some(_) => {
                    report.skipped += 1;
                    continue;
                }
                None => (ListenerRecord::new_dirty(name, chrono::Utc::now()), true),
            };
            record.dirty = true;
            self.scheduling.touch_updated_at(&mut record);
            docs.push(record);
            created.push(is_new);
        }

        if docs.is_empty() {
            return Ok(BTreeSet::new());
        }

        let names: Vec<DbName> = docs.iter().map(|d| d.db_name.clone()).collect();
        let expected = docs.len();
        let results = self.store.bulk_upsert(docs).await?;
        if results.len() != expected {
            return Err(StoreError::storage(format!(
                "bulk upsert returned {} results for {expected} documents",
                results.len()
            ))
            .into());
        }

        let mut conflicted = BTreeSet::new();
        for ((name, is_new), result) in names.into_iter().zip(created).zip(results) {
            match result.outcome {
                WriteOutcome::Written(_) if is_new => report.created += 1,
                WriteOutcome::Written(_) => report.dirtied += 1,
                WriteOutcome::Conflict => {
                    conflicted.insert(name);
                }
                WriteOutcome::Failed(message) => {
                    return Err(StoreError::Storage(format!("{}: {message}", result.id)).into());
                }
            }
        }

        Ok(conflicted)
    }

    /// Pause before round `round` (1-based count of rounds already run):
    /// linear in the round with a deterministic ±10% spread.
    fn pause_before(&self, round: u32) -> Duration {
        let base = self.retry_base.saturating_mul(round);
        let spread = f64::from(round.wrapping_mul(17) % 100) / 100.0;
        base.mul_f64(0.9 + 0.2 * spread)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use changewatch_core::ListenerId;

    use super::*;
    use crate::scheduling::StoreScheduling;
    use crate::store::InMemoryListenerStore;

    type Protocol = ClaimProtocol<
        Arc<InMemoryListenerStore>,
        Arc<StoreScheduling<Arc<InMemoryListenerStore>>>,
    >;

    async fn setup(config: &ListenerConfig) -> (Arc<InMemoryListenerStore>, Protocol) {
        let store = InMemoryListenerStore::arc();
        let scheduling = StoreScheduling::arc(store.clone());
        scheduling.install_views().await.unwrap();
        let claim = ClaimProtocol::new(store.clone(), scheduling, config);
        (store, claim)
    }

    fn names(raw: &[&str]) -> Vec<DbName> {
        raw.iter().map(|n| DbName::escape(n)).collect()
    }

    #[tokio::test]
    async fn creates_missing_records_dirty() {
        let (store, claim) = setup(&ListenerConfig::default()).await;

        let report = claim.dirty_if_clean_or_locked(names(&["a", "b"])).await.unwrap();

        assert_eq!(report.created, 2);
        assert_eq!(report.rounds, 1);
        let listeners = store.listeners().unwrap();
        assert_eq!(listeners.len(), 2);
        assert!(listeners.iter().all(|l| l.dirty));
        assert!(listeners.iter().any(|l| l.id == ListenerId::for_db(&DbName::escape("a"))));
    }

    #[tokio::test]
    async fn duplicate_names_in_one_burst_collapse() {
        let (store, claim) = setup(&ListenerConfig::default()).await;

        let report = claim
            .dirty_if_clean_or_locked(names(&["a", "a", "a"]))
            .await
            .unwrap();

        assert_eq!(report.created, 1);
        assert_eq!(store.listeners().unwrap().len(), 1);
        assert_eq!(store.stats().bulk_upserts, 1);
    }

    #[tokio::test]
    async fn queued_records_are_skipped() {
        let (store, claim) = setup(&ListenerConfig::default()).await;
        let queued = store
            .insert_listener(ListenerRecord::new_dirty(DbName::escape("a"), Utc::now()))
            .unwrap();

        let report = claim.dirty_if_clean_or_locked(names(&["a"])).await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(store.stats().bulk_upserts, 0);
        let after = store.listeners().unwrap();
        assert_eq!(after[0].revision, queued.revision);
    }

    #[tokio::test]
    async fn clean_and_locked_records_are_dirtied() {
        let (store, claim) = setup(&ListenerConfig::default()).await;

        let mut clean = ListenerRecord::new_dirty(DbName::escape("clean"), Utc::now());
        clean.dirty = false;
        store.insert_listener(clean).unwrap();

        let mut locked = ListenerRecord::new_dirty(DbName::escape("locked"), Utc::now());
        locked.dirty = false;
        let locked_at = Utc::now();
        locked.locked_at = Some(locked_at);
        store.insert_listener(locked).unwrap();

        let report = claim
            .dirty_if_clean_or_locked(names(&["clean", "locked"]))
            .await
            .unwrap();

        assert_eq!(report.dirtied, 2);
        for l in store.listeners().unwrap() {
            assert!(l.dirty);
            if l.db_name == DbName::escape("locked") {
                assert_eq!(l.locked_at, Some(locked_at));
            }
        }
    }

    #[tokio::test]
    async fn conflicts_retry_only_the_conflicted_subset() {
        let config = ListenerConfig::default().with_claim_rounds(5, 1);
        let (store, claim) = setup(&config).await;

        let mut locked = ListenerRecord::new_dirty(DbName::escape("a"), Utc::now());
        locked.dirty = false;
        locked.locked_at = Some(Utc::now());
        let locked = store.insert_listener(locked).unwrap();
        store.interleave_writes(&locked.id, 2).unwrap();

        let report = claim.dirty_if_clean_or_locked(names(&["a", "b"])).await.unwrap();

        assert_eq!(report.rounds, 3);
        assert_eq!(report.conflicts, 2);
        assert_eq!(report.created, 1);
        assert_eq!(report.dirtied, 1);
        assert_eq!(store.stats().queries, 3);
        assert_eq!(store.listeners().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_rounds() {
        let config = ListenerConfig::default().with_claim_rounds(2, 1);
        let (store, claim) = setup(&config).await;

        let mut locked = ListenerRecord::new_dirty(DbName::escape("a"), Utc::now());
        locked.locked_at = Some(Utc::now());
        let locked = store.insert_listener(locked).unwrap();
        store.interleave_writes(&locked.id, 10).unwrap();

        let err = claim.dirty_if_clean_or_locked(names(&["a"])).await.unwrap_err();
        assert_eq!(
            err,
            ClaimError::Unconverged {
                db_names: names(&["a"]),
                rounds: 2,
            }
        );
    }

    #[tokio::test]
    async fn missing_view_is_a_store_error() {
        let store = InMemoryListenerStore::arc();
        let scheduling = StoreScheduling::arc(store.clone());
        let claim = ClaimProtocol::new(store, scheduling, &ListenerConfig::default());

        let err = claim.dirty_if_clean_or_locked(names(&["a"])).await.unwrap_err();
        assert!(matches!(err, ClaimError::Store(StoreError::NotFound(_))));
    }

    #[test]
    fn pause_grows_with_round() {
        let store = InMemoryListenerStore::arc();
        let scheduling = StoreScheduling::arc(store.clone());
        let config = ListenerConfig::default().with_claim_rounds(10, 100);
        let claim = ClaimProtocol::new(store, scheduling, &config);

        let first = claim.pause_before(1);
        let third = claim.pause_before(3);
        assert!(first >= Duration::from_millis(90) && first <= Duration::from_millis(110));
        assert!(third > first);
    }
}
