use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use changewatch_core::{DbName, ListenerId, ListenerPatch, ListenerRecord, Revision, Seq};
use changewatch_events::{Change, ChangesPage, PollOptions};

use super::r#trait::{BulkWriteResult, ListenerStore, StoreError, ViewDefinition, WriteOutcome};

/// Call counters, for asserting batching behaviour in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub queries: u64,
    pub bulk_upserts: u64,
    pub merges: u64,
    pub polls: u64,
}

#[derive(Debug, Default)]
struct Counters {
    queries: AtomicU64,
    bulk_upserts: AtomicU64,
    merges: AtomicU64,
    polls: AtomicU64,
}

#[derive(Debug, Default)]
struct Inner {
    docs: BTreeMap<ListenerId, ListenerRecord>,
    views: BTreeMap<String, ViewDefinition>,
    /// Watched databases: change feed per name, `seq` = position + 1.
    databases: HashMap<String, Vec<Change>>,
    /// Pending simulated interleaved writers per listener id.
    interleaved_writes: HashMap<ListenerId, u32>,
    failing_polls: HashMap<String, String>,
}

/// In-memory listener store.
///
/// Intended for tests/dev. Every call yields to the runtime before touching
/// state so concurrent callers interleave the way they would against a
/// remote store.
#[derive(Debug, Default)]
pub struct InMemoryListenerStore {
    inner: RwLock<Inner>,
    counters: Counters,
}

impl InMemoryListenerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::storage("lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::storage("lock poisoned"))
    }

    fn next_revision(previous: Option<&Revision>) -> Revision {
        let generation = previous.and_then(Revision::generation).unwrap_or(0) + 1;
        Revision::new(format!("{generation}-{}", Uuid::now_v7().simple()))
    }

    /// Create an empty watched database.
    pub fn create_database(&self, name: &str) -> Result<(), StoreError> {
        self.write()?.databases.entry(name.to_string()).or_default();
        Ok(())
    }

    /// Drop a watched database; later polls fail with `NotFound`.
    pub fn drop_database(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.write()?.databases.remove(name).is_some())
    }

    /// Append a document mutation to a watched database's feed.
    pub fn record_change(
        &self,
        db_name: &str,
        doc_id: &str,
        doc: JsonValue,
    ) -> Result<Seq, StoreError> {
        let mut inner = self.write()?;
        let feed = inner
            .databases
            .get_mut(db_name)
            .ok_or_else(|| StoreError::NotFound(format!("database {db_name}")))?;

        let seq = Seq::from(feed.len() as u64 + 1);
        let rev = format!("1-{}", Uuid::now_v7().simple());
        feed.push(
            Change::new(seq.clone(), doc_id)
                .with_rev(rev)
                .with_doc(doc),
        );
        Ok(seq)
    }

    /// Store `record` unconditionally (test setup), assigning a revision.
    pub fn insert_listener(
        &self,
        mut record: ListenerRecord,
    ) -> Result<ListenerRecord, StoreError> {
        let mut inner = self.write()?;
        let previous = inner.docs.get(&record.id).and_then(|r| r.revision.clone());
        record.revision = Some(Self::next_revision(previous.as_ref()));
        inner.docs.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    /// Make the next `times` bulk writes touching `id` lose a race: another
    /// writer dirties (or creates) the record first, so the write conflicts.
    pub fn interleave_writes(&self, id: &ListenerId, times: u32) -> Result<(), StoreError> {
        self.write()?.interleaved_writes.insert(id.clone(), times);
        Ok(())
    }

    /// Make the next poll of `db_name` fail with a storage error.
    pub fn fail_next_poll(
        &self,
        db_name: &str,
        message: impl Into<String>,
    ) -> Result<(), StoreError> {
        self.write()?
            .failing_polls
            .insert(db_name.to_string(), message.into());
        Ok(())
    }

    pub fn listeners(&self) -> Result<Vec<ListenerRecord>, StoreError> {
        Ok(self.read()?.docs.values().cloned().collect())
    }

    pub fn has_view(&self, design_id: &str) -> bool {
        self.read()
            .map(|inner| inner.views.contains_key(design_id))
            .unwrap_or(false)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            queries: self.counters.queries.load(Ordering::Relaxed),
            bulk_upserts: self.counters.bulk_upserts.load(Ordering::Relaxed),
            merges: self.counters.merges.load(Ordering::Relaxed),
            polls: self.counters.polls.load(Ordering::Relaxed),
        }
    }

    fn simulate_interleaved_writer(inner: &mut Inner, doc: &ListenerRecord) {
        let remaining = match inner.interleaved_writes.get_mut(&doc.id) {
            Some(n) if *n > 0 => {
                *n -= 1;
                *n
            }
            _ => return,
        };
        if remaining == 0 {
            inner.interleaved_writes.remove(&doc.id);
        }

        let now = Utc::now();
        match inner.docs.get_mut(&doc.id) {
            Some(stored) => {
                stored.revision = Some(Self::next_revision(stored.revision.as_ref()));
                stored.mark_dirty(now);
            }
            None => {
                let mut created = ListenerRecord::new_dirty(doc.db_name.clone(), now);
                created.id = doc.id.clone();
                created.revision = Some(Self::next_revision(None));
                inner.docs.insert(created.id.clone(), created);
            }
        }
    }
}

#[async_trait]
impl ListenerStore for InMemoryListenerStore {
    async fn create_or_update(&self, view: &ViewDefinition) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.write()?.views.insert(view.id.clone(), view.clone());
        Ok(())
    }

    async fn get_and_destroy(&self, design_id: &str) -> Result<bool, StoreError> {
        tokio::task::yield_now().await;
        Ok(self.write()?.views.remove(design_id).is_some())
    }

    async fn query_by_keys(
        &self,
        view: &str,
        keys: &[DbName],
    ) -> Result<Vec<ListenerRecord>, StoreError> {
        tokio::task::yield_now().await;
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        let inner = self.read()?;
        let installed = inner
            .views
            .values()
            .any(|def| def.qualified_names().any(|name| name == view));
        if !installed {
            return Err(StoreError::NotFound(format!("view {view}")));
        }

        let wanted: HashSet<&DbName> = keys.iter().collect();
        Ok(inner
            .docs
            .values()
            .filter(|r| wanted.contains(&r.db_name))
            .cloned()
            .collect())
    }

    async fn get(&self, id: &ListenerId) -> Result<Option<ListenerRecord>, StoreError> {
        tokio::task::yield_now().await;
        Ok(self.read()?.docs.get(id).cloned())
    }

    async fn bulk_upsert(
        &self,
        docs: Vec<ListenerRecord>,
    ) -> Result<Vec<BulkWriteResult>, StoreError> {
        tokio::task::yield_now().await;
        self.counters.bulk_upserts.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.write()?;
        let mut results = Vec::with_capacity(docs.len());

        for mut doc in docs {
            Self::simulate_interleaved_writer(&mut inner, &doc);

            let current = inner.docs.get(&doc.id).and_then(|r| r.revision.clone());
            if doc.revision != current {
                results.push(BulkWriteResult {
                    id: doc.id,
                    outcome: WriteOutcome::Conflict,
                });
                continue;
            }

            let revision = Self::next_revision(current.as_ref());
            doc.revision = Some(revision.clone());
            let id = doc.id.clone();
            inner.docs.insert(id.clone(), doc);
            results.push(BulkWriteResult {
                id,
                outcome: WriteOutcome::Written(revision),
            });
        }

        Ok(results)
    }

    async fn merge_upsert(
        &self,
        id: &ListenerId,
        patch: &ListenerPatch,
    ) -> Result<ListenerRecord, StoreError> {
        tokio::task::yield_now().await;
        self.counters.merges.fetch_add(1, Ordering::Relaxed);

        // The write lock makes read-patch-write atomic, so there is never a
        // conflict to retry here.
        let mut inner = self.write()?;
        let record = inner
            .docs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("listener {id}")))?;

        patch.apply_to(record);
        record.revision = Some(Self::next_revision(record.revision.as_ref()));
        Ok(record.clone())
    }

    async fn poll_changes(
        &self,
        db_name: &str,
        options: &PollOptions,
    ) -> Result<ChangesPage, StoreError> {
        tokio::task::yield_now().await;
        self.counters.polls.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.write()?;
        if let Some(message) = inner.failing_polls.remove(db_name) {
            return Err(StoreError::Storage(message));
        }

        let feed = inner
            .databases
            .get(db_name)
            .ok_or_else(|| StoreError::NotFound(format!("database {db_name}")))?;

        let since = options.since.as_ref().and_then(Seq::as_u64).unwrap_or(0);
        let skip = usize::try_from(since).unwrap_or(usize::MAX);

        let results: Vec<Change> = feed
            .iter()
            .skip(skip)
            .take(options.limit)
            .map(|change| {
                let mut change = change.clone();
                if !options.include_docs {
                    change.doc = None;
                }
                change
            })
            .collect();

        let consumed = skip.saturating_add(results.len());
        let last_seq = results
            .last()
            .map(|c| c.seq.clone())
            .unwrap_or_else(|| Seq::from(since.min(feed.len() as u64)));

        Ok(ChangesPage {
            pending: feed.len() > consumed,
            last_seq,
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(name: &str) -> ListenerRecord {
        ListenerRecord::new_dirty(DbName::escape(name), Utc::now())
    }

    #[tokio::test]
    async fn bulk_upsert_detects_stale_revisions() {
        let store = InMemoryListenerStore::new();

        let created = store.bulk_upsert(vec![listener("a")]).await.unwrap();
        let rev = match &created[0].outcome {
            WriteOutcome::Written(rev) => rev.clone(),
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(rev.generation(), Some(1));

        // Writing without the revision is a conflict once the doc exists.
        let again = store.bulk_upsert(vec![listener("a")]).await.unwrap();
        assert!(again[0].is_conflict());

        let mut current = store.get(&created[0].id).await.unwrap().unwrap();
        current.dirty = false;
        let updated = store.bulk_upsert(vec![current]).await.unwrap();
        assert!(matches!(
            updated[0].outcome,
            WriteOutcome::Written(ref r) if r.generation() == Some(2)
        ));
    }

    #[tokio::test]
    async fn query_requires_installed_view() {
        let store = InMemoryListenerStore::new();
        let keys = vec![DbName::escape("a")];

        let err = store
            .query_by_keys(super::super::LISTENERS_BY_DB_NAME, &keys)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        store.create_or_update(&ViewDefinition::listeners()).await.unwrap();
        store.insert_listener(listener("a")).unwrap();
        store.insert_listener(listener("b")).unwrap();

        let found = store
            .query_by_keys(super::super::LISTENERS_BY_DB_NAME, &keys)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].db_name, DbName::escape("a"));
    }

    #[tokio::test]
    async fn poll_pages_through_feed() {
        let store = InMemoryListenerStore::new();
        store.create_database("orders").unwrap();
        for i in 0..5 {
            store
                .record_change("orders", &format!("doc-{i}"), serde_json::json!({"i": i}))
                .unwrap();
        }

        let first = store
            .poll_changes("orders", &PollOptions::since(None, 2))
            .await
            .unwrap();
        assert_eq!(first.results.len(), 2);
        assert_eq!(first.last_seq, Seq::from(2));
        assert!(first.pending);
        assert!(first.results[0].doc.is_some());

        let rest = store
            .poll_changes("orders", &PollOptions::since(Some(first.last_seq), 10))
            .await
            .unwrap();
        assert_eq!(rest.results.len(), 3);
        assert_eq!(rest.last_seq, Seq::from(5));
        assert!(!rest.pending);

        let idle = store
            .poll_changes("orders", &PollOptions::since(Some(rest.last_seq), 10))
            .await
            .unwrap();
        assert!(idle.is_empty());
        assert_eq!(idle.last_seq, Seq::from(5));
    }

    #[tokio::test]
    async fn poll_of_missing_database_is_not_found() {
        let store = InMemoryListenerStore::new();
        let err = store
            .poll_changes("gone", &PollOptions::since(None, 10))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn merge_upsert_applies_patch_on_current_revision() {
        let store = InMemoryListenerStore::new();
        let stored = store.insert_listener(listener("a")).unwrap();

        let patch = ListenerPatch {
            retries: Some(2),
            ..Default::default()
        };
        let merged = store.merge_upsert(&stored.id, &patch).await.unwrap();

        assert_eq!(merged.retries, 2);
        assert_ne!(merged.revision, stored.revision);
        assert_eq!(store.stats().merges, 1);
    }

    #[tokio::test]
    async fn interleaved_writer_forces_conflict() {
        let store = InMemoryListenerStore::new();
        let doc = listener("a");
        store.interleave_writes(&doc.id, 1).unwrap();

        let first = store.bulk_upsert(vec![doc.clone()]).await.unwrap();
        assert!(first[0].is_conflict());
        assert_eq!(store.listeners().unwrap().len(), 1);

        let current = store.get(&doc.id).await.unwrap().unwrap();
        let second = store.bulk_upsert(vec![current]).await.unwrap();
        assert!(!second[0].is_conflict());
    }
}
