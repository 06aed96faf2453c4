use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use changewatch_core::{DbName, ListenerId, ListenerPatch, ListenerRecord, Revision};
use changewatch_events::{ChangesPage, PollOptions};

/// Id of the design document holding the listener index.
pub const LISTENERS_DESIGN_ID: &str = "_design/listeners";

/// Index of listener records keyed by (escaped) database name.
pub const LISTENERS_BY_DB_NAME: &str = "listeners/by_db_name";

/// Listener store operation error.
///
/// These are **infrastructure errors** as opposed to domain errors.
///
/// ## Error Categories
///
/// - **NotFound**: the target database, document or index does not exist
/// - **Storage**: anything else the backend reported
///
/// Stale revisions are not errors: `bulk_upsert` reports them per document
/// as [`WriteOutcome::Conflict`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Outcome of one document inside a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(Revision),
    /// Stale revision: someone else changed the document since it was read.
    Conflict,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkWriteResult {
    pub id: ListenerId,
    pub outcome: WriteOutcome,
}

impl BulkWriteResult {
    pub fn is_conflict(&self) -> bool {
        matches!(self.outcome, WriteOutcome::Conflict)
    }
}

/// An index (view) definition installed in the coordination database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    #[serde(rename = "_id")]
    pub id: String,
    pub views: BTreeMap<String, ViewSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSpec {
    pub map: String,
}

impl ViewDefinition {
    /// The listener index used by the claim protocol.
    pub fn listeners() -> Self {
        let map = "function (doc) { if (doc.type === 'listener') { emit(doc.db_name, null); } }";
        Self {
            id: LISTENERS_DESIGN_ID.to_string(),
            views: BTreeMap::from([(
                "by_db_name".to_string(),
                ViewSpec {
                    map: map.to_string(),
                },
            )]),
        }
    }

    /// Fully-qualified `design/view` names this definition provides.
    pub fn qualified_names(&self) -> impl Iterator<Item = String> + '_ {
        let design = self.id.trim_start_matches("_design/");
        self.views.keys().map(move |v| format!("{design}/{v}"))
    }
}

/// Document-store primitives the listener core is built on.
///
/// An adapter is bound to one coordination database (the collection holding
/// listener records and the listener index); change feeds are polled from
/// the watched databases by name.
///
/// ## Implementation Requirements
///
/// - `bulk_upsert` must check every document's `revision` against the stored
///   one and report per-document conflicts, preserving input order
/// - `merge_upsert` must retry internally against revision conflicts
/// - `poll_changes` must fail with [`StoreError::NotFound`] when the watched
///   database does not exist
#[async_trait]
pub trait ListenerStore: Send + Sync {
    /// Idempotent upsert of an index definition.
    async fn create_or_update(&self, view: &ViewDefinition) -> Result<(), StoreError>;

    /// Remove an index definition. Returns whether one existed.
    async fn get_and_destroy(&self, design_id: &str) -> Result<bool, StoreError>;

    /// Bulk lookup of listener records through `view`, keyed by db name.
    async fn query_by_keys(
        &self,
        view: &str,
        keys: &[DbName],
    ) -> Result<Vec<ListenerRecord>, StoreError>;

    async fn get(&self, id: &ListenerId) -> Result<Option<ListenerRecord>, StoreError>;

    /// Conditional write of every document; one result per input, in order.
    async fn bulk_upsert(
        &self,
        docs: Vec<ListenerRecord>,
    ) -> Result<Vec<BulkWriteResult>, StoreError>;

    /// Apply `patch` to the current revision of `id`, retrying on conflict.
    async fn merge_upsert(
        &self,
        id: &ListenerId,
        patch: &ListenerPatch,
    ) -> Result<ListenerRecord, StoreError>;

    /// Fetch one page of `db_name`'s change feed.
    async fn poll_changes(
        &self,
        db_name: &str,
        options: &PollOptions,
    ) -> Result<ChangesPage, StoreError>;
}

#[async_trait]
impl<S> ListenerStore for Arc<S>
where
    S: ListenerStore + ?Sized,
{
    async fn create_or_update(&self, view: &ViewDefinition) -> Result<(), StoreError> {
        (**self).create_or_update(view).await
    }

    async fn get_and_destroy(&self, design_id: &str) -> Result<bool, StoreError> {
        (**self).get_and_destroy(design_id).await
    }

    async fn query_by_keys(
        &self,
        view: &str,
        keys: &[DbName],
    ) -> Result<Vec<ListenerRecord>, StoreError> {
        (**self).query_by_keys(view, keys).await
    }

    async fn get(&self, id: &ListenerId) -> Result<Option<ListenerRecord>, StoreError> {
        (**self).get(id).await
    }

    async fn bulk_upsert(
        &self,
        docs: Vec<ListenerRecord>,
    ) -> Result<Vec<BulkWriteResult>, StoreError> {
        (**self).bulk_upsert(docs).await
    }

    async fn merge_upsert(
        &self,
        id: &ListenerId,
        patch: &ListenerPatch,
    ) -> Result<ListenerRecord, StoreError> {
        (**self).merge_upsert(id, patch).await
    }

    async fn poll_changes(
        &self,
        db_name: &str,
        options: &PollOptions,
    ) -> Result<ChangesPage, StoreError> {
        (**self).poll_changes(db_name, options).await
    }
}
