//! Listener records: shared, crash-safe "someone must watch database X" state.
//!
//! A listener record exists once per watched database and is mutated by three
//! parties: the claim protocol (dirty transitions), the batch engine
//! (`last_seq`) and the retry scheduler (`dirty_at`, `retries`). Every write is
//! conditioned on the record's `revision`; nothing here performs IO.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{DbName, ListenerId, Revision, Seq};

/// Document type tag stored on every listener record.
pub const LISTENER_DOC_TYPE: &str = "listener";

/// A listener record as stored in the document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerRecord {
    #[serde(rename = "_id")]
    pub id: ListenerId,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
    #[serde(rename = "type")]
    pub doc_type: String,
    /// Escaped database name; call [`DbName::decode`] before using it.
    pub db_name: DbName,
    #[serde(default)]
    pub dirty: bool,
    /// Not eligible for processing before this instant (backoff).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirty_at: Option<DateTime<Utc>>,
    /// Advisory marker: a worker holds an active change-feed session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<Seq>,
    #[serde(default)]
    pub retries: u32,
    pub updated_at: DateTime<Utc>,
}

impl ListenerRecord {
    /// A fresh, never-written record that is already dirty.
    pub fn new_dirty(db_name: DbName, now: DateTime<Utc>) -> Self {
        Self {
            id: ListenerId::for_db(&db_name),
            revision: None,
            doc_type: LISTENER_DOC_TYPE.to_string(),
            db_name,
            dirty: true,
            dirty_at: None,
            locked_at: None,
            last_seq: None,
            retries: 0,
            updated_at: now,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    /// Eligible to be (re-)dirtied by a claimer.
    ///
    /// A held lock never exempts a record: the session behind it may be
    /// working from a stale revision and has to be forced to re-check.
    pub fn is_claimable(&self) -> bool {
        !self.dirty || self.is_locked()
    }

    /// Already dirty and waiting for a worker; claimers skip it.
    pub fn is_queued(&self) -> bool {
        self.dirty && !self.is_locked()
    }

    /// Flag the record as needing a pass. `locked_at` is left untouched.
    pub fn mark_dirty(&mut self, now: DateTime<Utc>) {
        self.dirty = true;
        self.updated_at = now;
    }

    /// Whether a backoff delay (if any) has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.dirty_at.is_none_or(|at| at <= now)
    }

    /// Whether someone touched the scheduling marker after `marker` was
    /// captured, i.e. the record was re-dirtied concurrently.
    pub fn dirtied_since(&self, marker: DateTime<Utc>) -> bool {
        self.updated_at != marker
    }
}

/// Partial update applied by `merge_upsert`.
///
/// Absent fields are left alone. Nullable columns use `Option<Option<_>>`:
/// `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerPatch {
    pub dirty: Option<bool>,
    pub dirty_at: Option<Option<DateTime<Utc>>>,
    pub locked_at: Option<Option<DateTime<Utc>>>,
    pub last_seq: Option<Option<Seq>>,
    pub retries: Option<u32>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ListenerPatch {
    /// Advance the resume position after a clean batch.
    ///
    /// Leaves `updated_at` alone: only claimers and the retry scheduler move
    /// the re-dirty marker.
    pub fn advance(last_seq: Seq) -> Self {
        Self {
            last_seq: Some(Some(last_seq)),
            retries: Some(0),
            ..Default::default()
        }
    }

    /// Clear the failure counter without touching anything else.
    pub fn reset_retries() -> Self {
        Self {
            retries: Some(0),
            ..Default::default()
        }
    }

    /// Carry the scheduling fields of `record` (dirty, dirty_at, retries,
    /// updated_at) onto whatever revision is current in the store.
    pub fn scheduling_of(record: &ListenerRecord) -> Self {
        Self {
            dirty: Some(record.dirty),
            dirty_at: Some(record.dirty_at),
            retries: Some(record.retries),
            updated_at: Some(record.updated_at),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, record: &mut ListenerRecord) {
        if let Some(dirty) = self.dirty {
            record.dirty = dirty;
        }
        if let Some(dirty_at) = self.dirty_at {
            record.dirty_at = dirty_at;
        }
        if let Some(locked_at) = self.locked_at {
            record.locked_at = locked_at;
        }
        if let Some(last_seq) = &self.last_seq {
            record.last_seq = last_seq.clone();
        }
        if let Some(retries) = self.retries {
            record.retries = retries;
        }
        if let Some(updated_at) = self.updated_at {
            record.updated_at = updated_at;
        }
    }
}
