use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use changewatch_core::Seq;

/// One entry of a database's change feed.
///
/// Notes:
/// - `seq` is the feed position *after* this change.
/// - `doc` is only populated when the page was polled with `include_docs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub seq: Seq,
    /// Id of the mutated document.
    pub id: String,
    #[serde(default)]
    pub changes: Vec<ChangeRev>,
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<JsonValue>,
}

/// Leaf revision reported for a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRev {
    pub rev: String,
}

impl Change {
    pub fn new(seq: impl Into<Seq>, id: impl Into<String>) -> Self {
        Self {
            seq: seq.into(),
            id: id.into(),
            changes: Vec::new(),
            deleted: false,
            doc: None,
        }
    }

    pub fn with_rev(mut self, rev: impl Into<String>) -> Self {
        self.changes.push(ChangeRev { rev: rev.into() });
        self
    }

    pub fn with_doc(mut self, doc: JsonValue) -> Self {
        self.doc = Some(doc);
        self
    }

    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }
}

/// One page of a change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesPage {
    pub results: Vec<Change>,
    /// Cursor to resume from after this page.
    pub last_seq: Seq,
    /// More changes are waiting beyond this page.
    pub pending: bool,
}

impl ChangesPage {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Parameters of a single change-feed poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOptions {
    /// Resume position; `None` starts from the beginning of the feed.
    pub since: Option<Seq>,
    pub limit: usize,
    pub include_docs: bool,
}

impl PollOptions {
    pub fn since(since: Option<Seq>, limit: usize) -> Self {
        Self {
            since,
            limit,
            include_docs: true,
        }
    }
}
