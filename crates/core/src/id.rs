//! Strongly-typed identifiers used across the listener domain.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};

/// Prefix of every listener document id.
///
/// Listener ids are `prefix + escaped db name`, so reserved names such as
/// `_users` stay usable as suffixes.
pub const LISTENER_ID_PREFIX: &str = "cw_listener_";

/// Name of a watched database, held in its escaped (percent-encoded) form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DbName(String);

/// Identifier of a listener document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(String);

/// Store-assigned optimistic concurrency token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

macro_rules! impl_string_newtype {
    ($t:ty) => {
        impl $t {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_string_newtype!(DbName);
impl_string_newtype!(ListenerId);
impl_string_newtype!(Revision);

impl DbName {
    /// Escape a raw database name (e.g. `team/orders` becomes `team%2Forders`).
    pub fn escape(raw: &str) -> Self {
        Self(urlencoding::encode(raw).into_owned())
    }

    /// Wrap a name that is already escaped, as read from a record or a
    /// change notification.
    pub fn from_escaped(escaped: impl Into<String>) -> Self {
        Self(escaped.into())
    }

    /// Reverse the escaping applied when the name was captured.
    pub fn decode(&self) -> DomainResult<String> {
        urlencoding::decode(&self.0)
            .map(Cow::into_owned)
            .map_err(|e| DomainError::invalid_id(format!("DbName '{}': {e}", self.0)))
    }
}

impl ListenerId {
    /// Deterministic listener id for a database, using [`LISTENER_ID_PREFIX`].
    pub fn for_db(db_name: &DbName) -> Self {
        Self::with_prefix(LISTENER_ID_PREFIX, db_name)
    }

    pub fn with_prefix(prefix: &str, db_name: &DbName) -> Self {
        Self(format!("{prefix}{}", db_name.as_str()))
    }
}

impl Revision {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Leading generation counter of a `"<n>-<suffix>"` revision, if present.
    pub fn generation(&self) -> Option<u64> {
        self.0.split_once('-').and_then(|(n, _)| n.parse().ok())
    }
}

/// Opaque resume cursor into a database's change feed.
///
/// Stores differ on the cursor shape (integer or string), so the raw JSON
/// value is kept as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq(JsonValue);

impl Seq {
    pub fn as_u64(&self) -> Option<u64> {
        match &self.0 {
            JsonValue::Number(n) => n.as_u64(),
            JsonValue::String(s) => s.split('-').next().and_then(|n| n.parse().ok()),
            _ => None,
        }
    }
}

impl From<u64> for Seq {
    fn from(value: u64) -> Self {
        Self(JsonValue::from(value))
    }
}

impl From<&str> for Seq {
    fn from(value: &str) -> Self {
        Self(JsonValue::from(value))
    }
}

impl core::fmt::Display for Seq {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.0 {
            JsonValue::String(s) => f.write_str(s),
            other => write!(f, "{other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_id_is_prefix_plus_escaped_name() {
        let db = DbName::escape("orders");
        assert_eq!(ListenerId::for_db(&db).as_str(), "cw_listener_orders");

        let reserved = DbName::escape("_users");
        assert_eq!(ListenerId::for_db(&reserved).as_str(), "cw_listener__users");
    }

    #[test]
    fn escape_then_decode_restores_slashes() {
        let db = DbName::escape("team/orders");
        assert_eq!(db.as_str(), "team%2Forders");
        assert_eq!(db.decode().unwrap(), "team/orders");
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        let db = DbName::from_escaped("bad%FF%FE");
        assert!(matches!(db.decode(), Err(DomainError::InvalidId(_))));
    }

    #[test]
    fn revision_generation_parses_prefix() {
        assert_eq!(Revision::new("3-abc").generation(), Some(3));
        assert_eq!(Revision::new("opaque").generation(), None);
    }

    #[test]
    fn seq_accepts_numbers_and_strings() {
        assert_eq!(Seq::from(42).as_u64(), Some(42));
        assert_eq!(Seq::from("17-g1AAAA").as_u64(), Some(17));
        assert_eq!(Seq::from("17-g1AAAA").to_string(), "17-g1AAAA");
    }
}
