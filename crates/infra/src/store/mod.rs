//! Listener store boundary.
//!
//! This module defines the document-store primitives the listener core
//! consumes, plus an in-memory implementation for tests/dev.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::{InMemoryListenerStore, StoreStats};
pub use r#trait::{
    BulkWriteResult, ListenerStore, StoreError, ViewDefinition, ViewSpec, WriteOutcome,
    LISTENERS_BY_DB_NAME, LISTENERS_DESIGN_ID,
};
