//! `changewatch-core`: listener coordination building blocks.
//!
//! This crate contains **pure domain** primitives (no IO): listener identity,
//! the listener record and its state transitions, backoff policy and
//! configuration.

pub mod backoff;
pub mod config;
pub mod error;
pub mod id;
pub mod listener;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use config::ListenerConfig;
pub use error::{DomainError, DomainResult};
pub use id::{DbName, ListenerId, Revision, Seq, LISTENER_ID_PREFIX};
pub use listener::{ListenerPatch, ListenerRecord, LISTENER_DOC_TYPE};
