//! Downstream dispatch seam.
//!
//! A dispatcher turns one [`Change`] into outbound work. Dispatch itself is
//! invoked strictly in feed order; the outbound operations it produces are
//! pushed onto a [`PendingOps`] accumulator and awaited together once the
//! whole page has been handed off.
//!
//! ```ignore
//! let mut pending = PendingOps::new();
//! for change in &page.results {
//!     dispatcher.dispatch(change, &db_name, &mut pending).await?;
//! }
//! pending.join_all().await?;
//! ```

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use thiserror::Error;
use tracing::debug;

use crate::change::Change;

/// An outbound operation that failed (or could not be issued).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The downstream endpoint could not be reached or errored.
    #[error("downstream failure: {0}")]
    Downstream(String),

    /// The downstream endpoint answered with a rejection.
    #[error("downstream rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl DispatchError {
    pub fn downstream(msg: impl Into<String>) -> Self {
        Self::Downstream(msg.into())
    }
}

/// One outbound operation. Futures are lazy: it starts running when the
/// page is joined, not when it is pushed.
pub type PendingOp = BoxFuture<'static, Result<(), DispatchError>>;

/// Accumulator of outbound operations produced while dispatching a page.
#[derive(Default)]
pub struct PendingOps {
    ops: Vec<PendingOp>,
}

impl PendingOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: PendingOp) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Await every operation, in any completion order.
    ///
    /// No operation is abandoned when another fails: all run to completion,
    /// then the first failure (in push order) is returned. On success the
    /// number of completed operations is returned.
    pub async fn join_all(self) -> Result<usize, DispatchError> {
        let total = self.ops.len();
        let results = future::join_all(self.ops).await;

        let mut errors = results.into_iter().filter_map(Result::err);
        match errors.next() {
            Some(err) => {
                let failed = 1 + errors.count();
                debug!(total, failed, error = %err, "outbound operations failed");
                Err(err)
            }
            None => Ok(total),
        }
    }
}

impl core::fmt::Debug for PendingOps {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PendingOps").field("len", &self.ops.len()).finish()
    }
}

/// Forwards a single change downstream.
///
/// Implementations should return quickly: anything slow belongs in the
/// future pushed onto `pending`. Pushed futures only start once the whole
/// page has been handed off and [`PendingOps::join_all`] runs. Work that must
/// start at hand-off should be `tokio::spawn`ed, with a future awaiting its
/// `JoinHandle` pushed instead.
///
/// An `Err` from `dispatch` itself means the change could not even be
/// handed off.
#[async_trait]
pub trait ChangeDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        change: &Change,
        db_name: &str,
        pending: &mut PendingOps,
    ) -> Result<(), DispatchError>;
}

#[async_trait]
impl<D> ChangeDispatcher for std::sync::Arc<D>
where
    D: ChangeDispatcher + ?Sized,
{
    async fn dispatch(
        &self,
        change: &Change,
        db_name: &str,
        pending: &mut PendingOps,
    ) -> Result<(), DispatchError> {
        (**self).dispatch(change, db_name, pending).await
    }
}
