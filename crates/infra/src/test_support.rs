//! Shared test doubles.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use changewatch_events::{Change, ChangeDispatcher, DispatchError, PendingOps};

/// Dispatcher that records hand-off and completion order.
///
/// A change whose document carries `"delay_ms"` completes after that delay,
/// which lets tests force out-of-order completion.
#[derive(Debug, Default)]
pub(crate) struct RecordingDispatcher {
    dispatched: Mutex<Vec<String>>,
    completed: Arc<Mutex<Vec<String>>>,
    failing: Mutex<HashSet<String>>,
    refusing: Mutex<HashSet<String>>,
}

impl RecordingDispatcher {
    pub(crate) fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The outbound operation for `doc_id` fails.
    pub(crate) fn fail_on(&self, doc_id: &str) {
        self.failing.lock().unwrap().insert(doc_id.to_string());
    }

    /// `dispatch` itself errors for `doc_id`, before issuing anything.
    pub(crate) fn refuse(&self, doc_id: &str) {
        self.refusing.lock().unwrap().insert(doc_id.to_string());
    }

    pub(crate) fn heal(&self) {
        self.failing.lock().unwrap().clear();
        self.refusing.lock().unwrap().clear();
    }

    pub(crate) fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().unwrap().clone()
    }

    pub(crate) fn completed(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangeDispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        change: &Change,
        _db_name: &str,
        pending: &mut PendingOps,
    ) -> Result<(), DispatchError> {
        let refused = self.refusing.lock().unwrap().contains(&change.id);
        if refused {
            return Err(DispatchError::Rejected {
                status: 400,
                message: format!("{} refused", change.id),
            });
        }
        self.dispatched.lock().unwrap().push(change.id.clone());

        let fail = self.failing.lock().unwrap().contains(&change.id);
        let delay = change
            .doc
            .as_ref()
            .and_then(|doc| doc.get("delay_ms"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let completed = Arc::clone(&self.completed);
        let id = change.id.clone();

        pending.push(Box::pin(async move {
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            completed.lock().unwrap().push(id.clone());
            if fail {
                Err(DispatchError::downstream(format!("{id} failed")))
            } else {
                Ok(())
            }
        }));
        Ok(())
    }
}
