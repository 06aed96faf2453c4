//! Infrastructure layer: listener store, claim protocol, batch engine and
//! retry scheduling.

pub mod batch;
pub mod claim;
pub mod driver;
pub mod process;
pub mod retry;
pub mod scheduling;
pub mod store;

#[cfg(test)]
mod test_support;

pub use batch::{BatchEngine, BatchError, BatchOutcome, BatchReport};
pub use claim::{ClaimError, ClaimProtocol, ClaimReport};
pub use driver::{DrainSummary, ListenerDriver};
pub use process::ListenerProcess;
pub use retry::{RetryDecision, RetryScheduler};
pub use scheduling::{Scheduling, SchedulingError, StoreScheduling, WakeupNotifier};
pub use store::{InMemoryListenerStore, ListenerStore, StoreError};
