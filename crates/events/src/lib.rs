//! Change-feed messages and the downstream dispatch seam.

pub mod change;
pub mod dispatch;

pub use change::{Change, ChangeRev, ChangesPage, PollOptions};
pub use dispatch::{ChangeDispatcher, DispatchError, PendingOp, PendingOps};
