//! Tracing and logging setup shared by changewatch processes.

/// Initialize process-wide tracing from `RUST_LOG` / `CHANGEWATCH_LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Subscriber configuration (filters, output format).
pub mod tracing;

pub use self::tracing::{LogFormat, TracingConfig};
