//! Process-wide tracing setup for job engine binaries and tests.

/// Initialize tracing with the filter from `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    self::tracing::init();
}

pub use self::tracing::{LogFormat, init_with_filter};

/// Subscriber configuration (filters, output format).
pub mod tracing;
