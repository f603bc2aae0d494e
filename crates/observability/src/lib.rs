//! Process-wide tracing setup shared by the ledger binaries.

pub mod tracing;

pub use crate::tracing::{LogFormat, TracingConfig};

/// Initialize tracing from the environment (`RUST_LOG`, `LOG_FORMAT`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    crate::tracing::init(TracingConfig::from_env());
}
