//! Process-wide logging setup shared by every pipeline entry point.

/// Tracing subscriber configuration (filters, JSON formatting).
pub mod tracing;

pub use crate::tracing::{LogFormat, init_with};

/// Initialize JSON logging filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}
