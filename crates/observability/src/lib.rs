//! Tracing/logging setup shared by the courier binaries.

/// Initialize process-wide JSON logging to stdout.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&tracing::LogConfig::default());
}

/// Tracing configuration (filters, formats).
pub mod tracing;
