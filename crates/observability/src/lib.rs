//! Process-wide tracing setup.

/// Initialize process-wide tracing.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize with an explicit filter directive instead of `RUST_LOG`.
pub fn init_with_filter(directives: &str) {
    tracing::init_with_filter(directives);
}

/// Subscriber construction.
pub mod tracing;
