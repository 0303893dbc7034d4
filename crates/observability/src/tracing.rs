//! JSON log output with an `EnvFilter`.
//!
//! Job lifecycle records are emitted under the `jobkeeper::jobs` target, so
//! `RUST_LOG=jobkeeper::jobs=info` isolates them from engine chatter.

use tracing_subscriber::EnvFilter;

/// Default directive when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Install the JSON subscriber, reading filters from `RUST_LOG`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    install(filter);
}

pub fn init_with_filter(directives: &str) {
    install(EnvFilter::new(directives));
}

fn install(filter: EnvFilter) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true)
        .with_current_span(false)
        .try_init();
}
