//! Logging initialization for embedding services and tests.

use tracing_subscriber::EnvFilter;

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "dashcast=info,process_utils=info";

/// Initialize a fmt subscriber with the default filter.
///
/// `RUST_LOG` overrides the default directive. Safe to call more than once;
/// subsequent calls are no-ops.
pub fn init() {
    init_with_filter(DEFAULT_LOG_FILTER);
}

/// Initialize a fmt subscriber with an explicit filter directive.
pub fn init_with_filter(directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
