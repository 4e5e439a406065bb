//! Logging initialisation.

use tracing_subscriber::EnvFilter;

/// Initialise the global subscriber. `RUST_LOG` wins when set; otherwise the
/// command-line level applies to the whole tree.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}
