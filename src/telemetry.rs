use tracing_subscriber::EnvFilter;

/// Filter applied when `RUST_LOG` is unset: engine internals at debug in
/// debug builds, info everywhere else.
const DEFAULT_DIRECTIVES: &str = if cfg!(debug_assertions) {
    "info,coda=debug"
} else {
    "info"
};

/// Install the global tracing subscriber for the embedding process.
///
/// Debug builds get human-readable output with targets; release builds emit
/// JSON lines for log aggregation. `RUST_LOG` overrides the default filter.
/// Calling this when a subscriber is already installed is a no-op, so tests
/// and embedders can both call it freely.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if cfg!(debug_assertions) {
        let _ = builder.try_init();
    } else {
        let _ = builder.json().try_init();
    }
}
