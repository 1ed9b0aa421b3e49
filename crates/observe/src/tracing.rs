use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

/// Initializes the global tracing subscriber with the given env-filter
/// directives (e.g. `"info,dispatcher=debug"`).
///
/// Safe to call more than once; only the first call installs a subscriber,
/// which keeps tests that share a process from panicking.
pub fn initialize(env_filter: &str) {
    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|err| {
        eprintln!("invalid log filter {env_filter:?}: {err}, falling back to \"info\"");
        EnvFilter::new("info")
    });
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}
