//! Telemetry helpers for structured logging and tracing.

/// Install a default `fmt` subscriber driven by `RUST_LOG`.
///
/// Does nothing if the embedding application already installed a global
/// subscriber.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .try_init();
}
