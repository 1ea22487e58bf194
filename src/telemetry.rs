use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber: an `EnvFilter` (`RUST_LOG`,
/// defaulting to `info`) plus a plain fmt layer. No OTLP export pipeline:
/// this system has no collector/infrastructure requirement, unlike the
/// teacher's telescope deployment.
pub fn init_tracing_subscriber(verbosity: u8) {
    let default_directive = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
