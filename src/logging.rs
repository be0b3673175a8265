//! Tracing subscriber setup for the `codectx` binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a stderr fmt subscriber. `RUST_LOG` overrides `filter`.
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init(filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}
