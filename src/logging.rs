use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const DEFAULT_FILTER: &str = "medisense=info";

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_FILTER.into(),
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}
