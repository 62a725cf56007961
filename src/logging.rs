//! Logging setup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing for the command line tool.
///
/// `RUST_LOG` wins when set. Otherwise the level is `info`, or `debug` for
/// proxion itself when `verbose` is on.
pub fn init(verbose: bool) {
    let default = if verbose { "info,proxion=debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}
