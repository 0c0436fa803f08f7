//! Process runtime: CLI surface, configuration assembly, structured
//! component shutdown, and log initialization.

pub mod cli;
pub mod component;
pub mod conf;
pub mod shutdown;

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `--debug` lowers the default filter to debug; `RUST_LOG` still wins when
/// set so individual modules can be dialed up without a rebuild.
pub fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
