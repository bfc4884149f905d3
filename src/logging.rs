//! Logging setup for the command-line binary

use env_logger::{Builder, Env};
use log::LevelFilter;

/// Initialize the logger with the given verbosity, honoring `RUST_LOG` when
/// set.
pub fn initialize_logger(filter: LevelFilter) {
    Builder::from_env(Env::default().default_filter_or(filter.as_str()))
        .format_target(false)
        .init();
}
