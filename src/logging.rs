//! Structured logging setup.
//!
//! Everything logs through `tracing`. The binary installs a `tracing-subscriber` formatter filtered
//! by `RUST_LOG`; without it the level is `info`, or `debug` when the config enables debug mode.

use tracing_subscriber::EnvFilter;

use crate::config::CrossTestConfig;

/// Install the global subscriber. A no-op if one is already installed (as in tests).
pub fn init(config: &CrossTestConfig) {
    let default_level = if config.debug { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Cut a logged payload down to `max` characters, marking the cut with `...`.
pub fn truncate(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message.to_string(),
    }
}
