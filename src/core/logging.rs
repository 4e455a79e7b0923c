//! Subscriber setup for the binary and worker processes
//!
//! Everything goes to stderr. A pipe worker's stdout carries its payload and
//! nothing else.

use tracing::Level;

/// Environment variable that overrides the verbosity flags (`error` ..
/// `trace`).
pub const LOG_ENV: &str = "FANJOIN_LOG";

/// Level for a count of `-v` flags
pub fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Level from `FANJOIN_LOG`, falling back to the verbosity flags.
pub fn resolve_level(verbosity: u8) -> Level {
    std::env::var(LOG_ENV)
        .ok()
        .and_then(|value| value.trim().parse::<Level>().ok())
        .unwrap_or_else(|| level_for(verbosity))
}

/// Install the global fmt subscriber. A second call is a no-op.
pub fn init(verbosity: u8) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(resolve_level(verbosity))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
