//! Process-wide `tracing` subscriber setup for the telc binaries.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "TELC_LOG";

/// Builds the filter: `TELC_LOG`, then `RUST_LOG`, then `default_level`.
pub fn env_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str().to_ascii_lowercase()))
}

/// Installs a formatting subscriber writing to stderr. Calling this twice is
/// harmless; the second installation is ignored.
pub fn init_logging(default_level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Verbosity flag count to a level, as the CLI's `-v` switches map it.
pub fn level_for_verbosity(verbose: u8) -> Level {
    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_increasing_levels() {
        assert_eq!(level_for_verbosity(0), Level::WARN);
        assert_eq!(level_for_verbosity(1), Level::INFO);
        assert_eq!(level_for_verbosity(2), Level::DEBUG);
        assert_eq!(level_for_verbosity(9), Level::TRACE);
    }

    #[test]
    fn repeated_init_does_not_panic() {
        init_logging(Level::WARN);
        init_logging(Level::DEBUG);
    }
}
