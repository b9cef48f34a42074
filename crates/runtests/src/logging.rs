//! Diagnostic logging.
//!
//! Diagnostics are `tracing` events written to stderr so they never mix with
//! the banners on stdout. `RUST_LOG` overrides the verbosity flag.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Level for a `-v` count: warn, info, debug, then trace.
#[must_use]
pub const fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Install the global subscriber at `level`. Later calls are no-ops.
pub fn init(level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_levels() {
        assert_eq!(level_for(0), Level::WARN);
        assert_eq!(level_for(1), Level::INFO);
        assert_eq!(level_for(2), Level::DEBUG);
        assert_eq!(level_for(7), Level::TRACE);
    }

    #[test]
    fn init_twice_is_harmless() {
        init(level_for(0));
        init(Level::TRACE);
    }
}
