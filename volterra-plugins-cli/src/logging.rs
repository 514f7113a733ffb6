//! Logging setup for the CLI
//!
//! Logs go to stderr so stdout carries only the JSON output of a command.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Level selected by the global verbosity flags
pub fn level_for(verbose: bool, debug: bool, quiet: bool) -> Level {
    if quiet {
        Level::ERROR
    } else if debug {
        Level::DEBUG
    } else if verbose {
        Level::TRACE
    } else {
        Level::INFO
    }
}

/// Install the stderr subscriber; `RUST_LOG` takes precedence over the flags
pub fn init(verbose: bool, debug: bool, quiet: bool) {
    let level = level_for(verbose, debug, quiet);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_wins_over_other_flags() {
        assert_eq!(level_for(true, true, true), Level::ERROR);
        assert_eq!(level_for(true, true, false), Level::DEBUG);
        assert_eq!(level_for(true, false, false), Level::TRACE);
        assert_eq!(level_for(false, false, false), Level::INFO);
    }
}
