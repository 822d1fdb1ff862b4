//! Log subscriber setup.
//!
//! Every crate in the workspace logs through `tracing` macros. Nothing is
//! printed until a subscriber is installed, normally once at startup:
//!
//! ```no_run
//! causeway_engine::logging::init(causeway_engine::logging::DEFAULT_FILTER).unwrap();
//! ```
//!
//! `RUST_LOG` overrides the default filter, e.g.
//! `RUST_LOG=causeway_tracker=debug` to see every capture and resolution.

use tracing_subscriber::EnvFilter;

use crate::EngineError;

/// Filter used when `RUST_LOG` is unset. Capture inconsistencies, conflicts
/// and restore failures are all logged at `warn` or above.
pub const DEFAULT_FILTER: &str = "warn";

/// Install a global `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`.
///
/// Fails if a global subscriber is already installed.
pub fn init(default_filter: &str) -> Result<(), EngineError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .map_err(|err| EngineError::Logging(err.to_string()))
}

/// Install a `debug` subscriber that writes through the test harness so
/// output only shows for failing tests. Safe to call from every test.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_can_be_installed_repeatedly() {
        init_for_tests();
        init_for_tests();
        tracing::debug!(answer = 42, "still logging");
    }

    #[test]
    fn second_global_install_is_an_error() {
        init_for_tests();
        let err = init(DEFAULT_FILTER).unwrap_err();
        assert!(matches!(err, EngineError::Logging(_)));
    }
}
