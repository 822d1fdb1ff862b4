//! Tracker configuration.

use serde::{Deserialize, Serialize};

use crate::TrackerError;

/// Knobs for a [`PhaseTracker`](crate::tracker::PhaseTracker).
///
/// Every field has a default, so a JSON document only needs the fields it
/// changes:
///
/// ```
/// use causeway_tracker::config::TrackerConfig;
///
/// let config = TrackerConfig::from_json_str(r#"{ "max_phase_depth": 16 }"#).unwrap();
/// assert_eq!(config.max_phase_depth, 16);
/// assert!(config.record_journal);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Phases that may be stacked above the idle floor before the tracker
    /// treats the nesting as runaway recursion and panics.
    pub max_phase_depth: usize,
    /// Write resolutions to the per-tick journal.
    pub record_journal: bool,
    /// Restore the captured transactions of a phase whose body panicked.
    /// When off, the mutations are left in place and only logged.
    pub restore_on_abort: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_phase_depth: 128,
            record_journal: true,
            restore_on_abort: true,
        }
    }
}

impl TrackerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, TrackerError> {
        Ok(serde_json::from_str(json)?)
    }
}
