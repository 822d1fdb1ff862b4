//! Causeway Engine -- tick loop and task scheduler around the phase tracker.
//!
//! This crate drives a world through [`causeway_tracker`]: a fixed-timestep
//! tick loop that runs systems in declaration order, each inside its own
//! phase, followed by the scheduled tasks due that tick. It also installs the
//! `tracing` subscriber the other crates log through.
//!
//! # Quick Start
//!
//! ```
//! use causeway_engine::prelude::*;
//!
//! // Observers veto every explosion.
//! let bus = RecordingBus::cancelling(|event| event.phase == Phase::Explosion);
//! let mut tick_loop = TickLoop::with_bus(GridWorld::new(), bus, TickConfig::default());
//!
//! tick_loop.add_system("creeper", Phase::Explosion, |tracker, world| {
//!     for pos in CellPos::new(0, 64, 0).neighbors() {
//!         tracker.set_cell(world, pos, CellState::of(1), ChangeFlags::DEFAULT).unwrap();
//!     }
//! });
//!
//! let cancelled = tick_loop.run_ticks(5);
//! assert_eq!(cancelled, 5);
//! assert_eq!(tick_loop.world().cell(CellPos::new(1, 64, 0)), CellState::AIR);
//! ```

#![deny(unsafe_code)]

pub mod logging;
pub mod scheduler;
pub mod tick;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the tracker crate for convenience.
pub use causeway_tracker;

/// Re-export the world crate for convenience.
pub use causeway_world;

/// Re-export the journal crate for convenience.
pub use causeway_journal;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by engine setup and diagnostics export.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The configuration document could not be parsed.
    #[error("invalid tick configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("fixed_dt must be positive and finite, got {0}")]
    InvalidTimestep(f64),

    #[error(transparent)]
    Journal(#[from] causeway_journal::JournalError),

    /// A global log subscriber was already installed.
    #[error("failed to install log subscriber: {0}")]
    Logging(String),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    pub use causeway_tracker::prelude::*;
    pub use causeway_world::prelude::*;

    pub use crate::scheduler::{Scheduler, TaskFn, TaskId, TaskRun};
    pub use crate::tick::{SystemFn, TickConfig, TickDiagnostics, TickLoop};
    pub use crate::EngineError;

    pub use causeway_journal::journal::{JournalEntry, JournalSummary, Resolution, TransactionJournal};
}
