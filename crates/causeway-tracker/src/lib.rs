//! Causeway Tracker -- transactional capture of world mutations.
//!
//! Game logic runs inside *phases*: a cell tick, an explosion, a container
//! click. While a phase is active, every mutation routed through the
//! [`PhaseTracker`](tracker::PhaseTracker) is applied to the world at once
//! and recorded as a [`GameTransaction`](transaction::GameTransaction)
//! holding the state it replaced. When the phase ends the transactions are
//! grouped into domain events and handed to an observer bus. Observers may
//! cancel any event; cancelled mutations are reverted from their snapshots,
//! newest first, and accepted ones run their deferred side effects.
//!
//! # Quick Start
//!
//! ```
//! use causeway_tracker::prelude::*;
//! use causeway_world::prelude::*;
//!
//! let mut world = GridWorld::new();
//! let mut tracker = PhaseTracker::new(TrackerConfig::default());
//! let mut bus = RecordingBus::accepting();
//! let origin = CellPos::new(0, 64, 0);
//!
//! let ctx = PhaseContext::for_phase(Phase::Explosion)
//!     .with_source(Cause::Explosion { origin });
//! let (_, report) = tracker.run_phase(ctx, &mut world, &mut bus, |tracker, world| {
//!     for pos in origin.neighbors() {
//!         tracker.set_cell(world, pos, CellState::of(1), ChangeFlags::DEFAULT).unwrap();
//!     }
//! });
//!
//! // Explosions batch their cell changes into one event.
//! assert_eq!(report.events_fired, 1);
//! assert_eq!(report.committed, 6);
//! assert_eq!(bus.events()[0].transactions.len(), 6);
//! ```

#![deny(unsafe_code)]

pub mod cause;
pub mod config;
pub mod context;
pub mod effect;
pub mod event;
pub mod phase;
pub mod supplier;
pub mod tracker;
pub mod transaction;
pub mod unwind;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by tracker operations.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// A capture buffer was requested from a context that has none.
    #[error("phase {phase} is not capturing")]
    NotCapturing { phase: phase::Phase },

    /// The world refused a read or write.
    #[error(transparent)]
    World(#[from] causeway_world::WorldError),

    #[error("transaction {id} does not exist in this context")]
    UnknownTransaction { id: transaction::TransactionId },

    /// Configuration could not be parsed.
    #[error("invalid tracker configuration: {0}")]
    Config(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::cause::{Cause, CauseChain, CauseFrame, ContextKey, ContextValue, SpawnType};
    pub use crate::config::TrackerConfig;
    pub use crate::context::{CaptureFlags, CapturedSupplier, ItemDrop, PhaseContext};
    pub use crate::effect::{ChangeFlags, Effect, EffectPipeline, EffectStage};
    pub use crate::event::{AcceptAll, DomainEvent, EventTransaction, ObserverBus, RecordingBus};
    pub use crate::phase::{EventGrouping, Phase};
    pub use crate::supplier::TransactionalCaptureSupplier;
    pub use crate::tracker::{
        CellChangeOutcome, PhaseSummary, PhaseTracker, SpawnOutcome, StackSummary,
    };
    pub use crate::transaction::{
        EventKind, GameTransaction, InventoryAction, TransactionId, TransactionKind,
        TransactionState,
    };
    pub use crate::unwind::UnwindReport;
    pub use crate::TrackerError;
}
