//! Domain events and the observer bus contract.
//!
//! When a phase unwinds, its captured transactions are grouped into
//! [`DomainEvent`]s and handed to an [`ObserverBus`]. The bus answers one
//! question per event: was it cancelled? How observers are registered,
//! ordered or filtered is the bus's business.
//!
//! Any `FnMut(&DomainEvent) -> bool` is a bus:
//!
//! ```
//! use causeway_tracker::prelude::*;
//!
//! let mut cancel_explosions = |event: &DomainEvent| event.phase == Phase::Explosion;
//! fn takes_bus(_: &mut dyn ObserverBus) {}
//! takes_bus(&mut cancel_explosions);
//! ```

use causeway_world::cell::CellPos;
use causeway_world::snapshot::{EntitySnapshot, Snapshot};
use serde::Serialize;

use crate::cause::CauseFrame;
use crate::phase::Phase;
use crate::transaction::{EventKind, TransactionId};

// ---------------------------------------------------------------------------
// DomainEvent
// ---------------------------------------------------------------------------

/// One transaction as seen by observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventTransaction {
    pub id: TransactionId,
    pub parent: Option<TransactionId>,
    /// Transaction kind label, e.g. `"change_cell"`.
    pub kind: &'static str,
    pub original: Snapshot,
    pub resulting: Option<Snapshot>,
}

/// A cancellable, causally labeled event derived from captured mutations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainEvent {
    /// Dispatch index within the unwinding phase.
    pub sequence: u32,
    pub kind: EventKind,
    pub phase: Phase,
    pub frame: CauseFrame,
    /// Backing transactions in creation order. Empty for spawn events.
    pub transactions: Vec<EventTransaction>,
    /// Entities about to be spawned. Empty unless `kind` is
    /// [`EventKind::SpawnEntity`].
    pub entities: Vec<EntitySnapshot>,
}

impl DomainEvent {
    /// Positions of every cell-located snapshot this event touches, in
    /// transaction order, deduplicated.
    pub fn positions(&self) -> Vec<CellPos> {
        let mut out: Vec<CellPos> = Vec::new();
        let located = self
            .transactions
            .iter()
            .filter_map(|tx| tx.original.position())
            .chain(self.entities.iter().map(|e| e.pos));
        for pos in located {
            if !out.contains(&pos) {
                out.push(pos);
            }
        }
        out
    }

    /// Number of backing transactions plus entities.
    pub fn len(&self) -> usize {
        self.transactions.len() + self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// ObserverBus
// ---------------------------------------------------------------------------

/// Delivers domain events to observers.
pub trait ObserverBus {
    /// Deliver `event`. Returns `true` if an observer cancelled it.
    fn dispatch(&mut self, event: &DomainEvent) -> bool;
}

impl<F> ObserverBus for F
where
    F: FnMut(&DomainEvent) -> bool,
{
    fn dispatch(&mut self, event: &DomainEvent) -> bool {
        self(event)
    }
}

/// A bus with no observers. Nothing is ever cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ObserverBus for AcceptAll {
    fn dispatch(&mut self, _event: &DomainEvent) -> bool {
        false
    }
}

/// A bus that keeps every event it sees and cancels those matching a
/// predicate. Useful for diagnostics and tests.
pub struct RecordingBus {
    events: Vec<DomainEvent>,
    cancel: Box<dyn FnMut(&DomainEvent) -> bool + Send>,
}

impl RecordingBus {
    /// Record everything, cancel nothing.
    pub fn accepting() -> Self {
        Self::cancelling(|_| false)
    }

    /// Record everything, cancel events for which `predicate` holds.
    pub fn cancelling<F>(predicate: F) -> Self
    where
        F: FnMut(&DomainEvent) -> bool + Send + 'static,
    {
        Self {
            events: Vec::new(),
            cancel: Box::new(predicate),
        }
    }

    pub fn events(&self) -> &[DomainEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }
}

impl std::fmt::Debug for RecordingBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingBus")
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

impl ObserverBus for RecordingBus {
    fn dispatch(&mut self, event: &DomainEvent) -> bool {
        let cancelled = (self.cancel)(event);
        self.events.push(event.clone());
        cancelled
    }
}
