//! Per-phase capture state.
//!
//! A [`PhaseContext`] is created by the call site that enters a phase and
//! handed to [`PhaseTracker::push_cause_frame`]. It carries the provenance of
//! the phase (source, owner, notifier) and, for phases that capture, the
//! buffers mutations are recorded into until the phase unwinds.
//!
//! Buffers are allocated lazily by [`PhaseContext::add_captures`]. A context
//! that is never expected to capture anything allocates none, and asking it
//! for a buffer fails with [`TrackerError::NotCapturing`].
//!
//! ```
//! use causeway_tracker::prelude::*;
//! use causeway_world::prelude::*;
//!
//! let mut ctx = PhaseContext::new(Phase::Explosion)
//!     .with_source(Cause::Explosion { origin: CellPos::new(0, 64, 0) })
//!     .with_owner(EntityId::new(1, 0))
//!     .add_captures();
//!
//! assert!(ctx.is_capturing());
//! assert!(ctx.captured_entity_supplier().unwrap().is_empty());
//! ```
//!
//! [`PhaseTracker::push_cause_frame`]: crate::tracker::PhaseTracker::push_cause_frame

use causeway_world::cell::{CellPos, ScheduledCellEvent};
use causeway_world::entity::EntityId;
use causeway_world::item::ItemStack;
use causeway_world::snapshot::EntitySnapshot;
use serde::{Deserialize, Serialize};

use crate::cause::{Cause, CauseFrame, ContextKey, ContextValue};
use crate::phase::Phase;
use crate::supplier::TransactionalCaptureSupplier;
use crate::TrackerError;

// ---------------------------------------------------------------------------
// CaptureFlags
// ---------------------------------------------------------------------------

/// Per-invocation capture overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureFlags {
    /// Cell ticks capture cell writes only while this is set.
    pub bulk_cell_captures: bool,
    /// Hold scheduled cell events back until unwind.
    pub cell_events: bool,
    /// Route spawns through spawn events. When clear, spawns go straight to
    /// the world.
    pub entity_events: bool,
}

impl Default for CaptureFlags {
    fn default() -> Self {
        Self {
            bulk_cell_captures: true,
            cell_events: true,
            entity_events: true,
        }
    }
}

// ---------------------------------------------------------------------------
// CapturedSupplier
// ---------------------------------------------------------------------------

/// Append-only buffer of captured values.
#[derive(Debug, Clone)]
pub struct CapturedSupplier<T> {
    items: Vec<T>,
}

impl<T> Default for CapturedSupplier<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> CapturedSupplier<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Hand every buffered value to `consumer` and leave the buffer empty.
    /// `consumer` is not called when nothing was captured. Returns whether
    /// it was called.
    pub fn accept_and_clear_if_not_empty<F>(&mut self, consumer: F) -> bool
    where
        F: FnOnce(Vec<T>),
    {
        if self.items.is_empty() {
            return false;
        }
        consumer(std::mem::take(&mut self.items));
        true
    }
}

// ---------------------------------------------------------------------------
// ItemDrop
// ---------------------------------------------------------------------------

/// An item about to be dropped into the world as an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDrop {
    pub pos: CellPos,
    pub stack: ItemStack,
}

impl ItemDrop {
    pub fn new(pos: CellPos, stack: ItemStack) -> Self {
        Self { pos, stack }
    }

    /// The item entity this drop becomes once spawned.
    pub fn to_entity(&self) -> EntitySnapshot {
        EntitySnapshot::pending(
            "item",
            self.pos,
            serde_json::json!({ "item": self.stack.item, "count": self.stack.count }),
        )
    }
}

// ---------------------------------------------------------------------------
// PhaseContext
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct Captures {
    pub(crate) transactions: TransactionalCaptureSupplier,
    pub(crate) entities: CapturedSupplier<EntitySnapshot>,
    pub(crate) items: CapturedSupplier<ItemDrop>,
    pub(crate) cell_events: CapturedSupplier<ScheduledCellEvent>,
}

/// State of one active phase.
#[derive(Debug)]
pub struct PhaseContext {
    phase: Phase,
    flags: CaptureFlags,
    source: Option<Cause>,
    owner: Option<EntityId>,
    notifier: Option<EntityId>,
    captures: Option<Box<Captures>>,
}

impl PhaseContext {
    /// A context without capture buffers.
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            flags: CaptureFlags::default(),
            source: None,
            owner: None,
            notifier: None,
            captures: None,
        }
    }

    /// A context with capture buffers if the phase captures anything.
    pub fn for_phase(phase: Phase) -> Self {
        let ctx = Self::new(phase);
        if phase.allows_captures() {
            ctx.add_captures()
        } else {
            ctx
        }
    }

    #[must_use]
    pub fn add_captures(mut self) -> Self {
        if self.captures.is_none() {
            self.captures = Some(Box::default());
        }
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: Cause) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner: EntityId) -> Self {
        self.owner = Some(owner);
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: EntityId) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: CaptureFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn flags(&self) -> CaptureFlags {
        self.flags
    }

    pub fn source(&self) -> Option<&Cause> {
        self.source.as_ref()
    }

    pub fn owner(&self) -> Option<EntityId> {
        self.owner
    }

    pub fn notifier(&self) -> Option<EntityId> {
        self.notifier
    }

    pub fn is_capturing(&self) -> bool {
        self.captures.is_some()
    }

    fn captures_mut(&mut self) -> Result<&mut Captures, TrackerError> {
        let phase = self.phase;
        self.captures
            .as_deref_mut()
            .ok_or(TrackerError::NotCapturing { phase })
    }

    pub fn captured_cell_supplier(
        &mut self,
    ) -> Result<&mut TransactionalCaptureSupplier, TrackerError> {
        Ok(&mut self.captures_mut()?.transactions)
    }

    pub fn captured_items_supplier(
        &mut self,
    ) -> Result<&mut CapturedSupplier<ItemDrop>, TrackerError> {
        Ok(&mut self.captures_mut()?.items)
    }

    pub fn captured_entity_supplier(
        &mut self,
    ) -> Result<&mut CapturedSupplier<EntitySnapshot>, TrackerError> {
        Ok(&mut self.captures_mut()?.entities)
    }

    pub fn captured_cell_events(
        &mut self,
    ) -> Result<&mut CapturedSupplier<ScheduledCellEvent>, TrackerError> {
        Ok(&mut self.captures_mut()?.cell_events)
    }

    /// Read-only view of the transaction log, if any.
    pub fn transactions(&self) -> Option<&TransactionalCaptureSupplier> {
        self.captures.as_deref().map(|c| &c.transactions)
    }

    /// Number of buffered spawns and item drops.
    pub fn captured_spawn_count(&self) -> usize {
        self.captures
            .as_deref()
            .map_or(0, |c| c.entities.len() + c.items.len())
    }

    pub fn apply_owner_if_available<F: FnOnce(EntityId)>(&self, f: F) {
        if let Some(owner) = self.owner {
            f(owner);
        }
    }

    pub fn apply_notifier_if_available<F: FnOnce(EntityId)>(&self, f: F) {
        if let Some(notifier) = self.notifier {
            f(notifier);
        }
    }

    /// Extend `frame` with this context's phase, source and provenance.
    pub fn frame_modifier(&self, frame: CauseFrame) -> CauseFrame {
        let mut frame = frame.push_cause(Cause::Phase(self.phase));
        if let Some(source) = &self.source {
            frame = frame.push_cause(source.clone());
        }
        if let Some(owner) = self.owner {
            frame = frame.with_context(ContextKey::Owner, ContextValue::Entity(owner));
        }
        if let Some(notifier) = self.notifier {
            frame = frame.with_context(ContextKey::Notifier, ContextValue::Entity(notifier));
        }
        frame
    }

    pub(crate) fn take_captures(&mut self) -> Option<Box<Captures>> {
        self.captures.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_world::cell::CellKind;

    #[test]
    fn bare_context_refuses_buffers() {
        let mut ctx = PhaseContext::new(Phase::EntityTick);
        assert!(!ctx.is_capturing());
        assert!(matches!(
            ctx.captured_cell_supplier(),
            Err(TrackerError::NotCapturing {
                phase: Phase::EntityTick
            })
        ));
        assert!(ctx.captured_items_supplier().is_err());
        assert!(ctx.captured_entity_supplier().is_err());
        assert!(ctx.captured_cell_events().is_err());
    }

    #[test]
    fn for_phase_allocates_only_for_capturing_phases() {
        assert!(PhaseContext::for_phase(Phase::Explosion).is_capturing());
        assert!(!PhaseContext::for_phase(Phase::Idle).is_capturing());
        assert!(!PhaseContext::for_phase(Phase::CellRestoring).is_capturing());
    }

    #[test]
    fn accept_and_clear_runs_once() {
        let mut supplier = CapturedSupplier::new();
        assert!(!supplier.accept_and_clear_if_not_empty(|_: Vec<u32>| {
            panic!("empty supplier must not call the consumer")
        }));

        supplier.push(1u32);
        supplier.push(2);
        let mut seen = Vec::new();
        assert!(supplier.accept_and_clear_if_not_empty(|items| seen = items));
        assert_eq!(seen, vec![1, 2]);
        assert!(supplier.is_empty());
        assert!(!supplier.accept_and_clear_if_not_empty(|_| unreachable!()));
    }

    #[test]
    fn provenance_callbacks_fire_only_when_present() {
        let owner = EntityId::new(3, 1);
        let ctx = PhaseContext::new(Phase::EntityTick).with_owner(owner);
        let mut seen = None;
        ctx.apply_owner_if_available(|id| seen = Some(id));
        ctx.apply_notifier_if_available(|_| panic!("no notifier"));
        assert_eq!(seen, Some(owner));
    }

    #[test]
    fn frame_modifier_adds_phase_source_and_context() {
        let owner = EntityId::new(1, 0);
        let notifier = EntityId::new(2, 0);
        let ctx = PhaseContext::new(Phase::CellTick)
            .with_source(Cause::Task("growth".to_owned()))
            .with_owner(owner)
            .with_notifier(notifier);
        let frame = ctx.frame_modifier(CauseFrame::new());

        assert_eq!(frame.causes().first(), Some(&Cause::Task("growth".to_owned())));
        assert_eq!(frame.causes().root(), Some(&Cause::Phase(Phase::CellTick)));
        assert_eq!(frame.owner(), Some(owner));
        assert_eq!(frame.notifier(), Some(notifier));
    }

    #[test]
    fn captured_cell_events_are_buffered() {
        let mut ctx = PhaseContext::for_phase(Phase::ScheduledTask);
        ctx.captured_cell_events()
            .unwrap()
            .push(ScheduledCellEvent {
                pos: CellPos::new(0, 0, 0),
                kind: CellKind(25),
                event_id: 1,
                param: 0,
            });
        assert_eq!(ctx.captured_cell_events().unwrap().len(), 1);
    }

    #[test]
    fn item_drop_becomes_item_entity() {
        let drop = ItemDrop::new(CellPos::new(1, 2, 3), ItemStack::new("cobblestone", 4));
        let entity = drop.to_entity();
        assert_eq!(entity.kind, "item");
        assert_eq!(entity.data["count"], 4);
        assert!(entity.id.is_none());
    }
}
