//! Recorded mutations and the restore protocol.
//!
//! A [`GameTransaction`] is one atomic mutation captured while a phase was
//! running. It holds the snapshot of the target before the mutation and,
//! once the phase unwinds, the snapshot after it. Transactions form a tree:
//! a cell change owns the attached-entity removal its pipeline performed, a
//! container click owns the slot writes it caused.
//!
//! # Restore protocol
//!
//! [`GameTransaction::restore`] re-applies the original snapshot through
//! [`WorldAccess`]. It is idempotent: a transaction that already restored
//! reports [`RestoreOutcome::AlreadyRestored`] and touches nothing. No-op
//! transactions (equal snapshots) and deferred ones that never reached the
//! world are marked restored without a write. Callers restore the
//! transactions of an event in reverse creation order, which puts children
//! before their parent.

use std::fmt;

use causeway_world::access::WorldAccess;
use causeway_world::cell::{AttachedEntity, CellPos, CellState};
use causeway_world::entity::EntityId;
use causeway_world::item::ContainerId;
use causeway_world::snapshot::{CellSnapshot, CursorSnapshot, SlotSnapshot, Snapshot};
use causeway_world::WorldError;
use serde::Serialize;

use crate::cause::{Cause, CauseFrame, ContextKey, ContextValue};
use crate::effect::{ChangeFlags, Effect};

// ---------------------------------------------------------------------------
// Identifiers and enums
// ---------------------------------------------------------------------------

/// Index of a transaction within its phase's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TransactionId(pub u32);

impl TransactionId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Pending,
    Committed,
    Restored,
}

/// Domain event a transaction feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ChangeCell,
    ChangeInventory,
    ClickContainer,
    NotifyNeighbor,
    SpawnEntity,
}

impl EventKind {
    pub const fn name(self) -> &'static str {
        match self {
            EventKind::ChangeCell => "change_cell",
            EventKind::ChangeInventory => "change_inventory",
            EventKind::ClickContainer => "click_container",
            EventKind::NotifyNeighbor => "notify_neighbor",
            EventKind::SpawnEntity => "spawn_entity",
        }
    }
}

/// What a player-inventory session was doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryAction {
    SwapHands,
    PickupItem,
    Extension,
}

/// Mutation target used for last-write-wins conflict detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Target {
    Cell(CellPos),
    Slot(ContainerId, u32),
}

// ---------------------------------------------------------------------------
// TransactionKind
// ---------------------------------------------------------------------------

/// Per-kind payload of a transaction.
///
/// `resulting` fields stay `None` until the owning phase unwinds.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionKind {
    ChangeCell {
        original: CellSnapshot,
        new_state: CellState,
        flags: ChangeFlags,
        resulting: Option<CellSnapshot>,
    },
    AddAttached {
        original: CellSnapshot,
        added: AttachedEntity,
        resulting: Option<CellSnapshot>,
    },
    RemoveAttached {
        original: CellSnapshot,
        resulting: Option<CellSnapshot>,
    },
    ReplaceAttached {
        original: CellSnapshot,
        replacement: AttachedEntity,
        resulting: Option<CellSnapshot>,
    },
    SlotChange {
        original: SlotSnapshot,
        resulting: Option<SlotSnapshot>,
    },
    /// A click session. Owns the slot changes it caused; the transaction
    /// itself covers the clicking entity's cursor.
    ContainerClick {
        container: ContainerId,
        slot: Option<u32>,
        /// Creative clicks do not report the cursor; it always ends empty.
        creative: bool,
        original_cursor: CursorSnapshot,
        resulting_cursor: Option<CursorSnapshot>,
    },
    /// A player-inventory session such as swapping hands. Owns slot changes.
    InventoryChange {
        holder: EntityId,
        container: ContainerId,
        action: InventoryAction,
    },
    /// A neighbor notification held back until the owning event is
    /// accepted. Never reaches the world before commit.
    NeighborNotification {
        source: CellPos,
        source_state: CellState,
        target: CellSnapshot,
    },
}

impl TransactionKind {
    pub const fn label(&self) -> &'static str {
        match self {
            TransactionKind::ChangeCell { .. } => "change_cell",
            TransactionKind::AddAttached { .. } => "add_attached",
            TransactionKind::RemoveAttached { .. } => "remove_attached",
            TransactionKind::ReplaceAttached { .. } => "replace_attached",
            TransactionKind::SlotChange { .. } => "slot_change",
            TransactionKind::ContainerClick { .. } => "container_click",
            TransactionKind::InventoryChange { .. } => "inventory_change",
            TransactionKind::NeighborNotification { .. } => "neighbor_notification",
        }
    }

    pub(crate) fn target(&self) -> Option<Target> {
        match self {
            TransactionKind::ChangeCell { original, .. } => Some(Target::Cell(original.pos)),
            TransactionKind::SlotChange { original, .. } => {
                Some(Target::Slot(original.container, original.slot))
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// RestoreOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The original snapshot was written back.
    Restored,
    AlreadyRestored,
    /// Nothing changed, so nothing was written.
    NoOp,
    /// The mutation was deferred and never reached the world.
    NeverApplied,
    Failed(WorldError),
}

/// A pipeline effect failure attributed to a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectFailure {
    pub effect: Effect,
    pub cause: String,
}

// ---------------------------------------------------------------------------
// GameTransaction
// ---------------------------------------------------------------------------

/// One captured mutation.
#[derive(Debug, Clone)]
pub struct GameTransaction {
    pub(crate) id: TransactionId,
    pub(crate) parent: Option<TransactionId>,
    pub(crate) children: Vec<TransactionId>,
    pub(crate) kind: TransactionKind,
    pub(crate) state: TransactionState,
    pub(crate) valid: bool,
    pub(crate) superseded_by: Option<TransactionId>,
    pub(crate) failure: Option<EffectFailure>,
}

impl GameTransaction {
    pub(crate) fn new(id: TransactionId, parent: Option<TransactionId>, kind: TransactionKind) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            kind,
            state: TransactionState::Pending,
            valid: true,
            superseded_by: None,
            failure: None,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn parent(&self) -> Option<TransactionId> {
        self.parent
    }

    pub fn children(&self) -> &[TransactionId] {
        &self.children
    }

    pub fn kind(&self) -> &TransactionKind {
        &self.kind
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// False once superseded, restored, or failed.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn superseded_by(&self) -> Option<TransactionId> {
        self.superseded_by
    }

    pub fn failure(&self) -> Option<&EffectFailure> {
        self.failure.as_ref()
    }

    pub fn label(&self) -> &'static str {
        self.kind.label()
    }

    pub fn event_kind(&self) -> EventKind {
        match &self.kind {
            TransactionKind::ChangeCell { .. }
            | TransactionKind::AddAttached { .. }
            | TransactionKind::RemoveAttached { .. }
            | TransactionKind::ReplaceAttached { .. } => EventKind::ChangeCell,
            TransactionKind::SlotChange { .. } | TransactionKind::InventoryChange { .. } => {
                EventKind::ChangeInventory
            }
            TransactionKind::ContainerClick { .. } => EventKind::ClickContainer,
            TransactionKind::NeighborNotification { .. } => EventKind::NotifyNeighbor,
        }
    }

    pub fn original_snapshot(&self) -> Snapshot {
        match &self.kind {
            TransactionKind::ChangeCell { original, .. }
            | TransactionKind::AddAttached { original, .. }
            | TransactionKind::RemoveAttached { original, .. }
            | TransactionKind::ReplaceAttached { original, .. } => original.clone().into(),
            TransactionKind::SlotChange { original, .. } => original.clone().into(),
            TransactionKind::ContainerClick {
                original_cursor, ..
            } => original_cursor.clone().into(),
            TransactionKind::InventoryChange { holder, .. } => CursorSnapshot {
                holder: *holder,
                stack: Default::default(),
            }
            .into(),
            TransactionKind::NeighborNotification { target, .. } => target.clone().into(),
        }
    }

    /// The snapshot after the mutation. `None` before unwind finalization,
    /// for sessions that do not own a snapshot, and for deferred
    /// notifications.
    pub fn resulting_snapshot(&self) -> Option<Snapshot> {
        match &self.kind {
            TransactionKind::ChangeCell { resulting, .. }
            | TransactionKind::AddAttached { resulting, .. }
            | TransactionKind::RemoveAttached { resulting, .. }
            | TransactionKind::ReplaceAttached { resulting, .. } => {
                resulting.clone().map(Snapshot::from)
            }
            TransactionKind::SlotChange { resulting, .. } => resulting.clone().map(Snapshot::from),
            TransactionKind::ContainerClick {
                resulting_cursor, ..
            } => resulting_cursor.clone().map(Snapshot::from),
            TransactionKind::InventoryChange { .. }
            | TransactionKind::NeighborNotification { .. } => None,
        }
    }

    /// Whether the transaction is expected to have a resulting snapshot.
    pub(crate) fn owns_snapshot(&self) -> bool {
        !matches!(
            self.kind,
            TransactionKind::InventoryChange { .. } | TransactionKind::NeighborNotification { .. }
        )
    }

    /// Original and resulting snapshots are equal.
    pub fn is_noop(&self) -> bool {
        match &self.kind {
            TransactionKind::ChangeCell {
                original, resulting, ..
            }
            | TransactionKind::AddAttached {
                original, resulting, ..
            }
            | TransactionKind::RemoveAttached {
                original, resulting, ..
            }
            | TransactionKind::ReplaceAttached {
                original, resulting, ..
            } => resulting.as_ref() == Some(original),
            TransactionKind::SlotChange {
                original,
                resulting,
            } => resulting.as_ref() == Some(original),
            TransactionKind::ContainerClick {
                original_cursor,
                resulting_cursor,
                ..
            } => resulting_cursor.as_ref() == Some(original_cursor) && self.children.is_empty(),
            TransactionKind::InventoryChange { .. } => self.children.is_empty(),
            TransactionKind::NeighborNotification { .. } => false,
        }
    }

    /// Extend the event frame with this transaction's cause.
    pub fn frame_mutator(&self, frame: CauseFrame) -> CauseFrame {
        match &self.kind {
            TransactionKind::ChangeCell { original, .. } => frame.push_cause(Cause::Cell {
                pos: original.pos,
                state: original.state,
            }),
            TransactionKind::NeighborNotification {
                source,
                source_state,
                ..
            } => frame.push_cause(Cause::Cell {
                pos: *source,
                state: *source_state,
            }),
            TransactionKind::ContainerClick {
                original_cursor, ..
            } => frame
                .push_cause(Cause::Player {
                    id: original_cursor.holder,
                })
                .with_context(
                    ContextKey::Notifier,
                    ContextValue::Entity(original_cursor.holder),
                ),
            TransactionKind::InventoryChange { holder, .. } => {
                frame.push_cause(Cause::Player { id: *holder })
            }
            _ => frame,
        }
    }

    /// Read the current state of the target into the resulting snapshot.
    pub(crate) fn finalize(&mut self, world: &dyn WorldAccess) -> Result<(), WorldError> {
        match &mut self.kind {
            TransactionKind::ChangeCell {
                original, resulting, ..
            }
            | TransactionKind::AddAttached {
                original, resulting, ..
            }
            | TransactionKind::RemoveAttached {
                original, resulting, ..
            }
            | TransactionKind::ReplaceAttached {
                original, resulting, ..
            } => {
                *resulting = Some(world.read_cell(original.pos)?);
            }
            TransactionKind::SlotChange {
                original,
                resulting,
            } => {
                *resulting = Some(world.read_slot(original.container, original.slot)?);
            }
            TransactionKind::ContainerClick {
                creative,
                original_cursor,
                resulting_cursor,
                ..
            } => {
                let stack = if *creative {
                    Default::default()
                } else {
                    world.read_cursor(original_cursor.holder)
                };
                *resulting_cursor = Some(CursorSnapshot {
                    holder: original_cursor.holder,
                    stack,
                });
            }
            TransactionKind::InventoryChange { .. }
            | TransactionKind::NeighborNotification { .. } => {}
        }
        Ok(())
    }

    /// Set the resulting snapshot of a cell or slot change without reading
    /// the world.
    pub(crate) fn set_resulting(&mut self, snapshot: Snapshot) {
        match (&mut self.kind, snapshot) {
            (TransactionKind::ChangeCell { resulting, .. }, Snapshot::Cell(cell)) => {
                *resulting = Some(cell)
            }
            (TransactionKind::SlotChange { resulting, .. }, Snapshot::Slot(slot)) => {
                *resulting = Some(slot)
            }
            (kind, snapshot) => {
                tracing::warn!(
                    kind = kind.label(),
                    ?snapshot,
                    "ignoring resulting snapshot of a different target"
                );
            }
        }
    }

    /// Replace the original snapshot of a cell or slot change. Used when an
    /// earlier write to the same target is folded into this one.
    pub(crate) fn rebase_original(&mut self, earlier: Snapshot) {
        match (&mut self.kind, earlier) {
            (TransactionKind::ChangeCell { original, .. }, Snapshot::Cell(cell)) => *original = cell,
            (TransactionKind::SlotChange { original, .. }, Snapshot::Slot(slot)) => *original = slot,
            (kind, earlier) => {
                tracing::warn!(
                    kind = kind.label(),
                    ?earlier,
                    "ignoring rebase onto a snapshot of a different target"
                );
            }
        }
    }

    /// Re-apply the original snapshot.
    pub fn restore(&mut self, world: &mut dyn WorldAccess) -> RestoreOutcome {
        if self.state == TransactionState::Restored {
            return RestoreOutcome::AlreadyRestored;
        }
        if self.is_noop() {
            self.mark_restored();
            return RestoreOutcome::NoOp;
        }
        if matches!(self.kind, TransactionKind::NeighborNotification { .. }) {
            self.mark_restored();
            return RestoreOutcome::NeverApplied;
        }

        let result = match &self.kind {
            TransactionKind::ChangeCell { original, .. } => world.apply_cell(original),
            TransactionKind::AddAttached { original, .. }
            | TransactionKind::RemoveAttached { original, .. }
            | TransactionKind::ReplaceAttached { original, .. } => match &original.attached {
                Some(attached) => world.set_attached(original.pos, attached.clone()).map(drop),
                None => world.remove_attached(original.pos).map(drop),
            },
            TransactionKind::SlotChange { original, .. } => world
                .write_slot(original.container, original.slot, original.stack.clone())
                .map(drop),
            TransactionKind::ContainerClick {
                original_cursor, ..
            } => {
                world.write_cursor(original_cursor.holder, original_cursor.stack.clone());
                Ok(())
            }
            TransactionKind::InventoryChange { .. }
            | TransactionKind::NeighborNotification { .. } => Ok(()),
        };

        match result {
            Ok(()) => {
                self.mark_restored();
                RestoreOutcome::Restored
            }
            Err(error) => {
                self.valid = false;
                RestoreOutcome::Failed(error)
            }
        }
    }

    pub(crate) fn mark_restored(&mut self) {
        self.state = TransactionState::Restored;
        self.valid = false;
    }

    pub(crate) fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
