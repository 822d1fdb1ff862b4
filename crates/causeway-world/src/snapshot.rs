//! Immutable captures of world state.
//!
//! A snapshot holds exactly what is needed to put one piece of the world
//! back the way it was: a cell with its attached entity, a container slot, a
//! cursor, or an entity about to be spawned. Snapshots are plain values; they
//! never borrow from the world.
//!
//! [`Snapshot`] unifies the variants for event payloads, where observers see
//! a list of before/after pairs regardless of what kind of state changed.

use serde::{Deserialize, Serialize};

use crate::cell::{AttachedEntity, CellPos, CellState};
use crate::entity::EntityId;
use crate::item::{ContainerId, ItemStack};

// ---------------------------------------------------------------------------
// CellSnapshot
// ---------------------------------------------------------------------------

/// State of one cell, including its attached entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub pos: CellPos,
    pub state: CellState,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub attached: Option<AttachedEntity>,
}

impl CellSnapshot {
    pub fn new(pos: CellPos, state: CellState) -> Self {
        Self {
            pos,
            state,
            attached: None,
        }
    }

    pub fn with_attached(mut self, attached: AttachedEntity) -> Self {
        self.attached = Some(attached);
        self
    }
}

// ---------------------------------------------------------------------------
// SlotSnapshot
// ---------------------------------------------------------------------------

/// Contents of one container slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub container: ContainerId,
    pub slot: u32,
    pub stack: ItemStack,
}

// ---------------------------------------------------------------------------
// CursorSnapshot
// ---------------------------------------------------------------------------

/// The stack a player carries on the cursor while a container menu is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorSnapshot {
    pub holder: EntityId,
    pub stack: ItemStack,
}

// ---------------------------------------------------------------------------
// EntitySnapshot
// ---------------------------------------------------------------------------

/// An entity, either live (`id` set) or pending spawn (`id == None`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<EntityId>,
    /// Catalog name, e.g. `"item"`, `"zombie"`, `"experience_orb"`.
    pub kind: String,
    pub pos: CellPos,
    pub data: serde_json::Value,
}

impl EntitySnapshot {
    /// An entity that has not been spawned yet.
    pub fn pending(kind: &str, pos: CellPos, data: serde_json::Value) -> Self {
        Self {
            id: None,
            kind: kind.to_owned(),
            pos,
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Any captured piece of world state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Snapshot {
    Cell(CellSnapshot),
    Slot(SlotSnapshot),
    Cursor(CursorSnapshot),
    Entity(EntitySnapshot),
}

impl Snapshot {
    /// The cell position this snapshot is located at, if it has one.
    pub fn position(&self) -> Option<CellPos> {
        match self {
            Snapshot::Cell(cell) => Some(cell.pos),
            Snapshot::Entity(entity) => Some(entity.pos),
            Snapshot::Slot(_) | Snapshot::Cursor(_) => None,
        }
    }

    pub fn as_cell(&self) -> Option<&CellSnapshot> {
        match self {
            Snapshot::Cell(cell) => Some(cell),
            _ => None,
        }
    }

    pub fn as_slot(&self) -> Option<&SlotSnapshot> {
        match self {
            Snapshot::Slot(slot) => Some(slot),
            _ => None,
        }
    }
}

impl From<CellSnapshot> for Snapshot {
    fn from(value: CellSnapshot) -> Self {
        Snapshot::Cell(value)
    }
}

impl From<SlotSnapshot> for Snapshot {
    fn from(value: SlotSnapshot) -> Self {
        Snapshot::Slot(value)
    }
}

impl From<CursorSnapshot> for Snapshot {
    fn from(value: CursorSnapshot) -> Self {
        Snapshot::Cursor(value)
    }
}

impl From<EntitySnapshot> for Snapshot {
    fn from(value: EntitySnapshot) -> Self {
        Snapshot::Entity(value)
    }
}
