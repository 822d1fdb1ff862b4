//! Causeway World -- the storage-side contract of a simulation engine.
//!
//! The tracker never owns the world it observes. This crate defines what it
//! needs from one: position and state value types, immutable snapshots of
//! cells, container slots and entities, and the [`WorldAccess`] trait through
//! which snapshots are read and re-applied. [`GridWorld`] is an in-memory
//! implementation with deterministic state hashing.
//!
//! # Quick Start
//!
//! ```
//! use causeway_world::prelude::*;
//!
//! let mut world = GridWorld::new();
//! let pos = CellPos::new(4, 70, -2);
//! let before = world.read_cell(pos).unwrap();
//!
//! world.write_cell_state(pos, CellState::of(1)).unwrap();
//! world.apply_cell(&before).unwrap();
//!
//! assert_eq!(world.read_cell(pos).unwrap(), before);
//! ```
//!
//! [`WorldAccess`]: access::WorldAccess
//! [`GridWorld`]: grid::GridWorld

#![deny(unsafe_code)]

pub mod access;
pub mod cell;
pub mod entity;
pub mod grid;
pub mod item;
pub mod snapshot;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by world reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorldError {
    /// The chunk holding the position is not loaded.
    #[error("cell {pos} is in an unloaded chunk")]
    Unloaded { pos: cell::CellPos },

    #[error("{container} does not exist")]
    NoSuchContainer { container: item::ContainerId },

    #[error("slot {slot} is out of range for {container} (size {size})")]
    SlotOutOfRange {
        container: item::ContainerId,
        slot: u32,
        size: usize,
    },

    /// The entity handle is stale or was never allocated.
    #[error("entity {entity} does not exist (stale or never allocated)")]
    StaleEntity { entity: entity::EntityId },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::access::WorldAccess;
    pub use crate::cell::{
        AttachedEntity, CellKind, CellPos, CellState, ChunkPos, ScheduledCellEvent, CHUNK_SIZE,
    };
    pub use crate::entity::{EntityAllocator, EntityId};
    pub use crate::grid::{GridWorld, WorldSignal};
    pub use crate::item::{ContainerId, ItemStack};
    pub use crate::snapshot::{CellSnapshot, CursorSnapshot, EntitySnapshot, SlotSnapshot, Snapshot};
    pub use crate::WorldError;
}
