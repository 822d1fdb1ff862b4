//! The storage-side contract a simulation engine exposes to the tracker.
//!
//! [`WorldAccess`] is deliberately low level: raw reads and writes with no
//! event firing, no capture and no cascading behavior. Everything the
//! engine would normally do *around* a write (relighting, waking neighbors,
//! pushing the change to observers) is exposed as a separate primitive so the
//! tracker's effect pipeline can decide whether and when to run it.

use crate::cell::{AttachedEntity, CellPos, CellState, ScheduledCellEvent};
use crate::entity::EntityId;
use crate::item::{ContainerId, ItemStack};
use crate::snapshot::{CellSnapshot, EntitySnapshot, SlotSnapshot};
use crate::WorldError;

/// Raw access to world state plus the primitive side effects of a write.
pub trait WorldAccess {
    // -- cells ---------------------------------------------------------------

    /// Whether the chunk holding `pos` is loaded.
    fn is_loaded(&self, pos: CellPos) -> bool;

    /// Capture the cell at `pos`, including its attached entity.
    fn read_cell(&self, pos: CellPos) -> Result<CellSnapshot, WorldError>;

    /// Overwrite the cell's state, returning the previous state. The
    /// attached entity is left untouched.
    fn write_cell_state(&mut self, pos: CellPos, state: CellState)
        -> Result<CellState, WorldError>;

    /// Put a cell back exactly as captured: state and attached entity.
    fn apply_cell(&mut self, snapshot: &CellSnapshot) -> Result<(), WorldError>;

    /// Whether cells in `state` carry an attached entity.
    fn carries_attached(&self, state: CellState) -> bool;

    // -- attached entities ---------------------------------------------------

    fn attached(&self, pos: CellPos) -> Option<&AttachedEntity>;

    /// Bind an attached entity to `pos`, returning the one it replaced.
    fn set_attached(
        &mut self,
        pos: CellPos,
        attached: AttachedEntity,
    ) -> Result<Option<AttachedEntity>, WorldError>;

    fn remove_attached(&mut self, pos: CellPos) -> Result<Option<AttachedEntity>, WorldError>;

    // -- containers ----------------------------------------------------------

    fn read_slot(&self, container: ContainerId, slot: u32) -> Result<SlotSnapshot, WorldError>;

    /// Overwrite a slot, returning the previous stack.
    fn write_slot(
        &mut self,
        container: ContainerId,
        slot: u32,
        stack: ItemStack,
    ) -> Result<ItemStack, WorldError>;

    fn read_cursor(&self, holder: EntityId) -> ItemStack;

    fn write_cursor(&mut self, holder: EntityId, stack: ItemStack) -> ItemStack;

    // -- entities ------------------------------------------------------------

    /// Spawn an entity from a pending snapshot, returning its new id.
    fn spawn_entity(&mut self, entity: &EntitySnapshot) -> Result<EntityId, WorldError>;

    fn despawn_entity(&mut self, id: EntityId) -> Result<EntitySnapshot, WorldError>;

    fn entity(&self, id: EntityId) -> Option<&EntitySnapshot>;

    // -- primitive side effects ----------------------------------------------

    /// Recompute lighting around `pos`.
    fn update_light(&mut self, pos: CellPos);

    /// Let the attached entity at `pos` refresh its cached view of the cell.
    fn refresh_attached(&mut self, pos: CellPos);

    /// Push the cell at `pos` to everyone observing that part of the world.
    fn notify_observers(&mut self, pos: CellPos);

    /// Wake `target` because `source` changed.
    fn notify_neighbor(&mut self, source: CellPos, target: CellPos);

    /// Queue a cell event for end-of-tick delivery.
    fn schedule_cell_event(&mut self, event: ScheduledCellEvent);
}
