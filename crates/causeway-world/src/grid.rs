//! In-memory reference world.
//!
//! [`GridWorld`] implements [`WorldAccess`] over ordered maps so that its
//! state can be hashed deterministically. It is the world used by the
//! engine crate's headless tick loop and by every test in the workspace.
//!
//! Side effects that a real engine would perform (relighting, neighbor
//! wake-ups, network updates) are recorded as [`WorldSignal`]s in call order.
//! Tests read the signal log to check effect ordering and restore ordering.
//!
//! # Example
//!
//! ```
//! use causeway_world::prelude::*;
//!
//! let mut world = GridWorld::new();
//! let pos = CellPos::new(0, 64, 0);
//! world.write_cell_state(pos, CellState::of(1)).unwrap();
//! assert_eq!(world.read_cell(pos).unwrap().state, CellState::of(1));
//! assert_eq!(world.state_hash().len(), 64);
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::access::WorldAccess;
use crate::cell::{AttachedEntity, CellKind, CellPos, CellState, ChunkPos, ScheduledCellEvent};
use crate::entity::{EntityAllocator, EntityId};
use crate::item::{ContainerId, ItemStack};
use crate::snapshot::{CellSnapshot, EntitySnapshot, SlotSnapshot};
use crate::WorldError;

// ---------------------------------------------------------------------------
// WorldSignal
// ---------------------------------------------------------------------------

/// One observable world operation, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WorldSignal {
    CellWritten { pos: CellPos, state: CellState },
    CellApplied { pos: CellPos, state: CellState },
    AttachedSet { pos: CellPos },
    AttachedRemoved { pos: CellPos },
    SlotWritten { container: ContainerId, slot: u32 },
    CursorWritten { holder: EntityId },
    EntitySpawned { id: EntityId },
    EntityDespawned { id: EntityId },
    LightUpdated { pos: CellPos },
    AttachedRefreshed { pos: CellPos },
    ObserversNotified { pos: CellPos },
    NeighborNotified { source: CellPos, target: CellPos },
    CellEventScheduled { pos: CellPos, event_id: u32 },
}

// ---------------------------------------------------------------------------
// GridWorld
// ---------------------------------------------------------------------------

/// An ordered-map world with chunk-granular loading.
///
/// All chunks are loaded unless explicitly unloaded with
/// [`unload_chunk`](Self::unload_chunk). Reads and writes to an unloaded
/// chunk fail with [`WorldError::Unloaded`], which is how tests provoke
/// restore failures.
#[derive(Debug, Default)]
pub struct GridWorld {
    cells: BTreeMap<CellPos, CellState>,
    attached: BTreeMap<CellPos, AttachedEntity>,
    attached_kinds: BTreeSet<CellKind>,
    unloaded: BTreeSet<ChunkPos>,
    containers: BTreeMap<ContainerId, Vec<ItemStack>>,
    cursors: BTreeMap<EntityId, ItemStack>,
    allocator: EntityAllocator,
    entities: BTreeMap<EntityId, EntitySnapshot>,
    scheduled: Vec<ScheduledCellEvent>,
    signals: Vec<WorldSignal>,
}

impl GridWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that cells of `kind` carry an attached entity.
    pub fn register_attached_kind(&mut self, kind: CellKind) {
        self.attached_kinds.insert(kind);
    }

    /// Create a container with `size` empty slots.
    pub fn add_container(&mut self, id: ContainerId, size: usize) {
        self.containers.insert(id, vec![ItemStack::empty(); size]);
    }

    pub fn unload_chunk(&mut self, chunk: ChunkPos) {
        if self.unloaded.insert(chunk) {
            tracing::debug!(?chunk, "chunk unloaded");
        }
    }

    pub fn load_chunk(&mut self, chunk: ChunkPos) {
        if self.unloaded.remove(&chunk) {
            tracing::debug!(?chunk, "chunk loaded");
        }
    }

    /// Current state of a cell; unset cells read as air. Does not check
    /// loading.
    pub fn cell(&self, pos: CellPos) -> CellState {
        self.cells.get(&pos).copied().unwrap_or(CellState::AIR)
    }

    pub fn slot(&self, container: ContainerId, slot: u32) -> Option<&ItemStack> {
        self.containers.get(&container)?.get(slot as usize)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntitySnapshot> {
        self.entities.values()
    }

    pub fn scheduled_events(&self) -> &[ScheduledCellEvent] {
        &self.scheduled
    }

    /// Operations performed so far, oldest first.
    pub fn signals(&self) -> &[WorldSignal] {
        &self.signals
    }

    /// Drain the signal log.
    pub fn take_signals(&mut self) -> Vec<WorldSignal> {
        std::mem::take(&mut self.signals)
    }

    /// BLAKE3 hex digest of the persistent world state.
    ///
    /// Covers cells, attached entities, containers, cursors, entities and
    /// queued cell events. The signal log is not state and is excluded, so
    /// two worlds that reach the same state through different operations
    /// hash identically. Air cells are skipped, which makes "never written"
    /// and "written back to air" indistinguishable, as they are to readers.
    pub fn state_hash(&self) -> String {
        #[derive(Serialize)]
        struct HashableWorld<'a> {
            cells: Vec<(&'a CellPos, &'a CellState)>,
            attached: Vec<(&'a CellPos, &'a AttachedEntity)>,
            containers: Vec<(&'a ContainerId, &'a Vec<ItemStack>)>,
            cursors: Vec<(&'a EntityId, &'a ItemStack)>,
            entities: Vec<&'a EntitySnapshot>,
            scheduled: &'a [ScheduledCellEvent],
        }

        let hashable = HashableWorld {
            cells: self.cells.iter().filter(|(_, s)| !s.is_air()).collect(),
            attached: self.attached.iter().collect(),
            containers: self.containers.iter().collect(),
            cursors: self.cursors.iter().filter(|(_, s)| !s.is_empty()).collect(),
            entities: self.entities.values().collect(),
            scheduled: &self.scheduled,
        };

        let bytes = serde_json::to_vec(&hashable)
            .expect("GridWorld state should always be JSON-serializable");
        blake3::hash(&bytes).to_hex().to_string()
    }

    fn ensure_loaded(&self, pos: CellPos) -> Result<(), WorldError> {
        if self.is_loaded(pos) {
            Ok(())
        } else {
            Err(WorldError::Unloaded { pos })
        }
    }

    fn slot_mut(&mut self, container: ContainerId, slot: u32) -> Result<&mut ItemStack, WorldError> {
        let slots = self
            .containers
            .get_mut(&container)
            .ok_or(WorldError::NoSuchContainer { container })?;
        let size = slots.len();
        slots
            .get_mut(slot as usize)
            .ok_or(WorldError::SlotOutOfRange {
                container,
                slot,
                size,
            })
    }
}

impl WorldAccess for GridWorld {
    fn is_loaded(&self, pos: CellPos) -> bool {
        !self.unloaded.contains(&pos.chunk())
    }

    fn read_cell(&self, pos: CellPos) -> Result<CellSnapshot, WorldError> {
        self.ensure_loaded(pos)?;
        Ok(CellSnapshot {
            pos,
            state: self.cell(pos),
            attached: self.attached.get(&pos).cloned(),
        })
    }

    fn write_cell_state(
        &mut self,
        pos: CellPos,
        state: CellState,
    ) -> Result<CellState, WorldError> {
        self.ensure_loaded(pos)?;
        let previous = self.cells.insert(pos, state).unwrap_or(CellState::AIR);
        self.signals.push(WorldSignal::CellWritten { pos, state });
        Ok(previous)
    }

    fn apply_cell(&mut self, snapshot: &CellSnapshot) -> Result<(), WorldError> {
        self.ensure_loaded(snapshot.pos)?;
        self.cells.insert(snapshot.pos, snapshot.state);
        match &snapshot.attached {
            Some(attached) => {
                self.attached.insert(snapshot.pos, attached.clone());
            }
            None => {
                self.attached.remove(&snapshot.pos);
            }
        }
        self.signals.push(WorldSignal::CellApplied {
            pos: snapshot.pos,
            state: snapshot.state,
        });
        Ok(())
    }

    fn carries_attached(&self, state: CellState) -> bool {
        self.attached_kinds.contains(&state.kind)
    }

    fn attached(&self, pos: CellPos) -> Option<&AttachedEntity> {
        self.attached.get(&pos)
    }

    fn set_attached(
        &mut self,
        pos: CellPos,
        attached: AttachedEntity,
    ) -> Result<Option<AttachedEntity>, WorldError> {
        self.ensure_loaded(pos)?;
        let previous = self.attached.insert(pos, attached);
        self.signals.push(WorldSignal::AttachedSet { pos });
        Ok(previous)
    }

    fn remove_attached(&mut self, pos: CellPos) -> Result<Option<AttachedEntity>, WorldError> {
        self.ensure_loaded(pos)?;
        let previous = self.attached.remove(&pos);
        if previous.is_some() {
            self.signals.push(WorldSignal::AttachedRemoved { pos });
        }
        Ok(previous)
    }

    fn read_slot(&self, container: ContainerId, slot: u32) -> Result<SlotSnapshot, WorldError> {
        let slots = self
            .containers
            .get(&container)
            .ok_or(WorldError::NoSuchContainer { container })?;
        let stack = slots
            .get(slot as usize)
            .cloned()
            .ok_or(WorldError::SlotOutOfRange {
                container,
                slot,
                size: slots.len(),
            })?;
        Ok(SlotSnapshot {
            container,
            slot,
            stack,
        })
    }

    fn write_slot(
        &mut self,
        container: ContainerId,
        slot: u32,
        stack: ItemStack,
    ) -> Result<ItemStack, WorldError> {
        let target = self.slot_mut(container, slot)?;
        let previous = std::mem::replace(target, stack);
        self.signals.push(WorldSignal::SlotWritten { container, slot });
        Ok(previous)
    }

    fn read_cursor(&self, holder: EntityId) -> ItemStack {
        self.cursors.get(&holder).cloned().unwrap_or_default()
    }

    fn write_cursor(&mut self, holder: EntityId, stack: ItemStack) -> ItemStack {
        self.signals.push(WorldSignal::CursorWritten { holder });
        self.cursors.insert(holder, stack).unwrap_or_default()
    }

    fn spawn_entity(&mut self, entity: &EntitySnapshot) -> Result<EntityId, WorldError> {
        self.ensure_loaded(entity.pos)?;
        let id = self.allocator.allocate();
        let mut live = entity.clone();
        live.id = Some(id);
        self.entities.insert(id, live);
        self.signals.push(WorldSignal::EntitySpawned { id });
        Ok(id)
    }

    fn despawn_entity(&mut self, id: EntityId) -> Result<EntitySnapshot, WorldError> {
        if !self.allocator.release(id) {
            return Err(WorldError::StaleEntity { entity: id });
        }
        let removed = self
            .entities
            .remove(&id)
            .ok_or(WorldError::StaleEntity { entity: id })?;
        self.signals.push(WorldSignal::EntityDespawned { id });
        Ok(removed)
    }

    fn entity(&self, id: EntityId) -> Option<&EntitySnapshot> {
        self.entities.get(&id)
    }

    fn update_light(&mut self, pos: CellPos) {
        self.signals.push(WorldSignal::LightUpdated { pos });
    }

    fn refresh_attached(&mut self, pos: CellPos) {
        self.signals.push(WorldSignal::AttachedRefreshed { pos });
    }

    fn notify_observers(&mut self, pos: CellPos) {
        self.signals.push(WorldSignal::ObserversNotified { pos });
    }

    fn notify_neighbor(&mut self, source: CellPos, target: CellPos) {
        self.signals
            .push(WorldSignal::NeighborNotified { source, target });
    }

    fn schedule_cell_event(&mut self, event: ScheduledCellEvent) {
        self.signals.push(WorldSignal::CellEventScheduled {
            pos: event.pos,
            event_id: event.event_id,
        });
        self.scheduled.push(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
