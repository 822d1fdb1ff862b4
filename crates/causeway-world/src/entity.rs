//! Entity handles and allocation for world-owned entities.
//!
//! An [`EntityId`] packs a *generation* in the high 32 bits and a *slot* in
//! the low 32 bits. Releasing a slot bumps its generation, so a handle held
//! across a despawn (for example inside a captured spawn that was later
//! cancelled) is detected as stale instead of aliasing a new entity.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A generational entity handle.
///
/// Layout: `[generation: u32 | slot: u32]`. Ordering follows the raw value,
/// which keeps world iteration deterministic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// Build a handle from a slot and generation.
    #[inline]
    pub fn new(slot: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | slot as u64)
    }

    #[inline]
    pub fn slot(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}v{})", self.slot(), self.generation())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.slot(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct SlotState {
    generation: u32,
    live: bool,
}

/// Hands out [`EntityId`]s and recycles released slots.
///
/// Released slots queue up FIFO so a hot slot does not burn through its
/// generations.
#[derive(Debug, Default)]
pub struct EntityAllocator {
    slots: Vec<SlotState>,
    free: VecDeque<u32>,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle, reusing the oldest released slot when one exists.
    pub fn allocate(&mut self) -> EntityId {
        if let Some(slot) = self.free.pop_front() {
            let state = &mut self.slots[slot as usize];
            state.live = true;
            return EntityId::new(slot, state.generation);
        }
        let slot = self.slots.len() as u32;
        self.slots.push(SlotState {
            generation: 0,
            live: true,
        });
        EntityId::new(slot, 0)
    }

    /// Release a handle. Returns `false` when the handle was already stale.
    pub fn release(&mut self, id: EntityId) -> bool {
        if !self.is_live(id) {
            return false;
        }
        let state = &mut self.slots[id.slot() as usize];
        state.live = false;
        state.generation = state.generation.wrapping_add(1);
        self.free.push_back(id.slot());
        true
    }

    /// Whether `id` names a live entity with a current generation.
    pub fn is_live(&self, id: EntityId) -> bool {
        self.slots
            .get(id.slot() as usize)
            .is_some_and(|s| s.live && s.generation == id.generation())
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.live).count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
