//! Execution-context kinds and their capture policy.
//!
//! A [`Phase`] names what the engine is doing right now: ticking a cell,
//! running an explosion, handling an inventory click. The tracker asks the
//! phase of the current context whether a given kind of mutation should be
//! captured as a transaction or applied immediately, and how captured
//! transactions are grouped into domain events.
//!
//! Phases are stateless. Every capability question is a pure function of
//! the phase and, for a few questions, the per-invocation [`CaptureFlags`]
//! of the context.
//!
//! | Phase | Cells | Spawns | Attached | Inventory | Grouping |
//! |-------|-------|--------|----------|-----------|----------|
//! | `Idle`, `CellRestoring` | no | no | no | no | - |
//! | `CellTick`, `RandomCellTick` | flag | immediate | no | no | per transaction |
//! | `NeighborNotify`, `EntityTick` | yes | yes | yes | yes | per transaction |
//! | `Explosion` | yes | yes | yes | no | batched |
//! | inventory phases | yes | yes | yes | yes | per transaction |
//! | `ExtensionCommand`, `ScheduledTask` | yes | yes | yes | yes | batched |
//!
//! [`CaptureFlags`]: crate::context::CaptureFlags

use std::fmt;

use serde::Serialize;

use crate::cause::SpawnType;
use crate::context::PhaseContext;

/// How captured transactions are turned into domain events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventGrouping {
    /// One event per top-level transaction.
    PerTransaction,
    /// One event per event kind, covering every top-level transaction of
    /// that kind.
    Batched,
}

/// A kind of execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing tracked is running. Permanent floor of every tracker stack.
    Idle,
    /// A scheduled cell update.
    CellTick,
    RandomCellTick,
    /// A cell reacting to a neighbor change.
    NeighborNotify,
    EntityTick,
    Explosion,
    /// A network-originated container click.
    InventoryAction,
    SwapHandItems,
    CreativeMenuClick,
    ExtensionCommand,
    ScheduledTask,
    /// Snapshots are being re-applied. Nothing is captured.
    CellRestoring,
}

impl Phase {
    pub const ALL: [Phase; 12] = [
        Phase::Idle,
        Phase::CellTick,
        Phase::RandomCellTick,
        Phase::NeighborNotify,
        Phase::EntityTick,
        Phase::Explosion,
        Phase::InventoryAction,
        Phase::SwapHandItems,
        Phase::CreativeMenuClick,
        Phase::ExtensionCommand,
        Phase::ScheduledTask,
        Phase::CellRestoring,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::CellTick => "cell_tick",
            Phase::RandomCellTick => "random_cell_tick",
            Phase::NeighborNotify => "neighbor_notify",
            Phase::EntityTick => "entity_tick",
            Phase::Explosion => "explosion",
            Phase::InventoryAction => "inventory_action",
            Phase::SwapHandItems => "swap_hand_items",
            Phase::CreativeMenuClick => "creative_menu_click",
            Phase::ExtensionCommand => "extension_command",
            Phase::ScheduledTask => "scheduled_task",
            Phase::CellRestoring => "cell_restoring",
        }
    }

    /// Whether contexts of this phase allocate capture buffers at all.
    pub const fn allows_captures(self) -> bool {
        !matches!(self, Phase::Idle | Phase::CellRestoring)
    }

    /// Whether spawns that are not captured still go through an event.
    pub const fn fires_events(self) -> bool {
        !matches!(self, Phase::Idle | Phase::CellRestoring)
    }

    pub const fn is_restoring(self) -> bool {
        matches!(self, Phase::CellRestoring)
    }

    const fn is_cell_tick(self) -> bool {
        matches!(self, Phase::CellTick | Phase::RandomCellTick)
    }

    const fn is_inventory(self) -> bool {
        matches!(
            self,
            Phase::InventoryAction | Phase::SwapHandItems | Phase::CreativeMenuClick
        )
    }

    // -- capability questions ----------------------------------------------

    /// Whether cell writes are captured as transactions.
    pub fn captures_bulk_cell_mutations(self, ctx: &PhaseContext) -> bool {
        if self.is_cell_tick() {
            return ctx.flags().bulk_cell_captures;
        }
        self.allows_captures()
    }

    /// Whether neighbor notifications are deferred until the owning event
    /// is accepted.
    pub fn captures_neighbor_notifications(self, ctx: &PhaseContext) -> bool {
        if self.is_cell_tick() {
            return ctx.flags().bulk_cell_captures;
        }
        self.allows_captures()
    }

    /// Whether spawned entities are buffered until unwind. Phases that
    /// answer `false` but [`fire events`](Self::fires_events) spawn at once
    /// behind a single-entity event.
    pub const fn captures_entity_spawns(self) -> bool {
        self.allows_captures() && !self.is_cell_tick()
    }

    pub fn captures_item_drops(self, ctx: &PhaseContext) -> bool {
        if self.is_cell_tick() {
            return ctx.flags().bulk_cell_captures;
        }
        self.allows_captures()
    }

    pub fn tracks_attached_entity_changes(self, _ctx: &PhaseContext) -> bool {
        self.allows_captures() && !self.is_cell_tick()
    }

    pub const fn captures_inventory_changes(self) -> bool {
        self.is_inventory()
            || matches!(
                self,
                Phase::EntityTick | Phase::NeighborNotify | Phase::ExtensionCommand | Phase::ScheduledTask
            )
    }

    /// Whether cell writes in this phase run the cell-change effect pipeline
    /// with a transaction bound to it, recording child transactions.
    pub fn has_specific_mutation_process(self, ctx: &PhaseContext) -> bool {
        matches!(self, Phase::CellTick) && ctx.flags().bulk_cell_captures
    }

    /// Whether scheduled cell events are held back until unwind.
    pub fn tracks_cell_events(self, ctx: &PhaseContext) -> bool {
        self.allows_captures() && ctx.flags().cell_events
    }

    pub const fn event_grouping(self) -> EventGrouping {
        match self {
            Phase::Explosion | Phase::ExtensionCommand | Phase::ScheduledTask => {
                EventGrouping::Batched
            }
            _ => EventGrouping::PerTransaction,
        }
    }

    /// Spawn type stamped on entities spawned in this phase.
    pub const fn spawn_type(self) -> SpawnType {
        match self {
            Phase::CellTick | Phase::RandomCellTick | Phase::NeighborNotify => {
                SpawnType::CellSpawning
            }
            Phase::ExtensionCommand | Phase::ScheduledTask => SpawnType::Extension,
            _ => SpawnType::Natural,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
