//! The phase stack and the instrumented mutation entry points.
//!
//! A [`PhaseTracker`] belongs to one world and one thread. Engine call sites
//! push a [`PhaseContext`] when they enter a phase, route every mutation
//! through the tracker while it runs, and pop the context when they leave.
//! Popping unwinds the context: captured transactions become domain events,
//! observers get to cancel them, and cancelled mutations are reverted.
//!
//! The stack always holds an [`Phase::Idle`] context at the bottom, so
//! [`current_context`](PhaseTracker::current_context) never fails.
//! Mutations made while only the idle floor is present are applied
//! immediately and never tracked.
//!
//! # Example
//!
//! ```
//! use causeway_tracker::prelude::*;
//! use causeway_world::prelude::*;
//!
//! let mut world = GridWorld::new();
//! let mut tracker = PhaseTracker::new(TrackerConfig::default());
//! let mut bus = |event: &DomainEvent| event.kind == EventKind::ChangeCell;
//! let pos = CellPos::new(0, 64, 0);
//!
//! let (_, report) = tracker.run_phase(
//!     PhaseContext::for_phase(Phase::EntityTick),
//!     &mut world,
//!     &mut bus,
//!     |tracker, world| tracker.set_cell(world, pos, CellState::of(1), ChangeFlags::DEFAULT),
//! );
//!
//! // The observer cancelled the change, so the cell is air again.
//! assert_eq!(report.events_cancelled, 1);
//! assert_eq!(world.cell(pos), CellState::AIR);
//! assert_eq!(tracker.depth(), 0);
//! ```
//!
//! # Threading
//!
//! The tracker is `Send` so it can be handed to the thread that runs the
//! engine, but every entry point checks that it is called on the thread
//! that created it and panics otherwise. Other threads read tracker state
//! through [`StackSummary`] copies.

use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, ThreadId};

use causeway_journal::journal::TransactionJournal;
use causeway_world::access::WorldAccess;
use causeway_world::cell::{AttachedEntity, CellPos, CellState, ScheduledCellEvent};
use causeway_world::entity::EntityId;
use causeway_world::item::{ContainerId, ItemStack};
use causeway_world::snapshot::{CellSnapshot, CursorSnapshot, EntitySnapshot};
use serde::Serialize;

use crate::cause::{CauseFrame, ContextKey, ContextValue, SpawnType};
use crate::config::TrackerConfig;
use crate::context::{ItemDrop, PhaseContext};
use crate::effect::{
    ChangeFlags, Effect, EffectContext, EffectPipeline, EffectStage, PipelineOutcome,
    PipelineRunner,
};
use crate::event::{DomainEvent, ObserverBus};
use crate::phase::Phase;
use crate::transaction::{
    EffectFailure, EventKind, GameTransaction, InventoryAction, RestoreOutcome, TransactionId,
    TransactionKind,
};
use crate::unwind::{self, UnwindReport};
use crate::TrackerError;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of [`PhaseTracker::set_cell`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellChangeOutcome {
    /// Written and fully processed without tracking.
    Applied,
    /// Written and recorded; post-event effects wait for the unwind.
    Captured(TransactionId),
    /// The cell already had the requested state.
    Unchanged,
    /// An effect failed. Any partial write was reverted.
    Failed { effect: Effect, cause: String },
}

/// Result of [`PhaseTracker::spawn_entity`] and [`PhaseTracker::drop_item`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// Buffered until the phase unwinds.
    Captured,
    Spawned(EntityId),
    /// An observer cancelled the spawn event.
    Cancelled,
}

// ---------------------------------------------------------------------------
// StackSummary
// ---------------------------------------------------------------------------

/// A copy of one stack entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub source: Option<String>,
    pub owner: Option<EntityId>,
    pub notifier: Option<EntityId>,
    pub captured_transactions: usize,
    pub captured_spawns: usize,
}

/// A defensive copy of a tracker's phase stack, bottom first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackSummary {
    pub phases: Vec<PhaseSummary>,
    /// Phases unwound since the tracker was created.
    pub unwound: u64,
}

impl StackSummary {
    pub fn depth(&self) -> usize {
        self.phases.len().saturating_sub(1)
    }

    pub fn current(&self) -> Option<Phase> {
        self.phases.last().map(|p| p.phase)
    }
}

// ---------------------------------------------------------------------------
// PhaseTracker
// ---------------------------------------------------------------------------

/// A per-world stack of phase contexts.
#[derive(Debug)]
pub struct PhaseTracker {
    owner: ThreadId,
    stack: Vec<PhaseContext>,
    config: TrackerConfig,
    journal: TransactionJournal,
    unwound: u64,
}

impl PhaseTracker {
    /// A tracker owned by the calling thread, with only the idle floor on
    /// its stack.
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            owner: thread::current().id(),
            stack: vec![PhaseContext::new(Phase::Idle)],
            config,
            journal: TransactionJournal::new(),
            unwound: 0,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Resolutions recorded since the last [`begin_tick`](Self::begin_tick).
    pub fn journal(&self) -> &TransactionJournal {
        &self.journal
    }

    /// Start a new tick: clear the journal and stamp later entries with
    /// `tick`.
    pub fn begin_tick(&mut self, tick: u64) {
        self.check_thread("begin_tick");
        if self.depth() != 0 {
            tracing::warn!(
                tick,
                depth = self.depth(),
                trace = %self.stack_trace(),
                "tick started with phases still on the stack"
            );
        }
        self.journal.begin_tick(tick);
    }

    // -- stack ----------------------------------------------------------------

    /// Phases above the idle floor.
    pub fn depth(&self) -> usize {
        self.stack.len() - 1
    }

    pub fn current_context(&self) -> &PhaseContext {
        self.check_thread("current_context");
        self.top()
    }

    pub fn current_context_mut(&mut self) -> &mut PhaseContext {
        self.check_thread("current_context_mut");
        self.top_mut()
    }

    pub fn current_phase(&self) -> Phase {
        self.check_thread("current_phase");
        self.top().phase()
    }

    /// Whether snapshots are being re-applied right now.
    pub fn is_restoring(&self) -> bool {
        self.check_thread("is_restoring");
        self.top().phase().is_restoring()
    }

    /// Install `ctx` as the current context.
    ///
    /// # Panics
    ///
    /// Panics off the engine thread, and when the push would exceed
    /// [`TrackerConfig::max_phase_depth`].
    pub fn push_cause_frame(&mut self, ctx: PhaseContext) {
        self.check_thread("push_cause_frame");
        if self.depth() >= self.config.max_phase_depth {
            tracing::error!(
                phase = ctx.phase().name(),
                max = self.config.max_phase_depth,
                "phase stack overflow"
            );
            panic!(
                "phase stack overflow: pushing {} would exceed max_phase_depth {} (runaway recursion?)\n{}",
                ctx.phase(),
                self.config.max_phase_depth,
                self.stack_trace()
            );
        }
        tracing::trace!(phase = ctx.phase().name(), depth = self.depth() + 1, "push phase");
        self.stack.push(ctx);
    }

    /// Remove the current context, which must be of phase `expected`, and
    /// unwind it against `world` and `bus`.
    ///
    /// # Panics
    ///
    /// Panics off the engine thread, when only the idle floor remains, and
    /// when the current phase is not `expected`. The panic message carries
    /// the phase stack.
    pub fn pop_cause_frame(
        &mut self,
        expected: Phase,
        world: &mut dyn WorldAccess,
        bus: &mut dyn ObserverBus,
    ) -> UnwindReport {
        self.check_thread("pop_cause_frame");
        let mut ctx = self.pop_checked(expected);
        let trace = format!("{}  (unwinding {})", self.stack_trace(), ctx.phase());
        let base = self.current_frame();
        let journal = self.config.record_journal.then_some(&mut self.journal);
        let report = unwind::unwind_context(&mut ctx, base, world, bus, journal, &trace);
        self.unwound += 1;
        tracing::debug!(
            phase = expected.name(),
            events = report.events_fired,
            cancelled = report.events_cancelled,
            committed = report.committed,
            restored = report.restored,
            failed = report.failed,
            "phase unwound"
        );
        report
    }

    /// Push `ctx`, run `body`, then pop and unwind.
    ///
    /// If `body` panics, every context it left on the stack (including
    /// `ctx`) is discarded without firing events, its captured mutations
    /// are restored when [`TrackerConfig::restore_on_abort`] is set, and
    /// the panic resumes.
    pub fn run_phase<W, R, F>(
        &mut self,
        ctx: PhaseContext,
        world: &mut W,
        bus: &mut dyn ObserverBus,
        body: F,
    ) -> (R, UnwindReport)
    where
        W: WorldAccess,
        F: FnOnce(&mut PhaseTracker, &mut W) -> R,
    {
        let floor = self.stack.len();
        let phase = ctx.phase();
        self.push_cause_frame(ctx);

        match panic::catch_unwind(AssertUnwindSafe(|| body(self, world))) {
            Ok(value) => {
                let report = self.pop_cause_frame(phase, world, bus);
                (value, report)
            }
            Err(payload) => {
                self.abort_to(floor, world);
                panic::resume_unwind(payload)
            }
        }
    }

    fn abort_to(&mut self, floor: usize, world: &mut dyn WorldAccess) {
        while self.stack.len() > floor {
            let trace = self.stack_trace();
            let Some(mut ctx) = self.stack.pop() else { break };
            tracing::error!(
                phase = ctx.phase().name(),
                trace = %trace,
                "phase body panicked; discarding context"
            );
            let journal = self.config.record_journal.then_some(&mut self.journal);
            unwind::abort_context(
                &mut ctx,
                world,
                journal,
                &trace,
                self.config.restore_on_abort,
            );
            self.unwound += 1;
        }
    }

    fn pop_checked(&mut self, expected: Phase) -> PhaseContext {
        if self.stack.len() == 1 {
            panic!("cannot pop {expected}: only the idle floor is on the phase stack");
        }
        let current = self.top().phase();
        if current != expected {
            tracing::error!(
                expected = expected.name(),
                current = current.name(),
                "unbalanced phase pop"
            );
            panic!(
                "unbalanced phase pop: expected {expected}, current phase is {current}\n{}",
                self.stack_trace()
            );
        }
        match self.stack.pop() {
            Some(ctx) => ctx,
            None => unreachable!("stack holds more than the idle floor"),
        }
    }

    fn top(&self) -> &PhaseContext {
        match self.stack.last() {
            Some(ctx) => ctx,
            None => unreachable!("the idle floor is never popped"),
        }
    }

    fn top_mut(&mut self) -> &mut PhaseContext {
        match self.stack.last_mut() {
            Some(ctx) => ctx,
            None => unreachable!("the idle floor is never popped"),
        }
    }

    /// The cause frame of the current context, including every enclosing
    /// phase.
    fn current_frame(&self) -> CauseFrame {
        self.stack[1..]
            .iter()
            .fold(CauseFrame::new(), |frame, ctx| ctx.frame_modifier(frame))
    }

    /// Whether the current context captures what `policy` asks about.
    fn captures(&self, policy: fn(Phase, &PhaseContext) -> bool) -> bool {
        let ctx = self.top();
        ctx.is_capturing() && policy(ctx.phase(), ctx)
    }

    fn check_thread(&self, operation: &str) {
        let current = thread::current();
        if current.id() != self.owner {
            tracing::error!(
                operation,
                caller = ?current.name(),
                "phase tracker used off the engine thread"
            );
            panic!(
                "PhaseTracker::{operation} called off the engine thread (owner {:?}, caller {:?} {:?})\n{}",
                self.owner,
                current.id(),
                current.name(),
                self.stack_trace()
            );
        }
    }

    // -- diagnostics ----------------------------------------------------------

    /// The phase stack, top first, one line per phase.
    pub fn stack_trace(&self) -> String {
        let mut out = String::from("phase stack (top first):\n");
        for (depth, ctx) in self.stack.iter().enumerate().rev() {
            let _ = write!(out, "  [{depth}] {}", ctx.phase());
            if let Some(source) = ctx.source() {
                let _ = write!(out, " source={source}");
            }
            if let Some(owner) = ctx.owner() {
                let _ = write!(out, " owner={owner}");
            }
            if let Some(log) = ctx.transactions() {
                let _ = write!(out, " transactions={}", log.len());
            }
            out.push('\n');
        }
        out
    }

    /// A copy of the stack that can be sent to other threads.
    pub fn summary(&self) -> StackSummary {
        StackSummary {
            phases: self
                .stack
                .iter()
                .map(|ctx| PhaseSummary {
                    phase: ctx.phase(),
                    source: ctx.source().map(ToString::to_string),
                    owner: ctx.owner(),
                    notifier: ctx.notifier(),
                    captured_transactions: ctx.transactions().map_or(0, |log| log.len()),
                    captured_spawns: ctx.captured_spawn_count(),
                })
                .collect(),
            unwound: self.unwound,
        }
    }

    /// A transaction captured by the current phase, as it stands now.
    pub fn captured_transaction(&self, id: TransactionId) -> Result<&GameTransaction, TrackerError> {
        self.check_thread("captured_transaction");
        let ctx = self.top();
        ctx.transactions()
            .ok_or(TrackerError::NotCapturing { phase: ctx.phase() })?
            .get(id)
            .ok_or(TrackerError::UnknownTransaction { id })
    }

    // -- cells ----------------------------------------------------------------

    /// Change the state of a cell through the cell-change pipeline.
    ///
    /// When the current phase captures cell mutations the write is recorded
    /// as a transaction; it is still applied at once, so later reads in the
    /// phase see it. Observer and neighbor notification wait until the
    /// transaction's event is accepted.
    pub fn set_cell(
        &mut self,
        world: &mut dyn WorldAccess,
        pos: CellPos,
        state: CellState,
        flags: ChangeFlags,
    ) -> Result<CellChangeOutcome, TrackerError> {
        self.check_thread("set_cell");
        let former = world.read_cell(pos)?;
        let pipeline = EffectPipeline::for_cell_change(flags);

        if !self.captures(Phase::captures_bulk_cell_mutations) {
            let mut runner = PipelineRunner::new(
                &pipeline,
                EffectContext {
                    world,
                    supplier: None,
                    former: &former,
                    new_state: state,
                },
            );
            let outcome = match runner.run(EffectStage::Apply).outcome {
                PipelineOutcome::Completed => runner.run(EffectStage::PostEvent).outcome,
                other => other,
            };
            return Ok(match outcome {
                PipelineOutcome::Completed => CellChangeOutcome::Applied,
                PipelineOutcome::Skipped { .. } => CellChangeOutcome::Unchanged,
                PipelineOutcome::Failed { effect, cause } => {
                    tracing::warn!(%pos, effect = effect.name(), %cause, "untracked cell change failed");
                    CellChangeOutcome::Failed { effect, cause }
                }
            });
        }

        let ctx = self.top_mut();
        let phase = ctx.phase();
        let record_children =
            phase.has_specific_mutation_process(ctx) || phase.tracks_attached_entity_changes(ctx);
        let supplier = ctx.captured_cell_supplier()?;
        let id = supplier.log(TransactionKind::ChangeCell {
            original: former.clone(),
            new_state: state,
            flags,
            resulting: None,
        });

        supplier.push_parent(id);
        let report = PipelineRunner::new(
            &pipeline,
            EffectContext {
                world: &mut *world,
                supplier: if record_children {
                    Some(&mut *supplier)
                } else {
                    None
                },
                former: &former,
                new_state: state,
            },
        )
        .run(EffectStage::Apply);
        supplier.pop_parent(id);

        let PipelineOutcome::Failed { effect, cause } = report.outcome else {
            return Ok(CellChangeOutcome::Captured(id));
        };

        // Fail closed: revert whatever the pipeline did before failing.
        let outcomes = supplier.restore_subtree(id, world);
        if let Some(tx) = supplier.get_mut(id) {
            tx.failure = Some(EffectFailure {
                effect,
                cause: cause.clone(),
            });
        }
        let trace = self.stack_trace();
        tracing::warn!(
            phase = phase.name(),
            transaction = %id,
            %pos,
            effect = effect.name(),
            %cause,
            trace = %trace,
            "cell change failed while applying; transaction restored"
        );
        for (member, outcome) in outcomes {
            if let RestoreOutcome::Failed(error) = outcome {
                tracing::error!(transaction = %member, %error, trace = %trace, "failed to restore after effect failure");
            }
        }
        Ok(CellChangeOutcome::Failed { effect, cause })
    }

    /// Re-apply a cell snapshot without tracking it, even inside a capturing
    /// phase.
    pub fn restore_cell(
        &mut self,
        world: &mut dyn WorldAccess,
        snapshot: &CellSnapshot,
    ) -> Result<(), TrackerError> {
        self.check_thread("restore_cell");
        self.push_cause_frame(PhaseContext::new(Phase::CellRestoring));
        let result = world.apply_cell(snapshot);
        let _ = self.pop_checked(Phase::CellRestoring);
        result.map_err(TrackerError::from)
    }

    // -- attached entities ----------------------------------------------------

    pub fn add_attached(
        &mut self,
        world: &mut dyn WorldAccess,
        pos: CellPos,
        attached: AttachedEntity,
    ) -> Result<Option<TransactionId>, TrackerError> {
        self.check_thread("add_attached");
        let former = world.read_cell(pos)?;
        let previous = world.set_attached(pos, attached.clone())?;
        if !self.captures(Phase::tracks_attached_entity_changes) {
            return Ok(None);
        }
        let kind = match previous {
            Some(_) => TransactionKind::ReplaceAttached {
                original: former,
                replacement: attached,
                resulting: None,
            },
            None => TransactionKind::AddAttached {
                original: former,
                added: attached,
                resulting: None,
            },
        };
        Ok(Some(self.top_mut().captured_cell_supplier()?.log(kind)))
    }

    /// Remove the attached entity at `pos`. Returns `None` when nothing was
    /// attached or the removal was not tracked.
    pub fn remove_attached(
        &mut self,
        world: &mut dyn WorldAccess,
        pos: CellPos,
    ) -> Result<Option<TransactionId>, TrackerError> {
        self.check_thread("remove_attached");
        let former = world.read_cell(pos)?;
        if world.remove_attached(pos)?.is_none()
            || !self.captures(Phase::tracks_attached_entity_changes)
        {
            return Ok(None);
        }
        let kind = TransactionKind::RemoveAttached {
            original: former,
            resulting: None,
        };
        Ok(Some(self.top_mut().captured_cell_supplier()?.log(kind)))
    }

    // -- inventories ----------------------------------------------------------

    pub fn set_slot(
        &mut self,
        world: &mut dyn WorldAccess,
        container: ContainerId,
        slot: u32,
        stack: ItemStack,
    ) -> Result<Option<TransactionId>, TrackerError> {
        self.check_thread("set_slot");
        let original = world.read_slot(container, slot)?;
        world.write_slot(container, slot, stack)?;
        if !self.captures(|phase, _| phase.captures_inventory_changes()) {
            return Ok(None);
        }
        let kind = TransactionKind::SlotChange {
            original,
            resulting: None,
        };
        Ok(Some(self.top_mut().captured_cell_supplier()?.log(kind)))
    }

    /// Run `body` as a click on `container` by `holder`. Slot changes made
    /// inside become children of the click, and cancelling the click also
    /// restores the holder's cursor.
    pub fn container_click<W, R, F>(
        &mut self,
        world: &mut W,
        container: ContainerId,
        holder: EntityId,
        slot: Option<u32>,
        body: F,
    ) -> Result<(R, Option<TransactionId>), TrackerError>
    where
        W: WorldAccess,
        F: FnOnce(&mut PhaseTracker, &mut W) -> R,
    {
        self.check_thread("container_click");
        let creative = self.top().phase() == Phase::CreativeMenuClick;
        let cursor = CursorSnapshot {
            holder,
            stack: world.read_cursor(holder),
        };
        let kind = TransactionKind::ContainerClick {
            container,
            slot,
            creative,
            original_cursor: cursor,
            resulting_cursor: None,
        };
        self.with_session(world, kind, body)
    }

    /// Run `body` as a change to `holder`'s own inventory (swapping hands,
    /// picking up an item). Slot changes made inside become children.
    pub fn inventory_change<W, R, F>(
        &mut self,
        world: &mut W,
        holder: EntityId,
        container: ContainerId,
        action: InventoryAction,
        body: F,
    ) -> Result<(R, Option<TransactionId>), TrackerError>
    where
        W: WorldAccess,
        F: FnOnce(&mut PhaseTracker, &mut W) -> R,
    {
        self.check_thread("inventory_change");
        let kind = TransactionKind::InventoryChange {
            holder,
            container,
            action,
        };
        self.with_session(world, kind, body)
    }

    fn with_session<W, R, F>(
        &mut self,
        world: &mut W,
        kind: TransactionKind,
        body: F,
    ) -> Result<(R, Option<TransactionId>), TrackerError>
    where
        W: WorldAccess,
        F: FnOnce(&mut PhaseTracker, &mut W) -> R,
    {
        if !self.captures(|phase, _| phase.captures_inventory_changes()) {
            return Ok((body(self, world), None));
        }
        let depth = self.depth();
        let supplier = self.top_mut().captured_cell_supplier()?;
        let id = supplier.log(kind);
        supplier.push_parent(id);

        let value = body(self, world);

        assert_eq!(
            self.depth(),
            depth,
            "inventory session body left the phase stack unbalanced\n{}",
            self.stack_trace()
        );
        self.top_mut().captured_cell_supplier()?.pop_parent(id);
        Ok((value, Some(id)))
    }

    // -- neighbors and cell events --------------------------------------------

    /// Notify `target` that `source` changed. Deferred until commit when
    /// the current phase captures notifications. Both cells must be loaded
    /// either way.
    pub fn notify_neighbor(
        &mut self,
        world: &mut dyn WorldAccess,
        source: CellPos,
        target: CellPos,
    ) -> Result<Option<TransactionId>, TrackerError> {
        self.check_thread("notify_neighbor");
        let source_state = world.read_cell(source)?.state;
        let target_snapshot = world.read_cell(target)?;
        if !self.captures(Phase::captures_neighbor_notifications) {
            world.notify_neighbor(source, target);
            return Ok(None);
        }
        let kind = TransactionKind::NeighborNotification {
            source,
            source_state,
            target: target_snapshot,
        };
        Ok(Some(self.top_mut().captured_cell_supplier()?.log(kind)))
    }

    /// Queue a cell event. Returns `true` if it was held back until unwind.
    pub fn schedule_cell_event(
        &mut self,
        world: &mut dyn WorldAccess,
        event: ScheduledCellEvent,
    ) -> Result<bool, TrackerError> {
        self.check_thread("schedule_cell_event");
        if !self.captures(Phase::tracks_cell_events) {
            world.schedule_cell_event(event);
            return Ok(false);
        }
        self.top_mut().captured_cell_events()?.push(event);
        Ok(true)
    }

    // -- spawns ---------------------------------------------------------------

    /// Spawn an entity, buffering it when the current phase captures spawns
    /// and otherwise firing a single-entity spawn event first.
    pub fn spawn_entity(
        &mut self,
        world: &mut dyn WorldAccess,
        bus: &mut dyn ObserverBus,
        entity: EntitySnapshot,
    ) -> Result<SpawnOutcome, TrackerError> {
        self.check_thread("spawn_entity");
        let phase = self.top().phase();
        if !self.top().flags().entity_events || !phase.fires_events() {
            return Ok(SpawnOutcome::Spawned(world.spawn_entity(&entity)?));
        }
        if self.captures(|phase, _| phase.captures_entity_spawns()) {
            self.top_mut().captured_entity_supplier()?.push(entity);
            return Ok(SpawnOutcome::Captured);
        }
        self.spawn_now(world, bus, entity, phase.spawn_type())
    }

    /// Drop an item into the world as an entity.
    pub fn drop_item(
        &mut self,
        world: &mut dyn WorldAccess,
        bus: &mut dyn ObserverBus,
        drop: ItemDrop,
    ) -> Result<SpawnOutcome, TrackerError> {
        self.check_thread("drop_item");
        if !self.top().flags().entity_events || !self.top().phase().fires_events() {
            return Ok(SpawnOutcome::Spawned(world.spawn_entity(&drop.to_entity())?));
        }
        if self.captures(Phase::captures_item_drops) {
            self.top_mut().captured_items_supplier()?.push(drop);
            return Ok(SpawnOutcome::Captured);
        }
        self.spawn_now(world, bus, drop.to_entity(), SpawnType::DroppedItem)
    }

    fn spawn_now(
        &mut self,
        world: &mut dyn WorldAccess,
        bus: &mut dyn ObserverBus,
        entity: EntitySnapshot,
        spawn_type: SpawnType,
    ) -> Result<SpawnOutcome, TrackerError> {
        let event = DomainEvent {
            sequence: 0,
            kind: EventKind::SpawnEntity,
            phase: self.top().phase(),
            frame: self
                .current_frame()
                .with_context(ContextKey::SpawnType, ContextValue::SpawnType(spawn_type)),
            transactions: Vec::new(),
            entities: vec![entity],
        };
        if bus.dispatch(&event) {
            tracing::debug!(phase = event.phase.name(), "spawn cancelled");
            return Ok(SpawnOutcome::Cancelled);
        }
        let id = world.spawn_entity(&event.entities[0])?;
        Ok(SpawnOutcome::Spawned(id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
