//! Turning a popped phase into domain events.
//!
//! When a context is popped its capture buffers are consumed in a fixed
//! order:
//!
//! 1. **Finalize.** The transaction log is frozen and every resulting
//!    snapshot is read from the world. A transaction whose target can no
//!    longer be read is a capture inconsistency: logged, skipped by the
//!    post-event effects if its event is accepted, and restored as a no-op
//!    if it is cancelled.
//! 2. **Group.** Top-level transactions become [`DomainEvent`]s, one each or
//!    one per [`EventKind`] depending on the phase's
//!    [`EventGrouping`]. Children travel with their parent.
//! 3. **Dispatch.** Events go to the bus in creation order. A cancelled
//!    event restores every backing transaction newest first. An accepted
//!    event commits depth-first (children before parents) and runs the
//!    post-event effects of each cell change; if one fails, that
//!    transaction's subtree is restored and nothing else is touched.
//! 4. **Flush.** Captured scheduled cell events reach the world unless their
//!    cell was restored.
//! 5. **Spawn.** Captured entities and item drops each fire one batched
//!    spawn event; accepted batches are spawned.
//!
//! Every resolution is written to the [`TransactionJournal`].
//!
//! # Superseded transactions
//!
//! When two transactions in one phase write the same cell or slot, the
//! earlier is superseded by the later, even when one of them sits inside a
//! container click and the other does not. Restoring a superseded
//! transaction while its successor still stands does not write to the world. Instead
//! the successor's original snapshot is rebased onto the superseded one's,
//! so that cancelling the successor later restores the state from before
//! the phase rather than the intermediate one.

use std::collections::HashSet;

use causeway_journal::journal::{JournalEntry, Resolution, TransactionJournal};
use causeway_world::access::WorldAccess;
use causeway_world::cell::CellPos;
use causeway_world::entity::EntityId;
use causeway_world::snapshot::{EntitySnapshot, Snapshot};
use serde::Serialize;

use crate::cause::{CauseFrame, ContextKey, ContextValue, SpawnType};
use crate::context::{Captures, PhaseContext};
use crate::effect::{
    EffectContext, EffectPipeline, EffectStage, PipelineOutcome, PipelineRunner,
};
use crate::event::{DomainEvent, EventTransaction, ObserverBus};
use crate::phase::{EventGrouping, Phase};
use crate::supplier::TransactionalCaptureSupplier;
use crate::transaction::{
    EventKind, RestoreOutcome, TransactionId, TransactionKind, TransactionState,
};

// ---------------------------------------------------------------------------
// UnwindReport
// ---------------------------------------------------------------------------

/// What happened when a phase unwound.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnwindReport {
    pub phase: Option<Phase>,
    pub events_fired: usize,
    pub events_cancelled: usize,
    pub committed: usize,
    pub restored: usize,
    pub no_op: usize,
    pub superseded: usize,
    pub inconsistent: usize,
    /// Transactions whose effects or restore failed.
    pub failed: usize,
    /// Entities spawned from captured spawns and item drops.
    pub spawned: Vec<EntityId>,
    pub spawns_cancelled: usize,
    pub cell_events_flushed: usize,
    /// Captured cell events dropped because their cell was restored.
    pub cell_events_dropped: usize,
}

impl UnwindReport {
    pub(crate) fn empty(phase: Phase) -> Self {
        Self {
            phase: Some(phase),
            ..Self::default()
        }
    }

    /// No transaction failed to apply its effects or to restore, and every
    /// resulting snapshot could be read back.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.inconsistent == 0
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Consume the captures of a popped context and resolve them.
pub(crate) fn unwind_context(
    ctx: &mut PhaseContext,
    base: CauseFrame,
    world: &mut dyn WorldAccess,
    bus: &mut dyn ObserverBus,
    journal: Option<&mut TransactionJournal>,
    trace: &str,
) -> UnwindReport {
    let phase = ctx.phase();
    let frame = ctx.frame_modifier(base);
    let Some(captures) = ctx.take_captures() else {
        return UnwindReport::empty(phase);
    };
    let Captures {
        mut transactions,
        mut entities,
        mut items,
        mut cell_events,
    } = *captures;

    let mut unwinder = Unwinder::new(phase, world, journal, trace);
    unwinder.finalize(&mut transactions);

    for tops in group_transactions(&transactions, phase.event_grouping()) {
        unwinder.resolve_event(&mut transactions, &tops, &frame, bus);
    }

    cell_events.accept_and_clear_if_not_empty(|events| {
        for event in events {
            if unwinder.restored_cells.contains(&event.pos) {
                tracing::debug!(pos = %event.pos, event_id = event.event_id, "dropping cell event for restored cell");
                unwinder.report.cell_events_dropped += 1;
            } else {
                unwinder.world.schedule_cell_event(event);
                unwinder.report.cell_events_flushed += 1;
            }
        }
    });

    entities.accept_and_clear_if_not_empty(|batch| {
        unwinder.fire_spawns(batch, phase.spawn_type(), &frame, bus);
    });
    items.accept_and_clear_if_not_empty(|drops| {
        let batch = drops.iter().map(|drop| drop.to_entity()).collect();
        unwinder.fire_spawns(batch, SpawnType::DroppedItem, &frame, bus);
    });

    unwinder.report
}

/// Discard a context whose phase body panicked. No events are fired;
/// captured transactions are restored newest first when `restore` is set.
pub(crate) fn abort_context(
    ctx: &mut PhaseContext,
    world: &mut dyn WorldAccess,
    journal: Option<&mut TransactionJournal>,
    trace: &str,
    restore: bool,
) -> UnwindReport {
    let phase = ctx.phase();
    let Some(captures) = ctx.take_captures() else {
        return UnwindReport::empty(phase);
    };
    let Captures {
        mut transactions,
        entities,
        items,
        cell_events,
    } = *captures;

    let mut unwinder = Unwinder::new(phase, world, journal, trace);
    unwinder.finalize(&mut transactions);
    if restore {
        for index in (0..transactions.len()).rev() {
            unwinder.restore_one(
                &mut transactions,
                TransactionId(index as u32),
                Resolution::Restored,
                None,
                &[],
            );
        }
    }
    tracing::warn!(
        phase = phase.name(),
        transactions = transactions.len(),
        spawns = entities.len() + items.len(),
        cell_events = cell_events.len(),
        restored = restore,
        "aborted phase context"
    );
    unwinder.report
}

/// The still-standing transaction that overwrote `id`'s target, and whether
/// `id` itself was superseded. Without a successor of its own, a transaction
/// follows its root: the children of a superseded cell change describe a
/// cell the successor now owns.
fn live_successor(
    supplier: &TransactionalCaptureSupplier,
    id: TransactionId,
) -> Option<(TransactionId, bool)> {
    let live = |s: &TransactionId| {
        supplier
            .get(*s)
            .is_some_and(|tx| tx.state() != TransactionState::Restored)
    };
    let tx = supplier.get(id)?;
    match tx.superseded_by() {
        Some(successor) => live(&successor).then_some((successor, true)),
        None => {
            let root = supplier.root_of(id);
            if root == id {
                return None;
            }
            supplier
                .get(root)?
                .superseded_by()
                .filter(live)
                .map(|successor| (successor, false))
        }
    }
}

/// Top-level transactions per event, in creation order.
fn group_transactions(
    supplier: &TransactionalCaptureSupplier,
    grouping: EventGrouping,
) -> Vec<Vec<TransactionId>> {
    let tops = supplier
        .top_level()
        .filter(|tx| tx.state() == TransactionState::Pending);
    match grouping {
        EventGrouping::PerTransaction => tops.map(|tx| vec![tx.id()]).collect(),
        EventGrouping::Batched => {
            let mut groups: Vec<(EventKind, Vec<TransactionId>)> = Vec::new();
            for tx in tops {
                let kind = tx.event_kind();
                match groups.iter_mut().find(|(k, _)| *k == kind) {
                    Some((_, ids)) => ids.push(tx.id()),
                    None => groups.push((kind, vec![tx.id()])),
                }
            }
            groups.into_iter().map(|(_, ids)| ids).collect()
        }
    }
}

// ---------------------------------------------------------------------------
// Unwinder
// ---------------------------------------------------------------------------

struct Unwinder<'a> {
    phase: Phase,
    world: &'a mut dyn WorldAccess,
    journal: Option<&'a mut TransactionJournal>,
    trace: &'a str,
    report: UnwindReport,
    sequence: u32,
    inconsistent: HashSet<TransactionId>,
    restored_cells: HashSet<CellPos>,
}

impl<'a> Unwinder<'a> {
    fn new(
        phase: Phase,
        world: &'a mut dyn WorldAccess,
        journal: Option<&'a mut TransactionJournal>,
        trace: &'a str,
    ) -> Self {
        Self {
            phase,
            world,
            journal,
            trace,
            report: UnwindReport::empty(phase),
            sequence: 0,
            inconsistent: HashSet::new(),
            restored_cells: HashSet::new(),
        }
    }

    // -- step 1 -------------------------------------------------------------

    fn finalize(&mut self, supplier: &mut TransactionalCaptureSupplier) {
        supplier.freeze();
        for index in 0..supplier.len() {
            let id = TransactionId(index as u32);
            let Some(tx) = supplier.get(id) else { continue };

            if let Some(failure) = tx.failure().cloned() {
                // Failed while applying; already restored at capture time.
                for member in supplier.subtree(id) {
                    self.record(
                        supplier,
                        member,
                        None,
                        Resolution::EffectFailed {
                            effect: failure.effect.name().to_owned(),
                            cause: failure.cause.clone(),
                        },
                        &[],
                    );
                    self.report.failed += 1;
                }
                continue;
            }
            if tx.state() != TransactionState::Pending || !tx.owns_snapshot() {
                continue;
            }

            // A superseded write's result is what its successor overwrote.
            let successor_original = tx
                .superseded_by()
                .and_then(|s| supplier.get(s))
                .map(|s| s.original_snapshot());
            let Some(tx) = supplier.get_mut(id) else { continue };
            let outcome = match successor_original {
                Some(snapshot) => {
                    tx.set_resulting(snapshot);
                    Ok(())
                }
                None => tx.finalize(&*self.world),
            };
            if let Err(error) = outcome {
                tracing::warn!(
                    phase = self.phase.name(),
                    transaction = %id,
                    kind = tx.label(),
                    %error,
                    "capture inconsistency: resulting snapshot unavailable, treating as no-op restore"
                );
                self.inconsistent.insert(id);
            }
        }
    }

    // -- steps 2 and 3 --------------------------------------------------------

    fn resolve_event(
        &mut self,
        supplier: &mut TransactionalCaptureSupplier,
        tops: &[TransactionId],
        frame: &CauseFrame,
        bus: &mut dyn ObserverBus,
    ) {
        let Some(first) = tops.first().and_then(|id| supplier.get(*id)) else {
            return;
        };
        let kind = first.event_kind();

        let mut members: Vec<TransactionId> = tops
            .iter()
            .flat_map(|top| supplier.subtree(*top))
            .filter(|id| {
                supplier
                    .get(*id)
                    .is_some_and(|tx| tx.state() == TransactionState::Pending)
            })
            .collect();
        members.sort_unstable();

        let mut event_frame = frame.clone();
        for top in tops {
            if let Some(tx) = supplier.get(*top) {
                event_frame = tx.frame_mutator(event_frame);
            }
        }

        let event = DomainEvent {
            sequence: self.sequence,
            kind,
            phase: self.phase,
            frame: event_frame,
            transactions: members
                .iter()
                .filter_map(|id| supplier.get(*id))
                .map(|tx| EventTransaction {
                    id: tx.id(),
                    parent: tx.parent(),
                    kind: tx.label(),
                    original: tx.original_snapshot(),
                    resulting: tx.resulting_snapshot(),
                })
                .collect(),
            entities: Vec::new(),
        };

        let cancelled = bus.dispatch(&event);
        let sequence = self.sequence;
        self.sequence += 1;
        self.report.events_fired += 1;
        let causes = event.frame.describe();

        if cancelled {
            self.report.events_cancelled += 1;
            tracing::debug!(
                phase = self.phase.name(),
                sequence,
                kind = kind.name(),
                transactions = members.len(),
                "event cancelled, restoring"
            );
            for id in members.into_iter().rev() {
                self.restore_one(supplier, id, Resolution::Restored, Some(sequence), &causes);
            }
        } else {
            let mut committed = Vec::new();
            for top in tops {
                self.commit_subtree(supplier, *top, sequence, &causes, &mut committed);
            }
            for id in committed {
                if supplier.get(id).map(|tx| tx.state()) == Some(TransactionState::Committed) {
                    self.report.committed += 1;
                    self.record(supplier, id, Some(sequence), Resolution::Committed, &causes);
                }
            }
        }
    }

    /// Commit `id` after its children, running its post-event effects.
    fn commit_subtree(
        &mut self,
        supplier: &mut TransactionalCaptureSupplier,
        id: TransactionId,
        sequence: u32,
        causes: &[String],
        committed: &mut Vec<TransactionId>,
    ) {
        let children = supplier
            .get(id)
            .map(|tx| tx.children().to_vec())
            .unwrap_or_default();
        for child in children {
            self.commit_subtree(supplier, child, sequence, causes, committed);
        }

        let Some(tx) = supplier.get(id) else { return };
        if tx.state() != TransactionState::Pending {
            return;
        }
        if self.inconsistent.contains(&id) {
            // Already reported at finalize; its target is out of reach.
            tracing::debug!(transaction = %id, "skipping post-event effects of inconsistent transaction");
            if let Some(tx) = supplier.get_mut(id) {
                tx.mark_committed();
            }
            self.report.inconsistent += 1;
            self.record(supplier, id, Some(sequence), Resolution::Inconsistent, causes);
            return;
        }

        let failure = match tx.kind() {
            TransactionKind::ChangeCell {
                original,
                new_state,
                flags,
                ..
            } if !tx.is_noop() => {
                let pipeline = EffectPipeline::for_cell_change(*flags);
                let report = PipelineRunner::new(
                    &pipeline,
                    EffectContext {
                        world: &mut *self.world,
                        supplier: None,
                        former: original,
                        new_state: *new_state,
                    },
                )
                .run(EffectStage::PostEvent);
                match report.outcome {
                    PipelineOutcome::Failed { effect, cause } => Some((effect, cause)),
                    PipelineOutcome::Completed | PipelineOutcome::Skipped { .. } => None,
                }
            }
            TransactionKind::NeighborNotification { source, target, .. } => {
                self.world.notify_neighbor(*source, target.pos);
                None
            }
            _ => None,
        };

        match failure {
            None => {
                if let Some(tx) = supplier.get_mut(id) {
                    tx.mark_committed();
                }
                committed.push(id);
            }
            Some((effect, cause)) => {
                tracing::error!(
                    phase = self.phase.name(),
                    transaction = %id,
                    effect = effect.name(),
                    %cause,
                    trace = self.trace,
                    "post-event effect failed, restoring transaction"
                );
                let resolution = Resolution::EffectFailed {
                    effect: effect.name().to_owned(),
                    cause,
                };
                for member in supplier.subtree(id).into_iter().rev() {
                    self.restore_one(supplier, member, resolution.clone(), Some(sequence), causes);
                }
            }
        }
    }

    /// Restore one transaction and journal the outcome. `resolution` is
    /// recorded when the restore succeeds.
    fn restore_one(
        &mut self,
        supplier: &mut TransactionalCaptureSupplier,
        id: TransactionId,
        resolution: Resolution,
        sequence: Option<u32>,
        causes: &[String],
    ) {
        let Some(tx) = supplier.get(id) else { return };
        if tx.state() == TransactionState::Restored {
            return;
        }
        let is_failure = matches!(resolution, Resolution::EffectFailed { .. });

        if self.inconsistent.contains(&id) {
            if let Some(tx) = supplier.get_mut(id) {
                tx.mark_restored();
            }
            self.report.inconsistent += 1;
            self.record(supplier, id, sequence, Resolution::Inconsistent, causes);
            return;
        }

        if let Some((successor, own)) = live_successor(supplier, id) {
            if own {
                let original = supplier.get(id).map(|tx| tx.original_snapshot());
                if let (Some(original), Some(next)) = (original, supplier.get_mut(successor)) {
                    next.rebase_original(original);
                }
            }
            if let Some(tx) = supplier.get_mut(id) {
                tx.mark_restored();
            }
            tracing::debug!(transaction = %id, successor = %successor, "folded superseded transaction into its successor");
            self.report.superseded += 1;
            self.record(supplier, id, sequence, Resolution::Superseded, causes);
            return;
        }

        let Some(tx) = supplier.get_mut(id) else { return };
        let outcome = tx.restore(&mut *self.world);
        let position = tx.original_snapshot().position();
        let resolution = match outcome {
            RestoreOutcome::AlreadyRestored => return,
            RestoreOutcome::Restored | RestoreOutcome::NeverApplied => {
                if matches!(tx.kind(), TransactionKind::ChangeCell { .. }) {
                    if let Some(pos) = position {
                        self.restored_cells.insert(pos);
                    }
                }
                if is_failure {
                    self.report.failed += 1;
                } else {
                    self.report.restored += 1;
                }
                resolution
            }
            RestoreOutcome::NoOp => {
                if is_failure {
                    self.report.failed += 1;
                    resolution
                } else {
                    self.report.no_op += 1;
                    Resolution::NoOp
                }
            }
            RestoreOutcome::Failed(error) => {
                tracing::error!(
                    phase = self.phase.name(),
                    transaction = %id,
                    kind = tx.label(),
                    %error,
                    trace = self.trace,
                    "failed to restore transaction; world may diverge from its pre-phase state"
                );
                self.report.failed += 1;
                Resolution::RestoreFailed {
                    error: error.to_string(),
                }
            }
        };
        self.record(supplier, id, sequence, resolution, causes);
    }

    // -- step 5 -------------------------------------------------------------

    fn fire_spawns(
        &mut self,
        batch: Vec<EntitySnapshot>,
        spawn_type: SpawnType,
        frame: &CauseFrame,
        bus: &mut dyn ObserverBus,
    ) {
        let event = DomainEvent {
            sequence: self.sequence,
            kind: EventKind::SpawnEntity,
            phase: self.phase,
            frame: frame
                .clone()
                .with_context(ContextKey::SpawnType, ContextValue::SpawnType(spawn_type)),
            transactions: Vec::new(),
            entities: batch,
        };
        let cancelled = bus.dispatch(&event);
        let sequence = self.sequence;
        self.sequence += 1;
        self.report.events_fired += 1;
        let causes = event.frame.describe();

        if cancelled {
            self.report.events_cancelled += 1;
            self.report.spawns_cancelled += event.entities.len();
        }

        for entity in event.entities {
            let (resulting, resolution) = if cancelled {
                (None, Resolution::Restored)
            } else {
                match self.world.spawn_entity(&entity) {
                    Ok(id) => {
                        self.report.spawned.push(id);
                        let mut live = entity.clone();
                        live.id = Some(id);
                        (Some(Snapshot::Entity(live)), Resolution::Committed)
                    }
                    Err(error) => {
                        tracing::warn!(
                            phase = self.phase.name(),
                            kind = %entity.kind,
                            pos = %entity.pos,
                            %error,
                            "captured spawn could not be placed"
                        );
                        self.report.failed += 1;
                        (
                            None,
                            Resolution::EffectFailed {
                                effect: "spawn_entity".to_owned(),
                                cause: error.to_string(),
                            },
                        )
                    }
                }
            };
            self.write_journal(JournalEntry {
                tick: 0,
                phase: self.phase.name().to_owned(),
                transaction: None,
                parent: None,
                kind: EventKind::SpawnEntity.name().to_owned(),
                event: Some(sequence),
                original: Snapshot::Entity(entity),
                resulting,
                resolution,
                causes: causes.clone(),
            });
        }
    }

    // -- journal ------------------------------------------------------------

    fn record(
        &mut self,
        supplier: &TransactionalCaptureSupplier,
        id: TransactionId,
        sequence: Option<u32>,
        resolution: Resolution,
        causes: &[String],
    ) {
        let Some(tx) = supplier.get(id) else { return };
        self.write_journal(JournalEntry {
            tick: 0,
            phase: self.phase.name().to_owned(),
            transaction: Some(id.0),
            parent: tx.parent().map(|p| p.0),
            kind: tx.label().to_owned(),
            event: sequence,
            original: tx.original_snapshot(),
            resulting: tx.resulting_snapshot(),
            resolution,
            causes: causes.to_vec(),
        });
    }

    fn write_journal(&mut self, mut entry: JournalEntry) {
        if let Some(journal) = self.journal.as_deref_mut() {
            entry.tick = journal.tick();
            journal.record(entry);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
