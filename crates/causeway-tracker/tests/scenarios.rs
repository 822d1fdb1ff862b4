//! End-to-end capture, dispatch and restore scenarios.
//!
//! Each scenario drives a [`PhaseTracker`] against a [`GridWorld`] and checks
//! the world's signal log, the recorded events and the tick journal. The
//! failure scenarios at the end wrap the world in a `FlakyWorld` that refuses
//! chosen writes and restores.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use causeway_journal::journal::Resolution;
use causeway_tracker::prelude::*;
use causeway_world::prelude::*;

const SOLID: CellState = CellState::of(1);
const CHEST: CellState = CellState::of(54);

fn p() -> CellPos {
    CellPos::new(0, 64, 0)
}

fn applied_at(world: &GridWorld, pos: CellPos) -> usize {
    world
        .signals()
        .iter()
        .filter(|s| matches!(s, WorldSignal::CellApplied { pos: at, .. } if *at == pos))
        .count()
}

fn chest_world() -> GridWorld {
    let mut world = GridWorld::new();
    world.register_attached_kind(CHEST.kind);
    world.write_cell_state(p(), CHEST).unwrap();
    world
        .set_attached(p(), AttachedEntity::new("chest", serde_json::json!({ "items": 3 })))
        .unwrap();
    world.take_signals();
    world
}

// -- Scenario A: accepted capture stays applied ------------------------------

#[test]
fn scenario_a_accepted_change_is_kept_without_restore() {
    let mut world = GridWorld::new();
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let mut bus = RecordingBus::accepting();
    tracker.begin_tick(1);

    tracker.push_cause_frame(PhaseContext::for_phase(Phase::CellTick));
    let outcome = tracker
        .set_cell(&mut world, p(), SOLID, ChangeFlags::DEFAULT)
        .unwrap();
    assert!(matches!(outcome, CellChangeOutcome::Captured(_)));
    let report = tracker.pop_cause_frame(Phase::CellTick, &mut world, &mut bus);

    assert_eq!(world.cell(p()), SOLID);
    assert_eq!(applied_at(&world, p()), 0, "no restore may run");
    assert_eq!(report.events_fired, 1);
    assert_eq!(report.committed, 1);
    assert_eq!(report.restored, 0);
    assert_eq!(bus.events()[0].kind, EventKind::ChangeCell);
    assert_eq!(tracker.journal().summary().committed, 1);
}

// -- Scenario B: cancelled capture is restored once --------------------------

#[test]
fn scenario_b_cancelled_change_is_restored_exactly_once() {
    let mut world = GridWorld::new();
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let mut bus = RecordingBus::cancelling(|_| true);
    tracker.begin_tick(1);

    tracker.push_cause_frame(PhaseContext::for_phase(Phase::CellTick));
    tracker
        .set_cell(&mut world, p(), SOLID, ChangeFlags::DEFAULT)
        .unwrap();
    let report = tracker.pop_cause_frame(Phase::CellTick, &mut world, &mut bus);

    assert_eq!(world.cell(p()), CellState::AIR);
    assert_eq!(world.read_cell(p()).unwrap(), CellSnapshot::new(p(), CellState::AIR));
    assert_eq!(applied_at(&world, p()), 1);
    assert_eq!(report.events_cancelled, 1);
    assert_eq!(report.restored, 1);
    assert_eq!(
        tracker
            .journal()
            .entries_with(|r| *r == Resolution::Restored)
            .count(),
        1
    );
    // Post-event effects never ran for the cancelled change.
    assert!(!world
        .signals()
        .contains(&WorldSignal::ObserversNotified { pos: p() }));
}

// -- Scenario C: independent events resolve independently --------------------

#[test]
fn scenario_c_first_event_cancelled_second_kept() {
    let mut world = GridWorld::new();
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let mut seen = 0;
    let mut bus = RecordingBus::cancelling(move |_| {
        seen += 1;
        seen == 1
    });
    let q = CellPos::new(5, 64, 5);

    tracker.push_cause_frame(PhaseContext::for_phase(Phase::CellTick));
    tracker
        .set_cell(&mut world, p(), SOLID, ChangeFlags::DEFAULT)
        .unwrap();
    tracker
        .set_cell(&mut world, q, SOLID, ChangeFlags::DEFAULT)
        .unwrap();
    let report = tracker.pop_cause_frame(Phase::CellTick, &mut world, &mut bus);

    assert_eq!(report.events_fired, 2);
    assert_eq!(world.cell(p()), CellState::AIR);
    assert_eq!(world.cell(q), SOLID);
    assert_eq!(bus.events()[0].positions(), vec![p()]);
    assert_eq!(bus.events()[1].positions(), vec![q]);
    assert_eq!(bus.events()[1].sequence, 1);
}

// -- Scenario D: children restore before their parent ------------------------

#[test]
fn scenario_d_child_is_restored_before_parent() {
    let mut world = chest_world();
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let mut bus = RecordingBus::cancelling(|_| true);
    tracker.begin_tick(3);

    tracker.push_cause_frame(PhaseContext::for_phase(Phase::CellTick));
    let outcome = tracker
        .set_cell(&mut world, p(), SOLID, ChangeFlags::DEFAULT)
        .unwrap();
    let CellChangeOutcome::Captured(parent) = outcome else {
        panic!("expected a captured change, got {outcome:?}");
    };
    let children = tracker
        .captured_transaction(parent)
        .unwrap()
        .children()
        .to_vec();
    assert_eq!(children.len(), 1, "attached-entity removal is a child");
    assert!(world.attached(p()).is_none());
    world.take_signals();

    tracker.pop_cause_frame(Phase::CellTick, &mut world, &mut bus);

    let restores: Vec<WorldSignal> = world
        .take_signals()
        .into_iter()
        .filter(|s| {
            matches!(
                s,
                WorldSignal::AttachedSet { .. } | WorldSignal::CellApplied { .. }
            )
        })
        .collect();
    assert_eq!(
        restores,
        vec![
            WorldSignal::AttachedSet { pos: p() },
            WorldSignal::CellApplied {
                pos: p(),
                state: CHEST
            },
        ]
    );

    let order: Vec<Option<u32>> = tracker
        .journal()
        .entries()
        .iter()
        .map(|e| e.transaction)
        .collect();
    assert_eq!(order, vec![Some(children[0].0), Some(parent.0)]);
    assert_eq!(world.cell(p()), CHEST);
    assert_eq!(
        world.attached(p()).map(|a| a.data["items"].clone()),
        Some(serde_json::json!(3))
    );
}

// -- Scenario E: off-thread use is fatal ------------------------------------

/// Run `op` against `tracker` on a fresh thread and return the panic message,
/// if any, along with the tracker and world.
fn off_thread<F>(
    tracker: PhaseTracker,
    world: GridWorld,
    op: F,
) -> (PhaseTracker, GridWorld, Option<String>)
where
    F: FnOnce(&mut PhaseTracker, &mut GridWorld) + Send + 'static,
{
    thread::spawn(move || {
        let mut tracker = tracker;
        let mut world = world;
        let result = panic::catch_unwind(AssertUnwindSafe(|| op(&mut tracker, &mut world)));
        let message = result.err().map(|payload| match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(_) => "non-string panic".to_owned(),
        });
        (tracker, world, message)
    })
    .join()
    .expect("worker thread should return")
}

#[test]
fn scenario_e_off_thread_capture_panics_without_mutating() {
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let world = GridWorld::new();
    tracker.push_cause_frame(PhaseContext::for_phase(Phase::CellTick));
    let before = world.state_hash();

    let (mut tracker, mut world, message) = off_thread(tracker, world, |tracker, world| {
        let _ = tracker.set_cell(world, p(), SOLID, ChangeFlags::DEFAULT);
    });

    let message = message.expect("off-thread set_cell must panic");
    assert!(message.contains("set_cell called off the engine thread"), "{message}");
    assert!(message.contains("cell_tick"), "diagnostic carries the phase stack: {message}");
    assert_eq!(world.state_hash(), before);
    assert!(world.signals().is_empty());
    assert_eq!(tracker.depth(), 1);
    assert_eq!(tracker.summary().phases[1].captured_transactions, 0);

    // The owning thread can still use it.
    let report = tracker.pop_cause_frame(Phase::CellTick, &mut world, &mut AcceptAll);
    assert_eq!(report.events_fired, 0);
}

#[test]
fn scenario_e_every_entry_point_checks_the_thread() {
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let mut world = GridWorld::new();
    world.add_container(ContainerId(1), 9);

    type Op = Box<dyn FnOnce(&mut PhaseTracker, &mut GridWorld) + Send>;
    let ops: Vec<(&str, Op)> = vec![
        (
            "push_cause_frame",
            Box::new(|t: &mut PhaseTracker, _: &mut GridWorld| {
                t.push_cause_frame(PhaseContext::for_phase(Phase::Explosion))
            }),
        ),
        (
            "set_slot",
            Box::new(|t: &mut PhaseTracker, w: &mut GridWorld| {
                let _ = t.set_slot(w, ContainerId(1), 0, ItemStack::new("stone", 1));
            }),
        ),
        (
            "spawn_entity",
            Box::new(|t: &mut PhaseTracker, w: &mut GridWorld| {
                let entity = EntitySnapshot::pending("pig", p(), serde_json::Value::Null);
                let _ = t.spawn_entity(w, &mut AcceptAll, entity);
            }),
        ),
        (
            "current_context",
            Box::new(|t: &mut PhaseTracker, _: &mut GridWorld| {
                let _ = t.current_context();
            }),
        ),
    ];

    for (name, op) in ops {
        let (t, w, message) = off_thread(tracker, world, op);
        tracker = t;
        world = w;
        let message = message.unwrap_or_else(|| panic!("{name} must panic off-thread"));
        assert!(message.contains(&format!("{name} called off the engine thread")), "{message}");
    }
    assert_eq!(tracker.depth(), 0);
    assert_eq!(world.entity_count(), 0);
    assert_eq!(world.slot(ContainerId(1), 0), Some(&ItemStack::empty()));
}

// -- Provenance --------------------------------------------------------------

#[test]
fn events_carry_owner_and_frame_mutator_causes() {
    let mut world = GridWorld::new();
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let mut bus = RecordingBus::accepting();
    let owner = EntityId::new(9, 0);

    let ctx = PhaseContext::for_phase(Phase::ExtensionCommand)
        .with_source(Cause::Extension("terraform".to_owned()))
        .with_owner(owner);
    let _ = tracker.run_phase(ctx, &mut world, &mut bus, |tracker, world| {
        tracker
            .set_cell(world, p(), SOLID, ChangeFlags::DEFAULT)
            .unwrap();
    });

    let frame = &bus.events()[0].frame;
    assert_eq!(frame.owner(), Some(owner));
    assert_eq!(
        frame.causes().first(),
        Some(&Cause::Cell {
            pos: p(),
            state: CellState::AIR
        })
    );
    assert!(frame
        .causes()
        .find(|c| *c == Cause::Extension("terraform".to_owned()))
        .is_some());
}

// -- Panicking phase bodies ----------------------------------------------------

#[test]
fn panicking_body_restores_and_pops() {
    let mut world = GridWorld::new();
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let mut bus = RecordingBus::accepting();
    let before = world.state_hash();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        tracker.run_phase(
            PhaseContext::for_phase(Phase::EntityTick),
            &mut world,
            &mut bus,
            |tracker, world| {
                tracker
                    .set_cell(world, p(), SOLID, ChangeFlags::DEFAULT)
                    .unwrap();
                tracker.push_cause_frame(PhaseContext::for_phase(Phase::Explosion));
                tracker
                    .set_cell(world, CellPos::new(1, 64, 0), SOLID, ChangeFlags::DEFAULT)
                    .unwrap();
                panic!("system blew up");
            },
        )
    }));

    assert!(result.is_err());
    assert_eq!(tracker.depth(), 0);
    assert_eq!(world.state_hash(), before);
    assert!(bus.events().is_empty(), "aborted phases fire no events");
    assert_eq!(tracker.summary().unwound, 2);
}

#[test]
fn abort_without_restore_leaves_mutations() {
    let mut world = GridWorld::new();
    let mut tracker = PhaseTracker::new(TrackerConfig {
        restore_on_abort: false,
        ..TrackerConfig::default()
    });

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        tracker.run_phase(
            PhaseContext::for_phase(Phase::EntityTick),
            &mut world,
            &mut AcceptAll,
            |tracker, world| {
                tracker
                    .set_cell(world, p(), SOLID, ChangeFlags::DEFAULT)
                    .unwrap();
                panic!("system blew up");
            },
        )
    }));

    assert!(result.is_err());
    assert_eq!(tracker.depth(), 0);
    assert_eq!(world.cell(p()), SOLID);
}

// -- Failing worlds ----------------------------------------------------------

/// A [`GridWorld`] that refuses chosen operations at chosen cells.
#[derive(Default)]
struct FlakyWorld {
    inner: GridWorld,
    /// `write_cell_state` fails here.
    reject_writes: HashSet<CellPos>,
    /// `apply_cell` fails here.
    reject_restores: HashSet<CellPos>,
    /// Reported as unloaded, although reads still succeed.
    dark: HashSet<CellPos>,
}

impl WorldAccess for FlakyWorld {
    fn is_loaded(&self, pos: CellPos) -> bool {
        !self.dark.contains(&pos) && self.inner.is_loaded(pos)
    }

    fn read_cell(&self, pos: CellPos) -> Result<CellSnapshot, WorldError> {
        self.inner.read_cell(pos)
    }

    fn write_cell_state(
        &mut self,
        pos: CellPos,
        state: CellState,
    ) -> Result<CellState, WorldError> {
        if self.reject_writes.contains(&pos) {
            return Err(WorldError::Unloaded { pos });
        }
        self.inner.write_cell_state(pos, state)
    }

    fn apply_cell(&mut self, snapshot: &CellSnapshot) -> Result<(), WorldError> {
        if self.reject_restores.contains(&snapshot.pos) {
            return Err(WorldError::Unloaded { pos: snapshot.pos });
        }
        self.inner.apply_cell(snapshot)
    }

    fn carries_attached(&self, state: CellState) -> bool {
        self.inner.carries_attached(state)
    }

    fn attached(&self, pos: CellPos) -> Option<&AttachedEntity> {
        self.inner.attached(pos)
    }

    fn set_attached(
        &mut self,
        pos: CellPos,
        attached: AttachedEntity,
    ) -> Result<Option<AttachedEntity>, WorldError> {
        self.inner.set_attached(pos, attached)
    }

    fn remove_attached(&mut self, pos: CellPos) -> Result<Option<AttachedEntity>, WorldError> {
        self.inner.remove_attached(pos)
    }

    fn read_slot(&self, container: ContainerId, slot: u32) -> Result<SlotSnapshot, WorldError> {
        self.inner.read_slot(container, slot)
    }

    fn write_slot(
        &mut self,
        container: ContainerId,
        slot: u32,
        stack: ItemStack,
    ) -> Result<ItemStack, WorldError> {
        self.inner.write_slot(container, slot, stack)
    }

    fn read_cursor(&self, holder: EntityId) -> ItemStack {
        self.inner.read_cursor(holder)
    }

    fn write_cursor(&mut self, holder: EntityId, stack: ItemStack) -> ItemStack {
        self.inner.write_cursor(holder, stack)
    }

    fn spawn_entity(&mut self, entity: &EntitySnapshot) -> Result<EntityId, WorldError> {
        self.inner.spawn_entity(entity)
    }

    fn despawn_entity(&mut self, id: EntityId) -> Result<EntitySnapshot, WorldError> {
        self.inner.despawn_entity(id)
    }

    fn entity(&self, id: EntityId) -> Option<&EntitySnapshot> {
        self.inner.entity(id)
    }

    fn update_light(&mut self, pos: CellPos) {
        self.inner.update_light(pos)
    }

    fn refresh_attached(&mut self, pos: CellPos) {
        self.inner.refresh_attached(pos)
    }

    fn notify_observers(&mut self, pos: CellPos) {
        self.inner.notify_observers(pos)
    }

    fn notify_neighbor(&mut self, source: CellPos, target: CellPos) {
        self.inner.notify_neighbor(source, target)
    }

    fn schedule_cell_event(&mut self, event: ScheduledCellEvent) {
        self.inner.schedule_cell_event(event)
    }
}

fn q() -> CellPos {
    CellPos::new(1, 64, 0)
}

fn journaled(tracker: &PhaseTracker) -> Vec<Resolution> {
    tracker
        .journal()
        .entries()
        .iter()
        .map(|e| e.resolution.clone())
        .collect()
}

#[test]
fn failed_apply_is_reverted_and_journaled_without_an_event() {
    let mut world = FlakyWorld::default();
    world.reject_writes.insert(p());
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let mut bus = RecordingBus::accepting();

    tracker.push_cause_frame(PhaseContext::for_phase(Phase::EntityTick));
    let failed = tracker
        .set_cell(&mut world, p(), SOLID, ChangeFlags::DEFAULT)
        .unwrap();
    let kept = tracker
        .set_cell(&mut world, q(), SOLID, ChangeFlags::DEFAULT)
        .unwrap();
    let report = tracker.pop_cause_frame(Phase::EntityTick, &mut world, &mut bus);

    assert!(matches!(
        failed,
        CellChangeOutcome::Failed { effect: Effect::WriteCellData, .. }
    ));
    assert!(matches!(kept, CellChangeOutcome::Captured(_)));
    assert_eq!(world.inner.cell(p()), CellState::AIR);
    assert_eq!(world.inner.cell(q()), SOLID);
    assert_eq!(report.events_fired, 1, "failed transactions are never offered");
    assert_eq!(bus.events()[0].transactions[0].original.position(), Some(q()));
    assert_eq!((report.failed, report.committed), (1, 1));
    assert!(!report.is_clean());

    let resolutions = journaled(&tracker);
    assert!(matches!(
        &resolutions[0],
        Resolution::EffectFailed { effect, .. } if effect == "write_cell_data"
    ));
    assert_eq!(resolutions[1], Resolution::Committed);
}

#[test]
fn failed_restore_is_journaled_and_leaves_the_change() {
    let mut world = FlakyWorld::default();
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let mut bus = RecordingBus::cancelling(|_| true);

    tracker.push_cause_frame(PhaseContext::for_phase(Phase::EntityTick));
    tracker
        .set_cell(&mut world, p(), SOLID, ChangeFlags::DEFAULT)
        .unwrap();
    world.reject_restores.insert(p());
    let report = tracker.pop_cause_frame(Phase::EntityTick, &mut world, &mut bus);

    assert_eq!(report.events_cancelled, 1);
    assert_eq!((report.failed, report.restored), (1, 0));
    assert!(!report.is_clean());
    assert_eq!(world.inner.cell(p()), SOLID, "the world diverged");
    assert!(matches!(
        journaled(&tracker).as_slice(),
        [Resolution::RestoreFailed { .. }]
    ));
    assert_eq!(tracker.depth(), 0);
}

#[test]
fn post_event_failure_restores_only_its_own_transaction() {
    let mut world = FlakyWorld::default();
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let mut bus = RecordingBus::accepting();

    tracker.push_cause_frame(PhaseContext::for_phase(Phase::Explosion));
    for pos in [p(), q()] {
        tracker
            .set_cell(&mut world, pos, SOLID, ChangeFlags::DEFAULT)
            .unwrap();
    }
    world.dark.insert(p());
    world.inner.take_signals();
    let report = tracker.pop_cause_frame(Phase::Explosion, &mut world, &mut bus);

    assert_eq!(report.events_fired, 1);
    assert_eq!(bus.events()[0].transactions.len(), 2);
    assert_eq!((report.failed, report.committed), (1, 1));
    assert_eq!(world.inner.cell(p()), CellState::AIR);
    assert_eq!(world.inner.cell(q()), SOLID);

    let signals = world.inner.signals();
    assert!(signals.contains(&WorldSignal::ObserversNotified { pos: q() }));
    assert!(!signals.contains(&WorldSignal::ObserversNotified { pos: p() }));

    let entries = tracker.journal().entries();
    assert_eq!(entries.len(), 2);
    assert!(matches!(
        &entries[0].resolution,
        Resolution::EffectFailed { effect, .. } if effect == "notify_observers"
    ));
    assert_eq!(entries[0].event, Some(0));
    assert_eq!(entries[1].resolution, Resolution::Committed);
    assert_eq!(entries[1].original.position(), Some(q()));
}

#[test]
fn stranded_capture_is_journaled_as_inconsistent() {
    for cancel in [false, true] {
        let mut world = GridWorld::new();
        let mut tracker = PhaseTracker::new(TrackerConfig::default());
        let mut bus = RecordingBus::cancelling(move |_| cancel);

        tracker.push_cause_frame(PhaseContext::for_phase(Phase::EntityTick));
        tracker
            .set_cell(&mut world, p(), SOLID, ChangeFlags::DEFAULT)
            .unwrap();
        world.unload_chunk(p().chunk());
        let report = tracker.pop_cause_frame(Phase::EntityTick, &mut world, &mut bus);

        assert_eq!(report.inconsistent, 1, "cancel = {cancel}");
        assert_eq!(report.failed, 0);
        assert!(!report.is_clean());
        assert_eq!(journaled(&tracker), [Resolution::Inconsistent]);
        world.load_chunk(p().chunk());
        assert_eq!(world.cell(p()), SOLID, "nothing was written back");
    }
}
