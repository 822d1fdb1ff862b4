//! Spawn capture, item drops, deferred neighbor notifications and captured
//! cell events.

use causeway_journal::journal::Resolution;
use causeway_tracker::prelude::*;
use causeway_world::prelude::*;

fn p() -> CellPos {
    CellPos::new(0, 64, 0)
}

fn pig() -> EntitySnapshot {
    EntitySnapshot::pending("pig", p(), serde_json::json!({ "saddled": false }))
}

fn spawn_type_of(event: &DomainEvent) -> Option<SpawnType> {
    event.frame.spawn_type()
}

// -- 1. Captured spawns ----------------------------------------------------------

#[test]
fn captured_spawns_fire_one_batched_event() {
    let mut world = GridWorld::new();
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let mut bus = RecordingBus::accepting();

    let (outcomes, report) = tracker.run_phase(
        PhaseContext::for_phase(Phase::EntityTick),
        &mut world,
        &mut bus,
        |tracker, world| {
            let mut outcomes = Vec::new();
            for _ in 0..3 {
                outcomes.push(tracker.spawn_entity(world, &mut AcceptAll, pig()).unwrap());
            }
            assert_eq!(world.entity_count(), 0, "spawns wait for the unwind");
            outcomes
        },
    );

    assert_eq!(outcomes, vec![SpawnOutcome::Captured; 3]);
    assert_eq!(report.spawned.len(), 3);
    assert_eq!(world.entity_count(), 3);
    assert_eq!(bus.events().len(), 1);
    assert_eq!(bus.events()[0].kind, EventKind::SpawnEntity);
    assert_eq!(bus.events()[0].entities.len(), 3);
    assert_eq!(spawn_type_of(&bus.events()[0]), Some(SpawnType::Natural));
    assert_eq!(tracker.journal().summary().committed, 3);
}

#[test]
fn cancelled_spawn_batch_spawns_nothing() {
    let mut world = GridWorld::new();
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let mut bus = RecordingBus::cancelling(|e| e.kind == EventKind::SpawnEntity);

    let (_, report) = tracker.run_phase(
        PhaseContext::for_phase(Phase::ExtensionCommand),
        &mut world,
        &mut bus,
        |tracker, world| {
            tracker.spawn_entity(world, &mut AcceptAll, pig()).unwrap();
            tracker.spawn_entity(world, &mut AcceptAll, pig()).unwrap();
        },
    );

    assert_eq!(report.spawns_cancelled, 2);
    assert!(report.spawned.is_empty());
    assert_eq!(world.entity_count(), 0);
    assert_eq!(spawn_type_of(&bus.events()[0]), Some(SpawnType::Extension));
    assert_eq!(
        tracker
            .journal()
            .entries_with(|r| *r == Resolution::Restored)
            .count(),
        2
    );
}

#[test]
fn item_drops_become_dropped_item_spawns() {
    let mut world = GridWorld::new();
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let mut bus = RecordingBus::accepting();

    let ctx = PhaseContext::for_phase(Phase::Explosion)
        .with_source(Cause::Explosion { origin: p() });
    let (outcome, report) = tracker.run_phase(ctx, &mut world, &mut bus, |tracker, world| {
        let drop = ItemDrop::new(p(), ItemStack::new("tnt", 1));
        tracker.drop_item(world, &mut AcceptAll, drop).unwrap()
    });

    assert_eq!(outcome, SpawnOutcome::Captured);
    assert_eq!(report.spawned.len(), 1);
    let event = &bus.events()[0];
    assert_eq!(spawn_type_of(event), Some(SpawnType::DroppedItem));
    assert_eq!(event.entities[0].kind, "item");
    assert_eq!(event.frame.causes().first(), Some(&Cause::Explosion { origin: p() }));
    let spawned = world.entity(report.spawned[0]).unwrap();
    assert_eq!(spawned.data["item"], "tnt");
}

#[test]
fn spawn_into_unloaded_chunk_is_journaled_as_failed() {
    let mut world = GridWorld::new();
    let mut tracker = PhaseTracker::new(TrackerConfig::default());

    let (_, report) = tracker.run_phase(
        PhaseContext::for_phase(Phase::EntityTick),
        &mut world,
        &mut AcceptAll,
        |tracker, world| {
            tracker.spawn_entity(world, &mut AcceptAll, pig()).unwrap();
            world.unload_chunk(p().chunk());
        },
    );

    assert_eq!(report.failed, 1);
    assert!(!report.is_clean());
    assert_eq!(tracker.journal().summary().failed, 1);
}

// -- 2. Immediate spawns ---------------------------------------------------------

#[test]
fn cell_ticks_spawn_immediately_through_an_event() {
    let mut world = GridWorld::new();
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let mut bus = RecordingBus::accepting();

    tracker.push_cause_frame(PhaseContext::for_phase(Phase::CellTick));
    let outcome = tracker.spawn_entity(&mut world, &mut bus, pig()).unwrap();
    assert!(matches!(outcome, SpawnOutcome::Spawned(_)));
    assert_eq!(world.entity_count(), 1);
    assert_eq!(spawn_type_of(&bus.events()[0]), Some(SpawnType::CellSpawning));

    let mut cancel = RecordingBus::cancelling(|_| true);
    let outcome = tracker.spawn_entity(&mut world, &mut cancel, pig()).unwrap();
    assert_eq!(outcome, SpawnOutcome::Cancelled);
    assert_eq!(world.entity_count(), 1);
    tracker.pop_cause_frame(Phase::CellTick, &mut world, &mut AcceptAll);
}

#[test]
fn idle_and_flagged_spawns_skip_events() {
    let mut world = GridWorld::new();
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let mut bus = RecordingBus::cancelling(|_| true);

    let idle = tracker.spawn_entity(&mut world, &mut bus, pig()).unwrap();
    assert!(matches!(idle, SpawnOutcome::Spawned(_)));

    let flags = CaptureFlags {
        entity_events: false,
        ..CaptureFlags::default()
    };
    tracker.push_cause_frame(PhaseContext::for_phase(Phase::EntityTick).with_flags(flags));
    let flagged = tracker.spawn_entity(&mut world, &mut bus, pig()).unwrap();
    assert!(matches!(flagged, SpawnOutcome::Spawned(_)));
    tracker.pop_cause_frame(Phase::EntityTick, &mut world, &mut bus);

    assert_eq!(world.entity_count(), 2);
    assert!(bus.events().is_empty());
}

// -- 3. Neighbor notifications -----------------------------------------------------

#[test]
fn neighbor_notifications_wait_for_the_event() {
    let neighbor = CellPos::new(1, 64, 0);
    let notified = |world: &GridWorld| {
        world
            .signals()
            .contains(&WorldSignal::NeighborNotified {
                source: p(),
                target: neighbor,
            })
    };

    for cancel in [false, true] {
        let mut world = GridWorld::new();
        let mut tracker = PhaseTracker::new(TrackerConfig::default());
        let mut bus = RecordingBus::cancelling(move |_| cancel);

        tracker.push_cause_frame(PhaseContext::for_phase(Phase::NeighborNotify));
        let id = tracker.notify_neighbor(&mut world, p(), neighbor).unwrap();
        assert!(id.is_some());
        assert!(!notified(&world));
        tracker.pop_cause_frame(Phase::NeighborNotify, &mut world, &mut bus);

        assert_eq!(notified(&world), !cancel);
        let event = &bus.events()[0];
        assert_eq!(event.kind, EventKind::NotifyNeighbor);
        assert!(matches!(
            event.frame.causes().first(),
            Some(Cause::Cell { pos, .. }) if *pos == p()
        ));
    }
}

#[test]
fn idle_notifications_are_immediate() {
    let mut world = GridWorld::new();
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let target = CellPos::new(0, 65, 0);
    assert_eq!(tracker.notify_neighbor(&mut world, p(), target).unwrap(), None);
    assert_eq!(
        world.signals(),
        [WorldSignal::NeighborNotified { source: p(), target }]
    );
}

#[test]
fn notifications_into_unloaded_chunks_fail_in_every_phase() {
    let target = CellPos::new(-1, 64, 0);
    for phase in [Phase::Idle, Phase::NeighborNotify] {
        let mut world = GridWorld::new();
        world.unload_chunk(target.chunk());
        let mut tracker = PhaseTracker::new(TrackerConfig::default());
        if phase != Phase::Idle {
            tracker.push_cause_frame(PhaseContext::for_phase(phase));
        }

        let result = tracker.notify_neighbor(&mut world, p(), target);

        assert!(
            matches!(
                result,
                Err(TrackerError::World(WorldError::Unloaded { pos })) if pos == target
            ),
            "{phase}: {result:?}"
        );
        assert!(world.signals().is_empty(), "{phase}");
        if phase != Phase::Idle {
            let report = tracker.pop_cause_frame(phase, &mut world, &mut AcceptAll);
            assert_eq!(report.events_fired, 0);
        }
    }
}

// -- 4. Captured cell events -------------------------------------------------------

#[test]
fn cell_events_for_restored_cells_are_dropped() {
    let mut world = GridWorld::new();
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let q = CellPos::new(8, 64, 8);
    let piston = CellKind(33);
    let event_at = |pos| ScheduledCellEvent {
        pos,
        kind: piston,
        event_id: 0,
        param: 1,
    };
    let mut bus = RecordingBus::cancelling(|e| e.kind == EventKind::ChangeCell);

    let (held, report) = tracker.run_phase(
        PhaseContext::for_phase(Phase::ScheduledTask),
        &mut world,
        &mut bus,
        |tracker, world| {
            tracker
                .set_cell(world, p(), CellState::of(piston.0), ChangeFlags::DEFAULT)
                .unwrap();
            let a = tracker.schedule_cell_event(world, event_at(p())).unwrap();
            let b = tracker.schedule_cell_event(world, event_at(q)).unwrap();
            assert!(world.scheduled_events().is_empty());
            a && b
        },
    );

    assert!(held);
    assert_eq!(report.cell_events_dropped, 1);
    assert_eq!(report.cell_events_flushed, 1);
    assert_eq!(world.scheduled_events(), [event_at(q)]);
}

#[test]
fn cell_events_flag_disables_holding() {
    let mut world = GridWorld::new();
    let mut tracker = PhaseTracker::new(TrackerConfig::default());
    let flags = CaptureFlags {
        cell_events: false,
        ..CaptureFlags::default()
    };
    tracker.push_cause_frame(PhaseContext::for_phase(Phase::ScheduledTask).with_flags(flags));
    let held = tracker
        .schedule_cell_event(
            &mut world,
            ScheduledCellEvent {
                pos: p(),
                kind: CellKind(25),
                event_id: 0,
                param: 0,
            },
        )
        .unwrap();
    assert!(!held);
    assert_eq!(world.scheduled_events().len(), 1);
    tracker.pop_cause_frame(Phase::ScheduledTask, &mut world, &mut AcceptAll);
}
