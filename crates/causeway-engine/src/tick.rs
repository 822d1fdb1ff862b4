//! Fixed-timestep tick loop that runs systems inside tracked phases.
//!
//! The [`TickLoop`] owns the world, the [`PhaseTracker`] and the observer bus.
//! Each tick:
//!
//! 1. The tracker's journal is reset for the new tick.
//! 2. All registered systems run in declaration order, each inside its own
//!    phase context. Mutations a system makes through the tracker are
//!    captured, and the phase unwinds before the next system starts.
//! 3. Due scheduled tasks run, each in a `ScheduledTask` phase.
//! 4. The tick counter advances.
//!
//! # Example
//!
//! ```
//! use causeway_engine::tick::{TickConfig, TickLoop};
//! use causeway_tracker::prelude::*;
//! use causeway_world::prelude::*;
//!
//! let mut tick_loop = TickLoop::new(GridWorld::new(), TickConfig::default());
//!
//! tick_loop.add_system("grow", Phase::RandomCellTick, |tracker, world| {
//!     let pos = CellPos::new(0, 64, 0);
//!     tracker.set_cell(world, pos, CellState::of(2), ChangeFlags::DEFAULT).unwrap();
//! });
//!
//! tick_loop.run_ticks(10);
//! assert_eq!(tick_loop.tick_count(), 10);
//! assert_eq!(tick_loop.world().cell(CellPos::new(0, 64, 0)).kind, CellKind(2));
//! ```

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use causeway_journal::journal::TransactionJournal;
use causeway_tracker::prelude::*;
use causeway_world::prelude::*;

use crate::scheduler::{Scheduler, TaskRun};
use crate::EngineError;

// ---------------------------------------------------------------------------
// TickConfig
// ---------------------------------------------------------------------------

/// Configuration for the tick loop and the tracker it owns.
///
/// ```
/// use causeway_engine::tick::TickConfig;
///
/// let config = TickConfig::from_json_str(r#"{ "tracker": { "max_phase_depth": 8 } }"#).unwrap();
/// assert_eq!(config.tracker.max_phase_depth, 8);
/// assert!((config.fixed_dt - 1.0 / 20.0).abs() < f64::EPSILON);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Fixed time step in seconds per tick. Must be positive and finite.
    pub fixed_dt: f64,
    /// Ticks slower than this many milliseconds are logged. Zero disables
    /// the warning.
    pub slow_tick_ms: u64,
    pub tracker: TrackerConfig,
}

impl Default for TickConfig {
    /// Defaults to 20 Hz (1/20 second per tick).
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 20.0,
            slow_tick_ms: 50,
            tracker: TrackerConfig::default(),
        }
    }
}

impl TickConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: TickConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.fixed_dt > 0.0 && self.fixed_dt.is_finite() {
            Ok(())
        } else {
            Err(EngineError::InvalidTimestep(self.fixed_dt))
        }
    }
}

// ---------------------------------------------------------------------------
// TickDiagnostics
// ---------------------------------------------------------------------------

/// Timing and resolution diagnostics for the last tick.
#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    /// The tick these diagnostics describe.
    pub tick: u64,
    /// Wall-clock time per system (in order of execution).
    pub system_times: Vec<(String, Duration)>,
    /// How each system's phase unwound, in order of execution.
    pub system_reports: Vec<(String, UnwindReport)>,
    /// Scheduled tasks that ran this tick.
    pub task_runs: Vec<TaskRun>,
    /// Time spent running scheduled tasks.
    pub scheduler_time: Duration,
    /// Total time for the tick.
    pub total_time: Duration,
}

impl TickDiagnostics {
    /// Every unwind report of the tick, systems first.
    pub fn reports(&self) -> impl Iterator<Item = &UnwindReport> {
        self.system_reports
            .iter()
            .map(|(_, report)| report)
            .chain(self.task_runs.iter().map(|run| &run.report))
    }

    /// Events cancelled by observers across the whole tick.
    pub fn events_cancelled(&self) -> usize {
        self.reports().map(|r| r.events_cancelled).sum()
    }

    /// Transactions whose effects or restore failed across the whole tick.
    pub fn failed(&self) -> usize {
        self.reports().map(|r| r.failed).sum()
    }
}

// ---------------------------------------------------------------------------
// SystemFn
// ---------------------------------------------------------------------------

/// A system function run once per tick inside its phase.
///
/// Systems mutate the world through the tracker's instrumented entry points
/// so that every change they make is captured and can be cancelled.
pub type SystemFn<W> = fn(&mut PhaseTracker, &mut W);

/// A named system in the registry.
struct RegisteredSystem<W> {
    name: String,
    phase: Phase,
    func: SystemFn<W>,
    after: Vec<String>,
}

// ---------------------------------------------------------------------------
// TickLoop
// ---------------------------------------------------------------------------

/// The fixed-timestep tick loop.
///
/// Generic over the world and the observer bus. [`TickLoop::new`] uses
/// [`AcceptAll`]; use [`TickLoop::with_bus`] to install observers that may
/// cancel events.
pub struct TickLoop<W, B = AcceptAll> {
    world: W,
    tracker: PhaseTracker,
    bus: B,
    systems: Vec<RegisteredSystem<W>>,
    scheduler: Scheduler<W>,
    tick_counter: u64,
    config: TickConfig,
    last_diagnostics: TickDiagnostics,
}

impl<W: WorldAccess> TickLoop<W, AcceptAll> {
    /// Create a tick loop whose events are never cancelled.
    ///
    /// # Panics
    ///
    /// Panics if `config.fixed_dt` is not positive and finite.
    pub fn new(world: W, config: TickConfig) -> Self {
        Self::with_bus(world, AcceptAll, config)
    }
}

impl<W: WorldAccess, B: ObserverBus> TickLoop<W, B> {
    /// Create a tick loop that dispatches domain events to `bus`.
    ///
    /// # Panics
    ///
    /// Panics if `config.fixed_dt` is not positive and finite.
    pub fn with_bus(world: W, bus: B, config: TickConfig) -> Self {
        assert!(
            config.validate().is_ok(),
            "fixed_dt must be positive and finite, got {}",
            config.fixed_dt
        );
        Self {
            world,
            tracker: PhaseTracker::new(config.tracker.clone()),
            bus,
            systems: Vec::new(),
            scheduler: Scheduler::new(),
            tick_counter: 0,
            config,
            last_diagnostics: TickDiagnostics::default(),
        }
    }

    /// Register a system to be run each tick inside a `phase` context.
    ///
    /// Systems are executed in the order they are registered.
    ///
    /// # Panics
    ///
    /// Panics if a system with the same name is already registered.
    pub fn add_system(&mut self, name: &str, phase: Phase, func: SystemFn<W>) {
        self.add_system_after(name, phase, &[], func);
    }

    /// Register a system that must run after the systems named in `after`.
    ///
    /// Dependencies must already be registered, so registration order
    /// always satisfies them and no cycle can form.
    ///
    /// # Panics
    ///
    /// - If any system in `after` is not already registered.
    /// - If a system with this name already exists.
    pub fn add_system_after(
        &mut self,
        name: &str,
        phase: Phase,
        after: &[&str],
        func: SystemFn<W>,
    ) {
        for dep in after {
            assert!(
                self.systems.iter().any(|s| s.name == *dep),
                "system '{name}' declares dependency on '{dep}', but '{dep}' is not registered"
            );
        }
        assert!(
            !self.systems.iter().any(|s| s.name == name),
            "duplicate system name: {name:?}"
        );

        self.systems.push(RegisteredSystem {
            name: name.to_owned(),
            phase,
            func,
            after: after.iter().map(|s| s.to_string()).collect(),
        });
    }

    /// Execute one tick.
    pub fn tick(&mut self) -> &TickDiagnostics {
        let tick = self.tick_counter;
        let tick_start = Instant::now();
        self.tracker.begin_tick(tick);

        let mut system_times = Vec::with_capacity(self.systems.len());
        let mut system_reports = Vec::with_capacity(self.systems.len());
        for system in &self.systems {
            let sys_start = Instant::now();
            let func = system.func;
            let (_, report) = self.tracker.run_phase(
                PhaseContext::for_phase(system.phase),
                &mut self.world,
                &mut self.bus,
                |tracker, world| func(tracker, world),
            );
            if !report.is_clean() {
                tracing::warn!(
                    tick,
                    system = %system.name,
                    failed = report.failed,
                    inconsistent = report.inconsistent,
                    "system left failed or inconsistent transactions"
                );
            }
            system_times.push((system.name.clone(), sys_start.elapsed()));
            system_reports.push((system.name.clone(), report));
        }

        let scheduler_start = Instant::now();
        let task_runs =
            self.scheduler
                .run_due(tick, &mut self.tracker, &mut self.world, &mut self.bus);
        let scheduler_time = scheduler_start.elapsed();

        self.tick_counter += 1;

        let total_time = tick_start.elapsed();
        if self.config.slow_tick_ms > 0
            && total_time > Duration::from_millis(self.config.slow_tick_ms)
        {
            tracing::warn!(
                tick,
                elapsed_ms = total_time.as_millis() as u64,
                budget_ms = self.config.slow_tick_ms,
                "tick overran its budget"
            );
        }

        self.last_diagnostics = TickDiagnostics {
            tick,
            system_times,
            system_reports,
            task_runs,
            scheduler_time,
            total_time,
        };
        &self.last_diagnostics
    }

    /// Run `count` ticks. Returns the number of events cancelled across all
    /// of them.
    pub fn run_ticks(&mut self, count: u64) -> usize {
        let mut cancelled = 0;
        for _ in 0..count {
            cancelled += self.tick().events_cancelled();
        }
        cancelled
    }

    // -- accessors ----------------------------------------------------------

    /// The number of ticks executed so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_counter
    }

    /// The current simulation time in seconds.
    ///
    /// Computed as `tick_count * fixed_dt` to avoid floating-point drift from
    /// repeated addition.
    pub fn sim_time(&self) -> f64 {
        self.tick_counter as f64 * self.config.fixed_dt
    }

    pub fn config(&self) -> &TickConfig {
        &self.config
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    /// Mutable access to the world.
    ///
    /// Writes made here bypass the tracker. Appropriate for initial setup
    /// and testing.
    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    pub fn tracker(&self) -> &PhaseTracker {
        &self.tracker
    }

    /// The tracker, world and bus together, for driving phases by hand
    /// between ticks.
    pub fn parts_mut(&mut self) -> (&mut PhaseTracker, &mut W, &mut B) {
        (&mut self.tracker, &mut self.world, &mut self.bus)
    }

    /// The journal of the last tick.
    pub fn journal(&self) -> &TransactionJournal {
        self.tracker.journal()
    }

    /// The last tick's journal as pretty-printed JSON.
    pub fn export_journal(&self) -> Result<String, EngineError> {
        Ok(self.tracker.journal().to_json()?)
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn scheduler(&self) -> &Scheduler<W> {
        &self.scheduler
    }

    /// Schedule tasks here. Delays count from the next tick.
    pub fn scheduler_mut(&mut self) -> &mut Scheduler<W> {
        &mut self.scheduler
    }

    /// The number of registered systems.
    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    /// The names of all registered systems, in execution order.
    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|s| s.name.as_str()).collect()
    }

    /// The systems `name` was declared to run after.
    pub fn system_dependencies(&self, name: &str) -> Option<Vec<&str>> {
        self.systems
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.after.iter().map(String::as_str).collect())
    }

    /// Diagnostics from the last tick.
    pub fn last_diagnostics(&self) -> &TickDiagnostics {
        &self.last_diagnostics
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_journal::journal::Resolution;

    fn origin() -> CellPos {
        CellPos::new(0, 64, 0)
    }

    fn place_stone(tracker: &mut PhaseTracker, world: &mut GridWorld) {
        tracker
            .set_cell(world, origin(), CellState::of(1), ChangeFlags::DEFAULT)
            .unwrap();
    }

    fn place_dirt_east(tracker: &mut PhaseTracker, world: &mut GridWorld) {
        tracker
            .set_cell(world, CellPos::new(1, 64, 0), CellState::of(3), ChangeFlags::DEFAULT)
            .unwrap();
    }

    fn record_phase(tracker: &mut PhaseTracker, world: &mut GridWorld) {
        // Encodes the current phase into a cell so the test can read it back.
        let kind = match tracker.current_phase() {
            Phase::EntityTick => 10,
            Phase::Explosion => 11,
            _ => 99,
        };
        tracker
            .set_cell(world, origin(), CellState::of(kind), ChangeFlags::NONE)
            .unwrap();
    }

    // -- 1. Construction and config ---------------------------------------------

    #[test]
    fn new_tick_loop_starts_at_zero() {
        let tick_loop = TickLoop::new(GridWorld::new(), TickConfig::default());
        assert_eq!(tick_loop.tick_count(), 0);
        assert_eq!(tick_loop.sim_time(), 0.0);
        assert_eq!(tick_loop.system_count(), 0);
        assert_eq!(tick_loop.tracker().depth(), 0);
    }

    #[test]
    #[should_panic(expected = "fixed_dt must be positive")]
    fn zero_dt_panics() {
        let _tick_loop = TickLoop::new(
            GridWorld::new(),
            TickConfig {
                fixed_dt: 0.0,
                ..Default::default()
            },
        );
    }

    #[test]
    fn config_from_json_rejects_bad_timestep() {
        let err = TickConfig::from_json_str(r#"{ "fixed_dt": -1.0 }"#).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTimestep(dt) if dt == -1.0));
        let err = TickConfig::from_json_str(r#"{ "fixed_dt": "fast" }"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn tracker_settings_pass_through() {
        let config = TickConfig::from_json_str(r#"{ "tracker": { "record_journal": false } }"#)
            .unwrap();
        let mut tick_loop = TickLoop::new(GridWorld::new(), config);
        tick_loop.add_system("stone", Phase::EntityTick, place_stone);
        tick_loop.tick();
        assert!(tick_loop.journal().is_empty());
    }

    // -- 2. System registration -------------------------------------------------

    #[test]
    fn add_systems_in_order() {
        let mut tick_loop = TickLoop::new(GridWorld::new(), TickConfig::default());
        tick_loop.add_system("alpha", Phase::EntityTick, |_, _| {});
        tick_loop.add_system("beta", Phase::CellTick, |_, _| {});
        tick_loop.add_system_after("gamma", Phase::Explosion, &["alpha"], |_, _| {});

        assert_eq!(tick_loop.system_names(), vec!["alpha", "beta", "gamma"]);
        assert_eq!(tick_loop.system_dependencies("gamma"), Some(vec!["alpha"]));
        assert_eq!(tick_loop.system_dependencies("delta"), None);
    }

    #[test]
    #[should_panic(expected = "duplicate system name")]
    fn duplicate_system_name_panics() {
        let mut tick_loop = TickLoop::new(GridWorld::new(), TickConfig::default());
        tick_loop.add_system("physics", Phase::EntityTick, |_, _| {});
        tick_loop.add_system("physics", Phase::EntityTick, |_, _| {});
    }

    #[test]
    #[should_panic(expected = "is not registered")]
    fn dependency_on_missing_system_panics() {
        let mut tick_loop = TickLoop::new(GridWorld::new(), TickConfig::default());
        tick_loop.add_system_after("late", Phase::EntityTick, &["early"], |_, _| {});
    }

    // -- 3. Ticking -------------------------------------------------------------

    #[test]
    fn empty_tick_advances_counter_and_time() {
        let config = TickConfig {
            fixed_dt: 0.01,
            ..Default::default()
        };
        let mut tick_loop = TickLoop::new(GridWorld::new(), config);

        tick_loop.tick();
        assert_eq!(tick_loop.tick_count(), 1);
        assert!((tick_loop.sim_time() - 0.01).abs() < f64::EPSILON);
        tick_loop.tick();
        assert_eq!(tick_loop.last_diagnostics().tick, 1);
    }

    #[test]
    fn each_system_runs_in_its_own_phase() {
        let mut tick_loop = TickLoop::new(GridWorld::new(), TickConfig::default());
        tick_loop.add_system("entities", Phase::EntityTick, record_phase);
        tick_loop.add_system("boom", Phase::Explosion, record_phase);

        let diagnostics = tick_loop.tick();
        let phases: Vec<Option<Phase>> = diagnostics
            .system_reports
            .iter()
            .map(|(_, r)| r.phase)
            .collect();
        assert_eq!(phases, [Some(Phase::EntityTick), Some(Phase::Explosion)]);
        assert_eq!(tick_loop.world().cell(origin()), CellState::of(11));
        assert_eq!(tick_loop.tracker().depth(), 0);
    }

    #[test]
    fn journal_covers_only_the_last_tick() {
        let mut tick_loop = TickLoop::new(GridWorld::new(), TickConfig::default());
        tick_loop.add_system("stone", Phase::EntityTick, place_stone);
        tick_loop.add_system("dirt", Phase::EntityTick, place_dirt_east);

        tick_loop.tick();
        assert_eq!(tick_loop.journal().len(), 2);
        assert_eq!(tick_loop.journal().tick(), 0);

        tick_loop.tick();
        assert_eq!(tick_loop.journal().tick(), 1);
        assert_eq!(tick_loop.journal().len(), 2);
        assert!(tick_loop.journal().entries().iter().all(|e| e.tick == 1));
    }

    #[test]
    fn cancelled_system_events_are_restored() {
        let bus = RecordingBus::cancelling(|e| e.kind == EventKind::ChangeCell);
        let mut tick_loop = TickLoop::with_bus(GridWorld::new(), bus, TickConfig::default());
        tick_loop.add_system("stone", Phase::EntityTick, place_stone);

        let cancelled = tick_loop.run_ticks(3);

        assert_eq!(cancelled, 3);
        assert_eq!(tick_loop.world().cell(origin()), CellState::AIR);
        assert_eq!(tick_loop.bus().events().len(), 3);
        let restored = tick_loop
            .journal()
            .entries_with(|r| *r == Resolution::Restored)
            .count();
        assert_eq!(restored, 1);
    }

    #[test]
    fn scheduled_tasks_run_after_systems() {
        let mut tick_loop = TickLoop::new(GridWorld::new(), TickConfig::default());
        tick_loop.add_system("stone", Phase::EntityTick, place_stone);
        tick_loop
            .scheduler_mut()
            .run_later("clear", 1, |tracker, world: &mut GridWorld| {
                tracker.set_cell(world, origin(), CellState::AIR, ChangeFlags::DEFAULT)?;
                Ok(())
            });

        tick_loop.tick();
        assert_eq!(tick_loop.world().cell(origin()), CellState::of(1));
        let diagnostics = tick_loop.tick();
        assert_eq!(diagnostics.task_runs.len(), 1);
        assert_eq!(diagnostics.task_runs[0].report.committed, 1);
        assert_eq!(tick_loop.world().cell(origin()), CellState::AIR);
        let phases: Vec<&str> = tick_loop
            .journal()
            .entries()
            .iter()
            .map(|e| e.phase.as_str())
            .collect();
        assert_eq!(phases, ["entity_tick", "scheduled_task"]);
    }

    #[test]
    fn export_journal_is_json() {
        let mut tick_loop = TickLoop::new(GridWorld::new(), TickConfig::default());
        tick_loop.add_system("stone", Phase::EntityTick, place_stone);
        tick_loop.tick();
        let json = tick_loop.export_journal().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["tick"], 0);
    }
}
