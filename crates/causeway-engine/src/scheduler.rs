//! Same-thread scheduler for delayed and repeating tasks.
//!
//! Tasks are closures over the tracker and the world. They run at the end of
//! a tick, each inside its own [`Phase::ScheduledTask`] context whose source
//! cause is the task's name, so every mutation a task makes is captured,
//! offered to observers as one batch per event kind, and committed or
//! restored before the next task runs.
//!
//! Delays and intervals are counted in ticks. A task scheduled with a delay
//! of zero runs on the next scheduler pass.
//!
//! ```
//! use causeway_engine::scheduler::Scheduler;
//! use causeway_tracker::prelude::*;
//! use causeway_world::prelude::*;
//!
//! let mut world = GridWorld::new();
//! let mut tracker = PhaseTracker::new(TrackerConfig::default());
//! let mut scheduler = Scheduler::new();
//!
//! scheduler.run_later("place_marker", 1, |tracker, world: &mut GridWorld| {
//!     tracker.set_cell(world, CellPos::new(0, 64, 0), CellState::of(1), ChangeFlags::DEFAULT)?;
//!     Ok(())
//! });
//!
//! assert!(scheduler.run_due(0, &mut tracker, &mut world, &mut AcceptAll).is_empty());
//! let runs = scheduler.run_due(1, &mut tracker, &mut world, &mut AcceptAll);
//! assert_eq!(runs.len(), 1);
//! assert_eq!(runs[0].report.committed, 1);
//! assert_eq!(scheduler.pending(), 0);
//! ```

use std::fmt;

use causeway_tracker::prelude::*;
use causeway_world::prelude::*;

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// Handle to a scheduled task, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// TaskFn
// ---------------------------------------------------------------------------

/// The body of a scheduled task.
///
/// Errors are logged and reported in [`TaskRun::error`]. They do not stop a
/// repeating task, and the mutations made before the error are resolved like
/// those of a successful run.
pub type TaskFn<W> = Box<dyn FnMut(&mut PhaseTracker, &mut W) -> anyhow::Result<()>>;

struct ScheduledTask<W> {
    id: TaskId,
    name: String,
    next_run: u64,
    interval: Option<u64>,
    body: TaskFn<W>,
    finished: bool,
}

// ---------------------------------------------------------------------------
// TaskRun
// ---------------------------------------------------------------------------

/// The outcome of one task execution.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub id: TaskId,
    pub name: String,
    /// The tick the task ran in.
    pub tick: u64,
    /// The task's error, rendered with its full context chain.
    pub error: Option<String>,
    /// How the task's captured mutations were resolved.
    pub report: UnwindReport,
}

impl TaskRun {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Tasks waiting to run, in scheduling order.
///
/// Not thread-safe and not meant to be: tasks run on the engine thread that
/// owns the [`PhaseTracker`].
pub struct Scheduler<W> {
    tasks: Vec<ScheduledTask<W>>,
    next_id: u64,
    /// The first tick a newly scheduled task can run in.
    now: u64,
}

impl<W> Default for Scheduler<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> fmt::Debug for Scheduler<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.tasks.len())
            .field("now", &self.now)
            .finish()
    }
}

impl<W> Scheduler<W> {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            next_id: 0,
            now: 0,
        }
    }

    /// Run `body` once, `delay` ticks from now.
    pub fn run_later<F>(&mut self, name: &str, delay: u64, body: F) -> TaskId
    where
        F: FnMut(&mut PhaseTracker, &mut W) -> anyhow::Result<()> + 'static,
    {
        self.push(name, delay, None, Box::new(body))
    }

    /// Run `body` `delay` ticks from now and then every `interval` ticks
    /// until cancelled.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    pub fn run_repeating<F>(&mut self, name: &str, delay: u64, interval: u64, body: F) -> TaskId
    where
        F: FnMut(&mut PhaseTracker, &mut W) -> anyhow::Result<()> + 'static,
    {
        assert!(interval > 0, "repeat interval of task '{name}' must be at least one tick");
        self.push(name, delay, Some(interval), Box::new(body))
    }

    fn push(&mut self, name: &str, delay: u64, interval: Option<u64>, body: TaskFn<W>) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        let next_run = self.now.saturating_add(delay);
        tracing::debug!(task = name, %id, next_run, ?interval, "task scheduled");
        self.tasks.push(ScheduledTask {
            id,
            name: name.to_owned(),
            next_run,
            interval,
            body,
            finished: false,
        });
        id
    }

    /// Remove a task before it runs again. Returns `false` if the task is
    /// unknown or already finished.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|task| task.id != id);
        let removed = self.tasks.len() != before;
        if removed {
            tracing::debug!(%id, "task cancelled");
        }
        removed
    }

    /// Number of tasks still waiting to run.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Names of the waiting tasks, in scheduling order.
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// Run every task due at `tick`, earliest due first and then in
    /// scheduling order. Each task gets its own `ScheduledTask` phase.
    pub fn run_due(
        &mut self,
        tick: u64,
        tracker: &mut PhaseTracker,
        world: &mut W,
        bus: &mut dyn ObserverBus,
    ) -> Vec<TaskRun>
    where
        W: WorldAccess,
    {
        let mut due: Vec<usize> = (0..self.tasks.len())
            .filter(|&i| self.tasks[i].next_run <= tick)
            .collect();
        due.sort_by_key(|&i| (self.tasks[i].next_run, self.tasks[i].id));

        let mut runs = Vec::with_capacity(due.len());
        for index in due {
            let task = &mut self.tasks[index];
            let ctx = PhaseContext::for_phase(Phase::ScheduledTask)
                .with_source(Cause::Task(task.name.clone()));
            let body = &mut task.body;
            let (result, report) =
                tracker.run_phase(ctx, world, &mut *bus, |tracker, world| body(tracker, world));

            let error = result.err().map(|err| {
                let error = format!("{err:#}");
                tracing::error!(task = %task.name, id = %task.id, tick, %error, "scheduled task failed");
                error
            });

            match task.interval {
                Some(interval) => task.next_run = tick.saturating_add(interval),
                None => task.finished = true,
            }
            runs.push(TaskRun {
                id: task.id,
                name: task.name.clone(),
                tick,
                error,
                report,
            });
        }

        self.tasks.retain(|task| !task.finished);
        self.now = self.now.max(tick.saturating_add(1));
        runs
    }
}
