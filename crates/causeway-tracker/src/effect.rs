//! The side-effect pipeline of a cell change.
//!
//! A cell write is not one operation. The engine checks the chunk is loaded,
//! drops the attached entity the old state carried, writes the state,
//! relights, and eventually wakes observers and neighbors. [`EffectPipeline`]
//! lists those steps as data; one runner interprets the list, so adding or
//! reordering a step never touches control flow.
//!
//! Each [`Effect`] belongs to a [`EffectStage`]. `Apply` effects run when the
//! write happens (captured or not). `PostEvent` effects are held back until
//! the domain event carrying the change has been accepted; a cancelled event
//! never wakes anyone.
//!
//! ```
//! use causeway_tracker::effect::{ChangeFlags, Effect, EffectPipeline};
//!
//! let silent = EffectPipeline::for_cell_change(ChangeFlags::SILENT);
//! assert!(!silent.effects().contains(&Effect::NotifyNeighbors));
//! assert_eq!(
//!     EffectPipeline::for_cell_change(ChangeFlags::DEFAULT).len(),
//!     silent.len() + 1
//! );
//! ```

use std::fmt;

use causeway_world::access::WorldAccess;
use causeway_world::cell::CellState;
use causeway_world::snapshot::CellSnapshot;
use serde::{Deserialize, Serialize};

use crate::supplier::TransactionalCaptureSupplier;
use crate::transaction::TransactionKind;

// ---------------------------------------------------------------------------
// ChangeFlags
// ---------------------------------------------------------------------------

/// Which optional side effects a cell write performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeFlags {
    pub notify_neighbors: bool,
    pub notify_observers: bool,
    pub update_light: bool,
    pub refresh_attached: bool,
}

impl ChangeFlags {
    pub const DEFAULT: ChangeFlags = ChangeFlags {
        notify_neighbors: true,
        notify_observers: true,
        update_light: true,
        refresh_attached: true,
    };

    /// Observers hear about the change; neighbors do not.
    pub const SILENT: ChangeFlags = ChangeFlags {
        notify_neighbors: false,
        ..ChangeFlags::DEFAULT
    };

    /// Engine-internal write: no relight, no neighbor wake-up.
    pub const DIRECT: ChangeFlags = ChangeFlags {
        notify_neighbors: false,
        update_light: false,
        ..ChangeFlags::DEFAULT
    };

    pub const NONE: ChangeFlags = ChangeFlags {
        notify_neighbors: false,
        notify_observers: false,
        update_light: false,
        refresh_attached: false,
    };

    fn enables(self, effect: Effect) -> bool {
        match effect {
            Effect::NotifyNeighbors => self.notify_neighbors,
            Effect::NotifyObservers => self.notify_observers,
            Effect::UpdateLight => self.update_light,
            Effect::RefreshAttachedEntity => self.refresh_attached,
            Effect::CheckCellLoaded
            | Effect::CheckPlacementChanged
            | Effect::RemoveAttachedEntity
            | Effect::WriteCellData => true,
        }
    }
}

impl Default for ChangeFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ---------------------------------------------------------------------------
// Effect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectStage {
    /// Runs when the mutation happens.
    Apply,
    /// Runs once the owning event has been accepted.
    PostEvent,
}

/// One step of a cell change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    CheckCellLoaded,
    CheckPlacementChanged,
    RemoveAttachedEntity,
    WriteCellData,
    RefreshAttachedEntity,
    UpdateLight,
    NotifyObservers,
    NotifyNeighbors,
}

/// Every effect, in pipeline order.
const CELL_CHANGE_ORDER: [Effect; 8] = [
    Effect::CheckCellLoaded,
    Effect::CheckPlacementChanged,
    Effect::RemoveAttachedEntity,
    Effect::WriteCellData,
    Effect::RefreshAttachedEntity,
    Effect::UpdateLight,
    Effect::NotifyObservers,
    Effect::NotifyNeighbors,
];

impl Effect {
    pub const fn name(self) -> &'static str {
        match self {
            Effect::CheckCellLoaded => "check_cell_loaded",
            Effect::CheckPlacementChanged => "check_placement_changed",
            Effect::RemoveAttachedEntity => "remove_attached_entity",
            Effect::WriteCellData => "write_cell_data",
            Effect::RefreshAttachedEntity => "refresh_attached_entity",
            Effect::UpdateLight => "update_light",
            Effect::NotifyObservers => "notify_observers",
            Effect::NotifyNeighbors => "notify_neighbors",
        }
    }

    pub const fn stage(self) -> EffectStage {
        match self {
            Effect::NotifyObservers | Effect::NotifyNeighbors => EffectStage::PostEvent,
            _ => EffectStage::Apply,
        }
    }

    /// Perform this step against `ctx`.
    pub fn process(self, ctx: &mut EffectContext<'_>) -> EffectResult {
        let pos = ctx.former.pos;
        match self {
            Effect::CheckCellLoaded => {
                if ctx.world.is_loaded(pos) {
                    EffectResult::NullPass
                } else {
                    EffectResult::Fail(format!("cell {pos} is in an unloaded chunk"))
                }
            }
            Effect::CheckPlacementChanged => {
                if ctx.former.state == ctx.new_state {
                    EffectResult::SkipRemaining("unchanged")
                } else {
                    EffectResult::NullPass
                }
            }
            Effect::RemoveAttachedEntity => {
                if ctx.former.attached.is_none() {
                    return EffectResult::NullPass;
                }
                let keeps_attached = ctx.former.state.kind == ctx.new_state.kind
                    && ctx.world.carries_attached(ctx.new_state);
                if keeps_attached {
                    return EffectResult::NullPass;
                }
                if let Some(supplier) = ctx.supplier.as_deref_mut() {
                    supplier.log(TransactionKind::RemoveAttached {
                        original: ctx.former.clone(),
                        resulting: None,
                    });
                }
                match ctx.world.remove_attached(pos) {
                    Ok(_) => EffectResult::Continue,
                    Err(error) => EffectResult::Fail(error.to_string()),
                }
            }
            Effect::WriteCellData => match ctx.world.write_cell_state(pos, ctx.new_state) {
                Ok(_) => EffectResult::Continue,
                Err(error) => EffectResult::Fail(error.to_string()),
            },
            Effect::RefreshAttachedEntity => {
                let same_kind = ctx.former.state.kind == ctx.new_state.kind;
                if same_kind && ctx.world.attached(pos).is_some() {
                    ctx.world.refresh_attached(pos);
                    EffectResult::Continue
                } else {
                    EffectResult::NullPass
                }
            }
            Effect::UpdateLight => {
                ctx.world.update_light(pos);
                EffectResult::Continue
            }
            // The chunk can unload between capture and commit.
            Effect::NotifyObservers | Effect::NotifyNeighbors if !ctx.world.is_loaded(pos) => {
                EffectResult::Fail(format!("cell {pos} unloaded before {self} ran"))
            }
            Effect::NotifyObservers => {
                ctx.world.notify_observers(pos);
                EffectResult::Continue
            }
            Effect::NotifyNeighbors => {
                for neighbor in pos.neighbors() {
                    ctx.world.notify_neighbor(pos, neighbor);
                }
                EffectResult::Continue
            }
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What an effect asks the runner to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectResult {
    /// Nothing to do for this change; continue.
    NullPass,
    /// Did its work; continue.
    Continue,
    /// Stop the pipeline without failing.
    SkipRemaining(&'static str),
    /// Stop the pipeline; the change failed.
    Fail(String),
}

// ---------------------------------------------------------------------------
// EffectPipeline
// ---------------------------------------------------------------------------

/// An ordered list of effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectPipeline {
    effects: Vec<Effect>,
}

impl EffectPipeline {
    /// The cell-change pipeline with the effects `flags` disables removed.
    pub fn for_cell_change(flags: ChangeFlags) -> Self {
        Self {
            effects: CELL_CHANGE_ORDER
                .into_iter()
                .filter(|effect| flags.enables(*effect))
                .collect(),
        }
    }

    pub fn from_effects(effects: Vec<Effect>) -> Self {
        Self { effects }
    }

    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn stage(&self, stage: EffectStage) -> impl Iterator<Item = Effect> + '_ {
        self.effects
            .iter()
            .copied()
            .filter(move |effect| effect.stage() == stage)
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// The change an effect pipeline is applying.
pub struct EffectContext<'a> {
    pub world: &'a mut dyn WorldAccess,
    /// Where child transactions go; `None` when the change is not captured.
    pub supplier: Option<&'a mut TransactionalCaptureSupplier>,
    pub former: &'a CellSnapshot,
    pub new_state: CellState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    Skipped { reason: &'static str },
    Failed { effect: Effect, cause: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub outcome: PipelineOutcome,
    /// Effects that ran, in order. The effect that skipped or failed is
    /// the last entry.
    pub executed: Vec<Effect>,
}

/// Interprets an [`EffectPipeline`] one stage at a time.
pub struct PipelineRunner<'p, 'a> {
    pipeline: &'p EffectPipeline,
    ctx: EffectContext<'a>,
}

impl<'p, 'a> PipelineRunner<'p, 'a> {
    pub fn new(pipeline: &'p EffectPipeline, ctx: EffectContext<'a>) -> Self {
        Self { pipeline, ctx }
    }

    /// Run every effect of `stage` in order until one skips or fails.
    pub fn run(&mut self, stage: EffectStage) -> PipelineReport {
        let mut executed = Vec::new();
        for effect in self.pipeline.stage(stage) {
            executed.push(effect);
            match effect.process(&mut self.ctx) {
                EffectResult::NullPass | EffectResult::Continue => {}
                EffectResult::SkipRemaining(reason) => {
                    tracing::trace!(effect = effect.name(), reason, "pipeline skipped");
                    return PipelineReport {
                        outcome: PipelineOutcome::Skipped { reason },
                        executed,
                    };
                }
                EffectResult::Fail(cause) => {
                    return PipelineReport {
                        outcome: PipelineOutcome::Failed { effect, cause },
                        executed,
                    };
                }
            }
        }
        PipelineReport {
            outcome: PipelineOutcome::Completed,
            executed,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
