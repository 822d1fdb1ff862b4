//! Per-tick audit trail of transaction resolutions.
//!
//! The [`TransactionJournal`] records how every captured transaction ended:
//! committed, restored because its event was cancelled, skipped as a no-op,
//! or failed to restore. Each [`JournalEntry`] carries the phase that
//! captured it, its place in the transaction tree, the before/after
//! snapshots and the rendered cause chain of the event it fed.
//!
//! The journal is populated by the tracker while a phase unwinds and cleared
//! when the next tick begins via [`TransactionJournal::begin_tick`]. Nothing in
//! it outlives the tick.
//!
//! # Query API
//!
//! - **Phase**: [`TransactionJournal::entries_for_phase`]
//! - **Position**: [`TransactionJournal::entries_at`]
//! - **Resolution**: [`TransactionJournal::entries_with`]
//!
//! # Example
//!
//! ```
//! use causeway_journal::journal::{JournalEntry, Resolution, TransactionJournal};
//! use causeway_world::prelude::*;
//!
//! let mut journal = TransactionJournal::new();
//! journal.begin_tick(7);
//!
//! let pos = CellPos::new(0, 64, 0);
//! journal.record(JournalEntry {
//!     tick: journal.tick(),
//!     phase: "cell_tick".to_owned(),
//!     transaction: Some(0),
//!     parent: None,
//!     kind: "change_cell".to_owned(),
//!     event: Some(0),
//!     original: CellSnapshot::new(pos, CellState::AIR).into(),
//!     resulting: Some(CellSnapshot::new(pos, CellState::of(1)).into()),
//!     resolution: Resolution::Restored,
//!     causes: vec!["cell (0, 64, 0)".to_owned()],
//! });
//!
//! assert_eq!(journal.len(), 1);
//! assert_eq!(journal.entries_at(pos).count(), 1);
//! assert_eq!(journal.summary().restored, 1);
//! ```

use causeway_world::cell::CellPos;
use causeway_world::snapshot::Snapshot;
use serde::{Deserialize, Serialize};

use crate::JournalError;

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// How a captured transaction was resolved at unwind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    /// The event was accepted and the mutation stands.
    Committed,
    /// The event was cancelled and the original snapshot was re-applied.
    Restored,
    /// Original and resulting snapshots were equal; nothing to undo.
    NoOp,
    /// A later write to the same target in the same phase won; restoring
    /// this one was folded into its successor.
    Superseded,
    /// The resulting snapshot could not be read at unwind (the phase exited
    /// abnormally or the target vanished).
    Inconsistent,
    /// A post-event effect failed; the transaction was rolled back.
    EffectFailed { effect: String, cause: String },
    /// Re-applying the original snapshot failed. The world may diverge from
    /// the pre-phase state at this target.
    RestoreFailed { error: String },
}

impl Resolution {
    /// Whether the mutation is still present in the world.
    pub fn is_applied(&self) -> bool {
        matches!(self, Resolution::Committed | Resolution::RestoreFailed { .. })
    }
}

// ---------------------------------------------------------------------------
// JournalEntry
// ---------------------------------------------------------------------------

/// One resolved transaction or captured spawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub tick: u64,
    /// Name of the phase that captured the mutation.
    pub phase: String,
    /// Transaction id within its phase; `None` for captured spawns, which
    /// are buffered rather than logged as transactions.
    pub transaction: Option<u32>,
    pub parent: Option<u32>,
    /// Transaction kind, e.g. `"change_cell"` or `"slot_change"`.
    pub kind: String,
    /// Index of the domain event this entry fed, in dispatch order.
    pub event: Option<u32>,
    pub original: Snapshot,
    pub resulting: Option<Snapshot>,
    pub resolution: Resolution,
    /// Cause chain of the event, innermost cause first.
    pub causes: Vec<String>,
}

// ---------------------------------------------------------------------------
// JournalSummary
// ---------------------------------------------------------------------------

/// Resolution counts for the current tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalSummary {
    pub committed: usize,
    pub restored: usize,
    pub no_op: usize,
    pub superseded: usize,
    pub inconsistent: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// TransactionJournal
// ---------------------------------------------------------------------------

/// Accumulates [`JournalEntry`] values for one tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionJournal {
    tick: u64,
    entries: Vec<JournalEntry>,
}

impl TransactionJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the previous tick's entries and stamp subsequent entries with
    /// `tick`.
    pub fn begin_tick(&mut self, tick: u64) {
        self.tick = tick;
        self.entries.clear();
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn record(&mut self, entry: JournalEntry) {
        tracing::trace!(
            phase = %entry.phase,
            kind = %entry.kind,
            transaction = ?entry.transaction,
            resolution = ?entry.resolution,
            "journal entry"
        );
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in resolution order.
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn entries_for_phase<'a>(
        &'a self,
        phase: &'a str,
    ) -> impl Iterator<Item = &'a JournalEntry> {
        self.entries.iter().filter(move |e| e.phase == phase)
    }

    /// Entries whose original snapshot is located at `pos`.
    pub fn entries_at(&self, pos: CellPos) -> impl Iterator<Item = &JournalEntry> {
        self.entries
            .iter()
            .filter(move |e| e.original.position() == Some(pos))
    }

    /// Entries matching a predicate on their resolution.
    pub fn entries_with<F>(&self, mut predicate: F) -> impl Iterator<Item = &JournalEntry>
    where
        F: FnMut(&Resolution) -> bool,
    {
        self.entries.iter().filter(move |e| predicate(&e.resolution))
    }

    pub fn summary(&self) -> JournalSummary {
        let mut summary = JournalSummary::default();
        for entry in &self.entries {
            match entry.resolution {
                Resolution::Committed => summary.committed += 1,
                Resolution::Restored => summary.restored += 1,
                Resolution::NoOp => summary.no_op += 1,
                Resolution::Superseded => summary.superseded += 1,
                Resolution::Inconsistent => summary.inconsistent += 1,
                Resolution::EffectFailed { .. } | Resolution::RestoreFailed { .. } => {
                    summary.failed += 1
                }
            }
        }
        summary
    }

    /// Export the tick's entries as pretty JSON.
    pub fn to_json(&self) -> Result<String, JournalError> {
        serde_json::to_string_pretty(self).map_err(JournalError::Export)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
