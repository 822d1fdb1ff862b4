//! The per-phase transaction log.
//!
//! [`TransactionalCaptureSupplier`] is an append-only list of
//! [`GameTransaction`]s in creation order. A transaction's id is its index.
//! New transactions become children of the innermost open parent scope
//! ([`push_parent`](TransactionalCaptureSupplier::push_parent)), which is how
//! a cell change's pipeline attaches the attached-entity removal it performs
//! and how a container click owns the slot writes made while it is open.
//!
//! # Conflicts
//!
//! Two transactions targeting the same cell or slot in one phase resolve
//! last-write-wins: the earlier one is marked superseded by the later one
//! and a warning is logged. See [`crate::unwind`] for how superseded
//! transactions restore.
//!
//! Once the owning phase unwinds the log is [frozen](TransactionalCaptureSupplier::freeze):
//! logging more transactions is a programming error.

use std::collections::HashMap;

use causeway_world::access::WorldAccess;

use crate::transaction::{
    GameTransaction, RestoreOutcome, Target, TransactionId, TransactionKind,
};

/// Ordered transaction log of one phase context.
#[derive(Debug, Default)]
pub struct TransactionalCaptureSupplier {
    transactions: Vec<GameTransaction>,
    parents: Vec<TransactionId>,
    latest_by_target: HashMap<Target, TransactionId>,
    conflict_count: usize,
    frozen: bool,
}

impl TransactionalCaptureSupplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transaction under the innermost open parent scope.
    ///
    /// # Panics
    ///
    /// Panics if the log has been frozen.
    pub fn log(&mut self, kind: TransactionKind) -> TransactionId {
        assert!(
            !self.frozen,
            "cannot log a {} transaction into a frozen capture supplier",
            kind.label()
        );
        let id = TransactionId(self.transactions.len() as u32);
        let parent = self.parents.last().copied();
        let target = kind.target();

        tracing::debug!(%id, parent = ?parent, kind = kind.label(), "captured transaction");

        self.transactions.push(GameTransaction::new(id, parent, kind));
        if let Some(parent) = parent {
            self.transactions[parent.index()].children.push(id);
        }

        if let Some(target) = target {
            if let Some(earlier) = self.latest_by_target.insert(target, id) {
                self.conflict_count += 1;
                self.transactions[earlier.index()].superseded_by = Some(id);
                tracing::warn!(
                    earlier = %earlier,
                    later = %id,
                    target = ?target,
                    "conflict: two transactions target the same {} in this phase (last-write-wins)",
                    match target {
                        Target::Cell(_) => "cell",
                        Target::Slot(..) => "slot",
                    }
                );
            }
        }
        id
    }

    /// Open a parent scope: transactions logged until the matching
    /// [`pop_parent`](Self::pop_parent) become children of `id`.
    pub fn push_parent(&mut self, id: TransactionId) {
        assert!(
            id.index() < self.transactions.len(),
            "parent scope {id} does not exist"
        );
        self.parents.push(id);
    }

    /// # Panics
    ///
    /// Panics if `id` is not the innermost open scope.
    pub fn pop_parent(&mut self, id: TransactionId) {
        let top = self.parents.pop();
        assert_eq!(
            top,
            Some(id),
            "unbalanced parent scope: expected {id}, found {top:?}"
        );
    }

    pub fn open_parent(&self) -> Option<TransactionId> {
        self.parents.last().copied()
    }

    pub fn get(&self, id: TransactionId) -> Option<&GameTransaction> {
        self.transactions.get(id.index())
    }

    pub(crate) fn get_mut(&mut self, id: TransactionId) -> Option<&mut GameTransaction> {
        self.transactions.get_mut(id.index())
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// All transactions in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &GameTransaction> {
        self.transactions.iter()
    }

    /// Transactions without a parent, in creation order.
    pub fn top_level(&self) -> impl Iterator<Item = &GameTransaction> {
        self.transactions.iter().filter(|tx| tx.parent.is_none())
    }

    /// `id` and everything below it, in creation order.
    pub fn subtree(&self, id: TransactionId) -> Vec<TransactionId> {
        let mut out = Vec::new();
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            out.push(next);
            if let Some(tx) = self.get(next) {
                pending.extend(tx.children.iter().copied());
            }
        }
        out.sort_unstable();
        out
    }

    /// The parentless ancestor of `id`.
    pub fn root_of(&self, id: TransactionId) -> TransactionId {
        let mut current = id;
        while let Some(parent) = self.get(current).and_then(|tx| tx.parent) {
            current = parent;
        }
        current
    }

    /// Number of last-write-wins conflicts detected so far.
    pub fn conflict_count(&self) -> usize {
        self.conflict_count
    }

    pub fn freeze(&mut self) {
        if !self.parents.is_empty() {
            tracing::warn!(
                open = ?self.parents,
                "freezing capture supplier with open parent scopes"
            );
            self.parents.clear();
        }
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Restore `id` and its descendants, newest first.
    pub(crate) fn restore_subtree(
        &mut self,
        id: TransactionId,
        world: &mut dyn WorldAccess,
    ) -> Vec<(TransactionId, RestoreOutcome)> {
        let mut outcomes = Vec::new();
        for member in self.subtree(id).into_iter().rev() {
            if let Some(tx) = self.get_mut(member) {
                outcomes.push((member, tx.restore(world)));
            }
        }
        outcomes
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
