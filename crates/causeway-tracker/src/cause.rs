//! Immutable cause chains and event context.
//!
//! Every domain event carries a [`CauseFrame`]: the chain of things that led
//! to it (innermost first) plus keyed context such as the owner and notifier
//! of the mutation or how a spawned entity came to exist.
//!
//! Frames are values. Nested phases and transactions never mutate a shared
//! frame; they extend one and pass the result along. [`CauseChain`] is a
//! persistent singly linked list, so extending is O(1) and every earlier
//! frame stays valid.
//!
//! ```
//! use causeway_tracker::cause::{Cause, CauseChain};
//!
//! let base = CauseChain::new().push(Cause::Extension("worldedit".to_owned()));
//! let inner = base.push(Cause::Task("regen".to_owned()));
//!
//! assert_eq!(base.len(), 1);
//! assert_eq!(inner.len(), 2);
//! assert_eq!(inner.first(), Some(&Cause::Task("regen".to_owned())));
//! assert_eq!(inner.root(), Some(&Cause::Extension("worldedit".to_owned())));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use causeway_world::cell::{CellPos, CellState};
use causeway_world::entity::EntityId;
use serde::Serialize;

use crate::phase::Phase;

// ---------------------------------------------------------------------------
// Cause
// ---------------------------------------------------------------------------

/// One link in a cause chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cause {
    /// A player acting directly (clicking, breaking, placing).
    Player { id: EntityId },
    /// A non-player entity.
    Entity { id: EntityId },
    /// A cell, e.g. the one being ticked or the one that changed.
    Cell { pos: CellPos, state: CellState },
    /// An extension acting on its own behalf.
    Extension(String),
    /// A scheduled task, by name.
    Task(String),
    Explosion { origin: CellPos },
    /// The phase the mutation was captured in.
    Phase(Phase),
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Player { id } => write!(f, "player {id}"),
            Cause::Entity { id } => write!(f, "entity {id}"),
            Cause::Cell { pos, state } => write!(f, "cell {state} at {pos}"),
            Cause::Extension(name) => write!(f, "extension {name}"),
            Cause::Task(name) => write!(f, "task {name}"),
            Cause::Explosion { origin } => write!(f, "explosion at {origin}"),
            Cause::Phase(phase) => write!(f, "phase {phase}"),
        }
    }
}

// ---------------------------------------------------------------------------
// CauseChain
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Link {
    cause: Cause,
    next: CauseChain,
    len: usize,
}

/// Persistent list of causes, most recently pushed first.
///
/// Cloning is a reference-count bump. Nodes are `Arc`-shared so a frame can
/// be copied into a [`StackSummary`](crate::tracker::StackSummary) read by
/// another thread.
#[derive(Debug, Clone, Default)]
pub struct CauseChain(Option<Arc<Link>>);

impl CauseChain {
    pub fn new() -> Self {
        Self(None)
    }

    /// A new chain with `cause` in front of this one.
    #[must_use]
    pub fn push(&self, cause: Cause) -> CauseChain {
        let len = self.len() + 1;
        CauseChain(Some(Arc::new(Link {
            cause,
            next: self.clone(),
            len,
        })))
    }

    pub fn len(&self) -> usize {
        self.0.as_ref().map_or(0, |link| link.len)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// The innermost (most recently pushed) cause.
    pub fn first(&self) -> Option<&Cause> {
        self.0.as_ref().map(|link| &link.cause)
    }

    /// The outermost (earliest pushed) cause.
    pub fn root(&self) -> Option<&Cause> {
        self.iter().last()
    }

    pub fn iter(&self) -> CauseIter<'_> {
        CauseIter { next: &self.0 }
    }

    /// First cause matching `predicate`, searching innermost first.
    pub fn find<F>(&self, mut predicate: F) -> Option<&Cause>
    where
        F: FnMut(&Cause) -> bool,
    {
        self.iter().find(|cause| predicate(cause))
    }
}

impl PartialEq for CauseChain {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl Serialize for CauseChain {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

/// Iterator over a [`CauseChain`], innermost first.
pub struct CauseIter<'a> {
    next: &'a Option<Arc<Link>>,
}

impl<'a> Iterator for CauseIter<'a> {
    type Item = &'a Cause;

    fn next(&mut self) -> Option<Self::Item> {
        let link = self.next.as_ref()?;
        self.next = &link.next.0;
        Some(&link.cause)
    }
}

// ---------------------------------------------------------------------------
// Event context
// ---------------------------------------------------------------------------

/// How a spawned entity came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnType {
    Natural,
    CellSpawning,
    DroppedItem,
    Experience,
    Extension,
}

/// Keys of the context map carried next to the cause chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKey {
    /// The entity that owns the thing that mutated the world (the player
    /// who placed the TNT).
    Owner,
    /// The entity that last touched the thing that mutated the world.
    Notifier,
    SpawnType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ContextValue {
    Entity(EntityId),
    SpawnType(SpawnType),
}

// ---------------------------------------------------------------------------
// CauseFrame
// ---------------------------------------------------------------------------

/// The causal label attached to a domain event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CauseFrame {
    causes: CauseChain,
    context: BTreeMap<ContextKey, ContextValue>,
}

impl CauseFrame {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn push_cause(mut self, cause: Cause) -> Self {
        self.causes = self.causes.push(cause);
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: ContextKey, value: ContextValue) -> Self {
        self.context.insert(key, value);
        self
    }

    pub fn causes(&self) -> &CauseChain {
        &self.causes
    }

    pub fn context(&self, key: ContextKey) -> Option<&ContextValue> {
        self.context.get(&key)
    }

    pub fn owner(&self) -> Option<EntityId> {
        match self.context(ContextKey::Owner) {
            Some(ContextValue::Entity(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn notifier(&self) -> Option<EntityId> {
        match self.context(ContextKey::Notifier) {
            Some(ContextValue::Entity(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn spawn_type(&self) -> Option<SpawnType> {
        match self.context(ContextKey::SpawnType) {
            Some(ContextValue::SpawnType(kind)) => Some(*kind),
            _ => None,
        }
    }

    /// The cause chain rendered innermost first, for journals and logs.
    pub fn describe(&self) -> Vec<String> {
        self.causes.iter().map(ToString::to_string).collect()
    }
}
