//! Cell coordinates and cell state values.
//!
//! The world is a 3D grid of cells. Each cell holds a [`CellState`]
//! (a kind plus a small data word) and may carry an [`AttachedEntity`]: a
//! payload bound to the cell's position that lives and dies with the cell
//! kind (chests, furnaces, sign text).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Side length of a chunk in cells. Chunks are the unit of loading.
pub const CHUNK_SIZE: i32 = 16;

// ---------------------------------------------------------------------------
// CellPos
// ---------------------------------------------------------------------------

/// Integer position of a cell in the world grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl CellPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The chunk column containing this cell.
    pub fn chunk(self) -> ChunkPos {
        ChunkPos {
            x: self.x.div_euclid(CHUNK_SIZE),
            z: self.z.div_euclid(CHUNK_SIZE),
        }
    }

    /// The six face-adjacent positions, in the fixed order
    /// west, east, down, up, north, south.
    pub fn neighbors(self) -> [CellPos; 6] {
        let CellPos { x, y, z } = self;
        [
            CellPos::new(x - 1, y, z),
            CellPos::new(x + 1, y, z),
            CellPos::new(x, y - 1, z),
            CellPos::new(x, y + 1, z),
            CellPos::new(x, y, z - 1),
            CellPos::new(x, y, z + 1),
        ]
    }
}

impl fmt::Display for CellPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Column coordinate of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

// ---------------------------------------------------------------------------
// CellKind / CellState
// ---------------------------------------------------------------------------

/// Numeric cell type. The catalog of kinds belongs to the engine; only
/// [`CellKind::AIR`] has a fixed meaning here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellKind(pub u16);

impl CellKind {
    /// The empty cell. Unset cells read as air.
    pub const AIR: CellKind = CellKind(0);
}

/// The full state of one cell: its kind and a kind-specific data word
/// (orientation, growth stage, power level).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellState {
    pub kind: CellKind,
    pub data: u16,
}

impl CellState {
    pub const AIR: CellState = CellState {
        kind: CellKind::AIR,
        data: 0,
    };

    pub const fn of(kind: u16) -> Self {
        Self {
            kind: CellKind(kind),
            data: 0,
        }
    }

    pub const fn with_data(self, data: u16) -> Self {
        Self {
            kind: self.kind,
            data,
        }
    }

    pub fn is_air(self) -> bool {
        self.kind == CellKind::AIR
    }
}

impl Default for CellState {
    fn default() -> Self {
        Self::AIR
    }
}

impl fmt::Display for CellState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.0, self.data)
    }
}

// ---------------------------------------------------------------------------
// AttachedEntity
// ---------------------------------------------------------------------------

/// Payload bound to a cell position (a "tile entity").
///
/// `data` is opaque JSON owned by the engine's attached-entity catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedEntity {
    /// Catalog name, e.g. `"chest"` or `"sign"`.
    pub kind: String,
    pub data: serde_json::Value,
}

impl AttachedEntity {
    pub fn new(kind: &str, data: serde_json::Value) -> Self {
        Self {
            kind: kind.to_owned(),
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// ScheduledCellEvent
// ---------------------------------------------------------------------------

/// A cell event queued for delivery at the end of the tick (piston pushes,
/// note blocks, chest lids).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduledCellEvent {
    pub pos: CellPos,
    pub kind: CellKind,
    pub event_id: u32,
    pub param: u32,
}
