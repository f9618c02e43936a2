//! Shared application state and domain model.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the runtime config and a map of live room states. Each room
//! owns its member set, connected clients, and at most one bound game.
//!
//! CONCURRENCY
//! ===========
//! All state-mutating operations for a room go through the rooms map write
//! lock, which serializes them. Broadcast fan-out happens inside the same
//! critical section so delivery order matches application order. Game state
//! is mutated only by its authority service (`services::puzzle`,
//! `services::whiteboard`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::config::Config;
use crate::frame::Frame;

// =============================================================================
// PUZZLE
// =============================================================================

/// Grid cell, row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub row: u16,
    pub col: u16,
}

/// Where a puzzle piece currently sits. The bank is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PiecePosition {
    Bank,
    Placed(Cell),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Piece {
    pub id: Uuid,
    pub target: Cell,
    pub position: PiecePosition,
}

/// Authoritative puzzle state. Occupancy is derived from piece positions
/// and rebuilt after deserialization; it is never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PuzzleState {
    pub rows: u16,
    pub cols: u16,
    pub pieces: HashMap<Uuid, Piece>,
    #[serde(skip)]
    pub occupancy: HashMap<Cell, Uuid>,
    pub completed: bool,
    pub move_count: u64,
    /// Milliseconds since Unix epoch when the game started.
    pub started_ts: i64,
}

impl PuzzleState {
    /// Create a fresh puzzle: one piece per cell, all starting in the bank.
    #[must_use]
    pub fn new(rows: u16, cols: u16) -> Self {
        let mut pieces = HashMap::new();
        for row in 0..rows {
            for col in 0..cols {
                let id = Uuid::new_v4();
                pieces.insert(id, Piece { id, target: Cell { row, col }, position: PiecePosition::Bank });
            }
        }
        Self {
            rows,
            cols,
            pieces,
            occupancy: HashMap::new(),
            completed: false,
            move_count: 0,
            started_ts: crate::frame::now_ms(),
        }
    }

    #[must_use]
    pub fn in_bounds(&self, cell: Cell) -> bool {
        cell.row < self.rows && cell.col < self.cols
    }

    /// Rebuild the occupancy index from piece positions. Used after
    /// deserialization, where the index is skipped.
    pub fn rebuild_occupancy(&mut self) {
        self.occupancy.clear();
        for piece in self.pieces.values() {
            if let PiecePosition::Placed(cell) = piece.position {
                self.occupancy.insert(cell, piece.id);
            }
        }
    }

    /// True when every piece sits on its target cell.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.pieces
            .values()
            .all(|p| p.position == PiecePosition::Placed(p.target))
    }
}

// =============================================================================
// WHITEBOARD
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// One continuous freehand drawing action: ordered points plus style.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stroke {
    pub id: Uuid,
    pub author_id: Uuid,
    pub tool: String,
    pub color: String,
    pub size: f64,
    pub points: Vec<Point>,
    pub ts: i64,
}

/// A stroke being drawn. Lives outside the committed log until finalized;
/// discarded on disconnect or by the sweeper when it outlives the timeout.
#[derive(Debug, Clone)]
pub struct PendingStroke {
    pub stroke: Stroke,
    pub started: Instant,
}

/// Authoritative whiteboard state. The committed log is append-only in
/// stroke order; pending strokes never appear in it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhiteboardState {
    pub width: u32,
    pub height: u32,
    pub strokes: Vec<Stroke>,
    pub version: u64,
    #[serde(skip)]
    pub pending: HashMap<Uuid, PendingStroke>,
}

impl WhiteboardState {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, strokes: Vec::new(), version: 0, pending: HashMap::new() }
    }
}

// =============================================================================
// GAME
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GameState {
    Puzzle(PuzzleState),
    Whiteboard(WhiteboardState),
}

/// A bound game instance. Owned by exactly one room, destroyed with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: Uuid,
    pub room_id: Uuid,
    pub state: GameState,
}

// =============================================================================
// ROOM
// =============================================================================

/// Game mode requested at room creation. Carries the variant's dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "game", rename_all = "snake_case")]
pub enum GameMode {
    Puzzle { rows: u16, cols: u16 },
    Whiteboard { width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConfig {
    pub mode: GameMode,
    pub time_limit_secs: Option<u64>,
    pub turn_based: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Lobby,
    Starting,
    Active,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub config: RoomConfig,
    pub lifecycle: Lifecycle,
}

/// Member presence info, deduplicated by user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub user_id: Uuid,
    pub name: String,
    pub color: String,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Point>,
    #[serde(skip, default = "Instant::now")]
    pub last_seen: Instant,
}

/// Connected client: websocket connection mapped to its user and the
/// sender for outgoing frames.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    pub user_id: Uuid,
    pub tx: mpsc::Sender<Frame>,
}

/// Per-room live state: membership, connections, and the bound game.
pub struct RoomState {
    pub room: Room,
    pub members: HashMap<Uuid, Member>,
    pub clients: HashMap<Uuid, ConnectedClient>,
    pub game: Option<Game>,
}

impl RoomState {
    #[must_use]
    pub fn new(room: Room) -> Self {
        Self { room, members: HashMap::new(), clients: HashMap::new(), game: None }
    }

    /// Full-state snapshot for `state_sync` frames. Members sorted by id
    /// so the payload is stable across calls.
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        let mut members: Vec<&Member> = self.members.values().collect();
        members.sort_by_key(|m| m.user_id);
        serde_json::json!({
            "room": self.room,
            "members": members,
            "game": self.game,
        })
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Copy.
#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RwLock<HashMap<Uuid, RoomState>>>,
    pub config: Config,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { rooms: Arc::new(RwLock::new(HashMap::new())), config }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
