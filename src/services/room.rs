//! Room registry — membership, config, lifecycle, and broadcast fan-out.
//!
//! DESIGN
//! ======
//! Rooms are held in the `AppState` map; every mutating operation takes the
//! write lock, applies its change, and broadcasts to the room's connected
//! clients before releasing the lock. Leaves are idempotent; a room switch
//! runs leave + join under one lock acquisition so no frame interleaves
//! across the transition.
//!
//! ERROR HANDLING
//! ==============
//! Expected rejections (full room, duplicate membership, non-creator
//! removal) are typed `RoomError` values carrying a grepable code. No
//! failed operation mutates state.

use std::collections::HashMap;
use std::time::Instant;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::state::{
    AppState, ConnectedClient, Game, GameMode, GameState, Lifecycle, Member, PuzzleState, Room, RoomConfig,
    RoomState, WhiteboardState,
};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RoomError {
    #[error("room not found: {0}")]
    NotFound(Uuid),
    #[error("room is full (capacity {capacity})")]
    Full { capacity: usize },
    #[error("room is closed: {0}")]
    Closed(Uuid),
    #[error("user is already an active member: {0}")]
    DuplicateMember(Uuid),
    #[error("user is not a room member: {0}")]
    NotMember(Uuid),
    #[error("only the room creator may do this")]
    NotCreator,
    #[error("the creator cannot be removed")]
    CannotRemoveCreator,
    #[error("game already started")]
    AlreadyStarted,
    #[error("room is not in the lobby")]
    NotInLobby,
    #[error("game not found: {0}")]
    GameNotFound(Uuid),
}

impl crate::frame::ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_ROOM_NOT_FOUND",
            Self::Full { .. } => "E_ROOM_FULL",
            Self::Closed(_) => "E_ROOM_CLOSED",
            Self::DuplicateMember(_) => "E_DUPLICATE_MEMBER",
            Self::NotMember(_) => "E_NOT_MEMBER",
            Self::NotCreator => "E_NOT_CREATOR",
            Self::CannotRemoveCreator => "E_CANNOT_REMOVE_CREATOR",
            Self::AlreadyStarted => "E_ALREADY_STARTED",
            Self::NotInLobby => "E_NOT_IN_LOBBY",
            Self::GameNotFound(_) => "E_GAME_NOT_FOUND",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Full { .. })
    }
}

/// Display colors assigned to members round-robin-ish at join.
const MEMBER_COLORS: &[&str] = &[
    "#e6194b", "#3cb44b", "#ffe119", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6", "#bcf60c",
    "#fabebe", "#008080", "#e6beff",
];

fn pick_color() -> String {
    let idx = rand::rng().random_range(0..MEMBER_COLORS.len());
    MEMBER_COLORS[idx].to_string()
}

// =============================================================================
// CREATE
// =============================================================================

/// Create a room in the lobby state with the creator as its first member.
/// The creator is offline until they join with a live connection.
pub async fn create_room(state: &AppState, creator_id: Uuid, creator_name: &str, config: RoomConfig) -> Room {
    let room = Room { id: Uuid::new_v4(), creator_id, config, lifecycle: Lifecycle::Lobby };
    let mut room_state = RoomState::new(room.clone());
    room_state.members.insert(
        creator_id,
        Member {
            user_id: creator_id,
            name: creator_name.to_string(),
            color: pick_color(),
            online: false,
            cursor: None,
            last_seen: Instant::now(),
        },
    );

    let mut rooms = state.rooms.write().await;
    rooms.insert(room.id, room_state);
    info!(room_id = %room.id, creator_id = %creator_id, "room created");
    room
}

// =============================================================================
// JOIN / LEAVE / SWITCH
// =============================================================================

/// Join a room with a live connection. Returns the full-state snapshot for
/// the joiner's `state_sync`. Rejoining while offline is a reconnect and
/// refreshes presence; joining while already online is a conflict.
///
/// # Errors
///
/// Returns `NotFound`, `Closed`, `Full`, or `DuplicateMember`.
pub async fn join_room(
    state: &AppState,
    room_id: Uuid,
    user_id: Uuid,
    user_name: &str,
    conn_id: Uuid,
    tx: mpsc::Sender<Frame>,
) -> Result<serde_json::Value, RoomError> {
    let mut rooms = state.rooms.write().await;
    join_locked(&mut rooms, state.config.max_room_members, room_id, user_id, user_name, conn_id, tx)
}

/// Leave a room. Idempotent: unknown rooms and unregistered connections are
/// no-ops. Non-creator members who leave explicitly give up their seat; the
/// creator only goes offline (the room closes when their grace expires).
pub async fn leave_room(state: &AppState, room_id: Uuid, conn_id: Uuid) {
    let mut rooms = state.rooms.write().await;
    leave_locked(&mut rooms, room_id, conn_id);
}

/// Atomically move a connection between rooms: the leave is fully applied
/// before the join, under a single write-lock acquisition.
///
/// # Errors
///
/// Returns the join rejection; the leave half is idempotent and cannot
/// fail. On rejection the connection has still left the old room.
pub async fn switch_room(
    state: &AppState,
    from_room_id: Uuid,
    to_room_id: Uuid,
    user_id: Uuid,
    user_name: &str,
    conn_id: Uuid,
    tx: mpsc::Sender<Frame>,
) -> Result<serde_json::Value, RoomError> {
    let mut rooms = state.rooms.write().await;
    leave_locked(&mut rooms, from_room_id, conn_id);
    join_locked(&mut rooms, state.config.max_room_members, to_room_id, user_id, user_name, conn_id, tx)
}

fn join_locked(
    rooms: &mut HashMap<Uuid, RoomState>,
    capacity: usize,
    room_id: Uuid,
    user_id: Uuid,
    user_name: &str,
    conn_id: Uuid,
    tx: mpsc::Sender<Frame>,
) -> Result<serde_json::Value, RoomError> {
    let room_state = rooms.get_mut(&room_id).ok_or(RoomError::NotFound(room_id))?;

    if room_state.room.lifecycle == Lifecycle::Closed {
        return Err(RoomError::Closed(room_id));
    }

    match room_state.members.get_mut(&user_id) {
        Some(member) if member.online => {
            return Err(RoomError::DuplicateMember(user_id));
        }
        Some(member) => {
            // Reconnect inside the grace period: refresh presence.
            member.online = true;
            member.last_seen = Instant::now();
        }
        None => {
            if room_state.members.len() >= capacity {
                return Err(RoomError::Full { capacity });
            }
            room_state.members.insert(
                user_id,
                Member {
                    user_id,
                    name: user_name.to_string(),
                    color: pick_color(),
                    online: true,
                    cursor: None,
                    last_seen: Instant::now(),
                },
            );
        }
    }

    room_state.clients.insert(conn_id, ConnectedClient { user_id, tx });
    info!(%room_id, %user_id, %conn_id, clients = room_state.clients.len(), "client joined room");

    let update = membership_frame(room_state);
    broadcast_locked(room_state, &update, Some(conn_id));
    let online = presence_frame(room_id, user_id, true);
    broadcast_locked(room_state, &online, Some(conn_id));

    Ok(room_state.snapshot())
}

fn leave_locked(rooms: &mut HashMap<Uuid, RoomState>, room_id: Uuid, conn_id: Uuid) {
    let Some(room_state) = rooms.get_mut(&room_id) else {
        return;
    };
    let Some(client) = room_state.clients.remove(&conn_id) else {
        return;
    };

    let user_id = client.user_id;
    let last_conn = !room_state.clients.values().any(|c| c.user_id == user_id);
    if last_conn {
        if user_id == room_state.room.creator_id {
            if let Some(member) = room_state.members.get_mut(&user_id) {
                member.online = false;
                member.last_seen = Instant::now();
            }
        } else {
            room_state.members.remove(&user_id);
        }
        crate::services::whiteboard::discard_pending_for_user(room_state, user_id);
    }
    info!(%room_id, %user_id, %conn_id, remaining = room_state.clients.len(), "client left room");

    let update = membership_frame(room_state);
    broadcast_locked(room_state, &update, None);
}

// =============================================================================
// DISCONNECT
// =============================================================================

/// Abrupt-disconnect hook. Unlike an explicit leave, membership is retained
/// so the user can reconnect within the grace period; the member is only
/// marked offline. Pending strokes of the user are discarded immediately.
pub async fn disconnect(state: &AppState, room_id: Uuid, conn_id: Uuid) {
    let mut rooms = state.rooms.write().await;
    let Some(room_state) = rooms.get_mut(&room_id) else {
        return;
    };
    let Some(client) = room_state.clients.remove(&conn_id) else {
        return;
    };

    let user_id = client.user_id;
    if !room_state.clients.values().any(|c| c.user_id == user_id) {
        if let Some(member) = room_state.members.get_mut(&user_id) {
            member.online = false;
            member.cursor = None;
            member.last_seen = Instant::now();
        }
        crate::services::whiteboard::discard_pending_for_user(room_state, user_id);

        let offline = presence_frame(room_id, user_id, false);
        broadcast_locked(room_state, &offline, None);
    }
    info!(%room_id, %user_id, %conn_id, "client disconnected");
}

// =============================================================================
// REGISTRY OPERATIONS
// =============================================================================

/// Remove a member. Creator-only; the creator can never remove themself.
/// The removed user's connections are dropped from the room after the
/// membership broadcast so they still receive the final update.
///
/// # Errors
///
/// Returns `NotCreator`, `CannotRemoveCreator`, or `NotMember`.
pub async fn remove_player(
    state: &AppState,
    room_id: Uuid,
    caller_id: Uuid,
    target_id: Uuid,
) -> Result<(), RoomError> {
    let mut rooms = state.rooms.write().await;
    let room_state = rooms.get_mut(&room_id).ok_or(RoomError::NotFound(room_id))?;

    if caller_id != room_state.room.creator_id {
        return Err(RoomError::NotCreator);
    }
    if target_id == room_state.room.creator_id {
        return Err(RoomError::CannotRemoveCreator);
    }
    if room_state.members.remove(&target_id).is_none() {
        return Err(RoomError::NotMember(target_id));
    }
    crate::services::whiteboard::discard_pending_for_user(room_state, target_id);

    let update = membership_frame(room_state);
    broadcast_locked(room_state, &update, None);
    room_state.clients.retain(|_, c| c.user_id != target_id);
    info!(%room_id, %target_id, "member removed by creator");
    Ok(())
}

/// Replace the room config. Creator-only, lobby-only.
///
/// # Errors
///
/// Returns `NotCreator` or `NotInLobby`.
pub async fn update_config(
    state: &AppState,
    room_id: Uuid,
    caller_id: Uuid,
    config: RoomConfig,
) -> Result<(), RoomError> {
    let mut rooms = state.rooms.write().await;
    let room_state = rooms.get_mut(&room_id).ok_or(RoomError::NotFound(room_id))?;

    if caller_id != room_state.room.creator_id {
        return Err(RoomError::NotCreator);
    }
    if room_state.room.lifecycle != Lifecycle::Lobby {
        return Err(RoomError::NotInLobby);
    }
    room_state.room.config = config;

    let update = membership_frame(room_state);
    broadcast_locked(room_state, &update, None);
    Ok(())
}

/// Start the game: lobby → active, creating the bound game instance from
/// the room config. The resulting snapshot is broadcast to every client
/// unconditionally and also returned for the caller's reply.
///
/// # Errors
///
/// Returns `NotCreator`, `AlreadyStarted`, or `NotInLobby`.
pub async fn start_game(state: &AppState, room_id: Uuid, caller_id: Uuid) -> Result<serde_json::Value, RoomError> {
    let mut rooms = state.rooms.write().await;
    let room_state = rooms.get_mut(&room_id).ok_or(RoomError::NotFound(room_id))?;

    if caller_id != room_state.room.creator_id {
        return Err(RoomError::NotCreator);
    }
    match room_state.room.lifecycle {
        Lifecycle::Lobby => {}
        Lifecycle::Active | Lifecycle::Starting => return Err(RoomError::AlreadyStarted),
        Lifecycle::Closed => return Err(RoomError::Closed(room_id)),
    }

    room_state.room.lifecycle = Lifecycle::Starting;
    let game_state = match room_state.room.config.mode {
        GameMode::Puzzle { rows, cols } => GameState::Puzzle(PuzzleState::new(rows, cols)),
        GameMode::Whiteboard { width, height } => GameState::Whiteboard(WhiteboardState::new(width, height)),
    };
    let game = Game { id: Uuid::new_v4(), room_id, state: game_state };
    info!(%room_id, game_id = %game.id, "game started");
    room_state.game = Some(game);
    room_state.room.lifecycle = Lifecycle::Active;

    let snapshot = room_state.snapshot();
    let sync = Frame::request("state_sync", Data::new())
        .with_room_id(room_id)
        .with_data("state", snapshot.clone());
    broadcast_locked(room_state, &sync, None);
    Ok(snapshot)
}

/// Whether a connection is currently in the room's client set. A removed
/// player's socket stays open but their registration is gone.
pub async fn is_registered(state: &AppState, room_id: Uuid, conn_id: Uuid) -> bool {
    let rooms = state.rooms.read().await;
    rooms
        .get(&room_id)
        .is_some_and(|room_state| room_state.clients.contains_key(&conn_id))
}

/// Current full-state snapshot, for `get_game_state` and reconnect resync.
///
/// # Errors
///
/// Returns `NotFound` for unknown rooms and `GameNotFound` when the client
/// asks about a game id the room does not hold.
pub async fn get_state(
    state: &AppState,
    room_id: Uuid,
    game_id: Option<Uuid>,
) -> Result<serde_json::Value, RoomError> {
    let rooms = state.rooms.read().await;
    let room_state = rooms.get(&room_id).ok_or(RoomError::NotFound(room_id))?;
    if let Some(wanted) = game_id {
        let held = room_state.game.as_ref().map(|g| g.id);
        if held != Some(wanted) {
            return Err(RoomError::GameNotFound(wanted));
        }
    }
    Ok(room_state.snapshot())
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Fan a frame out to all clients in a room, optionally excluding one
/// connection. Best-effort: a client with a full channel is skipped.
///
/// Called while the room lock is held so delivery order on each client
/// channel matches the order mutations were applied.
pub fn broadcast_locked(room_state: &RoomState, frame: &Frame, exclude: Option<Uuid>) {
    for (conn_id, client) in &room_state.clients {
        if exclude == Some(*conn_id) {
            continue;
        }
        let _ = client.tx.try_send(frame.clone());
    }
}

/// Read-lock convenience fan-out for paths that carry no ordering
/// obligation (presence relays).
pub async fn broadcast(state: &AppState, room_id: Uuid, frame: &Frame, exclude: Option<Uuid>) {
    let rooms = state.rooms.read().await;
    let Some(room_state) = rooms.get(&room_id) else {
        return;
    };
    broadcast_locked(room_state, frame, exclude);
}

// =============================================================================
// FRAME BUILDERS
// =============================================================================

/// `room_update` broadcast: room metadata plus the deduplicated member list.
#[must_use]
pub fn membership_frame(room_state: &RoomState) -> Frame {
    let mut members: Vec<&Member> = room_state.members.values().collect();
    members.sort_by_key(|m| m.user_id);
    Frame::request("room_update", Data::new())
        .with_room_id(room_state.room.id)
        .with_data("room", serde_json::json!(room_state.room))
        .with_data("members", serde_json::json!(members))
}

/// `presence_update` broadcast for an online-flag change.
#[must_use]
pub fn presence_frame(room_id: Uuid, user_id: Uuid, online: bool) -> Frame {
    Frame::request("presence_update", Data::new())
        .with_room_id(room_id)
        .with_data("userId", user_id.to_string())
        .with_data("online", online)
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
