//! Whiteboard authority — the only writer of whiteboard state.
//!
//! DESIGN
//! ======
//! A stroke lives in the pending map from `draw_start` until `draw_end`
//! promotes it into the committed log with the next version number. The
//! author holds an optimistic local copy the whole time, so committed-log
//! broadcasts exclude the author's connection; in-progress relays
//! (`draw_start`/`draw_move`) are best-effort previews for peers.
//!
//! Pending strokes never leak into the log: they are discarded by the
//! disconnect hook and by the sweeper once they outlive the pending
//! timeout.

use std::time::Instant;

use tracing::info;
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::state::{AppState, GameState, PendingStroke, Point, RoomState, Stroke, WhiteboardState};
use crate::validate::{self, StrokeError};

// =============================================================================
// RESOLUTION
// =============================================================================

fn resolve_board<'a>(
    room_state: &'a mut RoomState,
    game_id: Uuid,
    user_id: Uuid,
    conn_id: Uuid,
) -> Result<&'a mut WhiteboardState, StrokeError> {
    if !room_state.clients.contains_key(&conn_id) {
        return Err(StrokeError::NotMember(user_id));
    }
    let Some(game) = room_state.game.as_mut() else {
        return Err(StrokeError::GameNotFound(game_id));
    };
    if game.id != game_id {
        return Err(StrokeError::GameNotFound(game_id));
    }
    match &mut game.state {
        GameState::Whiteboard(board) => Ok(board),
        GameState::Puzzle(_) => Err(StrokeError::NotWhiteboard),
    }
}

// =============================================================================
// START / APPEND
// =============================================================================

/// Register a pending stroke keyed by the client-supplied id. Peers get a
/// best-effort `draw_start` preview.
///
/// # Errors
///
/// Returns `DuplicateStroke` when the id collides with a pending or
/// committed stroke.
#[allow(clippy::too_many_arguments)]
pub async fn start_stroke(
    state: &AppState,
    room_id: Uuid,
    game_id: Uuid,
    stroke_id: Uuid,
    tool: String,
    color: String,
    size: f64,
    user_id: Uuid,
    conn_id: Uuid,
) -> Result<(), StrokeError> {
    let mut rooms = state.rooms.write().await;
    let room_state = rooms
        .get_mut(&room_id)
        .ok_or(StrokeError::GameNotFound(game_id))?;
    let board = resolve_board(room_state, game_id, user_id, conn_id)?;

    validate::check_stroke_start(board, stroke_id)?;

    let stroke = Stroke {
        id: stroke_id,
        author_id: user_id,
        tool,
        color,
        size,
        points: Vec::new(),
        ts: crate::frame::now_ms(),
    };
    let preview = serde_json::json!(&stroke);
    board
        .pending
        .insert(stroke_id, PendingStroke { stroke, started: Instant::now() });

    let frame = Frame::request("draw_start", Data::new())
        .with_room_id(room_id)
        .with_data("stroke", preview);
    crate::services::room::broadcast_locked(room_state, &frame, Some(conn_id));
    Ok(())
}

/// Append one point to a pending stroke. Author-only; peers get a
/// best-effort `draw_move` preview.
///
/// # Errors
///
/// Returns `NotPending`, `NotAuthor`, or `TooManyPoints`.
#[allow(clippy::too_many_arguments)]
pub async fn append_point(
    state: &AppState,
    room_id: Uuid,
    game_id: Uuid,
    stroke_id: Uuid,
    point: Point,
    user_id: Uuid,
    conn_id: Uuid,
) -> Result<(), StrokeError> {
    let mut rooms = state.rooms.write().await;
    let room_state = rooms
        .get_mut(&room_id)
        .ok_or(StrokeError::GameNotFound(game_id))?;
    let board = resolve_board(room_state, game_id, user_id, conn_id)?;

    validate::check_append_point(board, stroke_id, user_id, state.config.max_stroke_points)?;
    if let Some(pending) = board.pending.get_mut(&stroke_id) {
        pending.stroke.points.push(point);
    }

    let frame = Frame::request("draw_move", Data::new())
        .with_room_id(room_id)
        .with_data("strokeId", stroke_id.to_string())
        .with_data("point", serde_json::json!(point));
    crate::services::room::broadcast_locked(room_state, &frame, Some(conn_id));
    Ok(())
}

// =============================================================================
// FINALIZE / UNDO / CLEAR
// =============================================================================

/// Promote a pending stroke into the committed log with the next version.
/// Broadcast to every member except the author, who already holds an
/// optimistic copy. Returns the committed stroke and the new version.
///
/// # Errors
///
/// Returns `NotPending` or `NotAuthor`.
pub async fn finalize_stroke(
    state: &AppState,
    room_id: Uuid,
    game_id: Uuid,
    stroke_id: Uuid,
    user_id: Uuid,
    conn_id: Uuid,
) -> Result<(u64, Stroke), StrokeError> {
    let mut rooms = state.rooms.write().await;
    let room_state = rooms
        .get_mut(&room_id)
        .ok_or(StrokeError::GameNotFound(game_id))?;
    let board = resolve_board(room_state, game_id, user_id, conn_id)?;

    validate::check_finalize(board, stroke_id, user_id)?;

    let mut stroke = board
        .pending
        .remove(&stroke_id)
        .map(|p| p.stroke)
        .ok_or(StrokeError::NotPending(stroke_id))?;
    stroke.ts = crate::frame::now_ms();
    board.version += 1;
    let version = board.version;
    board.strokes.push(stroke.clone());
    info!(%room_id, %stroke_id, version, points = stroke.points.len(), "stroke finalized");

    let frame = Frame::request("stroke_added", Data::new())
        .with_room_id(room_id)
        .with_data("stroke", serde_json::json!(&stroke))
        .with_data("version", version);
    crate::services::room::broadcast_locked(room_state, &frame, Some(conn_id));
    Ok((version, stroke))
}

/// Remove the caller's most recent committed stroke. Per-author policy:
/// older own strokes are rejected with the latest id as resync hint.
///
/// # Errors
///
/// Returns `NotFound`, `NotAuthor`, or `NotLatest`.
pub async fn undo_stroke(
    state: &AppState,
    room_id: Uuid,
    game_id: Uuid,
    stroke_id: Uuid,
    user_id: Uuid,
    conn_id: Uuid,
) -> Result<u64, StrokeError> {
    let mut rooms = state.rooms.write().await;
    let room_state = rooms
        .get_mut(&room_id)
        .ok_or(StrokeError::GameNotFound(game_id))?;
    let board = resolve_board(room_state, game_id, user_id, conn_id)?;

    validate::check_undo(board, stroke_id, user_id)?;
    board.strokes.retain(|s| s.id != stroke_id);
    board.version += 1;
    let version = board.version;
    info!(%room_id, %stroke_id, version, "stroke undone");

    let frame = Frame::request("stroke_removed", Data::new())
        .with_room_id(room_id)
        .with_data("strokeId", stroke_id.to_string())
        .with_data("version", version);
    crate::services::room::broadcast_locked(room_state, &frame, Some(conn_id));
    Ok(version)
}

/// Empty the committed log (`clear_all`) or just the caller's strokes, and
/// bump the version. Any member may clear.
///
/// # Errors
///
/// Returns `GameNotFound`, `NotWhiteboard`, or `NotMember`.
pub async fn clear(
    state: &AppState,
    room_id: Uuid,
    game_id: Uuid,
    user_id: Uuid,
    conn_id: Uuid,
    clear_all: bool,
) -> Result<u64, StrokeError> {
    let mut rooms = state.rooms.write().await;
    let room_state = rooms
        .get_mut(&room_id)
        .ok_or(StrokeError::GameNotFound(game_id))?;
    let board = resolve_board(room_state, game_id, user_id, conn_id)?;

    if clear_all {
        board.strokes.clear();
        board.pending.clear();
    } else {
        board.strokes.retain(|s| s.author_id != user_id);
        board.pending.retain(|_, p| p.stroke.author_id != user_id);
    }
    board.version += 1;
    let version = board.version;
    info!(%room_id, clear_all, version, "board cleared");

    let frame = Frame::request("board_cleared", Data::new())
        .with_room_id(room_id)
        .with_data("clearAll", clear_all)
        .with_data("userId", user_id.to_string())
        .with_data("version", version);
    crate::services::room::broadcast_locked(room_state, &frame, Some(conn_id));
    Ok(version)
}

// =============================================================================
// CANCELLATION
// =============================================================================

/// Drop a user's pending strokes. Called under the room lock by the
/// disconnect hook and member removal so half-drawn strokes never reach
/// the committed log.
pub fn discard_pending_for_user(room_state: &mut RoomState, user_id: Uuid) {
    let Some(game) = room_state.game.as_mut() else {
        return;
    };
    if let GameState::Whiteboard(board) = &mut game.state {
        board.pending.retain(|_, p| p.stroke.author_id != user_id);
    }
}

#[cfg(test)]
#[path = "whiteboard_test.rs"]
mod tests;
