//! WebSocket gateway — the single client entry point.
//!
//! DESIGN
//! ======
//! On upgrade, generates a connection ID and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by event name
//! - Broadcast frames from room peers → forward to the client
//!
//! Handler functions are thin: they parse the payload, call the owning
//! service, and return an `Outcome`. Services broadcast to peers inside
//! their own critical sections; the gateway only ever writes to its own
//! socket.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session_connected` with `connId`
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Dispatch sends the reply (or nothing, for fire-and-forget events)
//! 4. Close → `disconnect` hook marks the member offline for the grace window

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::services;
use crate::state::{AppState, PiecePosition, Point, RoomConfig};
use crate::validate::MoveError;

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. Peer broadcasts already happened
/// inside the service; this only decides what the sender gets back.
enum Outcome {
    /// Send done+data to the sender.
    Reply(Data),
    /// Send done+data to the sender under a different event name.
    ReplyAs { event: &'static str, data: Data },
    /// Send an empty done to the sender.
    Done,
    /// No reply. Used for fire-and-forget events (cursor, draw previews).
    Silent,
}

// =============================================================================
// UPGRADE
// =============================================================================

/// Upgrade handler. Identity arrives as a `user_id` query parameter, issued
/// by the auth layer in front of this service.
pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(user_id) = params.get("user_id").and_then(|s| s.parse::<Uuid>().ok()) else {
        return (StatusCode::UNAUTHORIZED, "user_id required").into_response();
    };
    let name = params
        .get("name")
        .cloned()
        .unwrap_or_else(|| "guest".to_string());

    ws.on_upgrade(move |socket| run_ws(socket, state, user_id, name))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, user_id: Uuid, name: String) {
    let conn_id = Uuid::new_v4();

    // Per-connection channel for receiving broadcast frames from peers.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.config.client_channel_capacity);

    let welcome = Frame::request("session_connected", Data::new())
        .with_data("connId", conn_id.to_string())
        .with_data("userId", user_id.to_string());
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }

    info!(%conn_id, %user_id, "ws: client connected");

    // The room this connection has joined, if any.
    let mut current_room: Option<Uuid> = None;

    'conn: loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(
                            &state, &mut current_room, conn_id, user_id, &name, &client_tx, &text,
                        )
                        .await;
                        for frame in replies {
                            // A failed send means the socket is gone; stop
                            // servicing the connection, not just the replies.
                            if send_frame(&mut socket, &frame).await.is_err() {
                                break 'conn;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    // Mark offline but keep membership for the reconnect grace window.
    if let Some(room_id) = current_room {
        services::room::disconnect(&state, room_id, conn_id).await;
    }
    info!(%conn_id, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the
/// sender. Split from the socket loop so tests can drive dispatch directly.
async fn process_inbound_text(
    state: &AppState,
    current_room: &mut Option<Uuid>,
    conn_id: Uuid,
    user_id: Uuid,
    name: &str,
    client_tx: &mpsc::Sender<Frame>,
    text: &str,
) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%conn_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway_error", Data::new())
                .with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    // Stamp the authenticated identity as `from`; never trust the client's.
    req.from = Some(user_id.to_string());

    let ephemeral = matches!(req.event.as_str(), "cursor" | "draw_move");
    if !ephemeral {
        info!(%conn_id, id = %req.id, event = %req.event, status = ?req.status, "ws: recv frame");
    }

    let result = match req.event.as_str() {
        "create_room" => handle_create_room(state, user_id, name, &req).await,
        "join_room" => handle_join_room(state, current_room, conn_id, user_id, name, client_tx, &req).await,
        "leave_room" => handle_leave_room(state, current_room, conn_id).await,
        "remove_player" => handle_remove_player(state, *current_room, user_id, &req).await,
        "update_config" => handle_update_config(state, *current_room, user_id, &req).await,
        "start_game" => handle_start_game(state, *current_room, user_id, &req).await,
        "get_game_state" => handle_get_game_state(state, *current_room, &req).await,
        "move_piece" => handle_move_piece(state, *current_room, conn_id, user_id, &req).await,
        "draw_start" | "draw_move" | "draw_end" | "undo" | "clear" => {
            handle_stroke(state, *current_room, conn_id, user_id, &req).await
        }
        "cursor" => Ok(handle_cursor(state, *current_room, conn_id, user_id, &req).await),
        "tool_change" => Ok(handle_tool_change(state, *current_room, conn_id, user_id, &req).await),
        other => Err(req.error(format!("unknown event: {other}"))),
    };

    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::ReplyAs { event, data }) => vec![req.done_with(data).with_event(event)],
        Ok(Outcome::Done) => vec![req.done()],
        Ok(Outcome::Silent) => vec![],
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// ROOM HANDLERS
// =============================================================================

async fn handle_create_room(
    state: &AppState,
    user_id: Uuid,
    name: &str,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let Some(config_value) = req.data.get("config").cloned() else {
        return Err(req.error("config required"));
    };
    let config: RoomConfig = match serde_json::from_value(config_value) {
        Ok(c) => c,
        Err(e) => return Err(req.error(format!("invalid config: {e}"))),
    };

    let room = services::room::create_room(state, user_id, name, config).await;
    let mut data = Data::new();
    data.insert("room".into(), serde_json::to_value(&room).unwrap_or_default());
    Ok(Outcome::Reply(data))
}

async fn handle_join_room(
    state: &AppState,
    current_room: &mut Option<Uuid>,
    conn_id: Uuid,
    user_id: Uuid,
    name: &str,
    client_tx: &mpsc::Sender<Frame>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let Some(room_id) = data_uuid(req, "roomId").or(req.room_id) else {
        return Err(req.error("roomId required"));
    };

    // The resync fast path is only valid while the connection is still in
    // the room's client set; a removed player falls through to a real join
    // so membership and the frame channel are restored.
    let registered = match *current_room {
        Some(current) if current == room_id => {
            services::room::is_registered(state, room_id, conn_id).await
        }
        _ => false,
    };

    let joined = if registered {
        services::room::get_state(state, room_id, None).await.map_err(|e| req.error_from(&e))?
    } else {
        match *current_room {
            // Joining while in another room is an atomic switch.
            Some(old) if old != room_id => {
                services::room::switch_room(state, old, room_id, user_id, name, conn_id, client_tx.clone())
                    .await
                    .map_err(|e| {
                        *current_room = None;
                        req.error_from(&e)
                    })?
            }
            _ => services::room::join_room(state, room_id, user_id, name, conn_id, client_tx.clone())
                .await
                .map_err(|e| req.error_from(&e))?,
        }
    };
    *current_room = Some(room_id);

    let mut data = Data::new();
    data.insert("snapshot".into(), joined);
    Ok(Outcome::ReplyAs { event: "state_sync", data })
}

async fn handle_leave_room(
    state: &AppState,
    current_room: &mut Option<Uuid>,
    conn_id: Uuid,
) -> Result<Outcome, Frame> {
    if let Some(room_id) = current_room.take() {
        services::room::leave_room(state, room_id, conn_id).await;
    }
    Ok(Outcome::Done)
}

async fn handle_remove_player(
    state: &AppState,
    current_room: Option<Uuid>,
    user_id: Uuid,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let room_id = require_room(current_room, req)?;
    let Some(target_id) = data_uuid(req, "userId") else {
        return Err(req.error("userId required"));
    };
    match services::room::remove_player(state, room_id, user_id, target_id).await {
        Ok(()) => Ok(Outcome::Done),
        Err(e) => Err(req.error_from(&e)),
    }
}

async fn handle_update_config(
    state: &AppState,
    current_room: Option<Uuid>,
    user_id: Uuid,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let room_id = require_room(current_room, req)?;
    let Some(config_value) = req.data.get("config").cloned() else {
        return Err(req.error("config required"));
    };
    let config: RoomConfig = match serde_json::from_value(config_value) {
        Ok(c) => c,
        Err(e) => return Err(req.error(format!("invalid config: {e}"))),
    };
    match services::room::update_config(state, room_id, user_id, config).await {
        Ok(()) => Ok(Outcome::Done),
        Err(e) => Err(req.error_from(&e)),
    }
}

async fn handle_start_game(
    state: &AppState,
    current_room: Option<Uuid>,
    user_id: Uuid,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let room_id = require_room(current_room, req)?;
    match services::room::start_game(state, room_id, user_id).await {
        Ok(snapshot) => {
            let mut data = Data::new();
            data.insert("snapshot".into(), snapshot);
            Ok(Outcome::ReplyAs { event: "state_sync", data })
        }
        Err(e) => Err(req.error_from(&e)),
    }
}

async fn handle_get_game_state(
    state: &AppState,
    current_room: Option<Uuid>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let room_id = require_room(current_room, req)?;
    let game_id = data_uuid(req, "gameId");
    match services::room::get_state(state, room_id, game_id).await {
        Ok(snapshot) => {
            let mut data = Data::new();
            data.insert("snapshot".into(), snapshot);
            Ok(Outcome::ReplyAs { event: "state_sync", data })
        }
        Err(e) => Err(req.error_from(&e)),
    }
}

// =============================================================================
// PUZZLE HANDLER
// =============================================================================

async fn handle_move_piece(
    state: &AppState,
    current_room: Option<Uuid>,
    conn_id: Uuid,
    user_id: Uuid,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let room_id = require_room(current_room, req)?;
    let Some(game_id) = data_uuid(req, "gameId") else {
        return Err(req.error("gameId required"));
    };
    let Some(piece_id) = data_uuid(req, "pieceId") else {
        return Err(req.error("pieceId required"));
    };
    let from: PiecePosition = data_parsed(req, "fromPosition")?;
    let to: PiecePosition = data_parsed(req, "toPosition")?;

    match services::puzzle::propose_move(state, room_id, game_id, piece_id, from, to, user_id, conn_id).await {
        Ok(applied) => {
            let mut data = Data::new();
            data.insert("pieceId".into(), serde_json::json!(applied.piece_id));
            data.insert("position".into(), serde_json::to_value(applied.position).unwrap_or_default());
            data.insert("completed".into(), serde_json::json!(applied.completed));
            if let Some(stats) = applied.stats {
                data.insert("stats".into(), serde_json::to_value(stats).unwrap_or_default());
            }
            Ok(Outcome::ReplyAs { event: "piece_moved", data })
        }
        Err(e) => {
            // Rejections answer as `move_rejected`; stale moves carry the
            // authoritative position so the client can resync the piece.
            let mut err = req.error_from(&e).with_event("move_rejected");
            err = err.with_data("pieceId", serde_json::json!(piece_id));
            if let MoveError::Stale { current } = e {
                err = err.with_data("position", serde_json::to_value(current).unwrap_or_default());
            }
            Err(err)
        }
    }
}

// =============================================================================
// WHITEBOARD HANDLER
// =============================================================================

async fn handle_stroke(
    state: &AppState,
    current_room: Option<Uuid>,
    conn_id: Uuid,
    user_id: Uuid,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let room_id = require_room(current_room, req)?;
    let Some(game_id) = data_uuid(req, "gameId") else {
        return Err(req.error("gameId required"));
    };

    match req.event.as_str() {
        "draw_start" => {
            let Some(stroke_id) = data_uuid(req, "strokeId") else {
                return Err(req.error("strokeId required"));
            };
            let tool = data_str(req, "tool").unwrap_or("pen").to_string();
            let color = data_str(req, "color").unwrap_or("#000000").to_string();
            let size = req.data.get("size").and_then(serde_json::Value::as_f64).unwrap_or(2.0);

            match services::whiteboard::start_stroke(
                state, room_id, game_id, stroke_id, tool, color, size, user_id, conn_id,
            )
            .await
            {
                Ok(()) => Ok(Outcome::Done),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "draw_move" => {
            let Some(stroke_id) = data_uuid(req, "strokeId") else {
                return Err(req.error("strokeId required"));
            };
            let point: Point = data_parsed(req, "point")?;

            // Previews are fire-and-forget: rejections are dropped rather
            // than answered, except authorship violations.
            match services::whiteboard::append_point(state, room_id, game_id, stroke_id, point, user_id, conn_id)
                .await
            {
                Ok(()) => Ok(Outcome::Silent),
                Err(e @ crate::validate::StrokeError::NotAuthor) => Err(req.error_from(&e)),
                Err(_) => Ok(Outcome::Silent),
            }
        }
        "draw_end" => {
            let Some(stroke_id) = data_uuid(req, "strokeId") else {
                return Err(req.error("strokeId required"));
            };
            match services::whiteboard::finalize_stroke(state, room_id, game_id, stroke_id, user_id, conn_id).await {
                Ok((version, stroke)) => {
                    let mut data = Data::new();
                    data.insert("version".into(), serde_json::json!(version));
                    data.insert("stroke".into(), serde_json::to_value(&stroke).unwrap_or_default());
                    Ok(Outcome::ReplyAs { event: "stroke_added", data })
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "undo" => {
            let Some(stroke_id) = data_uuid(req, "strokeId") else {
                return Err(req.error("strokeId required"));
            };
            match services::whiteboard::undo_stroke(state, room_id, game_id, stroke_id, user_id, conn_id).await {
                Ok(version) => {
                    let mut data = Data::new();
                    data.insert("version".into(), serde_json::json!(version));
                    data.insert("strokeId".into(), serde_json::json!(stroke_id));
                    Ok(Outcome::ReplyAs { event: "stroke_removed", data })
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "clear" => {
            let clear_all = req
                .data
                .get("clearAll")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            match services::whiteboard::clear(state, room_id, game_id, user_id, conn_id, clear_all).await {
                Ok(version) => {
                    let mut data = Data::new();
                    data.insert("version".into(), serde_json::json!(version));
                    Ok(Outcome::ReplyAs { event: "board_cleared", data })
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        other => Err(req.error(format!("unknown event: {other}"))),
    }
}

// =============================================================================
// PRESENCE HANDLERS
// =============================================================================

async fn handle_cursor(
    state: &AppState,
    current_room: Option<Uuid>,
    conn_id: Uuid,
    user_id: Uuid,
    req: &Frame,
) -> Outcome {
    let Some(room_id) = current_room else {
        // Silently ignore cursor moves before joining.
        return Outcome::Silent;
    };
    let x = req.data.get("x").and_then(serde_json::Value::as_f64).unwrap_or(0.0);
    let y = req.data.get("y").and_then(serde_json::Value::as_f64).unwrap_or(0.0);
    services::presence::cursor(state, room_id, user_id, conn_id, Point { x, y }).await;
    Outcome::Silent
}

async fn handle_tool_change(
    state: &AppState,
    current_room: Option<Uuid>,
    conn_id: Uuid,
    user_id: Uuid,
    req: &Frame,
) -> Outcome {
    let Some(room_id) = current_room else {
        return Outcome::Silent;
    };
    let payload = req.data.get("tool").cloned().unwrap_or(serde_json::Value::Null);
    services::presence::tool_change(state, room_id, user_id, conn_id, payload).await;
    Outcome::Silent
}

// =============================================================================
// HELPERS
// =============================================================================

fn require_room(current_room: Option<Uuid>, req: &Frame) -> Result<Uuid, Frame> {
    current_room.ok_or_else(|| req.error("must join a room first"))
}

fn data_uuid(req: &Frame, key: &str) -> Option<Uuid> {
    req.data.get(key).and_then(|v| v.as_str()).and_then(|s| s.parse().ok())
}

fn data_str<'a>(req: &'a Frame, key: &str) -> Option<&'a str> {
    req.data.get(key).and_then(|v| v.as_str())
}

fn data_parsed<T: serde::de::DeserializeOwned>(req: &Frame, key: &str) -> Result<T, Frame> {
    let Some(value) = req.data.get(key).cloned() else {
        return Err(req.error(format!("{key} required")));
    };
    serde_json::from_value(value).map_err(|e| req.error(format!("invalid {key}: {e}")))
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    let ephemeral = matches!(frame.event.as_str(), "cursor" | "draw_move" | "presence_update");
    if !ephemeral {
        if frame.status == crate::frame::Status::Error {
            let code = frame.data.get("code").and_then(|v| v.as_str()).unwrap_or("-");
            let message = frame.data.get("message").and_then(|v| v.as_str()).unwrap_or("-");
            warn!(id = %frame.id, event = %frame.event, code, message, "ws: send frame status=Error");
        } else {
            info!(id = %frame.id, event = %frame.event, status = ?frame.status, "ws: send frame");
        }
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
