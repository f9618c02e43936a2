//! Sweeper — background expiry of grace periods and stale pending strokes.
//!
//! DESIGN
//! ======
//! A background task wakes on a fixed interval and, under the rooms write
//! lock, removes offline members whose reconnect grace has expired,
//! discards pending strokes older than the pending timeout, and tears down
//! rooms that ended up empty or whose creator is gone. Rooms and their
//! bound game are destroyed together.

use tokio::task::JoinHandle;
use tracing::info;

use crate::state::{AppState, GameState, Lifecycle};

/// Spawn the background sweep task. Returns a handle for shutdown.
pub fn spawn_sweeper(state: AppState) -> JoinHandle<()> {
    let interval = state.config.sweep_interval;
    info!(interval_secs = interval.as_secs(), "sweeper configured");
    tokio::spawn(async move {
        loop {
            sweep(&state).await;
            tokio::time::sleep(interval).await;
        }
    })
}

/// One sweep pass. Split out from the task loop so tests can drive it.
pub async fn sweep(state: &AppState) {
    let grace = state.config.reconnect_grace;
    let pending_timeout = state.config.stroke_pending_timeout;

    let mut rooms = state.rooms.write().await;
    let mut closed = Vec::new();

    for (room_id, room_state) in rooms.iter_mut() {
        // Expire offline members past their grace period.
        let creator_id = room_state.room.creator_id;
        let before = room_state.members.len();
        let mut creator_expired = false;
        room_state.members.retain(|user_id, member| {
            if member.online || member.last_seen.elapsed() <= grace {
                return true;
            }
            if *user_id == creator_id {
                creator_expired = true;
                return true;
            }
            false
        });
        let expired = before - room_state.members.len();
        if expired > 0 {
            info!(%room_id, expired, "expired offline members");
            let update = crate::services::room::membership_frame(room_state);
            crate::services::room::broadcast_locked(room_state, &update, None);
        }

        // Discard pending strokes that never finalized.
        if let Some(game) = room_state.game.as_mut() {
            if let GameState::Whiteboard(board) = &mut game.state {
                let before = board.pending.len();
                board.pending.retain(|_, p| p.started.elapsed() <= pending_timeout);
                let dropped = before - board.pending.len();
                if dropped > 0 {
                    info!(%room_id, dropped, "discarded stale pending strokes");
                }
            }
        }

        if creator_expired || room_state.members.is_empty() {
            room_state.room.lifecycle = Lifecycle::Closed;
            let update = crate::services::room::membership_frame(room_state);
            crate::services::room::broadcast_locked(room_state, &update, None);
            closed.push(*room_id);
        }
    }

    for room_id in closed {
        rooms.remove(&room_id);
        info!(%room_id, "room closed and destroyed");
    }
}
