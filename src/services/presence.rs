//! Presence tracker — cursor and tool propagation, best-effort.
//!
//! DESIGN
//! ======
//! This path carries no correctness obligation: frames may be dropped
//! under load, nothing is retried or persisted. Cursor updates use
//! `try_write` so they never queue behind mutating traffic; if the lock is
//! contended the update is simply dropped. Online-flag presence lives in
//! `services::room` because it rides the membership lifecycle.

use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::state::{AppState, Point};

/// Record a member's cursor and relay it to peers. Drops silently when the
/// room is unknown, the lock is contended, or a peer channel is full.
pub async fn cursor(state: &AppState, room_id: Uuid, user_id: Uuid, conn_id: Uuid, point: Point) {
    let Ok(mut rooms) = state.rooms.try_write() else {
        return;
    };
    let Some(room_state) = rooms.get_mut(&room_id) else {
        return;
    };
    let Some(member) = room_state.members.get_mut(&user_id) else {
        return;
    };
    member.cursor = Some(point);

    let frame = Frame::request("presence_update", Data::new())
        .with_room_id(room_id)
        .with_data("userId", user_id.to_string())
        .with_data("cursor", serde_json::json!(point));
    crate::services::room::broadcast_locked(room_state, &frame, Some(conn_id));
}

/// Relay a tool change to peers. Pure notification, nothing stored.
pub async fn tool_change(
    state: &AppState,
    room_id: Uuid,
    user_id: Uuid,
    conn_id: Uuid,
    payload: serde_json::Value,
) {
    let frame = Frame::request("tool_change", Data::new())
        .with_room_id(room_id)
        .with_data("userId", user_id.to_string())
        .with_data("tool", payload);
    crate::services::room::broadcast(state, room_id, &frame, Some(conn_id)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_helpers;
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn cursor_updates_member_and_relays_to_peers() {
        let state = test_helpers::test_app_state();
        let creator = Uuid::new_v4();
        let room_id = test_helpers::seed_room(&state, creator, test_helpers::puzzle_config(4, 4)).await;
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (conn_a, mut rx_a) = test_helpers::register_client(&state, room_id, alice).await;
        let (_conn_b, mut rx_b) = test_helpers::register_client(&state, room_id, bob).await;

        cursor(&state, room_id, alice, conn_a, Point { x: 10.0, y: 20.0 }).await;

        let frame = timeout(Duration::from_millis(200), rx_b.recv())
            .await
            .expect("peer should receive cursor")
            .expect("channel open");
        assert_eq!(frame.event, "presence_update");
        assert_eq!(frame.data.get("userId").and_then(|v| v.as_str()), Some(alice.to_string().as_str()));

        // Sender is excluded.
        assert!(timeout(Duration::from_millis(80), rx_a.recv()).await.is_err());

        let rooms = state.rooms.read().await;
        let member = rooms.get(&room_id).unwrap().members.get(&alice).unwrap();
        assert_eq!(member.cursor, Some(Point { x: 10.0, y: 20.0 }));
    }

    #[tokio::test]
    async fn cursor_for_unknown_room_is_a_noop() {
        let state = test_helpers::test_app_state();
        cursor(&state, Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Point { x: 0.0, y: 0.0 }).await;
    }

    #[tokio::test]
    async fn tool_change_relays_payload() {
        let state = test_helpers::test_app_state();
        let creator = Uuid::new_v4();
        let room_id = test_helpers::seed_room(&state, creator, test_helpers::whiteboard_config()).await;
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (conn_a, _rx_a) = test_helpers::register_client(&state, room_id, alice).await;
        let (_conn_b, mut rx_b) = test_helpers::register_client(&state, room_id, bob).await;

        tool_change(&state, room_id, alice, conn_a, serde_json::json!({"tool": "eraser", "size": 8})).await;

        let frame = timeout(Duration::from_millis(200), rx_b.recv())
            .await
            .expect("peer should receive tool change")
            .expect("channel open");
        assert_eq!(frame.event, "tool_change");
        assert_eq!(
            frame.data.get("tool").and_then(|v| v.get("tool")).and_then(|v| v.as_str()),
            Some("eraser")
        );
    }
}
