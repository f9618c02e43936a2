//! Puzzle authority — the only writer of puzzle state.
//!
//! DESIGN
//! ======
//! `propose_move` validates through the pure checks in `validate`, then
//! applies the occupancy-map and piece-position update as one step under
//! the room write lock. The `piece_moved` broadcast (and `game_completed`,
//! when the move finishes the puzzle) is fanned out inside the same
//! critical section, so peers observe moves in application order.
//!
//! The completion event is latched: `completed` flips once, and any move
//! proposed afterwards is rejected `GAME_OVER` without mutation.

use tracing::info;
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::state::{AppState, GameState, PiecePosition};
use crate::validate::{self, MoveError};

// =============================================================================
// TYPES
// =============================================================================

/// Result of a successfully applied move, for the sender's reply.
#[derive(Debug, Clone, Copy)]
pub struct AppliedMove {
    pub piece_id: Uuid,
    pub position: PiecePosition,
    pub completed: bool,
    pub stats: Option<CompletionStats>,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CompletionStats {
    pub moves: u64,
    #[serde(rename = "durationMs")]
    pub duration_ms: i64,
}

// =============================================================================
// PROPOSE MOVE
// =============================================================================

/// Validate and apply a piece move for `user_id`.
///
/// # Errors
///
/// Returns the first failing check from `validate::check_move`, or
/// `GameNotFound`/`NotMember` when the room, game, or caller's seat is
/// missing. Rejections never mutate state.
#[allow(clippy::too_many_arguments)]
pub async fn propose_move(
    state: &AppState,
    room_id: Uuid,
    game_id: Uuid,
    piece_id: Uuid,
    from: PiecePosition,
    to: PiecePosition,
    user_id: Uuid,
    conn_id: Uuid,
) -> Result<AppliedMove, MoveError> {
    let mut rooms = state.rooms.write().await;
    let room_state = rooms
        .get_mut(&room_id)
        .ok_or(MoveError::GameNotFound(game_id))?;
    if !room_state.clients.contains_key(&conn_id) {
        return Err(MoveError::NotMember(user_id));
    }

    let Some(game) = room_state.game.as_mut() else {
        return Err(MoveError::GameNotFound(game_id));
    };
    if game.id != game_id {
        return Err(MoveError::GameNotFound(game_id));
    }
    let GameState::Puzzle(puzzle) = &mut game.state else {
        return Err(MoveError::NotPuzzle);
    };

    validate::check_move(puzzle, piece_id, from, to)?;

    // A same-position resubmission is acknowledged without counting as a
    // move or waking peers.
    if from == to {
        return Ok(AppliedMove { piece_id, position: to, completed: puzzle.completed, stats: None });
    }

    // Apply atomically: occupancy and piece position change together, and
    // become visible to later proposals only once the lock is released.
    if let PiecePosition::Placed(cell) = from {
        puzzle.occupancy.remove(&cell);
    }
    if let PiecePosition::Placed(cell) = to {
        puzzle.occupancy.insert(cell, piece_id);
    }
    if let Some(piece) = puzzle.pieces.get_mut(&piece_id) {
        piece.position = to;
    }
    puzzle.move_count += 1;

    let mut stats = None;
    if !puzzle.completed && puzzle.is_complete() {
        puzzle.completed = true;
        stats = Some(CompletionStats {
            moves: puzzle.move_count,
            duration_ms: crate::frame::now_ms().saturating_sub(puzzle.started_ts),
        });
        info!(%room_id, %game_id, moves = puzzle.move_count, "puzzle completed");
    }
    let completed = puzzle.completed;

    let moved = Frame::request("piece_moved", Data::new())
        .with_room_id(room_id)
        .with_data("pieceId", piece_id.to_string())
        .with_data("position", serde_json::json!(to))
        .with_data("userId", user_id.to_string());
    crate::services::room::broadcast_locked(room_state, &moved, Some(conn_id));

    if let Some(stats) = stats {
        // Emitted exactly once, to everyone including the mover.
        let done = Frame::request("game_completed", Data::new())
            .with_room_id(room_id)
            .with_data("gameId", game_id.to_string())
            .with_data("stats", serde_json::json!(stats));
        crate::services::room::broadcast_locked(room_state, &done, None);
    }

    Ok(AppliedMove { piece_id, position: to, completed, stats })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Cell, Game, test_helpers};
    use std::collections::HashSet;
    use tokio::sync::mpsc;
    use tokio::time::{Duration, timeout};

    async fn seed_active_puzzle(rows: u16, cols: u16) -> (AppState, Uuid, Uuid, Uuid) {
        let state = test_helpers::test_app_state();
        let creator = Uuid::new_v4();
        let room_id = test_helpers::seed_room(&state, creator, test_helpers::puzzle_config(rows, cols)).await;
        crate::services::room::start_game(&state, room_id, creator)
            .await
            .expect("start_game should succeed");
        let rooms = state.rooms.read().await;
        let game_id = rooms.get(&room_id).unwrap().game.as_ref().unwrap().id;
        drop(rooms);
        (state, room_id, game_id, creator)
    }

    fn bank() -> PiecePosition {
        PiecePosition::Bank
    }

    fn at(row: u16, col: u16) -> PiecePosition {
        PiecePosition::Placed(Cell { row, col })
    }

    async fn recv(rx: &mut mpsc::Receiver<Frame>) -> Frame {
        timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("broadcast receive timed out")
            .expect("broadcast channel closed unexpectedly")
    }

    #[tokio::test]
    async fn bank_to_cell_conflict_then_retry() {
        // Scenario: two users race for (0,0); the loser retries to (0,1).
        let (state, room_id, game_id, _) = seed_active_puzzle(4, 4).await;
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        let (conn_a, _rx_a) = test_helpers::register_client(&state, room_id, user_a).await;
        let (conn_b, _rx_b) = test_helpers::register_client(&state, room_id, user_b).await;
        let pieces = test_helpers::puzzle_pieces_by_target(&state, room_id).await;
        let p1 = pieces[&Cell { row: 0, col: 0 }];
        let p2 = pieces[&Cell { row: 0, col: 1 }];

        let applied = propose_move(&state, room_id, game_id, p1, bank(), at(0, 0), user_a, conn_a)
            .await
            .unwrap();
        assert_eq!(applied.position, at(0, 0));
        assert!(!applied.completed);

        let conflict = propose_move(&state, room_id, game_id, p2, bank(), at(0, 0), user_b, conn_b).await;
        assert_eq!(
            conflict.unwrap_err(),
            MoveError::Occupied { cell: Cell { row: 0, col: 0 }, by: p1 }
        );

        let retry = propose_move(&state, room_id, game_id, p2, bank(), at(0, 1), user_b, conn_b)
            .await
            .unwrap();
        assert_eq!(retry.position, at(0, 1));
    }

    #[tokio::test]
    async fn stale_move_carries_authoritative_position() {
        let (state, room_id, game_id, _) = seed_active_puzzle(4, 4).await;
        let user = Uuid::new_v4();
        let (conn, _rx) = test_helpers::register_client(&state, room_id, user).await;
        let pieces = test_helpers::puzzle_pieces_by_target(&state, room_id).await;
        let p1 = pieces[&Cell { row: 0, col: 0 }];

        propose_move(&state, room_id, game_id, p1, bank(), at(2, 2), user, conn)
            .await
            .unwrap();

        // A second submission from the same stale origin must carry the
        // authoritative position for resync.
        let result = propose_move(&state, room_id, game_id, p1, bank(), at(3, 3), user, conn).await;
        assert_eq!(result.unwrap_err(), MoveError::Stale { current: at(2, 2) });
    }

    #[tokio::test]
    async fn same_position_resubmission_is_a_noop() {
        let (state, room_id, game_id, _) = seed_active_puzzle(3, 3).await;
        let user = Uuid::new_v4();
        let (conn, _rx) = test_helpers::register_client(&state, room_id, user).await;
        let observer = Uuid::new_v4();
        let (_obs_conn, mut obs_rx) = test_helpers::register_client(&state, room_id, observer).await;
        let pieces = test_helpers::puzzle_pieces_by_target(&state, room_id).await;
        let p1 = pieces[&Cell { row: 0, col: 0 }];

        propose_move(&state, room_id, game_id, p1, bank(), at(0, 0), user, conn)
            .await
            .unwrap();
        assert_eq!(recv(&mut obs_rx).await.event, "piece_moved");

        // Resubmitting the piece at its current position is acknowledged
        // but counts for nothing.
        let applied = propose_move(&state, room_id, game_id, p1, at(0, 0), at(0, 0), user, conn)
            .await
            .unwrap();
        assert_eq!(applied.position, at(0, 0));
        assert!(applied.stats.is_none());

        {
            let rooms = state.rooms.read().await;
            let Some(Game { state: GameState::Puzzle(puzzle), .. }) = &rooms.get(&room_id).unwrap().game
            else {
                panic!("expected puzzle");
            };
            assert_eq!(puzzle.move_count, 1);
        }
        assert!(
            timeout(Duration::from_millis(80), obs_rx.recv()).await.is_err(),
            "no broadcast for a no-op move"
        );
    }

    #[tokio::test]
    async fn occupancy_stays_unique_under_interleaved_moves() {
        let (state, room_id, game_id, _) = seed_active_puzzle(3, 3).await;
        let user = Uuid::new_v4();
        let (conn, _rx) = test_helpers::register_client(&state, room_id, user).await;
        let pieces = test_helpers::puzzle_pieces_by_target(&state, room_id).await;

        // Fill the first row, then shuffle a piece through the bank.
        for col in 0..3 {
            let id = pieces[&Cell { row: 0, col }];
            propose_move(&state, room_id, game_id, id, bank(), at(0, col), user, conn)
                .await
                .unwrap();
        }
        let mover = pieces[&Cell { row: 0, col: 1 }];
        propose_move(&state, room_id, game_id, mover, at(0, 1), bank(), user, conn)
            .await
            .unwrap();
        propose_move(&state, room_id, game_id, mover, bank(), at(1, 1), user, conn)
            .await
            .unwrap();

        let rooms = state.rooms.read().await;
        let Some(Game { state: GameState::Puzzle(puzzle), .. }) = &rooms.get(&room_id).unwrap().game else {
            panic!("expected puzzle");
        };
        let cells: Vec<Cell> = puzzle.occupancy.keys().copied().collect();
        let unique: HashSet<Cell> = cells.iter().copied().collect();
        assert_eq!(cells.len(), unique.len());
        assert_eq!(puzzle.occupancy.len(), 3);
    }

    #[tokio::test]
    async fn completion_emitted_once_then_game_over() {
        // Scenario: 2x2 puzzle, last correct move completes; resubmission is
        // rejected GAME_OVER and the event is not re-emitted.
        let (state, room_id, game_id, _) = seed_active_puzzle(2, 2).await;
        let user = Uuid::new_v4();
        let (conn, _rx) = test_helpers::register_client(&state, room_id, user).await;
        let observer = Uuid::new_v4();
        let (_obs_conn, mut obs_rx) = test_helpers::register_client(&state, room_id, observer).await;
        let pieces = test_helpers::puzzle_pieces_by_target(&state, room_id).await;

        let mut targets: Vec<Cell> = pieces.keys().copied().collect();
        targets.sort_by_key(|c| (c.row, c.col));
        let (last, rest) = targets.split_last().unwrap();
        for cell in rest {
            let id = pieces[cell];
            propose_move(&state, room_id, game_id, id, bank(), PiecePosition::Placed(*cell), user, conn)
                .await
                .unwrap();
        }

        let final_piece = pieces[last];
        let applied = propose_move(
            &state,
            room_id,
            game_id,
            final_piece,
            bank(),
            PiecePosition::Placed(*last),
            user,
            conn,
        )
        .await
        .unwrap();
        assert!(applied.completed);
        let stats = applied.stats.expect("completing move should carry stats");
        assert_eq!(stats.moves, 4);

        // Observer sees piece_moved per move plus exactly one game_completed.
        let mut completed_count = 0;
        for _ in 0..5 {
            let frame = recv(&mut obs_rx).await;
            if frame.event == "game_completed" {
                completed_count += 1;
            }
        }
        assert_eq!(completed_count, 1);

        // Resubmitting the completing move is rejected without mutation.
        let resubmit = propose_move(
            &state,
            room_id,
            game_id,
            final_piece,
            bank(),
            PiecePosition::Placed(*last),
            user,
            conn,
        )
        .await;
        assert_eq!(resubmit.unwrap_err(), MoveError::GameOver);
        assert!(
            timeout(Duration::from_millis(80), obs_rx.recv()).await.is_err(),
            "no further frames after rejection"
        );
    }

    #[tokio::test]
    async fn broadcasts_preserve_application_order() {
        let (state, room_id, game_id, _) = seed_active_puzzle(4, 4).await;
        let user = Uuid::new_v4();
        let (conn, _rx) = test_helpers::register_client(&state, room_id, user).await;
        let observer = Uuid::new_v4();
        let (_obs_conn, mut obs_rx) = test_helpers::register_client(&state, room_id, observer).await;
        let pieces = test_helpers::puzzle_pieces_by_target(&state, room_id).await;
        let p1 = pieces[&Cell { row: 0, col: 0 }];
        let p2 = pieces[&Cell { row: 0, col: 1 }];

        propose_move(&state, room_id, game_id, p1, bank(), at(0, 0), user, conn)
            .await
            .unwrap();
        propose_move(&state, room_id, game_id, p2, bank(), at(0, 1), user, conn)
            .await
            .unwrap();

        let first = recv(&mut obs_rx).await;
        let second = recv(&mut obs_rx).await;
        assert_eq!(first.data.get("pieceId").and_then(|v| v.as_str()), Some(p1.to_string().as_str()));
        assert_eq!(second.data.get("pieceId").and_then(|v| v.as_str()), Some(p2.to_string().as_str()));
    }

    #[tokio::test]
    async fn wrong_game_id_is_not_found() {
        let (state, room_id, _game_id, _) = seed_active_puzzle(4, 4).await;
        let user = Uuid::new_v4();
        let (conn, _rx) = test_helpers::register_client(&state, room_id, user).await;
        let pieces = test_helpers::puzzle_pieces_by_target(&state, room_id).await;
        let p1 = pieces[&Cell { row: 0, col: 0 }];

        let bogus = Uuid::new_v4();
        let result = propose_move(&state, room_id, bogus, p1, bank(), at(0, 0), user, conn).await;
        assert_eq!(result.unwrap_err(), MoveError::GameNotFound(bogus));
    }

    #[tokio::test]
    async fn non_member_connection_is_rejected() {
        let (state, room_id, game_id, _) = seed_active_puzzle(4, 4).await;
        let pieces = test_helpers::puzzle_pieces_by_target(&state, room_id).await;
        let p1 = pieces[&Cell { row: 0, col: 0 }];

        let outsider = Uuid::new_v4();
        let result = propose_move(&state, room_id, game_id, p1, bank(), at(0, 0), outsider, Uuid::new_v4()).await;
        assert_eq!(result.unwrap_err(), MoveError::NotMember(outsider));
    }
}
