//! Move/stroke validation — pure decision logic.
//!
//! DESIGN
//! ======
//! The authorities (`services::puzzle`, `services::whiteboard`) call these
//! functions with a snapshot of the state they own; nothing here mutates.
//! Expected rejections (conflict, not-found, unauthorized) are values, not
//! faults, so every check returns an explicit `Result`.

use uuid::Uuid;

use crate::frame::ErrorCode;
use crate::state::{Cell, PiecePosition, PuzzleState, WhiteboardState};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MoveError {
    #[error("game not found: {0}")]
    GameNotFound(Uuid),
    #[error("room has no puzzle game")]
    NotPuzzle,
    #[error("caller is not a room member: {0}")]
    NotMember(Uuid),
    #[error("piece not found: {0}")]
    PieceNotFound(Uuid),
    #[error("stale move: piece is not at the submitted position")]
    Stale { current: PiecePosition },
    #[error("target cell out of bounds: ({row}, {col})")]
    OutOfBounds { row: u16, col: u16 },
    #[error("target cell occupied by another piece")]
    Occupied { cell: Cell, by: Uuid },
    #[error("game already completed")]
    GameOver,
}

impl ErrorCode for MoveError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::GameNotFound(_) => "E_GAME_NOT_FOUND",
            Self::NotPuzzle => "E_NOT_PUZZLE",
            Self::NotMember(_) => "E_NOT_MEMBER",
            Self::PieceNotFound(_) => "E_PIECE_NOT_FOUND",
            Self::Stale { .. } => "E_STALE_MOVE",
            Self::OutOfBounds { .. } => "E_OUT_OF_BOUNDS",
            Self::Occupied { .. } => "E_CELL_OCCUPIED",
            Self::GameOver => "GAME_OVER",
        }
    }

    fn retryable(&self) -> bool {
        // A stale move carries a resync hint; the client reconciles and
        // resubmits. An occupied cell needs a different target first.
        matches!(self, Self::Stale { .. })
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum StrokeError {
    #[error("game not found: {0}")]
    GameNotFound(Uuid),
    #[error("room has no whiteboard game")]
    NotWhiteboard,
    #[error("caller is not a room member: {0}")]
    NotMember(Uuid),
    #[error("stroke id already in use: {0}")]
    DuplicateStroke(Uuid),
    #[error("stroke not pending: {0}")]
    NotPending(Uuid),
    #[error("stroke not found: {0}")]
    NotFound(Uuid),
    #[error("caller is not the stroke author")]
    NotAuthor,
    #[error("stroke is not the caller's most recent")]
    NotLatest { latest: Option<Uuid> },
    #[error("stroke exceeds the point limit ({max})")]
    TooManyPoints { max: usize },
}

impl ErrorCode for StrokeError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::GameNotFound(_) => "E_GAME_NOT_FOUND",
            Self::NotWhiteboard => "E_NOT_WHITEBOARD",
            Self::NotMember(_) => "E_NOT_MEMBER",
            Self::DuplicateStroke(_) => "E_DUPLICATE_STROKE",
            Self::NotPending(_) => "E_STROKE_NOT_PENDING",
            Self::NotFound(_) => "E_STROKE_NOT_FOUND",
            Self::NotAuthor => "E_NOT_AUTHOR",
            Self::NotLatest { .. } => "E_STROKE_NOT_LATEST",
            Self::TooManyPoints { .. } => "E_TOO_MANY_POINTS",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::NotLatest { .. })
    }
}

// =============================================================================
// PUZZLE CHECKS
// =============================================================================

/// Validate a proposed piece move against the current puzzle state.
///
/// Checks run in rejection-priority order: game over, unknown piece, stale
/// submitted position, bounds, occupancy. A no-op move (same position) is
/// treated as stale-free and allowed; the authority acknowledges it
/// without applying anything.
///
/// # Errors
///
/// Returns the first failing check; the puzzle is untouched either way.
pub fn check_move(
    puzzle: &PuzzleState,
    piece_id: Uuid,
    from: PiecePosition,
    to: PiecePosition,
) -> Result<(), MoveError> {
    if puzzle.completed {
        return Err(MoveError::GameOver);
    }

    let piece = puzzle
        .pieces
        .get(&piece_id)
        .ok_or(MoveError::PieceNotFound(piece_id))?;

    // Guards against out-of-order delivery: the submitted origin must match
    // the authoritative position, otherwise the client is behind.
    if piece.position != from {
        return Err(MoveError::Stale { current: piece.position });
    }

    if let PiecePosition::Placed(cell) = to {
        if !puzzle.in_bounds(cell) {
            return Err(MoveError::OutOfBounds { row: cell.row, col: cell.col });
        }
        if let Some(&occupant) = puzzle.occupancy.get(&cell) {
            if occupant != piece_id {
                return Err(MoveError::Occupied { cell, by: occupant });
            }
        }
    }

    Ok(())
}

// =============================================================================
// WHITEBOARD CHECKS
// =============================================================================

/// A new pending stroke must not collide with a pending or committed id.
///
/// # Errors
///
/// Returns `DuplicateStroke` on collision.
pub fn check_stroke_start(board: &WhiteboardState, stroke_id: Uuid) -> Result<(), StrokeError> {
    if board.pending.contains_key(&stroke_id) || board.strokes.iter().any(|s| s.id == stroke_id) {
        return Err(StrokeError::DuplicateStroke(stroke_id));
    }
    Ok(())
}

/// Points may only be appended to a pending stroke by its author, up to
/// the configured cap.
///
/// # Errors
///
/// Returns `NotPending`, `NotAuthor`, or `TooManyPoints`.
pub fn check_append_point(
    board: &WhiteboardState,
    stroke_id: Uuid,
    caller: Uuid,
    max_points: usize,
) -> Result<(), StrokeError> {
    let pending = board
        .pending
        .get(&stroke_id)
        .ok_or(StrokeError::NotPending(stroke_id))?;
    if pending.stroke.author_id != caller {
        return Err(StrokeError::NotAuthor);
    }
    if pending.stroke.points.len() >= max_points {
        return Err(StrokeError::TooManyPoints { max: max_points });
    }
    Ok(())
}

/// Finalize requires a pending stroke owned by the caller.
///
/// # Errors
///
/// Returns `NotPending` or `NotAuthor`.
pub fn check_finalize(board: &WhiteboardState, stroke_id: Uuid, caller: Uuid) -> Result<(), StrokeError> {
    let pending = board
        .pending
        .get(&stroke_id)
        .ok_or(StrokeError::NotPending(stroke_id))?;
    if pending.stroke.author_id != caller {
        return Err(StrokeError::NotAuthor);
    }
    Ok(())
}

/// Undo policy: per-author-most-recent. The stroke must exist in the
/// committed log, belong to the caller, and be the caller's latest.
///
/// # Errors
///
/// Returns `NotFound`, `NotAuthor`, or `NotLatest` with the caller's
/// actual latest stroke id as resync hint.
pub fn check_undo(board: &WhiteboardState, stroke_id: Uuid, caller: Uuid) -> Result<(), StrokeError> {
    let stroke = board
        .strokes
        .iter()
        .find(|s| s.id == stroke_id)
        .ok_or(StrokeError::NotFound(stroke_id))?;
    if stroke.author_id != caller {
        return Err(StrokeError::NotAuthor);
    }

    let latest_own = board
        .strokes
        .iter()
        .rev()
        .find(|s| s.author_id == caller)
        .map(|s| s.id);
    if latest_own != Some(stroke_id) {
        return Err(StrokeError::NotLatest { latest: latest_own });
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{PendingStroke, Point, Stroke};
    use std::time::Instant;

    fn stroke(id: Uuid, author: Uuid, n_points: usize) -> Stroke {
        Stroke {
            id,
            author_id: author,
            tool: "pen".into(),
            color: "#222222".into(),
            size: 2.0,
            points: (0..n_points)
                .map(|i| {
                    let v = f64::from(u32::try_from(i).unwrap_or(0));
                    Point { x: v, y: v }
                })
                .collect(),
            ts: 0,
        }
    }

    fn board_with(strokes: Vec<Stroke>) -> WhiteboardState {
        let mut board = WhiteboardState::new(800, 600);
        board.version = strokes.len() as u64;
        board.strokes = strokes;
        board
    }

    #[test]
    fn move_unknown_piece_not_found() {
        let puzzle = PuzzleState::new(4, 4);
        let result = check_move(&puzzle, Uuid::new_v4(), PiecePosition::Bank, PiecePosition::Bank);
        assert!(matches!(result, Err(MoveError::PieceNotFound(_))));
    }

    #[test]
    fn move_stale_from_position() {
        let puzzle = PuzzleState::new(4, 4);
        let id = *puzzle.pieces.keys().next().unwrap();
        // Piece is in the bank, client claims it is placed.
        let from = PiecePosition::Placed(Cell { row: 0, col: 0 });
        let result = check_move(&puzzle, id, from, PiecePosition::Bank);
        assert_eq!(result, Err(MoveError::Stale { current: PiecePosition::Bank }));
    }

    #[test]
    fn move_out_of_bounds() {
        let puzzle = PuzzleState::new(4, 4);
        let id = *puzzle.pieces.keys().next().unwrap();
        let to = PiecePosition::Placed(Cell { row: 4, col: 0 });
        let result = check_move(&puzzle, id, PiecePosition::Bank, to);
        assert_eq!(result, Err(MoveError::OutOfBounds { row: 4, col: 0 }));
    }

    #[test]
    fn move_occupied_cell_conflicts() {
        let mut puzzle = PuzzleState::new(4, 4);
        let mut ids = puzzle.pieces.keys().copied();
        let a = ids.next().unwrap();
        let b = ids.next().unwrap();
        let cell = Cell { row: 0, col: 0 };
        puzzle.pieces.get_mut(&a).unwrap().position = PiecePosition::Placed(cell);
        puzzle.rebuild_occupancy();

        let result = check_move(&puzzle, b, PiecePosition::Bank, PiecePosition::Placed(cell));
        assert_eq!(result, Err(MoveError::Occupied { cell, by: a }));
    }

    #[test]
    fn move_to_own_cell_is_not_a_conflict() {
        let mut puzzle = PuzzleState::new(4, 4);
        let id = *puzzle.pieces.keys().next().unwrap();
        let cell = Cell { row: 1, col: 1 };
        puzzle.pieces.get_mut(&id).unwrap().position = PiecePosition::Placed(cell);
        puzzle.rebuild_occupancy();

        let result = check_move(&puzzle, id, PiecePosition::Placed(cell), PiecePosition::Placed(cell));
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn move_after_completion_is_game_over() {
        let mut puzzle = PuzzleState::new(2, 1);
        puzzle.completed = true;
        let id = *puzzle.pieces.keys().next().unwrap();
        let result = check_move(&puzzle, id, PiecePosition::Bank, PiecePosition::Bank);
        assert_eq!(result, Err(MoveError::GameOver));
    }

    #[test]
    fn stroke_start_rejects_duplicate_ids() {
        let author = Uuid::new_v4();
        let committed = Uuid::new_v4();
        let mut board = board_with(vec![stroke(committed, author, 3)]);

        assert_eq!(check_stroke_start(&board, committed), Err(StrokeError::DuplicateStroke(committed)));

        let pending_id = Uuid::new_v4();
        board.pending.insert(
            pending_id,
            PendingStroke { stroke: stroke(pending_id, author, 0), started: Instant::now() },
        );
        assert_eq!(check_stroke_start(&board, pending_id), Err(StrokeError::DuplicateStroke(pending_id)));
        assert_eq!(check_stroke_start(&board, Uuid::new_v4()), Ok(()));
    }

    #[test]
    fn append_point_requires_author() {
        let author = Uuid::new_v4();
        let other = Uuid::new_v4();
        let id = Uuid::new_v4();
        let mut board = WhiteboardState::new(800, 600);
        board
            .pending
            .insert(id, PendingStroke { stroke: stroke(id, author, 1), started: Instant::now() });

        assert_eq!(check_append_point(&board, id, other, 4096), Err(StrokeError::NotAuthor));
        assert_eq!(check_append_point(&board, id, author, 4096), Ok(()));
        assert_eq!(
            check_append_point(&board, id, author, 1),
            Err(StrokeError::TooManyPoints { max: 1 })
        );
        assert!(matches!(
            check_append_point(&board, Uuid::new_v4(), author, 4096),
            Err(StrokeError::NotPending(_))
        ));
    }

    #[test]
    fn undo_per_author_most_recent() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let a1 = Uuid::new_v4();
        let b1 = Uuid::new_v4();
        let a2 = Uuid::new_v4();
        let board = board_with(vec![stroke(a1, alice, 2), stroke(b1, bob, 2), stroke(a2, alice, 2)]);

        // Bob cannot undo Alice's stroke.
        assert_eq!(check_undo(&board, a2, bob), Err(StrokeError::NotAuthor));
        // Alice cannot undo her older stroke while a newer one exists.
        assert_eq!(check_undo(&board, a1, alice), Err(StrokeError::NotLatest { latest: Some(a2) }));
        // Bob's latest is b1 regardless of Alice drawing after him.
        assert_eq!(check_undo(&board, b1, bob), Ok(()));
        assert_eq!(check_undo(&board, a2, alice), Ok(()));
        assert!(matches!(check_undo(&board, Uuid::new_v4(), alice), Err(StrokeError::NotFound(_))));
    }
}
