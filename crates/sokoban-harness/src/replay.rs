//! Deterministic replay of a proposed move sequence.
//!
//! The replay never trusts the solver: it re-simulates every move against the
//! board rules and only then asks whether the board is solved. Everything here
//! is a pure function of its inputs, so concurrent jobs can replay freely as
//! long as each owns its board.

use serde::Serialize;
use thiserror::Error;

use crate::puzzle::{Board, Cell, Direction, ParseError, Position};

/// Why a single move is illegal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvalidMove {
    #[error("walked into a wall at {at}")]
    BlockedByWall { at: Position },

    #[error("box at {at} cannot be pushed")]
    BlockedPush { at: Position },

    #[error("unknown move token {token:?}")]
    UnknownToken { token: char },
}

/// A failed replay: the illegal move and where it sits in the sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[error("move {offset}: {reason}")]
pub struct ReplayError {
    /// Character offset of the offending token in the move string
    pub offset: usize,
    pub reason: InvalidMove,
}

/// Result of checking a solution against a board
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Solved { moves: usize },
    Unsolved { moves: usize },
    Invalid(ReplayError),
}

impl Verdict {
    pub fn is_solved(&self) -> bool {
        matches!(self, Verdict::Solved { .. })
    }
}

/// Apply one move, returning the successor board.
///
/// The input board is left untouched.
pub fn step(board: &Board, direction: Direction) -> Result<Board, InvalidMove> {
    let mut next = board.clone();
    apply(&mut next, direction)?;
    Ok(next)
}

/// In-place transition used by the replay loop. Leaves the board unchanged
/// when the move is rejected.
fn apply(board: &mut Board, direction: Direction) -> Result<(), InvalidMove> {
    let origin = board.player();
    let target = origin.offset(direction);
    let target_cell = board.cell_at(target);

    if target_cell == Cell::Wall {
        return Err(InvalidMove::BlockedByWall { at: target });
    }

    if target_cell.is_box() {
        let destination = target.offset(direction);
        let destination_cell = board.cell_at(destination);
        if !destination_cell.is_open() {
            return Err(InvalidMove::BlockedPush { at: target });
        }
        board.set(destination, destination_cell.with_box());
    }

    // The target is floor or target by now: either it was open, or its box
    // just moved away.
    board.set(target, target_cell.vacated().with_player());
    board.set(origin, board.cell_at(origin).vacated());
    board.set_player(target);
    Ok(())
}

/// Replay a move string left to right.
///
/// Whitespace is skipped, any other non-move character is fatal, and the
/// replay stops at the first illegal move.
pub fn go_by_string(board: &Board, moves: &str) -> Result<Board, ReplayError> {
    let mut current = board.clone();
    for (offset, token) in moves.chars().enumerate() {
        if token.is_whitespace() {
            continue;
        }
        let direction = Direction::from_token(token).ok_or(ReplayError {
            offset,
            reason: InvalidMove::UnknownToken { token },
        })?;
        apply(&mut current, direction).map_err(|reason| ReplayError { offset, reason })?;
    }
    Ok(current)
}

/// Count the move tokens in a solver answer
fn count_moves(moves: &str) -> usize {
    moves.chars().filter(|c| !c.is_whitespace()).count()
}

/// Replay `moves` on an already parsed board and judge the end state
pub fn verify(board: &Board, moves: &str) -> Verdict {
    match go_by_string(board, moves) {
        Ok(end) if end.is_solved() => Verdict::Solved {
            moves: count_moves(moves),
        },
        Ok(_) => Verdict::Unsolved {
            moves: count_moves(moves),
        },
        Err(e) => Verdict::Invalid(e),
    }
}

/// Parse the board text, then verify
pub fn verify_solution(board_text: &str, moves: &str) -> Result<Verdict, ParseError> {
    let board = Board::parse(board_text)?;
    Ok(verify(&board, moves))
}
