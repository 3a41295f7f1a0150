//! Authoritative sparse board store
//!
//! Boards are created lazily on first touch and live for the rest of the
//! process. Lookups take the map's read lock; creation takes the write lock
//! and re-checks before inserting, so concurrent first accesses to the same
//! coordinate all receive the same board.
//!
//! Each board sits behind its own mutex. The map lock is always released
//! before a board lock is taken, and no path holds two board locks.

use log::debug;
use parking_lot::{Mutex, RwLock};
use shared::{BoardState, Coordinate, Move, Player, Point};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub type SharedBoard = Arc<Mutex<BoardState>>;

/// A move as seen by the rules engine, already decoded to board-local space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposedMove {
    pub position: u16,
    pub point: Point,
    pub player: Player,
}

/// Outcome of a rules check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub accepted: bool,
    pub captures: Vec<Point>,
    pub reason: Option<String>,
}

impl Verdict {
    pub fn accept() -> Self {
        Self {
            accepted: true,
            captures: Vec::new(),
            reason: None,
        }
    }

    pub fn accept_with_captures(captures: Vec<Point>) -> Self {
        Self {
            accepted: true,
            captures,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            captures: Vec::new(),
            reason: Some(reason.into()),
        }
    }
}

/// Game rules collaborator: judges a proposed move against the current state
pub trait RulesEngine: Send + Sync {
    fn evaluate(&self, state: &BoardState, proposed: &ProposedMove) -> Verdict;
}

/// Placeholder rules: every move is accepted and nothing is captured
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl RulesEngine for AcceptAll {
    fn evaluate(&self, _state: &BoardState, _proposed: &ProposedMove) -> Verdict {
        Verdict::accept()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("position {position} is outside a {size}x{size} board")]
    PositionOutOfRange { position: u16, size: u8 },
    #[error("move rejected: {0}")]
    Rejected(String),
}

/// Result of an accepted move
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMove {
    pub last_move: Move,
    pub state: BoardState,
}

pub struct BoardStore {
    boards: RwLock<HashMap<Coordinate, SharedBoard>>,
    board_size: u8,
    rules: Arc<dyn RulesEngine>,
}

impl BoardStore {
    pub fn new(board_size: u8) -> Self {
        Self::with_rules(board_size, Arc::new(AcceptAll))
    }

    pub fn with_rules(board_size: u8, rules: Arc<dyn RulesEngine>) -> Self {
        Self {
            boards: RwLock::new(HashMap::new()),
            board_size,
            rules,
        }
    }

    pub fn board_size(&self) -> u8 {
        self.board_size
    }

    /// Returns the board at `coord`, creating a fresh one if none exists
    pub fn get_or_create(&self, coord: Coordinate) -> SharedBoard {
        if let Some(board) = self.boards.read().get(&coord) {
            return Arc::clone(board);
        }

        let mut boards = self.boards.write();
        // Another caller may have created it between the two locks
        if let Some(board) = boards.get(&coord) {
            return Arc::clone(board);
        }

        let board = Arc::new(Mutex::new(BoardState::new(
            self.board_size,
            shared::now_millis(),
        )));
        boards.insert(coord, Arc::clone(&board));
        debug!("Created board {} ({} boards live)", coord, boards.len());
        board
    }

    /// Copy of the board's current state, creating the board if needed
    pub fn snapshot(&self, coord: Coordinate) -> BoardState {
        let board = self.get_or_create(coord);
        let state = board.lock().clone();
        state
    }

    /// Copy of an existing board's state without creating one
    pub fn peek(&self, coord: Coordinate) -> Option<BoardState> {
        let board = self.boards.read().get(&coord).cloned()?;
        let state = board.lock().clone();
        Some(state)
    }

    /// Decodes, judges and records a move
    ///
    /// The board stays locked from the rules check through the mutation so
    /// two moves on one board cannot interleave.
    pub fn apply_move(
        &self,
        coord: Coordinate,
        position: u16,
        player: Player,
    ) -> Result<AppliedMove, StoreError> {
        let board = self.get_or_create(coord);
        let mut state = board.lock();

        let point = state
            .decode_position(position)
            .ok_or(StoreError::PositionOutOfRange {
                position,
                size: state.size,
            })?;

        let proposed = ProposedMove {
            position,
            point,
            player,
        };
        let verdict = self.rules.evaluate(&state, &proposed);
        if !verdict.accepted {
            return Err(StoreError::Rejected(
                verdict.reason.unwrap_or_else(|| "illegal move".to_string()),
            ));
        }

        state.place(position, point, player, &verdict.captures, shared::now_millis());
        let last_move = state
            .moves
            .last()
            .cloned()
            .unwrap_or(Move {
                position,
                player,
                move_num: state.move_count,
                x: point.x,
                y: point.y,
            });

        Ok(AppliedMove {
            last_move,
            state: state.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.boards.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.read().is_empty()
    }
}
