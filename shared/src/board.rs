//! Per-board game state shared by the authoritative store and viewer caches

use serde::{Deserialize, Serialize};

/// Default side length of a single Go board
pub const DEFAULT_BOARD_SIZE: u8 = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Player {
    Black,
    White,
}

impl Player {
    pub fn opponent(self) -> Self {
        match self {
            Player::Black => Player::White,
            Player::White => Player::Black,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GamePhase {
    Playing,
    Finished,
    Scoring,
}

/// A stone sitting on the board at board-local `(x, y)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stone {
    pub x: u8,
    pub y: u8,
    pub color: Player,
}

/// One entry of a board's move history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Move {
    pub position: u16,
    pub player: Player,
    pub move_num: u16,
    pub x: u8,
    pub y: u8,
}

/// A board-local point, used for move decoding and captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: u8,
    pub y: u8,
}

/// Complete state of one board on the grid
///
/// The field set mirrors the `BOARD_STATE` wire payload. It is also the
/// value the viewer snapshots into its state cache, so every field must
/// survive a non-self-describing encoding (no skipped fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardState {
    pub size: u8,
    pub move_count: u16,
    /// Unix milliseconds of the last accepted move (creation time until then)
    pub last_move: u64,
    pub current_player: Player,
    pub game_phase: GamePhase,
    /// Recent-activity counter, saturating at 255
    pub activity: u8,
    pub stones: Vec<Stone>,
    pub moves: Vec<Move>,
}

impl BoardState {
    /// Fresh board: no stones, black to play, activity at its baseline of 1
    pub fn new(size: u8, created_at: u64) -> Self {
        Self {
            size,
            move_count: 0,
            last_move: created_at,
            current_player: Player::Black,
            game_phase: GamePhase::Playing,
            activity: 1,
            stones: Vec::new(),
            moves: Vec::new(),
        }
    }

    /// Decodes a linear `position` into a board-local point
    ///
    /// Positions run row by row: `x = position % size`, `y = position / size`.
    /// Returns `None` for positions past the last intersection.
    pub fn decode_position(&self, position: u16) -> Option<Point> {
        let size = u16::from(self.size);
        if size == 0 || position >= size * size {
            return None;
        }
        Some(Point {
            x: (position % size) as u8,
            y: (position / size) as u8,
        })
    }

    pub fn stone_at(&self, point: Point) -> Option<&Stone> {
        self.stones
            .iter()
            .find(|stone| stone.x == point.x && stone.y == point.y)
    }

    /// Records an accepted move and hands the turn to the other player
    ///
    /// Captured stones are removed before the new stone is placed. No
    /// legality check happens here.
    pub fn place(&mut self, position: u16, point: Point, player: Player, captures: &[Point], at: u64) {
        self.stones
            .retain(|stone| !captures.iter().any(|c| c.x == stone.x && c.y == stone.y));
        self.stones.push(Stone {
            x: point.x,
            y: point.y,
            color: player,
        });

        self.move_count = self.move_count.saturating_add(1);
        self.moves.push(Move {
            position,
            player,
            move_num: self.move_count,
            x: point.x,
            y: point.y,
        });
        self.last_move = at;
        self.activity = self.activity.saturating_add(1);
        self.current_player = self.current_player.opponent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_board_defaults() {
        let board = BoardState::new(DEFAULT_BOARD_SIZE, 42);
        assert_eq!(board.move_count, 0);
        assert_eq!(board.current_player, Player::Black);
        assert_eq!(board.game_phase, GamePhase::Playing);
        assert_eq!(board.last_move, 42);
        assert!(board.stones.is_empty());
    }

    #[test]
    fn test_decode_position() {
        let board = BoardState::new(19, 0);
        assert_eq!(board.decode_position(0), Some(Point { x: 0, y: 0 }));
        assert_eq!(board.decode_position(20), Some(Point { x: 1, y: 1 }));
        assert_eq!(board.decode_position(360), Some(Point { x: 18, y: 18 }));
        assert_eq!(board.decode_position(361), None);

        let small = BoardState::new(9, 0);
        assert_eq!(small.decode_position(10), Some(Point { x: 1, y: 1 }));
        assert_eq!(small.decode_position(81), None);
    }

    #[test]
    fn test_place_alternates_players() {
        let mut board = BoardState::new(19, 0);
        board.place(0, Point { x: 0, y: 0 }, Player::Black, &[], 10);
        assert_eq!(board.current_player, Player::White);
        assert_eq!(board.move_count, 1);
        assert_eq!(board.last_move, 10);

        board.place(1, Point { x: 1, y: 0 }, Player::White, &[], 20);
        assert_eq!(board.current_player, Player::Black);
        assert_eq!(board.move_count, 2);
        assert_eq!(board.moves[1].move_num, 2);
        assert_eq!(board.activity, 3);
    }

    #[test]
    fn test_place_removes_captures() {
        let mut board = BoardState::new(19, 0);
        board.place(1, Point { x: 1, y: 0 }, Player::Black, &[], 1);
        board.place(0, Point { x: 0, y: 0 }, Player::White, &[], 2);
        board.place(19, Point { x: 0, y: 1 }, Player::Black, &[Point { x: 0, y: 0 }], 3);

        assert_eq!(board.stones.len(), 2);
        assert!(board.stone_at(Point { x: 0, y: 0 }).is_none());
        assert_eq!(board.stone_at(Point { x: 0, y: 1 }).unwrap().color, Player::Black);
    }

    #[test]
    fn test_board_state_json_shape() {
        let board = BoardState::new(19, 7);
        let value = serde_json::to_value(&board).unwrap();
        assert_eq!(value["moveCount"], 0);
        assert_eq!(value["currentPlayer"], "black");
        assert_eq!(value["gamePhase"], "playing");
        assert_eq!(value["lastMove"], 7);
        assert_eq!(value["activity"], 1);
    }

    #[test]
    fn test_board_state_survives_bincode() {
        let mut board = BoardState::new(19, 0);
        board.place(60, Point { x: 3, y: 3 }, Player::Black, &[], 5);

        let bytes = bincode::serialize(&board).unwrap();
        let restored: BoardState = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored, board);
    }
}
