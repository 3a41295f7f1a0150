pub mod board;
pub mod coord;
pub mod protocol;

pub use board::{BoardState, GamePhase, Move, Player, Point, Stone, DEFAULT_BOARD_SIZE};
pub use coord::{Coordinate, GridRect, ZoneId, GRID_SIZE, ZONES_PER_ROW, ZONE_SIZE};
pub use protocol::{
    error_codes, BoardRef, BoardSnapshot, BoardUpdate, Envelope, ErrorData, Message, MessageType,
    MoveRequest, MoveResult, Payload, PongData, ProtocolError, RegionData, RegionRequest, Request,
    ServerEvent, SubscribeRequest, ViewportSize, WelcomeData,
};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds
pub fn now_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    millis.min(u64::MAX as u128) as u64
}
