//! Wire protocol: the JSON envelope and the closed set of typed payloads
//!
//! Every frame on the socket is an envelope `{id, type, timestamp, data}`.
//! Decoding is two-staged. First the envelope itself is parsed; a frame
//! that is not a valid envelope is a transport-level failure and ends the
//! connection. Then `data` is decoded exactly once, by `type`, into one
//! variant of [`Request`] (client → server) or [`ServerEvent`]
//! (server → client). Failures at this stage are reported back to the
//! peer as an `ERROR` message and the connection stays open.

use crate::board::{BoardState, Move, Player};
use crate::coord::{Coordinate, GridRect};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Error codes carried in `ERROR` payloads
pub mod error_codes {
    pub const MALFORMED_MESSAGE: &str = "MALFORMED_MESSAGE";
    pub const UNKNOWN_MESSAGE_TYPE: &str = "UNKNOWN_MESSAGE_TYPE";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const MOVE_REJECTED: &str = "MOVE_REJECTED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    // Client → Server
    SendMove,
    FetchBoard,
    FetchRegion,
    SubscribeRegion,
    UnsubscribeRegion,
    Ping,

    // Server → Client
    MoveResult,
    BoardState,
    BoardUpdate,
    RegionData,
    Error,
    Pong,
    Welcome,
}

impl MessageType {
    pub const ALL: [MessageType; 13] = [
        MessageType::SendMove,
        MessageType::FetchBoard,
        MessageType::FetchRegion,
        MessageType::SubscribeRegion,
        MessageType::UnsubscribeRegion,
        MessageType::Ping,
        MessageType::MoveResult,
        MessageType::BoardState,
        MessageType::BoardUpdate,
        MessageType::RegionData,
        MessageType::Error,
        MessageType::Pong,
        MessageType::Welcome,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::SendMove => "SEND_MOVE",
            MessageType::FetchBoard => "FETCH_BOARD",
            MessageType::FetchRegion => "FETCH_REGION",
            MessageType::SubscribeRegion => "SUBSCRIBE_REGION",
            MessageType::UnsubscribeRegion => "UNSUBSCRIBE_REGION",
            MessageType::Ping => "PING",
            MessageType::MoveResult => "MOVE_RESULT",
            MessageType::BoardState => "BOARD_STATE",
            MessageType::BoardUpdate => "BOARD_UPDATE",
            MessageType::RegionData => "REGION_DATA",
            MessageType::Error => "ERROR",
            MessageType::Pong => "PONG",
            MessageType::Welcome => "WELCOME",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == tag)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageType, reason: String },
    #[error("board ({x},{y}) is outside the grid")]
    OffGrid { x: u16, y: u16 },
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl ProtocolError {
    /// Wire error code reported to the peer for this failure
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => error_codes::MALFORMED_MESSAGE,
            ProtocolError::UnknownType(_) => error_codes::UNKNOWN_MESSAGE_TYPE,
            ProtocolError::InvalidPayload { .. } | ProtocolError::OffGrid { .. } => {
                error_codes::INVALID_REQUEST
            }
            ProtocolError::Serialization(_) => error_codes::INTERNAL_ERROR,
        }
    }
}

/// The raw frame as it travels on the socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardRef {
    pub board_x: u16,
    pub board_y: u16,
}

impl BoardRef {
    pub fn of(coord: Coordinate) -> Self {
        Self {
            board_x: coord.x(),
            board_y: coord.y(),
        }
    }

    pub fn coordinate(&self) -> Result<Coordinate, ProtocolError> {
        Coordinate::new(self.board_x, self.board_y).ok_or(ProtocolError::OffGrid {
            x: self.board_x,
            y: self.board_y,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionRequest {
    pub start_x: u16,
    pub start_y: u16,
    pub width: u16,
    pub height: u16,
}

impl RegionRequest {
    pub fn rect(&self) -> GridRect {
        GridRect::new(
            u32::from(self.start_x),
            u32::from(self.start_y),
            u32::from(self.width),
            u32::from(self.height),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    pub board_x: u16,
    pub board_y: u16,
    pub position: u16,
    pub player: Player,
}

impl MoveRequest {
    pub fn coordinate(&self) -> Result<Coordinate, ProtocolError> {
        BoardRef {
            board_x: self.board_x,
            board_y: self.board_y,
        }
        .coordinate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportSize {
    pub viewport_width: u16,
    pub viewport_height: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub center_x: u16,
    pub center_y: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<ViewportSize>,
}

impl SubscribeRequest {
    pub fn center(&self) -> Result<Coordinate, ProtocolError> {
        BoardRef {
            board_x: self.center_x,
            board_y: self.center_y,
        }
        .coordinate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
    pub message: String,
}

impl ErrorData {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<&ProtocolError> for ErrorData {
    fn from(err: &ProtocolError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeData {
    pub client_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongData {
    pub timestamp: u64,
}

/// `BOARD_STATE` payload: the board's coordinates next to its state fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSnapshot {
    pub board_x: u16,
    pub board_y: u16,
    #[serde(flatten)]
    pub state: BoardState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionData {
    pub start_x: u16,
    pub start_y: u16,
    pub width: u16,
    pub height: u16,
    /// Keyed by `"x,y"`
    pub boards: BTreeMap<String, BoardState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveResult {
    pub success: bool,
    pub move_id: String,
    pub board_x: u16,
    pub board_y: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_state: Option<BoardState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardUpdate {
    pub board_x: u16,
    pub board_y: u16,
    #[serde(rename = "move")]
    pub last_move: Move,
    pub new_state: BoardState,
}

// ---------------------------------------------------------------------------
// Typed payload unions
// ---------------------------------------------------------------------------

/// A payload union that maps to and from the envelope's `type` + `data`
pub trait Payload: Sized {
    fn message_type(&self) -> MessageType;
    fn decode(kind: MessageType, data: Value) -> Result<Self, ProtocolError>;
    fn to_data(&self) -> Result<Value, ProtocolError>;
}

fn decode_data<T: DeserializeOwned>(kind: MessageType, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

fn encode_data<T: Serialize>(data: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(data).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Messages a viewer sends to the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    SendMove(MoveRequest),
    FetchBoard(BoardRef),
    FetchRegion(RegionRequest),
    SubscribeRegion(SubscribeRequest),
    UnsubscribeRegion(SubscribeRequest),
    Ping,
}

impl Payload for Request {
    fn message_type(&self) -> MessageType {
        match self {
            Request::SendMove(_) => MessageType::SendMove,
            Request::FetchBoard(_) => MessageType::FetchBoard,
            Request::FetchRegion(_) => MessageType::FetchRegion,
            Request::SubscribeRegion(_) => MessageType::SubscribeRegion,
            Request::UnsubscribeRegion(_) => MessageType::UnsubscribeRegion,
            Request::Ping => MessageType::Ping,
        }
    }

    fn decode(kind: MessageType, data: Value) -> Result<Self, ProtocolError> {
        match kind {
            MessageType::SendMove => decode_data(kind, data).map(Request::SendMove),
            MessageType::FetchBoard => decode_data(kind, data).map(Request::FetchBoard),
            MessageType::FetchRegion => decode_data(kind, data).map(Request::FetchRegion),
            MessageType::SubscribeRegion => decode_data(kind, data).map(Request::SubscribeRegion),
            MessageType::UnsubscribeRegion => {
                decode_data(kind, data).map(Request::UnsubscribeRegion)
            }
            MessageType::Ping => Ok(Request::Ping),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    fn to_data(&self) -> Result<Value, ProtocolError> {
        match self {
            Request::SendMove(data) => encode_data(data),
            Request::FetchBoard(data) => encode_data(data),
            Request::FetchRegion(data) => encode_data(data),
            Request::SubscribeRegion(data) | Request::UnsubscribeRegion(data) => encode_data(data),
            Request::Ping => Ok(Value::Object(Default::default())),
        }
    }
}

/// Messages the hub sends to viewers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    MoveResult(MoveResult),
    BoardState(BoardSnapshot),
    BoardUpdate(BoardUpdate),
    RegionData(RegionData),
    Error(ErrorData),
    Pong(PongData),
    Welcome(WelcomeData),
}

impl Payload for ServerEvent {
    fn message_type(&self) -> MessageType {
        match self {
            ServerEvent::MoveResult(_) => MessageType::MoveResult,
            ServerEvent::BoardState(_) => MessageType::BoardState,
            ServerEvent::BoardUpdate(_) => MessageType::BoardUpdate,
            ServerEvent::RegionData(_) => MessageType::RegionData,
            ServerEvent::Error(_) => MessageType::Error,
            ServerEvent::Pong(_) => MessageType::Pong,
            ServerEvent::Welcome(_) => MessageType::Welcome,
        }
    }

    fn decode(kind: MessageType, data: Value) -> Result<Self, ProtocolError> {
        match kind {
            MessageType::MoveResult => decode_data(kind, data).map(ServerEvent::MoveResult),
            MessageType::BoardState => decode_data(kind, data).map(ServerEvent::BoardState),
            MessageType::BoardUpdate => decode_data(kind, data).map(ServerEvent::BoardUpdate),
            MessageType::RegionData => decode_data(kind, data).map(ServerEvent::RegionData),
            MessageType::Error => decode_data(kind, data).map(ServerEvent::Error),
            MessageType::Pong => decode_data(kind, data).map(ServerEvent::Pong),
            MessageType::Welcome => decode_data(kind, data).map(ServerEvent::Welcome),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    fn to_data(&self) -> Result<Value, ProtocolError> {
        match self {
            ServerEvent::MoveResult(data) => encode_data(data),
            ServerEvent::BoardState(data) => encode_data(data),
            ServerEvent::BoardUpdate(data) => encode_data(data),
            ServerEvent::RegionData(data) => encode_data(data),
            ServerEvent::Error(data) => encode_data(data),
            ServerEvent::Pong(data) => encode_data(data),
            ServerEvent::Welcome(data) => encode_data(data),
        }
    }
}

/// A decoded envelope: identifier, timestamp and one typed payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<P> {
    pub id: String,
    pub timestamp: u64,
    pub body: P,
}

impl<P: Payload> Message<P> {
    pub fn new(id: impl Into<String>, body: P) -> Self {
        Self {
            id: id.into(),
            timestamp: crate::now_millis(),
            body,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let kind = MessageType::parse(&envelope.kind)
            .ok_or_else(|| ProtocolError::UnknownType(envelope.kind.clone()))?;
        let body = P::decode(kind, envelope.data)?;
        Ok(Self {
            id: envelope.id,
            timestamp: envelope.timestamp,
            body,
        })
    }

    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        Ok(Envelope {
            id: self.id.clone(),
            kind: self.message_type().as_str().to_string(),
            timestamp: self.timestamp,
            data: self.body.to_data()?,
        })
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        self.to_envelope()?.to_json()
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Self::from_envelope(Envelope::from_json(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_tags() {
        for kind in MessageType::ALL {
            assert_eq!(MessageType::parse(kind.as_str()), Some(kind));
            let via_serde = serde_json::to_value(kind).unwrap();
            assert_eq!(via_serde, json!(kind.as_str()));
        }
        assert_eq!(MessageType::parse("JUMP"), None);
    }

    #[test]
    fn test_decode_fetch_board() {
        let text = r#"{"id":"abc","type":"FETCH_BOARD","timestamp":1,"data":{"boardX":500,"boardY":501}}"#;
        let msg = Message::<Request>::from_json(text).unwrap();
        assert_eq!(msg.id, "abc");
        assert_eq!(
            msg.body,
            Request::FetchBoard(BoardRef {
                board_x: 500,
                board_y: 501
            })
        );
    }

    #[test]
    fn test_decode_ping_without_data() {
        let msg = Message::<Request>::from_json(r#"{"id":"p","type":"PING"}"#).unwrap();
        assert_eq!(msg.body, Request::Ping);
    }

    #[test]
    fn test_unknown_type_is_distinct_from_malformed() {
        let unknown = Message::<Request>::from_json(r#"{"id":"x","type":"TELEPORT","data":{}}"#);
        assert_eq!(
            unknown.unwrap_err().code(),
            error_codes::UNKNOWN_MESSAGE_TYPE
        );

        let malformed = Message::<Request>::from_json("{not json");
        assert_eq!(malformed.unwrap_err().code(), error_codes::MALFORMED_MESSAGE);
    }

    #[test]
    fn test_server_type_sent_as_request_is_unknown() {
        let result = Message::<Request>::from_json(r#"{"id":"x","type":"PONG","data":{}}"#);
        assert!(matches!(result, Err(ProtocolError::UnknownType(_))));
    }

    #[test]
    fn test_invalid_payload_shape() {
        let text = r#"{"id":"m","type":"SEND_MOVE","data":{"boardX":"left"}}"#;
        let err = Message::<Request>::from_json(text).unwrap_err();
        assert_eq!(err.code(), error_codes::INVALID_REQUEST);
        assert!(matches!(
            err,
            ProtocolError::InvalidPayload {
                kind: MessageType::SendMove,
                ..
            }
        ));
    }

    #[test]
    fn test_board_ref_off_grid() {
        let err = BoardRef {
            board_x: 1000,
            board_y: 3,
        }
        .coordinate()
        .unwrap_err();
        assert_eq!(err, ProtocolError::OffGrid { x: 1000, y: 3 });
        assert_eq!(err.code(), error_codes::INVALID_REQUEST);
    }

    #[test]
    fn test_board_snapshot_is_flat() {
        let snapshot = BoardSnapshot {
            board_x: 1,
            board_y: 2,
            state: BoardState::new(19, 0),
        };
        let msg = Message::new("id-1", ServerEvent::BoardState(snapshot.clone()));
        let envelope = msg.to_envelope().unwrap();
        assert_eq!(envelope.kind, "BOARD_STATE");
        assert_eq!(envelope.data["boardX"], 1);
        assert_eq!(envelope.data["moveCount"], 0);

        let decoded = Message::<ServerEvent>::from_envelope(envelope).unwrap();
        assert_eq!(decoded.body, ServerEvent::BoardState(snapshot));
    }

    #[test]
    fn test_move_result_omits_absent_fields() {
        let result = MoveResult {
            success: false,
            move_id: "m1".into(),
            board_x: 0,
            board_y: 0,
            board_state: None,
            error: Some(ErrorData::new(error_codes::MOVE_REJECTED, "occupied")),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert!(value.get("boardState").is_none());
        assert_eq!(value["error"]["code"], "MOVE_REJECTED");
    }

    #[test]
    fn test_subscribe_viewport_optional() {
        let with = json!({"centerX": 10, "centerY": 20, "viewport": {"viewportWidth": 100, "viewportHeight": 60}});
        let without = json!({"centerX": 10, "centerY": 20});

        let a: SubscribeRequest = serde_json::from_value(with).unwrap();
        let b: SubscribeRequest = serde_json::from_value(without).unwrap();
        assert_eq!(a.viewport.unwrap().viewport_width, 100);
        assert!(b.viewport.is_none());
        assert_eq!(b.center().unwrap(), Coordinate::new(10, 20).unwrap());
    }
}
