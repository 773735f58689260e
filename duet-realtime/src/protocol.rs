//! JSON wire protocol for the real-time relay.
//!
//! Every WebSocket text frame carries one named event:
//! ```text
//! { "event": "whiteboard:stroke", "data": { "sessionId": "wb-1", "stroke": { … } } }
//! ```
//!
//! Client→server events form the closed [`ClientEvent`] union and are
//! validated at decode time, so the signaling relay and whiteboard
//! manager only ever see well-formed input. Signaling payloads (SDP
//! blobs, ICE candidates) are carried as opaque JSON values and never
//! inspected.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Identities
// ───────────────────────────────────────────────────────────────────

/// Logical user identity.
///
/// The relational store hands out integer ids while browsers tend to
/// send them as strings, so both forms are accepted on input. Always
/// serialized as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawUserId", into = "String")]
pub struct UserId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawUserId {
    Text(String),
    Number(u64),
}

impl TryFrom<RawUserId> for UserId {
    type Error = String;

    fn try_from(raw: RawUserId) -> Result<Self, Self::Error> {
        match raw {
            RawUserId::Text(s) => UserId::parse(s),
            RawUserId::Number(n) => Ok(UserId(n.to_string())),
        }
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl UserId {
    /// Build a user id, rejecting empty or whitespace-only input.
    pub fn parse(id: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err("user id must not be empty".to_string());
        }
        Ok(UserId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for UserId {
    fn from(n: u64) -> Self {
        UserId(n.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-chosen whiteboard session id (stable, non-empty).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl TryFrom<String> for SessionId {
    type Error = String;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        SessionId::parse(id)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl SessionId {
    pub fn parse(id: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err("session id must not be empty".to_string());
        }
        Ok(SessionId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport-assigned connection id. Opaque to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Whiteboard payloads
// ───────────────────────────────────────────────────────────────────

/// Canvas-local coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// One pointer-down to pointer-up gesture. Immutable once sent.
///
/// `brush_size` (1–20) and `opacity` (0–100) are advisory ranges for
/// the drawing UI; the server stores whatever the author sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawingStroke {
    pub id: String,
    pub user_id: UserId,
    pub points: Vec<Point>,
    pub color: String,
    pub brush_size: f64,
    pub opacity: f64,
    /// Author capture time in epoch millis. Not used for ordering.
    #[serde(default)]
    pub timestamp: u64,
}

impl DrawingStroke {
    /// Structural checks applied at the transport boundary.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.id.trim().is_empty() {
            return Err(ProtocolError::InvalidPayload("stroke id must not be empty".into()));
        }
        if self.points.is_empty() {
            return Err(ProtocolError::InvalidPayload(format!(
                "stroke {} has no points",
                self.id
            )));
        }
        if !self.points.iter().all(Point::is_finite) {
            return Err(ProtocolError::InvalidPayload(format!(
                "stroke {} has non-finite coordinates",
                self.id
            )));
        }
        if !is_hex_color(&self.color) {
            return Err(ProtocolError::InvalidPayload(format!(
                "stroke {} has invalid color {:?}",
                self.id, self.color
            )));
        }
        Ok(())
    }
}

/// `#RRGGBB` (the leading `#` is optional).
fn is_hex_color(color: &str) -> bool {
    let digits = color.strip_prefix('#').unwrap_or(color);
    digits.len() == 6 && digits.chars().all(|c| c.is_ascii_hexdigit())
}

/// Ephemeral pointer position of a remote participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCursor {
    pub user_id: UserId,
    pub username: String,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

// ───────────────────────────────────────────────────────────────────
// Events
// ───────────────────────────────────────────────────────────────────

/// Client→server events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Identify this connection and announce presence to a peer.
    #[serde(rename = "user:join", rename_all = "camelCase")]
    UserJoin {
        user_id: UserId,
        #[serde(default)]
        peer_user_id: Option<UserId>,
        #[serde(default)]
        username: Option<String>,
    },

    #[serde(rename = "whiteboard:join", rename_all = "camelCase")]
    WhiteboardJoin {
        session_id: SessionId,
        user_id: UserId,
        #[serde(default)]
        peer_user_id: Option<UserId>,
        #[serde(default)]
        username: Option<String>,
    },

    #[serde(rename = "whiteboard:leave", rename_all = "camelCase")]
    WhiteboardLeave { session_id: SessionId },

    #[serde(rename = "whiteboard:stroke", rename_all = "camelCase")]
    WhiteboardStroke {
        session_id: SessionId,
        stroke: DrawingStroke,
    },

    #[serde(rename = "whiteboard:cursor", rename_all = "camelCase")]
    WhiteboardCursor { session_id: SessionId, x: f64, y: f64 },

    #[serde(rename = "whiteboard:clear", rename_all = "camelCase")]
    WhiteboardClear { session_id: SessionId },

    #[serde(rename = "whiteboard:save", rename_all = "camelCase")]
    WhiteboardSave {
        session_id: SessionId,
        content: String,
        #[serde(default)]
        thumbnail: Option<String>,
    },

    #[serde(rename = "call:initiate", rename_all = "camelCase")]
    CallInitiate {
        to_user_id: UserId,
        call_type: CallType,
    },

    #[serde(rename = "call:accept", rename_all = "camelCase")]
    CallAccept { call_id: String, to_user_id: UserId },

    #[serde(rename = "call:reject", rename_all = "camelCase")]
    CallReject { call_id: String, to_user_id: UserId },

    #[serde(rename = "webrtc:offer", rename_all = "camelCase")]
    WebRtcOffer {
        to_user_id: UserId,
        payload: Value,
        #[serde(default)]
        call_id: Option<String>,
    },

    #[serde(rename = "webrtc:answer", rename_all = "camelCase")]
    WebRtcAnswer {
        to_user_id: UserId,
        payload: Value,
        #[serde(default)]
        call_id: Option<String>,
    },

    #[serde(rename = "webrtc:ice-candidate", rename_all = "camelCase")]
    WebRtcIceCandidate {
        to_user_id: UserId,
        payload: Value,
        #[serde(default)]
        call_id: Option<String>,
    },

    #[serde(rename = "call:end", rename_all = "camelCase")]
    CallEnd {
        to_user_id: UserId,
        #[serde(default)]
        call_id: Option<String>,
    },

    #[serde(rename = "ping")]
    Ping,
}

impl ClientEvent {
    /// Decode and validate one text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let event: ClientEvent = serde_json::from_str(text)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Checks serde's typing cannot express.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ClientEvent::WhiteboardStroke { stroke, .. } => stroke.validate(),
            ClientEvent::WhiteboardCursor { x, y, .. } if !(x.is_finite() && y.is_finite()) => {
                Err(ProtocolError::InvalidPayload("cursor coordinates must be finite".into()))
            }
            ClientEvent::CallAccept { call_id, .. } | ClientEvent::CallReject { call_id, .. }
                if call_id.is_empty() =>
            {
                Err(ProtocolError::InvalidPayload("call id must not be empty".into()))
            }
            _ => Ok(()),
        }
    }

    /// Wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::UserJoin { .. } => "user:join",
            ClientEvent::WhiteboardJoin { .. } => "whiteboard:join",
            ClientEvent::WhiteboardLeave { .. } => "whiteboard:leave",
            ClientEvent::WhiteboardStroke { .. } => "whiteboard:stroke",
            ClientEvent::WhiteboardCursor { .. } => "whiteboard:cursor",
            ClientEvent::WhiteboardClear { .. } => "whiteboard:clear",
            ClientEvent::WhiteboardSave { .. } => "whiteboard:save",
            ClientEvent::CallInitiate { .. } => "call:initiate",
            ClientEvent::CallAccept { .. } => "call:accept",
            ClientEvent::CallReject { .. } => "call:reject",
            ClientEvent::WebRtcOffer { .. } => "webrtc:offer",
            ClientEvent::WebRtcAnswer { .. } => "webrtc:answer",
            ClientEvent::WebRtcIceCandidate { .. } => "webrtc:ice-candidate",
            ClientEvent::CallEnd { .. } => "call:end",
            ClientEvent::Ping => "ping",
        }
    }
}

/// Server→client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "user:online", rename_all = "camelCase")]
    UserOnline { user_id: UserId },

    #[serde(rename = "user:offline", rename_all = "camelCase")]
    UserOffline { user_id: UserId },

    /// Full stroke log, sent only to the joining connection.
    #[serde(rename = "whiteboard:sync", rename_all = "camelCase")]
    WhiteboardSync {
        session_id: SessionId,
        strokes: Vec<DrawingStroke>,
        participants: Vec<UserId>,
    },

    #[serde(rename = "whiteboard:user-joined", rename_all = "camelCase")]
    UserJoined {
        session_id: SessionId,
        user_id: UserId,
        username: String,
    },

    #[serde(rename = "whiteboard:user-left", rename_all = "camelCase")]
    UserLeft { session_id: SessionId, user_id: UserId },

    #[serde(rename = "whiteboard:stroke-received", rename_all = "camelCase")]
    StrokeReceived {
        session_id: SessionId,
        stroke: DrawingStroke,
    },

    #[serde(rename = "whiteboard:cursor-moved", rename_all = "camelCase")]
    CursorMoved {
        session_id: SessionId,
        cursor: RemoteCursor,
    },

    #[serde(rename = "whiteboard:cleared", rename_all = "camelCase")]
    Cleared {
        session_id: SessionId,
        cleared_by: UserId,
    },

    #[serde(rename = "whiteboard:saved", rename_all = "camelCase")]
    Saved { session_id: SessionId },

    #[serde(rename = "whiteboard:error", rename_all = "camelCase")]
    WhiteboardError {
        #[serde(default)]
        session_id: Option<SessionId>,
        message: String,
    },

    #[serde(rename = "call:incoming", rename_all = "camelCase")]
    CallIncoming {
        call_id: String,
        from_user_id: UserId,
        call_type: CallType,
    },

    #[serde(rename = "call:accepted", rename_all = "camelCase")]
    CallAccepted { call_id: String, from_user_id: UserId },

    #[serde(rename = "call:rejected", rename_all = "camelCase")]
    CallRejected { call_id: String, from_user_id: UserId },

    #[serde(rename = "call:ended", rename_all = "camelCase")]
    CallEnded {
        from_user_id: UserId,
        #[serde(default)]
        call_id: Option<String>,
    },

    #[serde(rename = "call:error", rename_all = "camelCase")]
    CallError {
        #[serde(default)]
        to_user_id: Option<UserId>,
        message: String,
    },

    #[serde(rename = "webrtc:offer-received", rename_all = "camelCase")]
    OfferReceived {
        from_user_id: UserId,
        payload: Value,
        #[serde(default)]
        call_id: Option<String>,
    },

    #[serde(rename = "webrtc:answer-received", rename_all = "camelCase")]
    AnswerReceived {
        from_user_id: UserId,
        payload: Value,
        #[serde(default)]
        call_id: Option<String>,
    },

    #[serde(rename = "webrtc:ice-candidate-received", rename_all = "camelCase")]
    IceCandidateReceived {
        from_user_id: UserId,
        payload: Value,
        #[serde(default)]
        call_id: Option<String>,
    },

    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "error", rename_all = "camelCase")]
    Error { message: String },
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
