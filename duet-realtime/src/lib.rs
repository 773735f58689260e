//! # duet-realtime — real-time sync core for paired users
//!
//! Presence, WebRTC call signaling and shared whiteboards over a single
//! WebSocket per client, with JSON `{"event", "data"}` frames.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐     WebSocket     ┌────────────────┐
//! │ RealtimeClient │ ◄───────────────► │ RealtimeServer │
//! │   (per user)   │    JSON events    │   (central)    │
//! └────────────────┘                   └───────┬────────┘
//!                                              │
//!                                        ┌─────┴─────┐
//!                                        │    Hub    │
//!                                        └─────┬─────┘
//!                      ┌───────────────────────┼────────────────────┐
//!                      ▼                       ▼                    ▼
//!              ConnectionRegistry       SignalingRelay     WhiteboardManager
//!              (user → connection)      (stateless fwd)    (stroke logs)
//!                                                                   │
//!                                                                   ▼
//!                                                           SnapshotStore
//!                                                        (memory / RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Wire events, identities, validation
//! - [`registry`] — Online users and their outbound queues
//! - [`signaling`] — Call control and SDP/ICE relay
//! - [`whiteboard`] — Per-session append-only stroke logs
//! - [`transport`] — Connection lifecycle and dispatch
//! - [`server`] — WebSocket server, configuration
//! - [`client`] — WebSocket client with reconnect
//! - [`storage`] — Snapshot persistence

pub mod protocol;
pub mod registry;
pub mod signaling;
pub mod whiteboard;
pub mod transport;
pub mod server;
pub mod client;
pub mod storage;

// Re-exports for convenience
pub use protocol::{
    CallType, ClientEvent, ConnectionId, DrawingStroke, Point, ProtocolError, RemoteCursor,
    ServerEvent, SessionId, UserId,
};
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use signaling::{CallId, RelayError, SignalingRelay};
pub use whiteboard::{JoinOutcome, WhiteboardError, WhiteboardManager, WhiteboardSession};
pub use transport::{ConnectionContext, Hub};
pub use server::{RealtimeServer, ServerConfig, ServerError, ServerStats};
pub use client::{ClientNotice, ConnectionState, RealtimeClient, ReconnectPolicy};
pub use storage::{
    MemoryStore, RenderedSnapshot, RocksStore, SessionMetadata, SnapshotStore, StoreConfig,
    StoreError,
};
