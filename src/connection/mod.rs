//! Connection to the voice service
//!
//! One WebSocket per connection generation. Text frames carry JSON events in
//! both directions; see [`protocol`] for the event contract.
//!
//! The [`ConnectionManager`] is the only writer of [`ConnectionState`]; every
//! other component reads it through a cloned [`StateHandle`].

pub mod manager;
pub mod protocol;

pub use manager::{ConnectionManager, ConnectionNotice, ConnectionOptions, InboundHandler};
pub use protocol::{parse_inbound, InboundEvent, OutboundEvent};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// Lifecycle of the transport
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Closed deliberately; no reconnection follows
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Cheap shared read access to the connection state
#[derive(Clone, Debug, Default)]
pub struct StateHandle {
    inner: Arc<RwLock<ConnectionState>>,
}

impl StateHandle {
    pub fn get(&self) -> ConnectionState {
        *self.inner.read()
    }

    pub fn is_connected(&self) -> bool {
        self.get().is_connected()
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        *self.inner.write() = state;
    }
}

/// Identity issued by the service in its `ready` event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: String, conversation_id: Option<String>) -> Self {
        Self {
            session_id,
            conversation_id,
            created_at: Utc::now(),
        }
    }
}

/// Failure to establish the first connection; surfaced, never retried
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no ready event within {0} ms")]
    HandshakeTimeout(u64),

    #[error("connection closed during handshake")]
    ClosedDuringHandshake,

    #[error("service rejected the session: {0}")]
    Rejected(String),

    #[error("connection attempt cancelled")]
    Cancelled,
}

/// Mid-session failure; triggers reconnection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    #[error("connection closed by peer")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("send failed: {0}")]
    Send(String),
}

/// A message that could not be understood; dropped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    Json(String),

    #[error("message has no type")]
    MissingType,

    #[error("invalid {kind} event: {error}")]
    InvalidEvent { kind: String, error: String },

    #[error("failed to serialize event: {0}")]
    Serialize(String),
}
