//! Lifecycle events delivered to the socket owner.

use std::fmt;

use bytes::Bytes;

/// Why a session ended without a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local application asked for it.
    Local,
    /// The peer sent DISCONNECT.
    Remote,
    /// A new connection from another endpoint took over the conversation id.
    Replaced,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Local => write!(f, "Local"),
            DisconnectReason::Remote => write!(f, "Remote"),
            DisconnectReason::Replaced => write!(f, "Replaced"),
        }
    }
}

/// Events emitted by sockets and their sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A session was established.
    Connected { conv: u32 },
    /// A complete message was reassembled by the engine.
    Message { conv: u32, payload: Bytes },
    /// A session was closed explicitly.
    Disconnected { conv: u32, reason: DisconnectReason },
    /// A session went silent for longer than the liveness timeout.
    TimedOut { conv: u32 },
    /// A client connect attempt gave up without an answer.
    ConnectFailed,
}

impl SocketEvent {
    /// Conversation the event belongs to, if any.
    pub fn conv(&self) -> Option<u32> {
        match self {
            SocketEvent::Connected { conv }
            | SocketEvent::Message { conv, .. }
            | SocketEvent::Disconnected { conv, .. }
            | SocketEvent::TimedOut { conv } => Some(*conv),
            SocketEvent::ConnectFailed => None,
        }
    }
}

/// Owner callback registered on a socket.
pub type EventCallback = Box<dyn FnMut(SocketEvent) + Send>;
