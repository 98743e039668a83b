use thiserror::Error;

/// All errors produced by the StrandKCP session layer.
#[derive(Debug, Error)]
pub enum StrandKcpError {
    #[error("datagram too short: expected at least {expected} bytes, got {actual}")]
    DatagramTooShort { expected: usize, actual: usize },

    #[error("unknown control command: 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("invalid conversation id: {0}")]
    InvalidConv(u32),

    #[error("not connected")]
    NotConnected,

    #[error("connect already in progress")]
    AlreadyConnecting,

    #[error("already connected")]
    AlreadyConnected,

    #[error("conversation {0} already in use")]
    ConvInUse(u32),

    #[error("session {0} not found")]
    SessionNotFound(u32),

    #[error("maximum sessions ({0}) exceeded")]
    MaxSessionsExceeded(usize),

    #[error("payload is empty")]
    EmptyPayload,

    #[error("send rejected on conversation {conv}: {reason}")]
    SendRejected { conv: u32, reason: String },

    #[error("engine error: {0}")]
    Engine(String),

    #[error("failed to resolve {0}")]
    Resolve(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StrandKcpError>;
