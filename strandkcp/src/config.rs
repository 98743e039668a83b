//! Tunables for engines, sessions, and the client/server sockets.
//!
//! All clock values are in the caller's time-units (milliseconds when driven
//! by [`Clock`](crate::clock::Clock)).

use std::net::{Ipv4Addr, SocketAddr};

use crate::error::{Result, StrandKcpError};

/// Default liveness timeout.
pub const DEFAULT_SESSION_TIMEOUT: u64 = 10_000;
/// Default engine tick interval.
pub const DEFAULT_TICK_INTERVAL: u32 = 5;
/// Default fast-retransmit threshold (ACK skips before resend).
pub const DEFAULT_FAST_RESEND: u32 = 1;
/// Default interval between CONNECT_REQUEST retransmissions.
pub const DEFAULT_CONNECT_RETRY_INTERVAL: u64 = 1_000;
/// Default time after which a pending connect gives up.
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 10_000;

/// KCP engine settings. Defaults select low-latency ("fast") mode.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Disable delayed ACKs and use the aggressive RTO back-off.
    pub nodelay: bool,
    /// Internal flush interval.
    pub interval: u32,
    /// Resend a segment after this many ACKs skip it (0 disables).
    pub fast_resend: u32,
    /// Ignore the congestion window when sending.
    pub no_congestion_window: bool,
    /// Send window in segments.
    pub send_window: u16,
    /// Receive window in segments.
    pub recv_window: u16,
    /// Maximum bytes per UDP datagram produced by the engine.
    pub mtu: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            interval: DEFAULT_TICK_INTERVAL,
            fast_resend: DEFAULT_FAST_RESEND,
            no_congestion_window: true,
            send_window: 128,
            recv_window: 128,
            mtu: 1400,
        }
    }
}

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub engine: EngineConfig,
    /// Inactivity after which a session is presumed dead.
    pub timeout: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }
}

/// Configuration for [`ClientSocket`](crate::client_socket::ClientSocket).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local address to bind when the socket owns its UDP endpoint.
    pub bind_addr: SocketAddr,
    pub session: SessionConfig,
    pub connect_retry_interval: u64,
    /// Give-up threshold for a pending connect. Must exceed the retry interval.
    pub connect_timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            session: SessionConfig::default(),
            connect_retry_interval: DEFAULT_CONNECT_RETRY_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Check the handshake timers are usable.
    pub fn validate(&self) -> Result<()> {
        if self.connect_retry_interval == 0 {
            return Err(StrandKcpError::InvalidConfig(
                "connect_retry_interval must be non-zero".into(),
            ));
        }
        if self.connect_timeout <= self.connect_retry_interval {
            return Err(StrandKcpError::InvalidConfig(format!(
                "connect_timeout ({}) must exceed connect_retry_interval ({})",
                self.connect_timeout, self.connect_retry_interval
            )));
        }
        Ok(())
    }
}

/// Configuration for [`ServerSocket`](crate::server::ServerSocket).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub session: SessionConfig,
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
    /// Create sessions on the first data datagram for an unseen conversation
    /// instead of requiring the connect handshake.
    pub eager_accept: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            max_sessions: 1024,
            eager_accept: false,
        }
    }
}
