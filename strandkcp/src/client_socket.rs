//! Client connection state machine.
//!
//! Idle -> Connecting -> Connected, with Connecting -> TimedOut when the
//! handshake gives up and Connected -> TimedOut when the peer goes silent.
//! Disconnecting returns to Idle. Time only moves when the caller invokes
//! [`ClientSocket::update`]; retries and liveness are re-evaluated there.

use std::fmt;
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::config::ClientConfig;
use crate::error::{Result, StrandKcpError};
use crate::event::{DisconnectReason, EventCallback, SocketEvent};
use crate::packet::{Control, Datagram};
use crate::session::ReliableSession;
use crate::socket::{DatagramTransport, Socket};

/// Observable client states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// No connection and no attempt in progress.
    Idle,
    /// Handshake in progress.
    Connecting,
    /// A session is live.
    Connected,
    /// The handshake gave up or the session went silent.
    TimedOut,
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketState::Idle => write!(f, "Idle"),
            SocketState::Connecting => write!(f, "Connecting"),
            SocketState::Connected => write!(f, "Connected"),
            SocketState::TimedOut => write!(f, "TimedOut"),
        }
    }
}

/// Handshake timers. `None` until the first tick after `connect`.
#[derive(Debug, Default)]
struct Attempt {
    started_at: Option<u64>,
    next_retry_at: Option<u64>,
}

/// Internal stage; the session lives only inside `Connected`.
enum Stage {
    Idle,
    Connecting(Attempt),
    Connected(ReliableSession),
    TimedOut,
}

/// A socket dedicated to one outbound connection.
pub struct ClientSocket {
    // Declared before `socket` so a live session is dropped, and says
    // goodbye, while the transport still exists.
    stage: Stage,
    target: Option<SocketAddr>,
    config: ClientConfig,
    callback: Option<EventCallback>,
    socket: Socket,
}

impl ClientSocket {
    /// Bind `config.bind_addr` and start receiving on it.
    pub async fn bind(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let socket = Socket::bind(config.bind_addr).await?;
        Ok(Self::from_socket(socket, config))
    }

    /// Run over a caller-supplied transport; feed received datagrams through
    /// [`handle_datagram`](Self::handle_datagram).
    pub fn with_transport(transport: Arc<dyn DatagramTransport>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_socket(Socket::with_transport(transport), config))
    }

    fn from_socket(socket: Socket, config: ClientConfig) -> Self {
        Self {
            stage: Stage::Idle,
            target: None,
            config,
            callback: None,
            socket,
        }
    }

    /// Resolve `host:port` and start connecting to it.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        self.ensure_can_connect()?;
        let target = self.resolve(host, port)?;
        self.connect_addr(target)
    }

    /// Start connecting to an already resolved address. The first
    /// CONNECT_REQUEST goes out on the next [`update`](Self::update).
    pub fn connect_addr(&mut self, target: SocketAddr) -> Result<()> {
        self.ensure_can_connect()?;
        tracing::debug!(peer = %target, "connecting");
        self.target = Some(target);
        self.stage = Stage::Connecting(Attempt::default());
        Ok(())
    }

    fn ensure_can_connect(&self) -> Result<()> {
        match self.stage {
            Stage::Connecting(_) => Err(StrandKcpError::AlreadyConnecting),
            Stage::Connected(_) => Err(StrandKcpError::AlreadyConnected),
            Stage::Idle | Stage::TimedOut => Ok(()),
        }
    }

    /// Pick a resolved address, preferring the local socket's family.
    fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| StrandKcpError::Resolve(format!("{host}:{port}: {e}")))?
            .collect();
        let want_v6 = self.socket.local_addr().map(|a| a.is_ipv6());
        addrs
            .iter()
            .find(|a| want_v6.map_or(true, |v6| a.is_ipv6() == v6))
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| StrandKcpError::Resolve(format!("{host}:{port}: no addresses")))
    }

    /// Drive the socket: process received datagrams, retry or give up the
    /// handshake, tick the session and check its liveness, then deliver
    /// queued events.
    pub fn update(&mut self, now: u64) {
        while let Some(inbound) = self.socket.next_inbound() {
            self.process(&inbound.data, inbound.from, now);
        }
        match self.stage {
            Stage::Connecting(_) => self.drive_handshake(now),
            Stage::Connected(_) => self.drive_session(now),
            Stage::Idle | Stage::TimedOut => {}
        }
        self.dispatch();
    }

    /// Process one datagram received outside the built-in receive task.
    pub fn handle_datagram(&mut self, data: &[u8], from: SocketAddr, now: u64) {
        self.process(data, from, now);
        self.dispatch();
    }

    fn drive_handshake(&mut self, now: u64) {
        let Stage::Connecting(attempt) = &mut self.stage else {
            return;
        };
        let started = *attempt.started_at.get_or_insert(now);
        if now.saturating_sub(started) >= self.config.connect_timeout {
            tracing::debug!(peer = ?self.target, elapsed = now.saturating_sub(started), "connect gave up");
            self.stage = Stage::TimedOut;
            self.socket.emit(SocketEvent::ConnectFailed);
            return;
        }
        if attempt.next_retry_at.map_or(true, |due| now >= due) {
            attempt.next_retry_at = Some(now.saturating_add(self.config.connect_retry_interval));
            if let Some(target) = self.target {
                tracing::trace!(peer = %target, "sending connect request");
                self.socket.send_raw(&Control::ConnectRequest.encode(), target);
            }
        }
    }

    fn drive_session(&mut self, now: u64) {
        let Stage::Connected(session) = &mut self.stage else {
            return;
        };
        session.update(now);
        if !session.is_timed_out(now) {
            return;
        }
        if let Stage::Connected(mut session) = mem::replace(&mut self.stage, Stage::TimedOut) {
            let conv = session.conv();
            tracing::debug!(conv, peer = %session.remote_addr(), "session timed out");
            session.emit(SocketEvent::TimedOut { conv });
            session.close(true);
        }
    }

    fn process(&mut self, data: &[u8], from: SocketAddr, now: u64) {
        match Datagram::decode(data) {
            Err(err) => {
                tracing::trace!(peer = %from, len = data.len(), error = %err, "malformed datagram dropped");
            }
            Ok(Datagram::Control(Control::ConnectAck { conv })) => self.on_connect_ack(conv, from, now),
            Ok(Datagram::Control(Control::Disconnect { conv })) => self.on_remote_disconnect(conv, from),
            Ok(Datagram::Control(Control::ConnectRequest)) => {
                tracing::trace!(peer = %from, "connect request ignored by client");
            }
            Ok(Datagram::Data { conv, bytes }) => match &mut self.stage {
                Stage::Connected(session) if session.conv() == conv => {
                    session.input(bytes, from, now);
                }
                _ => tracing::trace!(conv, peer = %from, "data for inactive conversation dropped"),
            },
        }
    }

    fn on_connect_ack(&mut self, conv: u32, from: SocketAddr, now: u64) {
        if !matches!(self.stage, Stage::Connecting(_)) || self.target != Some(from) {
            tracing::trace!(conv, peer = %from, "unexpected connect ack ignored");
            return;
        }
        match ReliableSession::create(self.socket.owner(), conv, from, now, &self.config.session) {
            Ok(mut session) => {
                session.touch(now);
                tracing::debug!(conv, peer = %from, "connected");
                self.stage = Stage::Connected(session);
                self.socket.emit(SocketEvent::Connected { conv });
            }
            Err(err) => {
                tracing::warn!(conv, peer = %from, error = %err, "session creation failed");
                self.stage = Stage::Idle;
                self.socket.emit(SocketEvent::ConnectFailed);
            }
        }
    }

    fn on_remote_disconnect(&mut self, conv: u32, from: SocketAddr) {
        let live = matches!(
            &self.stage,
            Stage::Connected(s) if s.conv() == conv && s.remote_addr() == from
        );
        if !live {
            tracing::trace!(conv, peer = %from, "disconnect for inactive conversation ignored");
            return;
        }
        if let Stage::Connected(mut session) = mem::replace(&mut self.stage, Stage::Idle) {
            tracing::debug!(conv, "peer disconnected");
            session.close(false);
            self.socket.emit(SocketEvent::Disconnected {
                conv,
                reason: DisconnectReason::Remote,
            });
        }
    }

    /// Queue `payload` for reliable delivery. Fails with `NotConnected`
    /// unless a session is live.
    pub fn send_msg(&mut self, payload: &[u8]) -> Result<()> {
        match &mut self.stage {
            Stage::Connected(session) => session.send_message(payload),
            _ => Err(StrandKcpError::NotConnected),
        }
    }

    /// Close the connection or abort a pending attempt. Safe to repeat.
    pub fn disconnect(&mut self) {
        match mem::replace(&mut self.stage, Stage::Idle) {
            Stage::Connected(mut session) => {
                let conv = session.conv();
                tracing::debug!(conv, "disconnecting");
                session.close(true);
                self.socket.emit(SocketEvent::Disconnected {
                    conv,
                    reason: DisconnectReason::Local,
                });
            }
            Stage::Connecting(_) => tracing::debug!(peer = ?self.target, "connect aborted"),
            Stage::TimedOut => self.stage = Stage::TimedOut,
            Stage::Idle => {}
        }
        self.dispatch();
    }

    pub fn state(&self) -> SocketState {
        match self.stage {
            Stage::Idle => SocketState::Idle,
            Stage::Connecting(_) => SocketState::Connecting,
            Stage::Connected(_) => SocketState::Connected,
            Stage::TimedOut => SocketState::TimedOut,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.stage, Stage::Connected(_))
    }

    /// Conversation id of the live session.
    pub fn conv(&self) -> Option<u32> {
        self.session().map(|s| s.conv())
    }

    pub fn session(&self) -> Option<&ReliableSession> {
        match &self.stage {
            Stage::Connected(session) => Some(session),
            _ => None,
        }
    }

    /// The live session's peer, or the connect target otherwise.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.session().map(|s| s.remote_addr()).or(self.target)
    }

    /// Peer IP as text; empty when no peer is known.
    pub fn remote_address(&self) -> String {
        self.remote_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_default()
    }

    /// Peer port; 0 when no peer is known.
    pub fn remote_port(&self) -> u16 {
        self.remote_addr().map_or(0, |a| a.port())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    /// Register the event callback. Events queued before registration are
    /// delivered on the next dispatch.
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnMut(SocketEvent) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    /// Pop a queued event when no callback is registered.
    pub fn poll_event(&mut self) -> Option<SocketEvent> {
        self.socket.next_event()
    }

    fn dispatch(&mut self) {
        self.socket.dispatch(self.callback.as_mut());
    }
}
