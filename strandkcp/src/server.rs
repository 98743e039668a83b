//! Acceptor socket.
//!
//! Answers CONNECT_REQUESTs by allocating a conversation id, opening a
//! session for the requesting endpoint and replying with CONNECT_ACK.
//! Sessions are created only through that handshake unless
//! [`ServerConfig::eager_accept`] is set, in which case the first valid data
//! datagram for an unseen conversation opens one too.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::event::{DisconnectReason, EventCallback, SocketEvent};
use crate::packet::{Control, Datagram, CONTROL_CONV};
use crate::session::ReliableSession;
use crate::socket::{DatagramTransport, Socket};
use crate::table::{Role, Routed, SessionTable};

/// Attempts at drawing an unused conversation id before refusing a request.
const CONV_ALLOC_ATTEMPTS: usize = 16;

/// A socket accepting many inbound sessions.
pub struct ServerSocket {
    // Dropped before `socket` so every session can still say goodbye.
    table: SessionTable,
    callback: Option<EventCallback>,
    socket: Socket,
}

impl ServerSocket {
    /// Bind `addr` and start receiving on it.
    pub async fn bind(addr: SocketAddr, config: ServerConfig) -> Result<Self> {
        let socket = Socket::bind(addr).await?;
        Ok(Self::from_socket(socket, config))
    }

    /// Run over a caller-supplied transport.
    pub fn with_transport(transport: Arc<dyn DatagramTransport>, config: ServerConfig) -> Self {
        Self::from_socket(Socket::with_transport(transport), config)
    }

    fn from_socket(socket: Socket, config: ServerConfig) -> Self {
        let role = Role::Acceptor {
            eager: config.eager_accept,
        };
        let table = SessionTable::new(role, socket.owner(), config.session, config.max_sessions);
        Self {
            table,
            callback: None,
            socket,
        }
    }

    /// Process received datagrams, tick all sessions, evict silent ones and
    /// deliver queued events.
    pub fn update(&mut self, now: u64) {
        while let Some(inbound) = self.socket.next_inbound() {
            self.process(&inbound.data, inbound.from, now);
        }
        self.table.tick_all(now);
        self.dispatch();
    }

    /// Process one datagram received outside the built-in receive task.
    pub fn handle_datagram(&mut self, data: &[u8], from: SocketAddr, now: u64) {
        self.process(data, from, now);
        self.dispatch();
    }

    fn process(&mut self, data: &[u8], from: SocketAddr, now: u64) {
        match Datagram::decode(data) {
            Err(err) => {
                tracing::trace!(peer = %from, len = data.len(), error = %err, "malformed datagram dropped");
            }
            Ok(Datagram::Control(Control::ConnectRequest)) => self.accept(from, now),
            Ok(Datagram::Control(Control::Disconnect { conv })) => self.on_remote_disconnect(conv, from),
            Ok(Datagram::Control(Control::ConnectAck { conv })) => {
                tracing::trace!(conv, peer = %from, "connect ack ignored by server");
            }
            Ok(Datagram::Data { conv, bytes }) => {
                if self.table.route(conv, bytes, from, now) == Routed::Accepted {
                    tracing::debug!(conv, peer = %from, "session opened by data");
                }
            }
        }
    }

    fn accept(&mut self, from: SocketAddr, now: u64) {
        if let Some(conv) = self.table.find_by_endpoint(from) {
            let awaiting_data = self
                .table
                .get(conv)
                .is_some_and(|s| s.stats().datagrams_in == 0);
            if awaiting_data {
                // The client never saw our ack; repeat it.
                if let Some(session) = self.table.get_mut(conv) {
                    session.touch(now);
                }
                self.send_ack(conv, from);
                return;
            }
            tracing::debug!(conv, peer = %from, "peer reconnected, dropping old session");
            if let Some(session) = self.table.get(conv) {
                session.emit(SocketEvent::Disconnected {
                    conv,
                    reason: DisconnectReason::Replaced,
                });
            }
            let _ = self.table.remove(conv, false);
        }

        let Some(conv) = self.allocate_conv() else {
            tracing::warn!(peer = %from, "no free conversation id");
            return;
        };
        match self.table.create(conv, from, now) {
            Ok(_) => {
                if let Some(session) = self.table.get_mut(conv) {
                    session.touch(now);
                }
                tracing::debug!(conv, peer = %from, "session accepted");
                self.socket.emit(SocketEvent::Connected { conv });
                self.send_ack(conv, from);
            }
            Err(err) => {
                tracing::warn!(peer = %from, error = %err, "connect request refused");
            }
        }
    }

    fn allocate_conv(&self) -> Option<u32> {
        (0..CONV_ALLOC_ATTEMPTS)
            .map(|_| rand::random::<u32>())
            .find(|conv| *conv != CONTROL_CONV && !self.table.contains(*conv))
    }

    fn send_ack(&self, conv: u32, to: SocketAddr) {
        self.socket.send_raw(&Control::ConnectAck { conv }.encode(), to);
    }

    fn on_remote_disconnect(&mut self, conv: u32, from: SocketAddr) {
        let known = self.table.get(conv).is_some_and(|s| s.remote_addr() == from);
        if !known {
            tracing::trace!(conv, peer = %from, "disconnect for unknown session ignored");
            return;
        }
        if self.table.remove(conv, false).is_ok() {
            tracing::debug!(conv, peer = %from, "peer disconnected");
            self.socket.emit(SocketEvent::Disconnected {
                conv,
                reason: DisconnectReason::Remote,
            });
        }
    }

    /// Queue `payload` on the session for `conv`.
    pub fn send(&mut self, conv: u32, payload: &[u8]) -> Result<()> {
        self.table.send(conv, payload)
    }

    /// Close the session for `conv`, notifying the peer.
    pub fn disconnect(&mut self, conv: u32) -> Result<()> {
        self.table.remove(conv, true)?;
        self.socket.emit(SocketEvent::Disconnected {
            conv,
            reason: DisconnectReason::Local,
        });
        self.dispatch();
        Ok(())
    }

    pub fn session(&self, conv: u32) -> Option<&ReliableSession> {
        self.table.get(conv)
    }

    pub fn session_count(&self) -> usize {
        self.table.len()
    }

    pub fn convs(&self) -> Vec<u32> {
        self.table.convs()
    }

    pub fn remote_addr(&self, conv: u32) -> Option<SocketAddr> {
        self.table.get(conv).map(|s| s.remote_addr())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnMut(SocketEvent) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    pub fn poll_event(&mut self) -> Option<SocketEvent> {
        self.socket.next_event()
    }

    fn dispatch(&mut self) {
        self.socket.dispatch(self.callback.as_mut());
    }
}
