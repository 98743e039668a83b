//! Session table / demultiplexer.
//!
//! Maps conversation ids to [`ReliableSession`]s, routes inbound data
//! datagrams to them, ticks every live session, and evicts the ones that
//! went silent.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::config::SessionConfig;
use crate::error::{Result, StrandKcpError};
use crate::event::{DisconnectReason, SocketEvent};
use crate::session::ReliableSession;
use crate::socket::OwnerRef;

/// How the table treats unknown and colliding conversation ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Outbound side: unknown conversations are dropped, collisions rejected.
    Client,
    /// Inbound side: a collision from a new endpoint replaces the old
    /// session. With `eager`, data for an unknown conversation opens one.
    Acceptor { eager: bool },
}

/// Outcome of [`SessionTable::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A new session was inserted.
    Created,
    /// A session for this conversation and endpoint already existed.
    Existing,
    /// An older session on another endpoint was destroyed and replaced.
    Replaced,
}

/// Outcome of [`SessionTable::route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Fed to an existing session; carries the number of messages delivered.
    Delivered(usize),
    /// A session was opened for the datagram, announced, and then fed.
    Accepted,
    /// No session and none may be created.
    Dropped,
}

/// Sessions keyed by conversation id.
pub struct SessionTable {
    sessions: HashMap<u32, ReliableSession>,
    role: Role,
    owner: OwnerRef,
    config: SessionConfig,
    max_sessions: usize,
}

impl SessionTable {
    pub fn new(role: Role, owner: OwnerRef, config: SessionConfig, max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            role,
            owner,
            config,
            max_sessions,
        }
    }

    /// Open a session for `conv` bound to `remote`, applying the role's
    /// collision policy.
    pub fn create(&mut self, conv: u32, remote: SocketAddr, now: u64) -> Result<Admission> {
        let mut admission = Admission::Created;
        let same_endpoint = self.sessions.get(&conv).map(|s| s.remote_addr() == remote);
        match (same_endpoint, self.role) {
            (None, _) => {}
            (Some(_), Role::Client) => return Err(StrandKcpError::ConvInUse(conv)),
            (Some(true), Role::Acceptor { .. }) => return Ok(Admission::Existing),
            (Some(false), Role::Acceptor { .. }) => {
                if let Some(mut old) = self.sessions.remove(&conv) {
                    tracing::debug!(conv, old = %old.remote_addr(), new = %remote, "conversation replaced");
                    old.emit(SocketEvent::Disconnected {
                        conv,
                        reason: DisconnectReason::Replaced,
                    });
                    old.close(true);
                }
                admission = Admission::Replaced;
            }
        }

        if self.sessions.len() >= self.max_sessions {
            return Err(StrandKcpError::MaxSessionsExceeded(self.max_sessions));
        }
        let session = ReliableSession::create(self.owner.clone(), conv, remote, now, &self.config)?;
        self.sessions.insert(conv, session);
        Ok(admission)
    }

    /// Dispatch a data datagram for `conv`.
    pub fn route(&mut self, conv: u32, data: &[u8], from: SocketAddr, now: u64) -> Routed {
        if let Some(session) = self.sessions.get_mut(&conv) {
            return Routed::Delivered(session.input(data, from, now));
        }
        match self.role {
            Role::Acceptor { eager: true } => self.accept_unseen(conv, data, from, now),
            _ => {
                tracing::trace!(conv, peer = %from, "datagram for unknown conversation dropped");
                Routed::Dropped
            }
        }
    }

    /// Open a session for an unseen conversation from its first datagram.
    ///
    /// The session is kept and announced only if the engine accepts the
    /// bytes; otherwise nothing would ever time it out.
    fn accept_unseen(&mut self, conv: u32, data: &[u8], from: SocketAddr, now: u64) -> Routed {
        if self.sessions.len() >= self.max_sessions {
            tracing::debug!(conv, peer = %from, max = self.max_sessions, "eager accept refused, table full");
            return Routed::Dropped;
        }
        let mut session = match ReliableSession::create(self.owner.clone(), conv, from, now, &self.config) {
            Ok(session) => session,
            Err(err) => {
                tracing::debug!(conv, peer = %from, error = %err, "eager accept refused");
                return Routed::Dropped;
            }
        };
        if !session.ingest(data, from, now) {
            tracing::trace!(conv, peer = %from, "invalid first datagram, no session opened");
            session.close(false);
            return Routed::Dropped;
        }
        // Connected must precede whatever the first datagram delivers.
        session.emit(SocketEvent::Connected { conv });
        session.deliver();
        self.sessions.insert(conv, session);
        Routed::Accepted
    }

    /// Tick every session, then evict those that timed out.
    ///
    /// Each evicted session emits `TimedOut` before it is destroyed.
    /// Returns the evicted conversation ids.
    pub fn tick_all(&mut self, now: u64) -> Vec<u32> {
        for session in self.sessions.values_mut() {
            session.update(now);
        }

        let expired: Vec<u32> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_timed_out(now))
            .map(|(conv, _)| *conv)
            .collect();

        for conv in &expired {
            if let Some(mut session) = self.sessions.remove(conv) {
                tracing::debug!(conv, peer = %session.remote_addr(), "session timed out");
                session.emit(SocketEvent::TimedOut { conv: *conv });
                session.close(true);
            }
        }
        expired
    }

    /// Remove and destroy the session for `conv`.
    pub fn remove(&mut self, conv: u32, notify_peer: bool) -> Result<()> {
        let mut session = self
            .sessions
            .remove(&conv)
            .ok_or(StrandKcpError::SessionNotFound(conv))?;
        session.close(notify_peer);
        Ok(())
    }

    /// Queue a message on the session for `conv`.
    pub fn send(&mut self, conv: u32, payload: &[u8]) -> Result<()> {
        self.sessions
            .get_mut(&conv)
            .ok_or(StrandKcpError::SessionNotFound(conv))?
            .send_message(payload)
    }

    pub fn get(&self, conv: u32) -> Option<&ReliableSession> {
        self.sessions.get(&conv)
    }

    pub fn get_mut(&mut self, conv: u32) -> Option<&mut ReliableSession> {
        self.sessions.get_mut(&conv)
    }

    pub fn contains(&self, conv: u32) -> bool {
        self.sessions.contains_key(&conv)
    }

    /// Conversation currently bound to `remote`, if any.
    pub fn find_by_endpoint(&self, remote: SocketAddr) -> Option<u32> {
        self.sessions
            .values()
            .find(|s| s.remote_addr() == remote)
            .map(|s| s.conv())
    }

    pub fn convs(&self) -> Vec<u32> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Destroy every session.
    pub fn clear(&mut self, notify_peer: bool) {
        for (_, mut session) in self.sessions.drain() {
            session.close(notify_peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::packet::{Control, Datagram};
    use crate::socket::{DatagramTransport, Socket};

    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    impl DatagramTransport for Capture {
        fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
            self.sent.lock().push((data.to_vec(), target));
            Ok(data.len())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:7000".parse().unwrap())
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn table(role: Role) -> (Socket, Arc<Capture>, SessionTable) {
        let capture = Arc::new(Capture::default());
        let socket = Socket::with_transport(capture.clone());
        let table = SessionTable::new(role, socket.owner(), SessionConfig::default(), 16);
        (socket, capture, table)
    }

    #[test]
    fn client_role_rejects_collision() {
        let (_socket, capture, mut table) = table(Role::Client);
        assert_eq!(table.create(7, addr(1), 0).unwrap(), Admission::Created);
        assert!(matches!(
            table.create(7, addr(2), 0),
            Err(StrandKcpError::ConvInUse(7))
        ));
        assert_eq!(table.len(), 1);
        // The rejected attempt must not have told the live peer to go away.
        assert!(capture.sent.lock().is_empty());
    }

    #[test]
    fn acceptor_replaces_collision_from_new_endpoint() {
        let (socket, capture, mut table) = table(Role::Acceptor { eager: false });
        table.create(7, addr(1), 0).unwrap();
        assert_eq!(table.create(7, addr(1), 0).unwrap(), Admission::Existing);
        assert_eq!(table.create(7, addr(2), 0).unwrap(), Admission::Replaced);

        assert_eq!(table.get(7).unwrap().remote_addr(), addr(2));
        assert_eq!(
            socket.next_event(),
            Some(SocketEvent::Disconnected {
                conv: 7,
                reason: DisconnectReason::Replaced
            })
        );
        let sent = capture.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, addr(1));
    }

    #[test]
    fn unknown_conv_dropped_in_client_role() {
        let (_socket, _capture, mut table) = table(Role::Client);
        let mut raw = vec![0u8; 24];
        raw[..4].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(table.route(99, &raw, addr(1), 0), Routed::Dropped);
        assert!(table.is_empty());
    }

    #[test]
    fn eager_accept_ignores_invalid_first_datagram() {
        let (socket, capture, mut table) = table(Role::Acceptor { eager: true });
        let mut junk = vec![0u8; 24];
        junk[..4].copy_from_slice(&77u32.to_le_bytes());
        junk[4] = 0xee;

        assert_eq!(table.route(77, &junk, addr(1), 0), Routed::Dropped);
        assert!(table.is_empty());
        assert!(socket.next_event().is_none());
        assert!(capture.sent.lock().is_empty());
    }

    #[test]
    fn max_sessions_enforced() {
        let capture = Arc::new(Capture::default());
        let socket = Socket::with_transport(capture);
        let mut table = SessionTable::new(Role::Client, socket.owner(), SessionConfig::default(), 2);
        table.create(1, addr(1), 0).unwrap();
        table.create(2, addr(2), 0).unwrap();
        assert!(matches!(
            table.create(3, addr(3), 0),
            Err(StrandKcpError::MaxSessionsExceeded(2))
        ));
    }

    #[test]
    fn tick_all_evicts_and_notifies() {
        let (socket, capture, mut table) = table(Role::Acceptor { eager: false });
        table.create(4, addr(4), 0).unwrap();
        table.create(5, addr(5), 0).unwrap();
        table.get_mut(4).unwrap().touch(100);
        // 5 never heard anything: it stays.

        assert!(table.tick_all(10_100).is_empty());
        assert_eq!(table.tick_all(10_101), vec![4]);
        assert!(!table.contains(4));
        assert!(table.contains(5));
        assert_eq!(socket.next_event(), Some(SocketEvent::TimedOut { conv: 4 }));

        let farewells: Vec<_> = capture
            .sent
            .lock()
            .iter()
            .filter_map(|(bytes, to)| match Datagram::decode(bytes) {
                Ok(Datagram::Control(c)) => Some((c, *to)),
                _ => None,
            })
            .collect();
        assert_eq!(farewells, vec![(Control::Disconnect { conv: 4 }, addr(4))]);
    }

    #[test]
    fn remove_missing_is_error() {
        let (_socket, _capture, mut table) = table(Role::Client);
        assert!(matches!(
            table.remove(3, true),
            Err(StrandKcpError::SessionNotFound(3))
        ));
    }

    #[test]
    fn find_by_endpoint_and_clear() {
        let (_socket, capture, mut table) = table(Role::Acceptor { eager: false });
        table.create(10, addr(10), 0).unwrap();
        table.create(11, addr(11), 0).unwrap();
        assert_eq!(table.find_by_endpoint(addr(11)), Some(11));
        assert_eq!(table.find_by_endpoint(addr(12)), None);

        table.clear(false);
        assert!(table.is_empty());
        assert!(capture.sent.lock().is_empty());
    }
}
