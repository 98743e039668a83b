//! One logical connection: a conversation id, its engine, and its peer.
//!
//! A session never owns its socket. It reaches the socket through an
//! [`OwnerRef`] for exactly two things: pushing engine output onto the wire
//! and emitting events. Both become no-ops once the socket is gone.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::SessionConfig;
use crate::engine::{ArqEngine, KcpEngine, OutputFn};
use crate::error::{Result, StrandKcpError};
use crate::event::SocketEvent;
use crate::packet::{Control, CONTROL_CONV};
use crate::socket::OwnerRef;

/// Per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Datagrams the engine accepted.
    pub datagrams_in: u64,
    /// Complete messages delivered to the owner.
    pub messages_in: u64,
    /// Messages handed to the engine for sending.
    pub messages_out: u64,
}

/// A reliable session bound to one remote endpoint.
pub struct ReliableSession {
    conv: u32,
    /// Shared with the engine's output closure so migration redirects output.
    remote: Arc<Mutex<SocketAddr>>,
    created_at: u64,
    last_activity: Option<u64>,
    timeout: u64,
    engine: Option<Box<dyn ArqEngine>>,
    owner: OwnerRef,
    stats: SessionStats,
}

impl ReliableSession {
    /// Create a session backed by a KCP engine in low-latency mode.
    pub fn create(
        owner: OwnerRef,
        conv: u32,
        remote: SocketAddr,
        now: u64,
        config: &SessionConfig,
    ) -> Result<Self> {
        let engine_config = config.engine.clone();
        Self::create_with(owner, conv, remote, now, config.timeout, move |output| {
            let engine = KcpEngine::new(conv, &engine_config, output)?;
            Ok(Box::new(engine) as Box<dyn ArqEngine>)
        })
    }

    /// Create a session around an engine built by `make_engine`, which
    /// receives the output callback to bind.
    pub fn create_with<F>(
        owner: OwnerRef,
        conv: u32,
        remote: SocketAddr,
        now: u64,
        timeout: u64,
        make_engine: F,
    ) -> Result<Self>
    where
        F: FnOnce(OutputFn) -> Result<Box<dyn ArqEngine>>,
    {
        if conv == CONTROL_CONV {
            return Err(StrandKcpError::InvalidConv(conv));
        }
        let remote = Arc::new(Mutex::new(remote));
        let output = {
            let owner = owner.clone();
            let remote = remote.clone();
            Box::new(move |buf: &[u8]| {
                if let Some(link) = owner.upgrade() {
                    let target = *remote.lock();
                    link.send_raw(buf, target);
                }
            }) as OutputFn
        };
        let engine = make_engine(output)?;
        Ok(Self {
            conv,
            remote,
            created_at: now,
            last_activity: None,
            timeout,
            engine: Some(engine),
            owner,
            stats: SessionStats::default(),
        })
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// Current peer address (follows endpoint migration).
    pub fn remote_addr(&self) -> SocketAddr {
        *self.remote.lock()
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Clock of the last accepted inbound traffic; `None` until something
    /// has been heard.
    pub fn last_activity(&self) -> Option<u64> {
        self.last_activity
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.engine.is_none()
    }

    /// Segments waiting in the engine's send path.
    pub fn pending_send(&self) -> usize {
        self.engine.as_ref().map_or(0, |e| e.pending_send())
    }

    /// Advance the engine to `now`, letting it emit due retransmissions and
    /// ACKs.
    pub fn update(&mut self, now: u64) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let current = now.saturating_sub(self.created_at) as u32;
        if let Err(err) = engine.update(current) {
            tracing::debug!(conv = self.conv, error = %err, "engine update failed");
        }
    }

    /// Feed a raw datagram received from `from`.
    ///
    /// Accepted bytes refresh liveness and move the session to `from`.
    /// Returns the number of complete messages delivered to the owner.
    pub fn input(&mut self, data: &[u8], from: SocketAddr, now: u64) -> usize {
        if !self.ingest(data, from, now) {
            return 0;
        }
        self.deliver()
    }

    /// Hand bytes to the engine without delivering messages. Returns whether
    /// the engine accepted them; only then are activity and endpoint updated.
    pub(crate) fn ingest(&mut self, data: &[u8], from: SocketAddr, now: u64) -> bool {
        let Some(engine) = self.engine.as_mut() else {
            return false;
        };
        if let Err(err) = engine.input(data) {
            tracing::trace!(conv = self.conv, peer = %from, error = %err, "datagram rejected by engine");
            return false;
        }

        self.last_activity = Some(now);
        self.stats.datagrams_in += 1;
        let mut remote = self.remote.lock();
        if *remote != from {
            tracing::debug!(conv = self.conv, old = %*remote, new = %from, "peer endpoint migrated");
            *remote = from;
        }
        true
    }

    /// Emit a `Message` event for every reassembled message.
    pub(crate) fn deliver(&mut self) -> usize {
        let Some(engine) = self.engine.as_mut() else {
            return 0;
        };
        let mut delivered = 0;
        while let Some(payload) = engine.recv() {
            delivered += 1;
            if let Some(link) = self.owner.upgrade() {
                link.emit(SocketEvent::Message {
                    conv: self.conv,
                    payload,
                });
            }
        }
        self.stats.messages_in += delivered as u64;
        delivered
    }

    /// Record activity that did not pass through the engine (handshake).
    pub fn touch(&mut self, now: u64) {
        self.last_activity = Some(now);
    }

    /// True once the peer has been silent for longer than the timeout.
    /// A session that has heard nothing is never timed out.
    pub fn is_timed_out(&self, now: u64) -> bool {
        self.last_activity
            .is_some_and(|last| now.saturating_sub(last) > self.timeout)
    }

    /// Hand `payload` to the engine. Rejections are returned, not retried.
    pub fn send_message(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(StrandKcpError::EmptyPayload);
        }
        let engine = self.engine.as_mut().ok_or(StrandKcpError::NotConnected)?;
        engine
            .send(payload)
            .map_err(|err| StrandKcpError::SendRejected {
                conv: self.conv,
                reason: err.to_string(),
            })?;
        self.stats.messages_out += 1;
        Ok(())
    }

    /// Emit an event through the owner, if it is still alive.
    pub fn emit(&self, event: SocketEvent) {
        if let Some(link) = self.owner.upgrade() {
            link.emit(event);
        }
    }

    /// Release the engine, first telling the peer when `notify_peer` is set.
    /// Only the first call has any effect.
    pub fn close(&mut self, notify_peer: bool) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        if notify_peer {
            if let Some(link) = self.owner.upgrade() {
                let farewell = Control::Disconnect { conv: self.conv }.encode();
                link.send_raw(&farewell, self.remote_addr());
            }
        }
        drop(engine);
        tracing::debug!(conv = self.conv, notify_peer, "session closed");
    }
}

impl Drop for ReliableSession {
    fn drop(&mut self) {
        self.close(true);
    }
}
