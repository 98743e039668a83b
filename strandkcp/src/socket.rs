//! UDP transport glue shared by the client and server sockets.
//!
//! A [`Socket`] owns a [`Link`]: the raw-send capability, the queue of
//! received datagrams, and the queue of pending [`SocketEvent`]s. Sessions
//! hold only a [`Weak<Link>`](OwnerRef), so tearing down the socket turns
//! every later send or event from a lingering session into a no-op.
//!
//! When the socket owns a tokio UDP endpoint, a receive task keeps exactly
//! one `recv_from` outstanding and pushes each completion onto the inbound
//! queue. Nothing else happens on that task: the owner drains the queue from
//! its own `update(now)` call, so session state is only ever touched from the
//! owning context.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::event::{EventCallback, SocketEvent};

/// Largest UDP payload the receive task accepts.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Pause after the first failed receive; doubles per consecutive failure.
const RECV_RETRY_MIN: Duration = Duration::from_millis(1);
/// Ceiling for the pause between failed receives.
const RECV_RETRY_MAX: Duration = Duration::from_millis(100);
/// While failures persist, only every this-many-th one is logged.
const RECV_FAILURE_LOG_EVERY: u32 = 1_000;

/// Non-owning handle sessions use to reach their socket.
pub type OwnerRef = Weak<Link>;

/// Datagram sink underneath a socket.
pub trait DatagramTransport: Send + Sync {
    /// Send without blocking. Failures are reported, never retried.
    fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramTransport for UdpSocket {
    fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.try_send_to(data, target)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// A datagram received by the transport, waiting to be processed.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub data: Bytes,
    pub from: SocketAddr,
}

/// The part of a socket that sessions may reach through an [`OwnerRef`].
pub struct Link {
    transport: Arc<dyn DatagramTransport>,
    inbound: SegQueue<Inbound>,
    events: Mutex<VecDeque<SocketEvent>>,
}

impl Link {
    fn new(transport: Arc<dyn DatagramTransport>) -> Self {
        Self {
            transport,
            inbound: SegQueue::new(),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Send raw bytes to `target`.
    ///
    /// Transport failures are logged and swallowed; the engine's own
    /// retransmission or the liveness timeout recovers from them.
    pub fn send_raw(&self, data: &[u8], target: SocketAddr) {
        if let Err(err) = self.transport.send_to(data, target) {
            tracing::warn!(peer = %target, len = data.len(), error = %err, "udp send failed");
        }
    }

    /// Queue an event for the owner.
    pub fn emit(&self, event: SocketEvent) {
        self.events.lock().push_back(event);
    }

    /// Hand a received datagram to the owning context.
    pub fn push_inbound(&self, data: Bytes, from: SocketAddr) {
        self.inbound.push(Inbound { data, from });
    }

    fn pop_inbound(&self) -> Option<Inbound> {
        self.inbound.pop()
    }

    fn pop_event(&self) -> Option<SocketEvent> {
        self.events.lock().pop_front()
    }
}

/// Owner of a UDP endpoint and its [`Link`].
pub struct Socket {
    link: Arc<Link>,
    local_addr: Option<SocketAddr>,
    recv_task: Option<JoinHandle<()>>,
}

impl Socket {
    /// Bind a UDP endpoint and start receiving on it.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let udp = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = udp.local_addr()?;
        let link = Arc::new(Link::new(udp.clone()));
        let recv_task = spawn_receiver(udp, Arc::downgrade(&link));
        tracing::debug!(local = %local_addr, "socket bound");
        Ok(Self {
            link,
            local_addr: Some(local_addr),
            recv_task: Some(recv_task),
        })
    }

    /// Wrap a caller-supplied transport. Received datagrams must be fed in
    /// through the owning socket's `handle_datagram`.
    pub fn with_transport(transport: Arc<dyn DatagramTransport>) -> Self {
        let local_addr = transport.local_addr().ok();
        Self {
            link: Arc::new(Link::new(transport)),
            local_addr,
            recv_task: None,
        }
    }

    /// Weak handle for sessions owned by this socket.
    pub fn owner(&self) -> OwnerRef {
        Arc::downgrade(&self.link)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn send_raw(&self, data: &[u8], target: SocketAddr) {
        self.link.send_raw(data, target);
    }

    pub fn emit(&self, event: SocketEvent) {
        self.link.emit(event);
    }

    /// Take the next received datagram, if any.
    pub fn next_inbound(&self) -> Option<Inbound> {
        self.link.pop_inbound()
    }

    /// Take the next queued event, if any.
    pub fn next_event(&self) -> Option<SocketEvent> {
        self.link.pop_event()
    }

    /// Deliver queued events to `callback`, or leave them queued if none is
    /// registered.
    pub fn dispatch(&self, callback: Option<&mut EventCallback>) {
        if let Some(callback) = callback {
            while let Some(event) = self.link.pop_event() {
                callback(event);
            }
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }
}

/// Consecutive receive failures and the pause they earn.
#[derive(Debug, Default)]
struct RecvBackoff {
    failures: u32,
}

impl RecvBackoff {
    /// Record a failure and return how long to wait before re-arming.
    fn fail(&mut self) -> Duration {
        let shift = self.failures.min(7);
        self.failures = self.failures.saturating_add(1);
        (RECV_RETRY_MIN * (1u32 << shift)).min(RECV_RETRY_MAX)
    }

    /// Log the first failure of a run, then one per `RECV_FAILURE_LOG_EVERY`.
    fn should_log(&self) -> bool {
        self.failures == 1 || self.failures % RECV_FAILURE_LOG_EVERY == 0
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Keep one receive outstanding on `udp`, re-arming after every completion.
fn spawn_receiver(udp: Arc<UdpSocket>, link: OwnerRef) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut backoff = RecvBackoff::default();
        loop {
            match udp.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    backoff.reset();
                    let Some(link) = link.upgrade() else { break };
                    link.push_inbound(Bytes::copy_from_slice(&buf[..len]), from);
                }
                Err(err) => {
                    if link.strong_count() == 0 {
                        break;
                    }
                    let pause = backoff.fail();
                    // ICMP port-unreachable surfaces here on some platforms.
                    if backoff.should_log() {
                        tracing::warn!(error = %err, failures = backoff.failures, "udp receive failed");
                    }
                    tokio::time::sleep(pause).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullTransport;

    impl DatagramTransport for NullTransport {
        fn send_to(&self, _data: &[u8], _target: SocketAddr) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "full"))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:4000".parse().unwrap())
        }
    }

    #[test]
    fn send_failure_is_swallowed() {
        let socket = Socket::with_transport(Arc::new(NullTransport));
        socket.send_raw(b"lost", "127.0.0.1:5000".parse().unwrap());
        assert_eq!(socket.local_addr(), Some("127.0.0.1:4000".parse().unwrap()));
    }

    #[test]
    fn owner_ref_dies_with_socket() {
        let socket = Socket::with_transport(Arc::new(NullTransport));
        let owner = socket.owner();
        assert!(owner.upgrade().is_some());
        drop(socket);
        assert!(owner.upgrade().is_none());
    }

    #[test]
    fn events_stay_queued_without_callback() {
        let socket = Socket::with_transport(Arc::new(NullTransport));
        socket.emit(SocketEvent::ConnectFailed);
        socket.dispatch(None);
        assert_eq!(socket.next_event(), Some(SocketEvent::ConnectFailed));

        socket.emit(SocketEvent::TimedOut { conv: 3 });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut callback: EventCallback = Box::new(move |e| sink.lock().push(e));
        socket.dispatch(Some(&mut callback));
        assert_eq!(seen.lock().as_slice(), &[SocketEvent::TimedOut { conv: 3 }]);
        assert!(socket.next_event().is_none());
    }

    #[test]
    fn receive_backoff_grows_and_resets() {
        let mut backoff = RecvBackoff::default();
        assert_eq!(backoff.fail(), Duration::from_millis(1));
        assert!(backoff.should_log());
        assert_eq!(backoff.fail(), Duration::from_millis(2));
        assert!(!backoff.should_log());
        assert_eq!(backoff.fail(), Duration::from_millis(4));
        for _ in 0..20 {
            assert!(backoff.fail() <= RECV_RETRY_MAX);
        }
        assert_eq!(backoff.fail(), RECV_RETRY_MAX);

        while backoff.failures < RECV_FAILURE_LOG_EVERY - 1 {
            backoff.fail();
        }
        assert!(!backoff.should_log());
        backoff.fail();
        assert!(backoff.should_log());

        backoff.reset();
        assert_eq!(backoff.fail(), Duration::from_millis(1));
        assert!(backoff.should_log());
    }

    #[tokio::test]
    async fn receive_task_queues_datagrams() {
        let socket = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let target = socket.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"abcd", target).await.unwrap();

        let mut received = None;
        for _ in 0..100 {
            if let Some(inbound) = socket.next_inbound() {
                received = Some(inbound);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let inbound = received.expect("datagram should arrive");
        assert_eq!(&inbound.data[..], b"abcd");
        assert_eq!(inbound.from, sender.local_addr().unwrap());
    }
}
