//! Shared helpers: an in-memory transport that records every datagram.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use strandkcp::packet::{Control, Datagram};
use strandkcp::DatagramTransport;

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Transport that keeps sent datagrams for the test to inspect or forward.
pub struct RecordingTransport {
    pub local: SocketAddr,
    sent: Mutex<Vec<(Bytes, SocketAddr)>>,
}

impl RecordingTransport {
    pub fn new(local: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            local,
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Drain everything sent so far.
    pub fn take(&self) -> Vec<(Bytes, SocketAddr)> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Control datagrams sent so far, without draining.
    pub fn controls(&self) -> Vec<(Control, SocketAddr)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|(bytes, to)| match Datagram::decode(bytes) {
                Ok(Datagram::Control(c)) => Some((c, *to)),
                _ => None,
            })
            .collect()
    }

    pub fn count_control(&self, wanted: Control) -> usize {
        self.controls().iter().filter(|(c, _)| *c == wanted).count()
    }
}

impl DatagramTransport for RecordingTransport {
    fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.sent.lock().push((Bytes::copy_from_slice(data), target));
        Ok(data.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}

/// Conversation id of a data datagram, `None` for control traffic.
pub fn data_conv(bytes: &[u8]) -> Option<u32> {
    match Datagram::decode(bytes) {
        Ok(Datagram::Data { conv, .. }) => Some(conv),
        _ => None,
    }
}
