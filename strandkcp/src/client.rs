//! Public client facade over [`ClientSocket`].

use std::net::SocketAddr;
use std::sync::Arc;

use crate::client_socket::{ClientSocket, SocketState};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::event::SocketEvent;
use crate::socket::DatagramTransport;

/// A reliable client connection over UDP.
///
/// The caller owns time: call [`update`](Client::update) on a regular
/// cadence (at most the engine tick interval apart for best latency).
pub struct Client {
    socket: ClientSocket,
}

impl Client {
    pub async fn bind(config: ClientConfig) -> Result<Self> {
        Ok(Self {
            socket: ClientSocket::bind(config).await?,
        })
    }

    pub fn with_transport(transport: Arc<dyn DatagramTransport>, config: ClientConfig) -> Result<Self> {
        Ok(Self {
            socket: ClientSocket::with_transport(transport, config)?,
        })
    }

    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        self.socket.connect(host, port)
    }

    pub fn update(&mut self, now: u64) {
        self.socket.update(now);
    }

    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnMut(SocketEvent) + Send + 'static,
    {
        self.socket.set_callback(callback);
    }

    pub fn send_msg(&mut self, payload: &[u8]) -> Result<()> {
        self.socket.send_msg(payload)
    }

    pub fn disconnect(&mut self) {
        self.socket.disconnect();
    }

    pub fn remote_address(&self) -> String {
        self.socket.remote_address()
    }

    pub fn remote_port(&self) -> u16 {
        self.socket.remote_port()
    }

    pub fn state(&self) -> SocketState {
        self.socket.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }
}
