//! StrandKCP -- reliable sessions multiplexed over a single UDP socket.
//!
//! Each session is a KCP conversation identified by a non-zero `conv`.
//! The crate provides the session layer around the engine:
//! - **Demultiplexing**: datagrams are routed to sessions by conversation id
//! - **Handshake**: CONNECT_REQUEST / CONNECT_ACK / DISCONNECT control datagrams
//! - **Liveness**: silent sessions are evicted and reported as timed out
//! - **Caller-driven time**: nothing happens between `update(now)` calls
//!
//! ```rust,no_run
//! use strandkcp::{Client, ClientConfig, Clock, SocketEvent};
//!
//! # async fn run() -> strandkcp::Result<()> {
//! let clock = Clock::new();
//! let mut client = Client::bind(ClientConfig::default()).await?;
//! client.set_callback(|event| {
//!     if let SocketEvent::Message { payload, .. } = event {
//!         println!("got {} bytes", payload.len());
//!     }
//! });
//! client.connect("127.0.0.1", 9000)?;
//! loop {
//!     client.update(clock.now());
//!     tokio::time::sleep(std::time::Duration::from_millis(5)).await;
//! }
//! # }
//! ```

pub mod client;
pub mod client_socket;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod packet;
pub mod server;
pub mod session;
pub mod socket;
pub mod table;

// Re-export key public types at crate root.
pub use client::Client;
pub use client_socket::{ClientSocket, SocketState};
pub use clock::Clock;
pub use config::{ClientConfig, EngineConfig, ServerConfig, SessionConfig};
pub use engine::{ArqEngine, KcpEngine};
pub use error::{Result, StrandKcpError};
pub use event::{DisconnectReason, SocketEvent};
pub use packet::{Control, Datagram};
pub use server::ServerSocket;
pub use session::ReliableSession;
pub use socket::{DatagramTransport, Socket};
pub use table::{Role, SessionTable};
