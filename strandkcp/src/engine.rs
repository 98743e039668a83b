//! ARQ engine seam.
//!
//! The session layer never looks inside the reliable-delivery algorithm. It
//! talks to an [`ArqEngine`]: bytes in, messages out, a clock to advance, and
//! an output callback bound when the engine is built. [`KcpEngine`] is the
//! production implementation on top of the `kcp` crate.

use std::io::{self, Write};

use bytes::Bytes;

use crate::config::EngineConfig;
use crate::error::{Result, StrandKcpError};

/// Callback receiving every datagram the engine wants on the wire.
///
/// Invoked synchronously from inside `update`, `input` and `send`.
pub type OutputFn = Box<dyn FnMut(&[u8]) + Send>;

/// Reliable-delivery engine driven by a session.
pub trait ArqEngine: Send {
    /// Conversation id the engine was created for.
    fn conv(&self) -> u32;

    /// Feed one raw datagram. Errors mean the bytes were not a valid segment
    /// for this conversation.
    fn input(&mut self, data: &[u8]) -> Result<()>;

    /// Queue a message for reliable transmission.
    fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Advance the engine clock to `current`, flushing due segments.
    fn update(&mut self, current: u32) -> Result<()>;

    /// Pop the next fully reassembled message, if any.
    fn recv(&mut self) -> Option<Bytes>;

    /// Number of segments queued or in flight.
    fn pending_send(&self) -> usize;
}

/// Adapts an [`OutputFn`] to the `Write` sink the KCP control block expects.
struct OutputSink(OutputFn);

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (self.0)(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// KCP control block configured from an [`EngineConfig`].
pub struct KcpEngine {
    kcp: kcp::Kcp<OutputSink>,
}

impl KcpEngine {
    /// Build an engine for `conv` that writes through `output`.
    pub fn new(conv: u32, config: &EngineConfig, output: OutputFn) -> Result<Self> {
        let mut kcp = kcp::Kcp::new(conv, OutputSink(output));
        kcp.set_nodelay(
            config.nodelay,
            config.interval as i32,
            config.fast_resend as i32,
            config.no_congestion_window,
        );
        kcp.set_wndsize(config.send_window, config.recv_window);
        kcp.set_mtu(config.mtu)
            .map_err(|e| StrandKcpError::Engine(format!("{e:?}")))?;
        Ok(Self { kcp })
    }
}

impl ArqEngine for KcpEngine {
    fn conv(&self) -> u32 {
        self.kcp.conv()
    }

    fn input(&mut self, data: &[u8]) -> Result<()> {
        self.kcp
            .input(data)
            .map(|_| ())
            .map_err(|e| StrandKcpError::Engine(format!("{e:?}")))
    }

    fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.kcp
            .send(payload)
            .map(|_| ())
            .map_err(|e| StrandKcpError::Engine(format!("{e:?}")))
    }

    fn update(&mut self, current: u32) -> Result<()> {
        self.kcp
            .update(current)
            .map_err(|e| StrandKcpError::Engine(format!("{e:?}")))
    }

    fn recv(&mut self) -> Option<Bytes> {
        let size = self.kcp.peeksize().ok()?;
        let mut buf = vec![0u8; size];
        match self.kcp.recv(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Some(Bytes::from(buf))
            }
            Err(e) => {
                tracing::trace!(conv = self.kcp.conv(), error = ?e, "engine recv failed");
                None
            }
        }
    }

    fn pending_send(&self) -> usize {
        self.kcp.wait_snd()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    fn capture() -> (OutputFn, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let output: OutputFn = Box::new(move |buf: &[u8]| sink.lock().push(buf.to_vec()));
        (output, sent)
    }

    #[test]
    fn message_crosses_between_engines() {
        let cfg = EngineConfig::default();
        let (out_a, sent_a) = capture();
        let (out_b, _sent_b) = capture();
        let mut a = KcpEngine::new(11, &cfg, out_a).unwrap();
        let mut b = KcpEngine::new(11, &cfg, out_b).unwrap();

        a.send(b"ping").unwrap();
        assert!(a.pending_send() > 0);
        a.update(0).unwrap();

        let wire = std::mem::take(&mut *sent_a.lock());
        assert!(!wire.is_empty());
        for datagram in &wire {
            assert_eq!(&datagram[..4], &11u32.to_le_bytes());
            b.input(datagram).unwrap();
        }
        assert_eq!(b.recv().unwrap(), Bytes::from_static(b"ping"));
        assert!(b.recv().is_none());
    }

    #[test]
    fn foreign_conversation_rejected() {
        let cfg = EngineConfig::default();
        let (out_a, sent_a) = capture();
        let (out_b, _) = capture();
        let mut a = KcpEngine::new(1, &cfg, out_a).unwrap();
        let mut b = KcpEngine::new(2, &cfg, out_b).unwrap();

        a.send(b"x").unwrap();
        a.update(0).unwrap();
        let wire = sent_a.lock().clone();
        assert!(b.input(&wire[0]).is_err());
    }
}
