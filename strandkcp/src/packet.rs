//! Datagram classification and control-datagram codec.
//!
//! Every UDP payload starts with a 4-byte little-endian conversation id, the
//! same field KCP segments carry first. Conversation 0 is reserved for
//! control datagrams:
//!
//! ```text
//! +-----------+---------+------------------+
//! | conv = 0  |  cmd    | fields per cmd   |
//! | (4B, LE)  |  (1B)   |                  |
//! +-----------+---------+------------------+
//! ```
//!
//! Any other conversation id marks a data datagram whose bytes belong to the
//! engine and are passed through untouched.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, StrandKcpError};

/// Length of the conversation-id prefix.
pub const CONV_LEN: usize = 4;
/// Conversation id carried by control datagrams.
pub const CONTROL_CONV: u32 = 0;
/// Size of a KCP segment header; shorter data datagrams cannot be valid.
pub const ENGINE_HEADER_LEN: usize = 24;

/// Control command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    ConnectRequest = 0x01,
    ConnectAck = 0x02,
    Disconnect = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = StrandKcpError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Command::ConnectRequest),
            0x02 => Ok(Command::ConnectAck),
            0x03 => Ok(Command::Disconnect),
            other => Err(StrandKcpError::UnknownCommand(other)),
        }
    }
}

/// An out-of-band control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// CONNECT_REQUEST: no fields.
    ConnectRequest,
    /// CONNECT_ACK: conv(4)
    ConnectAck { conv: u32 },
    /// DISCONNECT: conv(4)
    Disconnect { conv: u32 },
}

impl Control {
    pub fn command(&self) -> Command {
        match self {
            Control::ConnectRequest => Command::ConnectRequest,
            Control::ConnectAck { .. } => Command::ConnectAck,
            Control::Disconnect { .. } => Command::Disconnect,
        }
    }

    /// Encode into a freshly allocated buffer sized to the datagram.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(CONTROL_CONV);
        buf.put_u8(self.command() as u8);
        match self {
            Control::ConnectRequest => {}
            Control::ConnectAck { conv } | Control::Disconnect { conv } => {
                buf.put_u32_le(*conv);
            }
        }
        buf.freeze()
    }

    pub fn encoded_len(&self) -> usize {
        CONV_LEN
            + 1
            + match self {
                Control::ConnectRequest => 0,
                Control::ConnectAck { .. } | Control::Disconnect { .. } => 4,
            }
    }

    /// Decode the bytes following the reserved conversation id.
    fn decode_body(data: &[u8]) -> Result<Self> {
        ensure_len(data, 1)?;
        let command = Command::try_from(data[0])?;
        let data = &data[1..];
        match command {
            Command::ConnectRequest => Ok(Control::ConnectRequest),
            Command::ConnectAck => {
                let conv = decode_conv_field(data)?;
                Ok(Control::ConnectAck { conv })
            }
            Command::Disconnect => {
                let conv = decode_conv_field(data)?;
                Ok(Control::Disconnect { conv })
            }
        }
    }
}

/// A classified inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datagram<'a> {
    Control(Control),
    /// Engine segment(s) for `conv`; `bytes` is the whole datagram.
    Data { conv: u32, bytes: &'a [u8] },
}

impl<'a> Datagram<'a> {
    /// Classify a raw UDP payload.
    ///
    /// Malformed input (too short, unknown command, truncated fields, or a
    /// zero conversation id inside a control message) is an error; callers
    /// on the receive path drop it.
    pub fn decode(data: &'a [u8]) -> Result<Self> {
        let conv = peek_conv(data)?;
        if conv == CONTROL_CONV {
            return Control::decode_body(&data[CONV_LEN..]).map(Datagram::Control);
        }
        ensure_len(data, ENGINE_HEADER_LEN)?;
        Ok(Datagram::Data { conv, bytes: data })
    }
}

/// Read the conversation id prefix.
pub fn peek_conv(data: &[u8]) -> Result<u32> {
    ensure_len(data, CONV_LEN)?;
    Ok((&data[..CONV_LEN]).get_u32_le())
}

fn decode_conv_field(data: &[u8]) -> Result<u32> {
    let conv = peek_conv(data)?;
    if conv == CONTROL_CONV {
        return Err(StrandKcpError::InvalidConv(conv));
    }
    Ok(conv)
}

fn ensure_len(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        Err(StrandKcpError::DatagramTooShort {
            expected: needed,
            actual: data.len(),
        })
    } else {
        Ok(())
    }
}
