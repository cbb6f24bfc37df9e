//! Hostinfo messages: the handshake/echo envelope carried on
//! `TOPIC_HOSTINFO_ADV`.
//!
//! Header layout (8 bytes, little-endian):
//! - word 0: `message_type:4 | result:10 | stream_size_words:18`
//! - word 1: message marker (echo index for ECHO, round marker otherwise)
//!
//! ECHO messages carry their 32-byte timing payload directly after the
//! header; every other type carries a schema sub-header
//! `{u32 reserved, u32 len_u64s}` first.

use crate::error::XrspError;
use crate::framer::TopicPacket;
use crate::protocol::BUILTIN_ECHO;
use crate::Result;

pub const HOSTINFO_HEADER_SIZE: usize = 8;

/// Ping/pong timing payload of the echo exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EchoPayload {
    /// Originate: the peer's transmit time echoed back to it.
    pub org: i64,
    /// Receive time of the request at the replying side.
    pub recv: i64,
    /// Transmit time of this message.
    pub xmt: i64,
    /// Sender's current clock-offset estimate.
    pub offset: i64,
}

impl EchoPayload {
    pub const SIZE: usize = 32;

    pub fn parse(b: &[u8]) -> Result<EchoPayload> {
        if b.len() < Self::SIZE {
            return Err(XrspError::Schema("echo payload too short"));
        }
        let q = |off: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&b[off..off + 8]);
            i64::from_le_bytes(w)
        };
        Ok(EchoPayload {
            org: q(0),
            recv: q(8),
            xmt: q(16),
            offset: q(24),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.org.to_le_bytes());
        out.extend_from_slice(&self.recv.to_le_bytes());
        out.extend_from_slice(&self.xmt.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
    }
}

/// A decoded hostinfo message.
#[derive(Debug)]
pub struct HostInfoMsg {
    pub message_type: u8,
    pub result: u16,
    pub stream_size: u32,
    pub marker: u32,
    pub recv_ns: i64,
    payload: Vec<u8>,
}

impl HostInfoMsg {
    pub fn parse(pkt: &TopicPacket) -> Result<HostInfoMsg> {
        let b = pkt.payload();
        if b.len() < HOSTINFO_HEADER_SIZE {
            return Err(XrspError::Schema("hostinfo header too short"));
        }
        let word0 = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        let marker = u32::from_le_bytes([b[4], b[5], b[6], b[7]]);

        let message_type = (word0 & 0xF) as u8;
        let result = ((word0 >> 4) & 0x3FF) as u16;
        let stream_size = (word0 >> 14) << 2;

        // ECHO payloads start right after the header; everything else skips
        // the 8-byte schema sub-header as well.
        let body_off = if message_type == BUILTIN_ECHO {
            HOSTINFO_HEADER_SIZE
        } else {
            HOSTINFO_HEADER_SIZE + 8
        };
        let payload = b.get(body_off..).unwrap_or_default().to_vec();

        Ok(HostInfoMsg {
            message_type,
            result,
            stream_size,
            marker,
            recv_ns: pkt.recv_ns,
            payload,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Craft a raw hostinfo message.
pub fn craft(message_type: u8, result: u16, stream_size: u32, marker: u32, payload: &[u8]) -> Vec<u8> {
    let word0: u32 =
        (message_type as u32 & 0xF) | ((result as u32 & 0x3FF) << 4) | (((stream_size >> 2) & 0x3FFFF) << 14);
    let mut out = Vec::with_capacity(HOSTINFO_HEADER_SIZE + payload.len());
    out.extend_from_slice(&word0.to_le_bytes());
    out.extend_from_slice(&marker.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Craft a hostinfo message whose payload is wrapped in the schema
/// sub-header (`{0, len_u64s}`), as every non-echo round of the handshake is.
pub fn craft_schema(message_type: u8, result: u16, marker: u32, payload: &[u8]) -> Vec<u8> {
    let mut wrapped = Vec::with_capacity(8 + payload.len());
    wrapped.extend_from_slice(&0u32.to_le_bytes());
    wrapped.extend_from_slice(&((payload.len() / 8) as u32).to_le_bytes());
    wrapped.extend_from_slice(payload);
    craft(message_type, result, (payload.len() + 0x10) as u32, marker, &wrapped)
}

/// Craft an ECHO message (PING or PONG selected via `result`'s low bit).
pub fn craft_echo(result: u16, echo_idx: u32, payload: &EchoPayload) -> Vec<u8> {
    let mut body = Vec::with_capacity(EchoPayload::SIZE);
    payload.write(&mut body);
    craft(BUILTIN_ECHO, result, (EchoPayload::SIZE + 8) as u32, echo_idx, &body)
}
