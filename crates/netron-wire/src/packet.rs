//! Packet codec and stream framing.
//!
//! Every packet travels as one frame: a 4-byte big-endian length followed by
//! the packet body. The body is a fixed header (flags, action, 32-bit id)
//! and a MessagePack-encoded [`Value`] payload:
//!
//! ```text
//! +---------+-------+--------+--------+------------------+
//! | len u32 | flags | action | id u32 | payload (msgpack) |
//! +---------+-------+--------+--------+------------------+
//! ```
//!
//! `flags` bit 0 is the impulse bit (set on requests, clear on responses) and
//! bit 1 is the error bit (meaningful on responses only).

use crate::value::Value;
use bytes::{Buf, BytesMut};
use netron_types::{NetronError, NetronResult};
use serde::Deserialize;
use tracing::warn;

/// Maximum single frame body size (16 MB).
pub const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;

/// Length of the frame prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Length of the fixed body header: flags, action, id.
pub const HEADER_LEN: usize = 6;

const FLAG_IMPULSE: u8 = 0x01;
const FLAG_ERROR: u8 = 0x02;

/// What a request asks the remote side to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    /// Call a method or read a property.
    Get = 1,
    /// Call a method ignoring its result, or write a property.
    Set = 2,
    /// Run one or more named tasks.
    Task = 3,
}

impl TryFrom<u8> for Action {
    type Error = NetronError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Action::Get),
            2 => Ok(Action::Set),
            3 => Ok(Action::Task),
            other => Err(NetronError::InvalidPacket(format!(
                "unknown action code {other}"
            ))),
        }
    }
}

/// The unit of transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Correlation id, echoed by the response.
    pub id: u32,
    /// Set on requests, clear on responses.
    pub impulse: bool,
    pub action: Action,
    /// Set on responses carrying an error.
    pub error: bool,
    pub data: Value,
}

impl Packet {
    /// Build a request packet.
    pub fn request(id: u32, action: Action, data: Value) -> Self {
        Self {
            id,
            impulse: true,
            action,
            error: false,
            data,
        }
    }

    /// Build the response to `request`.
    pub fn response_to(request: &Packet, data: Value, error: bool) -> Self {
        Self {
            id: request.id,
            impulse: false,
            action: request.action,
            error,
            data,
        }
    }
}

/// Encode a packet body (header + payload, no length prefix).
pub fn encode_body(packet: &Packet) -> NetronResult<Vec<u8>> {
    let payload =
        rmp_serde::to_vec_named(&packet.data).map_err(|e| NetronError::Codec(e.to_string()))?;
    let mut flags = 0u8;
    if packet.impulse {
        flags |= FLAG_IMPULSE;
    }
    if packet.error {
        flags |= FLAG_ERROR;
    }
    let mut body = Vec::with_capacity(HEADER_LEN + payload.len());
    body.push(flags);
    body.push(packet.action as u8);
    body.extend_from_slice(&packet.id.to_be_bytes());
    body.extend_from_slice(&payload);
    Ok(body)
}

/// Encode a packet into a complete frame (4-byte big-endian length + body).
pub fn encode_packet(packet: &Packet) -> NetronResult<Vec<u8>> {
    let body = encode_body(packet)?;
    let len = u32::try_from(body.len()).unwrap_or(u32::MAX);
    if len > MAX_PACKET_SIZE {
        return Err(NetronError::MessageTooLarge {
            size: len,
            max: MAX_PACKET_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Decode a packet body. The payload must consume the body exactly.
pub fn decode_packet(body: &[u8]) -> NetronResult<Packet> {
    if body.len() < HEADER_LEN {
        return Err(NetronError::InvalidPacket(format!(
            "body of {} bytes is shorter than the header",
            body.len()
        )));
    }
    let flags = body[0];
    let action = Action::try_from(body[1])?;
    let id = u32::from_be_bytes([body[2], body[3], body[4], body[5]]);

    let mut payload = &body[HEADER_LEN..];
    let declared = payload.len();
    let data = {
        let mut de = rmp_serde::Deserializer::new(&mut payload);
        Value::deserialize(&mut de).map_err(|e| NetronError::InvalidPacket(e.to_string()))?
    };
    if !payload.is_empty() {
        return Err(NetronError::InvalidPacket(format!(
            "payload declared {declared} bytes but only {} were consumed",
            declared - payload.len()
        )));
    }

    Ok(Packet {
        id,
        impulse: flags & FLAG_IMPULSE != 0,
        action,
        error: flags & FLAG_ERROR != 0,
        data,
    })
}

/// Incremental frame decoder for a byte stream.
///
/// Chunks may split or merge frames arbitrarily. When a frame fails to
/// decode, or declares a size above [`MAX_PACKET_SIZE`], the whole buffer is
/// discarded and decoding resumes with the next chunk.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append a chunk and return every packet completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Packet> {
        self.buf.extend_from_slice(chunk);
        let mut packets = Vec::new();
        while self.buf.len() >= LENGTH_PREFIX {
            let len = decode_length(&[self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if len > MAX_PACKET_SIZE {
                warn!(
                    size = len,
                    max = MAX_PACKET_SIZE,
                    "netron: oversized frame, discarding buffer"
                );
                self.buf.clear();
                break;
            }
            let total = LENGTH_PREFIX + len as usize;
            if self.buf.len() < total {
                break;
            }
            self.buf.advance(LENGTH_PREFIX);
            let body = self.buf.split_to(len as usize);
            match decode_packet(&body) {
                Ok(packet) => packets.push(packet),
                Err(e) => {
                    warn!(
                        error = %e,
                        dropped = self.buf.len(),
                        "netron: undecodable frame, discarding buffer"
                    );
                    self.buf.clear();
                    break;
                }
            }
        }
        packets
    }
}
