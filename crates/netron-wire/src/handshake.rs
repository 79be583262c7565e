//! Authenticated handshake for TCP connections.
//!
//! Before two [`NetronNode`](crate::node::NetronNode)s exchange packets, the
//! dialing side sends a `hello` carrying its peer id, protocol version, a
//! random nonce and `HMAC-SHA256(shared_secret, nonce + peer_id)`. The
//! listening side verifies it and answers with a `hello_ack` signed the same
//! way, or with an `error`. Handshake messages are JSON, framed with the
//! same 4-byte big-endian length prefix as packets.

use hmac::{Hmac, Mac};
use netron_types::{NetronError, NetronResult};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type HmacSha256 = Hmac<Sha256>;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum handshake message size (64 KB).
pub const MAX_HANDSHAKE_SIZE: u32 = 64 * 1024;

/// Error code: the first message was not a hello.
pub const CODE_UNAUTHENTICATED: i32 = 401;
/// Error code: HMAC verification failed.
pub const CODE_FORBIDDEN: i32 = 403;
/// Error code: a peer with this id is already connected.
pub const CODE_CONFLICT: i32 = 409;
/// Error code: protocol version mismatch.
pub const CODE_VERSION: i32 = 1;

/// A handshake message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HandshakeMessage {
    /// Sent by the dialing side.
    #[serde(rename = "hello")]
    Hello {
        peer_id: String,
        protocol_version: u32,
        #[serde(default)]
        nonce: String,
        /// HMAC-SHA256(shared_secret, nonce + peer_id).
        #[serde(default)]
        auth_hmac: String,
    },
    /// Sent by the listening side on success.
    #[serde(rename = "hello_ack")]
    HelloAck {
        peer_id: String,
        protocol_version: u32,
        #[serde(default)]
        nonce: String,
        #[serde(default)]
        auth_hmac: String,
    },
    /// Sent by the listening side on failure.
    #[serde(rename = "error")]
    Error { code: i32, message: String },
}

impl HandshakeMessage {
    /// Signed hello for `peer_id`.
    pub fn hello(peer_id: &str, secret: &str) -> NetronResult<Self> {
        let (nonce, auth_hmac) = sign_identity(peer_id, secret)?;
        Ok(HandshakeMessage::Hello {
            peer_id: peer_id.to_string(),
            protocol_version: PROTOCOL_VERSION,
            nonce,
            auth_hmac,
        })
    }

    /// Signed acknowledgement for `peer_id`.
    pub fn ack(peer_id: &str, secret: &str) -> NetronResult<Self> {
        let (nonce, auth_hmac) = sign_identity(peer_id, secret)?;
        Ok(HandshakeMessage::HelloAck {
            peer_id: peer_id.to_string(),
            protocol_version: PROTOCOL_VERSION,
            nonce,
            auth_hmac,
        })
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        HandshakeMessage::Error {
            code,
            message: message.into(),
        }
    }
}

fn sign_identity(peer_id: &str, secret: &str) -> NetronResult<(String, String)> {
    let nonce = hex::encode(rand::random::<[u8; 16]>());
    let auth_hmac = hmac_sign(secret, format!("{nonce}{peer_id}").as_bytes())?;
    Ok((nonce, auth_hmac))
}

/// Generate an HMAC-SHA256 signature, hex-encoded.
pub fn hmac_sign(secret: &str, data: &[u8]) -> NetronResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| NetronError::Handshake(e.to_string()))?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify an HMAC-SHA256 signature in constant time.
pub fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    match hmac_sign(secret, data) {
        Ok(expected) => {
            subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
        }
        Err(_) => false,
    }
}

/// Verify the identity claimed by a hello or ack.
pub fn verify_identity(secret: &str, peer_id: &str, nonce: &str, auth_hmac: &str) -> bool {
    hmac_verify(secret, format!("{nonce}{peer_id}").as_bytes(), auth_hmac)
}

/// Encode a handshake message (4-byte big-endian length + JSON).
pub fn encode_message(msg: &HandshakeMessage) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Parse a JSON body into a handshake message.
pub fn decode_message(body: &[u8]) -> Result<HandshakeMessage, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Write a framed handshake message.
pub async fn write_message<W>(writer: &mut W, msg: &HandshakeMessage) -> NetronResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_message(msg).map_err(|e| NetronError::Codec(e.to_string()))?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed handshake message, consuming exactly one frame.
pub async fn read_message<R>(reader: &mut R) -> NetronResult<HandshakeMessage>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(NetronError::ConnectionClosed);
        }
        Err(e) => return Err(NetronError::Io(e)),
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_HANDSHAKE_SIZE {
        return Err(NetronError::MessageTooLarge {
            size: len,
            max: MAX_HANDSHAKE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    decode_message(&body).map_err(|e| NetronError::Handshake(e.to_string()))
}
