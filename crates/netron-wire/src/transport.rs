//! Byte-stream endpoints a peer is bound to.

use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxedSource = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

/// A bidirectional byte stream, split into its read and write halves.
pub struct Transport {
    pub source: BoxedSource,
    pub sink: BoxedSink,
}

impl Transport {
    pub fn new(
        source: impl AsyncRead + Send + Unpin + 'static,
        sink: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            source: Box::new(source),
            sink: Box::new(sink),
        }
    }

    /// Split a duplex stream such as a `TcpStream`.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (source, sink) = tokio::io::split(stream);
        Self::new(source, sink)
    }

    /// Two in-process transports wired to each other.
    pub fn pair(max_buf_size: usize) -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(max_buf_size);
        (Self::from_stream(a), Self::from_stream(b))
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Transport")
    }
}

/// Connection state change for a peer.
///
/// With a transport the peer binds to it and greets the remote side; without
/// one the peer tears its connection down.
#[derive(Debug)]
pub struct ConnectionInfo {
    pub peer_id: String,
    pub transport: Option<Transport>,
}

impl ConnectionInfo {
    pub fn connected(peer_id: impl Into<String>, transport: Transport) -> Self {
        Self {
            peer_id: peer_id.into(),
            transport: Some(transport),
        }
    }

    pub fn disconnected(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            transport: None,
        }
    }
}
