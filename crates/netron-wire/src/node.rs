//! NetronNode: TCP listener and dialer for a netron.
//!
//! A [`NetronNode`] binds a local TCP listener and accepts connections from
//! other netrons. It can also dial out. Every connection first completes the
//! authenticated handshake from [`crate::handshake`]; the socket is then
//! handed to [`Netron::connect`], which binds a [`RemotePeer`] to it and
//! greets the remote side.

use crate::handshake::{self, HandshakeMessage, PROTOCOL_VERSION};
use crate::netron::Netron;
use crate::peer::RemotePeer;
use crate::transport::Transport;
use netron_types::{NetronError, NetronResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration for a NetronNode.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address to bind the listener on.
    pub listen_addr: SocketAddr,
    /// Pre-shared key for HMAC-SHA256 authentication. Required.
    pub shared_secret: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            shared_secret: String::new(),
        }
    }
}

/// TCP front end of a netron.
pub struct NetronNode {
    netron: Netron,
    config: NodeConfig,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
}

impl NetronNode {
    /// Bind the listener and start accepting connections.
    pub async fn start(
        netron: Netron,
        config: NodeConfig,
    ) -> NetronResult<(Arc<Self>, JoinHandle<()>)> {
        if config.shared_secret.is_empty() {
            return Err(NetronError::Handshake(
                "a shared secret is required to accept connections".into(),
            ));
        }

        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, peer_id = %netron.id(), "netron: listening");

        let node = Arc::new(Self {
            netron,
            config,
            local_addr,
        });
        let accept_node = Arc::clone(&node);
        let handle = tokio::spawn(async move { accept_node.accept_loop(listener).await });
        Ok((node, handle))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn netron(&self) -> &Netron {
        &self.netron
    }

    /// Dial a remote node, authenticate, and connect the netrons.
    pub async fn connect(&self, addr: SocketAddr) -> NetronResult<Arc<RemotePeer>> {
        info!(addr = %addr, "netron: connecting");
        let mut stream = TcpStream::connect(addr).await?;

        let hello = HandshakeMessage::hello(self.netron.id(), &self.config.shared_secret)?;
        handshake::write_message(&mut stream, &hello).await?;

        let remote_id = match handshake::read_message(&mut stream).await? {
            HandshakeMessage::HelloAck {
                peer_id,
                protocol_version,
                nonce,
                auth_hmac,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(NetronError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }
                if !handshake::verify_identity(
                    &self.config.shared_secret,
                    &peer_id,
                    &nonce,
                    &auth_hmac,
                ) {
                    return Err(NetronError::Handshake(
                        "HMAC verification failed on handshake ack".into(),
                    ));
                }
                peer_id
            }
            HandshakeMessage::Error { code, message } => {
                return Err(NetronError::Handshake(format!("{code}: {message}")));
            }
            HandshakeMessage::Hello { .. } => {
                return Err(NetronError::Handshake(
                    "unexpected hello in response".into(),
                ));
            }
        };

        info!(addr = %addr, peer = %remote_id, "netron: handshake complete");
        self.netron
            .connect(&remote_id, Transport::from_stream(stream))
            .await
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(addr = %addr, "netron: accepted connection");
                    let node = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = node.handle_inbound(stream, addr).await {
                            debug!(addr = %addr, error = %e, "netron: inbound connection ended");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "netron: accept error");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Authenticate an inbound connection, then connect the netrons.
    async fn handle_inbound(&self, mut stream: TcpStream, addr: SocketAddr) -> NetronResult<()> {
        let remote_id = match handshake::read_message(&mut stream).await? {
            HandshakeMessage::Hello {
                peer_id,
                protocol_version,
                nonce,
                auth_hmac,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    let reply = HandshakeMessage::error(
                        handshake::CODE_VERSION,
                        format!(
                            "Protocol version mismatch: expected {PROTOCOL_VERSION}, got {protocol_version}"
                        ),
                    );
                    handshake::write_message(&mut stream, &reply).await?;
                    return Err(NetronError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }
                if !handshake::verify_identity(
                    &self.config.shared_secret,
                    &peer_id,
                    &nonce,
                    &auth_hmac,
                ) {
                    let reply = HandshakeMessage::error(
                        handshake::CODE_FORBIDDEN,
                        "HMAC authentication failed",
                    );
                    handshake::write_message(&mut stream, &reply).await?;
                    return Err(NetronError::Handshake(
                        "HMAC verification failed on incoming hello".into(),
                    ));
                }
                if peer_id == self.netron.id() || self.netron.get_peer(&peer_id).is_ok() {
                    let reply = HandshakeMessage::error(
                        handshake::CODE_CONFLICT,
                        format!("Peer '{peer_id}' already connected"),
                    );
                    handshake::write_message(&mut stream, &reply).await?;
                    return Err(NetronError::Exists(format!(
                        "Peer '{peer_id}' already connected"
                    )));
                }
                peer_id
            }
            _ => {
                warn!(addr = %addr, "netron: rejected connection without handshake");
                let reply = HandshakeMessage::error(
                    handshake::CODE_UNAUTHENTICATED,
                    "Authentication required: complete the handshake first",
                );
                handshake::write_message(&mut stream, &reply).await?;
                return Err(NetronError::Handshake(
                    "rejected unauthenticated connection".into(),
                ));
            }
        };

        let ack = HandshakeMessage::ack(self.netron.id(), &self.config.shared_secret)?;
        handshake::write_message(&mut stream, &ack).await?;
        info!(addr = %addr, peer = %remote_id, "netron: handshake accepted");

        self.netron
            .connect(&remote_id, Transport::from_stream(stream))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netron_types::NetronConfig;

    fn node_config(secret: &str) -> NodeConfig {
        NodeConfig {
            shared_secret: secret.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_requires_secret() {
        let netron = Netron::new(NetronConfig::with_peer_id("server"));
        let result = NetronNode::start(netron, NodeConfig::default()).await;
        assert!(matches!(result, Err(NetronError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_nodes_connect() {
        let server = Netron::new(NetronConfig::with_peer_id("server"));
        let (node1, _task1) = NetronNode::start(server.clone(), node_config("test-secret"))
            .await
            .unwrap();

        let client = Netron::new(NetronConfig::with_peer_id("client"));
        let (node2, _task2) = NetronNode::start(client.clone(), node_config("test-secret"))
            .await
            .unwrap();

        let peer = node2.connect(node1.local_addr()).await.unwrap();
        assert_eq!(peer.id(), "server");
        assert!(peer.connected_time().is_some());
        assert!(peer.remote_config().is_some());
        assert!(client.get_peer("server").is_ok());

        // Give the accept side a moment to finish its own greeting.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(server.get_peer("client").is_ok());
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let server = Netron::new(NetronConfig::with_peer_id("server"));
        let (node1, _task1) = NetronNode::start(server.clone(), node_config("right"))
            .await
            .unwrap();
        let client = Netron::new(NetronConfig::with_peer_id("client"));
        let (node2, _task2) = NetronNode::start(client.clone(), node_config("wrong"))
            .await
            .unwrap();

        match node2.connect(node1.local_addr()).await {
            Err(NetronError::Handshake(msg)) => assert!(msg.contains("403")),
            other => panic!("Expected handshake failure, got {other:?}"),
        }
        assert!(client.peers().is_empty());
    }

    #[tokio::test]
    async fn test_unauthenticated_connection_rejected() {
        let server = Netron::new(NetronConfig::with_peer_id("server"));
        let (node, _task) = NetronNode::start(server, node_config("secret"))
            .await
            .unwrap();

        let mut stream = TcpStream::connect(node.local_addr()).await.unwrap();
        let bogus = HandshakeMessage::error(0, "not a hello");
        handshake::write_message(&mut stream, &bogus).await.unwrap();

        match handshake::read_message(&mut stream).await.unwrap() {
            HandshakeMessage::Error { code, .. } => {
                assert_eq!(code, handshake::CODE_UNAUTHENTICATED)
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }
}
