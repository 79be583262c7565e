//! Netron: a peer-to-peer distributed-object protocol.
//!
//! Any netron can expose local objects (contexts) and call objects exposed
//! by the netrons it is connected to, in both directions over one
//! connection. Object handles can cross several hops; a context proxified
//! by one peer into another is reachable from every peer connected there.
//!
//! ## Architecture
//!
//! - **Netron**: hub holding attached contexts, connected peers, tasks and events
//! - **RemotePeer**: one connection, client and server side at once
//! - **Interface**: caller-side proxy to a remote context
//! - **StubManager**: server-side registry binding definitions to instances
//! - **Packet / FrameDecoder**: length-prefixed binary framing
//! - **NetronNode**: TCP listener and dialer with an HMAC handshake

pub mod correlator;
pub mod handshake;
pub mod interface;
pub mod netron;
pub mod node;
pub mod packet;
pub mod peer;
pub mod reflection;
pub mod stub;
pub mod task;
pub mod transport;
pub mod value;

pub use interface::Interface;
pub use netron::{Netron, NetronEvent};
pub use node::{NetronNode, NodeConfig};
pub use packet::{Action, FrameDecoder, Packet};
pub use peer::{EventHandler, RemotePeer};
pub use reflection::{Context, Reflection};
pub use stub::{Stub, StubManager, StubTarget};
pub use task::{Task, TaskContext, TaskOutcome, TaskRequest, TaskResults};
pub use transport::{ConnectionInfo, Transport};
pub use value::{LocalContext, Value};
