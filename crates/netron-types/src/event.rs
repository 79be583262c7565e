//! Well-known netron event names.

/// A context was attached to a netron. Data: `{id, def}`.
pub const CONTEXT_ATTACH: &str = "context:attach";

/// A context was detached from a netron. Data: `{id, defId}`.
pub const CONTEXT_DETACH: &str = "context:detach";

/// A peer finished its greet protocol. Data: `{id}`.
pub const PEER_CONNECT: &str = "peer:connect";

/// A peer connection was torn down. Data: `{id}`.
pub const PEER_DISCONNECT: &str = "peer:disconnect";
