//! Client-side proxy to a remote context.

use crate::peer::RemotePeer;
use crate::value::Value;
use netron_types::{DefId, Definition, NetronResult};
use std::sync::Arc;

/// Callable handle to a context owned by a remote peer.
///
/// Interfaces are cached per definition id on their peer, so querying the
/// same context twice yields handles to the same definition.
#[derive(Clone)]
pub struct Interface {
    def: Arc<Definition>,
    peer: Arc<RemotePeer>,
}

impl Interface {
    pub(crate) fn new(def: Definition, peer: Arc<RemotePeer>) -> Self {
        Self {
            def: Arc::new(def),
            peer,
        }
    }

    pub fn def_id(&self) -> DefId {
        self.def.id
    }

    /// Definition snapshot this interface was built from.
    pub fn definition(&self) -> &Definition {
        &self.def
    }

    /// Id of the peer that owns the context.
    pub fn peer_id(&self) -> &str {
        self.peer.id()
    }

    pub fn peer(&self) -> &Arc<RemotePeer> {
        &self.peer
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.def.member(name).is_some_and(|m| m.method)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.def.member(name).is_some_and(|m| !m.method)
    }

    /// Call a method and wait for its result.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> NetronResult<Value> {
        self.peer.get(self.def.id, method, Value::List(args)).await
    }

    /// Call a method, waiting only for the acknowledgement.
    pub async fn call_void(&self, method: &str, args: Vec<Value>) -> NetronResult<()> {
        self.peer.set(self.def.id, method, Value::List(args)).await
    }

    /// Read a property.
    pub async fn get(&self, property: &str) -> NetronResult<Value> {
        self.peer.get(self.def.id, property, Value::Null).await
    }

    /// Read a property, with a default the remote side may fall back to.
    pub async fn get_or(&self, property: &str, default: Value) -> NetronResult<Value> {
        self.peer.get(self.def.id, property, default).await
    }

    /// Write a property.
    pub async fn set(&self, property: &str, value: impl Into<Value>) -> NetronResult<()> {
        self.peer.set(self.def.id, property, value.into()).await
    }
}

impl PartialEq for Interface {
    fn eq(&self, other: &Self) -> bool {
        self.def.id == other.def.id && self.peer.id() == other.peer.id()
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("def_id", &self.def.id)
            .field("name", &self.def.name)
            .field("peer_id", &self.peer.id())
            .finish()
    }
}
