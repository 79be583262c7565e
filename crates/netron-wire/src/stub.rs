//! Server-side stubs and their registry.
//!
//! A [`Stub`] binds a [`Definition`] to the object that serves it: either a
//! local context instance or an interface to a context owned by another peer
//! (a proxy stub). The [`StubManager`] hands out definition ids and keeps
//! track of which stubs belong to which peer connection, so everything a
//! peer caused to exist can be released when it disconnects.

use crate::interface::Interface;
use crate::value::{LocalContext, Value};
use netron_types::{DefId, Definition, NetronError, NetronResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// What a stub forwards calls to.
#[derive(Clone)]
pub enum StubTarget {
    /// A context living in this process.
    Local(LocalContext),
    /// A context owned by another peer, reached through its interface.
    Remote(Interface),
}

/// Server-side binding of a definition to its instance.
pub struct Stub {
    definition: Definition,
    target: StubTarget,
    bound_peer: Option<String>,
}

impl Stub {
    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    pub fn target(&self) -> &StubTarget {
        &self.target
    }

    /// Peer whose connection keeps this stub alive, if any.
    pub fn bound_peer(&self) -> Option<&str> {
        self.bound_peer.as_deref()
    }

    pub fn is_local(&self) -> bool {
        matches!(self.target, StubTarget::Local(_))
    }

    /// Target as a value: the context itself or its interface.
    pub fn instance(&self) -> Value {
        match &self.target {
            StubTarget::Local(ctx) => Value::Context(ctx.clone()),
            StubTarget::Remote(iface) => Value::Interface(iface.clone()),
        }
    }

    pub(crate) fn set_ctx_id(&mut self, ctx_id: &str) {
        self.definition.ctx_id = Some(ctx_id.to_string());
    }

    pub(crate) fn set_parent(&mut self, parent_id: Option<DefId>) {
        self.definition.parent_id = parent_id;
    }

    /// Call a method or read a property on the target.
    pub async fn get(&self, name: &str, data: Value) -> NetronResult<Value> {
        if self.definition.member(name).is_none() {
            return Err(NetronError::NotExists(format!("'{name}' not exists")));
        }
        match &self.target {
            StubTarget::Local(ctx) => ctx.get(name, data).await,
            StubTarget::Remote(iface) => iface.peer().get(iface.def_id(), name, data).await,
        }
    }

    /// Write a property or call a void method on the target.
    pub async fn set(&self, name: &str, data: Value) -> NetronResult<()> {
        let member = self
            .definition
            .member(name)
            .ok_or_else(|| NetronError::NotExists(format!("'{name}' not exists")))?;
        if member.is_readonly_property() {
            return Err(NetronError::InvalidAccess(format!(
                "'{name}' is not writable"
            )));
        }
        match &self.target {
            StubTarget::Local(ctx) => ctx.set(name, data).await,
            StubTarget::Remote(iface) => iface.peer().set(iface.def_id(), name, data).await,
        }
    }
}

#[derive(Default)]
struct StubState {
    stubs: HashMap<DefId, Arc<Stub>>,
    /// Stubs created on demand for contexts returned to a peer, by peer id.
    peer_stubs: HashMap<String, Vec<DefId>>,
}

/// Registry of all stubs exposed by one netron.
pub struct StubManager {
    owner: String,
    next_id: AtomicU64,
    state: RwLock<StubState>,
}

impl StubManager {
    /// Create a registry for the netron with peer id `owner`.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            next_id: AtomicU64::new(1),
            state: RwLock::new(StubState::default()),
        }
    }

    fn allocate_id(&self) -> DefId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Build a stub for a local context. The stub is not registered yet.
    pub fn create_stub(&self, ctx: LocalContext, bound_peer: Option<String>) -> NetronResult<Stub> {
        let reflection = ctx.reflection();
        reflection.validate()?;
        Ok(Stub {
            definition: reflection.to_definition(self.allocate_id(), &self.owner),
            target: StubTarget::Local(ctx),
            bound_peer,
        })
    }

    /// Build a proxy stub forwarding to `iface`. The stub is not registered
    /// yet and lives as long as the interface's peer stays connected.
    pub fn create_remote_stub(&self, iface: Interface) -> Stub {
        let source = iface.definition();
        let definition = Definition {
            id: self.allocate_id(),
            peer_id: self.owner.clone(),
            parent_id: None,
            ctx_id: None,
            name: source.name.clone(),
            description: source.description.clone(),
            schema: source.schema.clone(),
            origin: Default::default(),
        };
        let bound_peer = Some(iface.peer_id().to_string());
        Stub {
            definition,
            target: StubTarget::Remote(iface),
            bound_peer,
        }
    }

    /// Register a stub and return the shared handle.
    pub fn add_stub(&self, stub: Stub) -> Arc<Stub> {
        let stub = Arc::new(stub);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.stubs.insert(stub.definition.id, Arc::clone(&stub));
        stub
    }

    pub fn get_stub(&self, def_id: DefId) -> Option<Arc<Stub>> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .stubs
            .get(&def_id)
            .cloned()
    }

    /// Remove a stub. Returns it if it was registered.
    pub fn delete_stub(&self, def_id: DefId) -> Option<Arc<Stub>> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let removed = state.stubs.remove(&def_id);
        if removed.is_some() {
            for ids in state.peer_stubs.values_mut() {
                ids.retain(|id| *id != def_id);
            }
        }
        removed
    }

    /// Definition of the stub exposing `ctx` to `peer_id`, creating the stub
    /// on first use. The same instance always maps to the same definition.
    pub fn ref_stub(&self, peer_id: &str, ctx: &LocalContext) -> NetronResult<Definition> {
        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if let Some(ids) = state.peer_stubs.get(peer_id) {
                for id in ids {
                    if let Some(stub) = state.stubs.get(id) {
                        if let StubTarget::Local(existing) = &stub.target {
                            if existing.same_instance(ctx) {
                                return Ok(stub.definition.clone());
                            }
                        }
                    }
                }
            }
        }

        let stub = self.create_stub(ctx.clone(), Some(peer_id.to_string()))?;
        let definition = stub.definition.clone();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.stubs.insert(definition.id, Arc::new(stub));
        state
            .peer_stubs
            .entry(peer_id.to_string())
            .or_default()
            .push(definition.id);
        debug!(def_id = definition.id, peer = %peer_id, "netron: created context stub");
        Ok(definition)
    }

    /// Drop every stub serving the instance `ctx`.
    pub fn release_context(&self, ctx: &LocalContext) -> Vec<Arc<Stub>> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let ids: Vec<DefId> = state
            .stubs
            .iter()
            .filter(|(_, stub)| match &stub.target {
                StubTarget::Local(existing) => existing.same_instance(ctx),
                StubTarget::Remote(_) => false,
            })
            .map(|(id, _)| *id)
            .collect();
        let removed: Vec<Arc<Stub>> = ids.iter().filter_map(|id| state.stubs.remove(id)).collect();
        for list in state.peer_stubs.values_mut() {
            list.retain(|id| !ids.contains(id));
        }
        removed
    }

    /// Remove every stub bound to `peer_id`, returning the removed stubs.
    pub fn release_peer(&self, peer_id: &str) -> Vec<Arc<Stub>> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.peer_stubs.remove(peer_id);
        let ids: Vec<DefId> = state
            .stubs
            .iter()
            .filter(|(_, stub)| stub.bound_peer.as_deref() == Some(peer_id))
            .map(|(id, _)| *id)
            .collect();
        ids.iter().filter_map(|id| state.stubs.remove(id)).collect()
    }

    /// Number of registered stubs.
    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(|e| e.into_inner()).stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflection::{Context, Reflection};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Counter {
        value: Mutex<i64>,
    }

    #[async_trait]
    impl Context for Counter {
        fn reflection(&self) -> Reflection {
            Reflection::new("Counter")
                .method("increment")
                .property("step")
                .readonly("value")
        }

        async fn get(&self, name: &str, _args: Value) -> NetronResult<Value> {
            let mut value = self.value.lock().unwrap();
            match name {
                "increment" => {
                    *value += 1;
                    Ok(Value::from(*value))
                }
                _ => Ok(Value::from(*value)),
            }
        }

        async fn set(&self, _name: &str, _value: Value) -> NetronResult<()> {
            Ok(())
        }
    }

    struct Empty;

    #[async_trait]
    impl Context for Empty {
        fn reflection(&self) -> Reflection {
            Reflection::new("Empty")
        }

        async fn get(&self, _name: &str, _args: Value) -> NetronResult<Value> {
            Ok(Value::Null)
        }

        async fn set(&self, _name: &str, _value: Value) -> NetronResult<()> {
            Ok(())
        }
    }

    fn counter() -> LocalContext {
        LocalContext::new(Arc::new(Counter {
            value: Mutex::new(0),
        }))
    }

    #[tokio::test]
    async fn test_stub_access_control() {
        let manager = StubManager::new("node-a");
        let stub = manager.add_stub(manager.create_stub(counter(), None).unwrap());

        assert_eq!(stub.get("increment", Value::Null).await.unwrap(), Value::from(1));
        assert!(stub.set("step", Value::from(2)).await.is_ok());
        assert!(matches!(
            stub.set("value", Value::from(10)).await,
            Err(NetronError::InvalidAccess(_))
        ));
        assert!(matches!(
            stub.get("missing", Value::Null).await,
            Err(NetronError::NotExists(_))
        ));
        assert!(matches!(
            stub.set("missing", Value::Null).await,
            Err(NetronError::NotExists(_))
        ));
    }

    #[test]
    fn test_empty_context_rejected() {
        let manager = StubManager::new("node-a");
        let result = manager.create_stub(LocalContext::new(Arc::new(Empty)), None);
        assert!(matches!(result, Err(NetronError::NotValid(_))));
    }

    #[test]
    fn test_ref_stub_reuses_definition() {
        let manager = StubManager::new("node-a");
        let ctx = counter();
        let first = manager.ref_stub("peer-1", &ctx).unwrap();
        let again = manager.ref_stub("peer-1", &ctx).unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(first.peer_id, "node-a");

        let other_peer = manager.ref_stub("peer-2", &ctx).unwrap();
        assert_ne!(first.id, other_peer.id);

        let other_instance = manager.ref_stub("peer-1", &counter()).unwrap();
        assert_ne!(first.id, other_instance.id);
        assert_eq!(manager.len(), 3);
    }

    #[test]
    fn test_release_peer() {
        let manager = StubManager::new("node-a");
        let ctx = counter();
        manager.add_stub(manager.create_stub(ctx.clone(), None).unwrap());
        manager.ref_stub("peer-1", &ctx).unwrap();
        manager.ref_stub("peer-2", &ctx).unwrap();

        let released = manager.release_peer("peer-1");
        assert_eq!(released.len(), 1);
        assert_eq!(manager.len(), 2);

        let released = manager.release_context(&ctx);
        assert_eq!(released.len(), 2);
        assert!(manager.is_empty());
    }
}
