//! The netron hub: local contexts, connected peers, tasks and events.
//!
//! A [`Netron`] is a cheap cloneable handle. It owns the stub registry that
//! serves local contexts, the registry of connected [`RemotePeer`]s, the
//! task table and a broadcast bus for netron events. It also implements the
//! value conversion applied at every hop: outgoing local objects become
//! definitions, outgoing handles to the receiver's own objects become
//! references, and incoming definitions become interfaces.

use crate::interface::Interface;
use crate::peer::RemotePeer;
use crate::reflection::Context;
use crate::stub::{Stub, StubManager, StubTarget};
use crate::task::{self, FnTask, Task, TaskContext, TaskOutcome, TaskRequest, TaskResults};
use crate::transport::{ConnectionInfo, Transport};
use crate::value::{LocalContext, Value};
use futures::future::join_all;
use netron_types::{
    event, DefId, Definition, NetronConfig, NetronError, NetronResult, Reference,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the event bus before slow subscribers start lagging.
const EVENT_BUS_CAPACITY: usize = 1024;

/// An event emitted by a netron.
#[derive(Debug, Clone)]
pub struct NetronEvent {
    pub name: String,
    pub data: Value,
}

struct NetronInner {
    config: NetronConfig,
    stubs: StubManager,
    peers: RwLock<HashMap<String, Arc<RemotePeer>>>,
    /// Attached contexts: ctx id to stub definition id.
    contexts: RwLock<HashMap<String, DefId>>,
    tasks: RwLock<HashMap<String, Arc<dyn Task>>>,
    events: broadcast::Sender<NetronEvent>,
}

/// Handle to a netron instance.
#[derive(Clone)]
pub struct Netron {
    inner: Arc<NetronInner>,
}

impl Netron {
    /// Create a netron with the built-in tasks registered.
    pub fn new(config: NetronConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let tasks = task::builtin_tasks()
            .into_iter()
            .map(|(name, task)| (name.to_string(), task))
            .collect();
        info!(peer_id = %config.peer_id, "netron: created");
        Self {
            inner: Arc::new(NetronInner {
                stubs: StubManager::new(config.peer_id.clone()),
                config,
                peers: RwLock::new(HashMap::new()),
                contexts: RwLock::new(HashMap::new()),
                tasks: RwLock::new(tasks),
                events,
            }),
        }
    }

    /// This netron's peer id.
    pub fn id(&self) -> &str {
        &self.inner.config.peer_id
    }

    pub fn config(&self) -> &NetronConfig {
        &self.inner.config
    }

    pub fn stub_manager(&self) -> &StubManager {
        &self.inner.stubs
    }

    // ---- Events ----

    /// Subscribe to every event this netron emits from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<NetronEvent> {
        self.inner.events.subscribe()
    }

    /// Emit an event to local subscribers and relaying peers.
    pub fn emit_special(&self, name: &str, data: Value) {
        debug!(event = %name, "netron: emitting event");
        // No receivers is fine.
        let _ = self.inner.events.send(NetronEvent {
            name: name.to_string(),
            data,
        });
    }

    // ---- Peers ----

    /// Register a peer. Fails with `Exists` if its id is taken.
    pub fn add_peer(&self, peer: Arc<RemotePeer>) -> NetronResult<()> {
        let mut peers = self.inner.peers.write().unwrap_or_else(|e| e.into_inner());
        if peers.contains_key(peer.id()) {
            return Err(NetronError::Exists(format!(
                "Peer '{}' already connected",
                peer.id()
            )));
        }
        peers.insert(peer.id().to_string(), peer);
        Ok(())
    }

    /// Register `peer` unless this very peer is registered already.
    pub(crate) fn register_peer(&self, peer: &Arc<RemotePeer>) -> NetronResult<()> {
        let registered = self
            .inner
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer.id())
            .is_some_and(|p| Arc::ptr_eq(p, peer));
        if registered {
            return Ok(());
        }
        self.add_peer(Arc::clone(peer))
    }

    /// Unregister a peer. Returns it if it was registered.
    pub fn delete_peer(&self, peer_id: &str) -> Option<Arc<RemotePeer>> {
        self.inner
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id)
    }

    pub fn get_peer(&self, peer_id: &str) -> NetronResult<Arc<RemotePeer>> {
        self.inner
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .cloned()
            .ok_or_else(|| NetronError::NotExists(format!("Peer '{peer_id}' not exists")))
    }

    /// All registered peers.
    pub fn peers(&self) -> Vec<Arc<RemotePeer>> {
        self.inner
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Connect to the netron `peer_id` over `transport` and greet it.
    pub async fn connect(&self, peer_id: &str, transport: Transport) -> NetronResult<Arc<RemotePeer>> {
        if self.get_peer(peer_id).is_ok() {
            return Err(NetronError::Exists(format!(
                "Peer '{peer_id}' already connected"
            )));
        }
        let peer = RemotePeer::new(self.clone(), peer_id);
        peer.update_connection_info(ConnectionInfo::connected(peer_id, transport))
            .await?;
        Ok(peer)
    }

    /// Tear down the connection to `peer_id`.
    pub fn disconnect(&self, peer_id: &str) -> NetronResult<()> {
        self.get_peer(peer_id)?.disconnect();
        Ok(())
    }

    /// Forget a disconnecting peer and everything it kept alive.
    pub(crate) fn remove_peer(&self, peer: &Arc<RemotePeer>) {
        {
            let mut peers = self.inner.peers.write().unwrap_or_else(|e| e.into_inner());
            if peers.get(peer.id()).is_some_and(|p| Arc::ptr_eq(p, peer)) {
                peers.remove(peer.id());
            }
        }
        self.release_peer(peer.id());
    }

    /// Release the stubs bound to `peer_id`, detaching the contexts that
    /// peer had proxified here.
    fn release_peer(&self, peer_id: &str) {
        let released: Vec<DefId> = self
            .inner
            .stubs
            .release_peer(peer_id)
            .iter()
            .map(|stub| stub.definition().id)
            .collect();
        if released.is_empty() {
            return;
        }
        let detached: Vec<(String, DefId)> = {
            let mut contexts = self.inner.contexts.write().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = contexts
                .iter()
                .filter(|(_, def_id)| released.contains(def_id))
                .map(|(ctx_id, _)| ctx_id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|ctx_id| contexts.remove(&ctx_id).map(|def_id| (ctx_id, def_id)))
                .collect()
        };
        debug!(
            peer = %peer_id,
            stubs = released.len(),
            contexts = detached.len(),
            "netron: released peer stubs"
        );
        for (ctx_id, def_id) in detached {
            self.emit_detach(&ctx_id, def_id);
        }
    }

    // ---- Contexts ----

    /// Attach a local context under `ctx_id`, or its reflected name.
    pub fn attach_context(&self, ctx: Arc<dyn Context>, ctx_id: Option<&str>) -> NetronResult<DefId> {
        let ctx = LocalContext::new(ctx);
        let reflection = ctx.reflection();
        reflection.validate()?;
        let ctx_id = ctx_id.unwrap_or(reflection.name()).to_string();
        if self.has_context(&ctx_id) {
            return Err(NetronError::Exists(format!(
                "Context '{ctx_id}' already attached"
            )));
        }
        let stub = self.inner.stubs.create_stub(ctx, None)?;
        self.attach_stub(&ctx_id, stub)
    }

    /// Attach a context owned by a remote peer, served through a proxy stub.
    pub(crate) fn attach_remote_context(&self, ctx_id: &str, iface: Interface) -> NetronResult<DefId> {
        let stub = self.inner.stubs.create_remote_stub(iface);
        self.attach_stub(ctx_id, stub)
    }

    fn attach_stub(&self, ctx_id: &str, mut stub: Stub) -> NetronResult<DefId> {
        stub.set_ctx_id(ctx_id);
        let def = stub.definition().clone();
        {
            let mut contexts = self.inner.contexts.write().unwrap_or_else(|e| e.into_inner());
            if contexts.contains_key(ctx_id) {
                return Err(NetronError::Exists(format!(
                    "Context '{ctx_id}' already attached"
                )));
            }
            contexts.insert(ctx_id.to_string(), def.id);
        }
        self.inner.stubs.add_stub(stub);
        info!(ctx_id = %ctx_id, def_id = def.id, "netron: context attached");
        self.emit_special(
            event::CONTEXT_ATTACH,
            Value::map([("id", Value::from(ctx_id)), ("def", Value::from(def.clone()))]),
        );
        Ok(def.id)
    }

    /// Detach the context `ctx_id`. With `release_originated`, a proxied
    /// context also drops its interface on the owning peer.
    pub fn detach_context(&self, ctx_id: &str, release_originated: bool) -> NetronResult<DefId> {
        let def_id = self
            .inner
            .contexts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(ctx_id)
            .ok_or_else(|| NetronError::NotExists(format!("Context '{ctx_id}' not exists")))?;
        if let Some(stub) = self.inner.stubs.delete_stub(def_id) {
            if release_originated {
                if let StubTarget::Remote(iface) = stub.target() {
                    iface.peer().release_interface(iface.def_id());
                }
            }
        }
        info!(ctx_id = %ctx_id, def_id, "netron: context detached");
        self.emit_detach(ctx_id, def_id);
        Ok(def_id)
    }

    /// Detach every attached context.
    pub fn detach_all_contexts(&self) {
        for ctx_id in self.context_names() {
            if let Err(e) = self.detach_context(&ctx_id, false) {
                debug!(ctx_id = %ctx_id, error = %e, "netron: context already detached");
            }
        }
    }

    fn emit_detach(&self, ctx_id: &str, def_id: DefId) {
        self.emit_special(
            event::CONTEXT_DETACH,
            Value::map([("id", Value::from(ctx_id)), ("defId", Value::from(def_id))]),
        );
    }

    pub fn has_context(&self, ctx_id: &str) -> bool {
        self.inner
            .contexts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(ctx_id)
    }

    pub fn has_contexts(&self) -> bool {
        !self
            .inner
            .contexts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Ids of attached contexts, sorted.
    pub fn context_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .contexts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Stub serving the attached context `ctx_id`.
    pub fn context_stub(&self, ctx_id: &str) -> Option<Arc<Stub>> {
        let def_id = *self
            .inner
            .contexts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(ctx_id)?;
        self.inner.stubs.get_stub(def_id)
    }

    /// Definitions of all attached contexts, by ctx id.
    pub fn context_definitions(&self) -> BTreeMap<String, Definition> {
        let contexts = self.inner.contexts.read().unwrap_or_else(|e| e.into_inner());
        contexts
            .iter()
            .filter_map(|(ctx_id, def_id)| {
                self.inner
                    .stubs
                    .get_stub(*def_id)
                    .map(|stub| (ctx_id.clone(), stub.definition().clone()))
            })
            .collect()
    }

    /// Definition exposing the context instance `ctx` to `peer_id`.
    pub fn ref_context(&self, peer_id: &str, ctx: &LocalContext) -> NetronResult<Definition> {
        self.inner.stubs.ref_stub(peer_id, ctx)
    }

    /// Drop every stub serving the context instance `ctx`.
    pub fn release_context(&self, ctx: &LocalContext) {
        let released = self.inner.stubs.release_context(ctx);
        debug!(stubs = released.len(), "netron: context released");
    }

    /// The instance behind a reference to one of our stubs.
    pub fn resolve_reference(&self, reference: &Reference) -> NetronResult<Value> {
        Ok(self.stub(reference.def_id)?.instance())
    }

    pub(crate) fn stub(&self, def_id: DefId) -> NetronResult<Arc<Stub>> {
        self.inner.stubs.get_stub(def_id).ok_or_else(|| {
            NetronError::NotExists(format!("Stub with definition id '{def_id}' not exists"))
        })
    }

    // ---- Tasks ----

    /// Register a task. Fails with `Exists` if the name is taken.
    pub fn add_task(&self, name: &str, task: Arc<dyn Task>) -> NetronResult<()> {
        let mut tasks = self.inner.tasks.write().unwrap_or_else(|e| e.into_inner());
        if tasks.contains_key(name) {
            return Err(NetronError::Exists(format!("Task '{name}' already exists")));
        }
        tasks.insert(name.to_string(), task);
        Ok(())
    }

    /// Register a synchronous closure as a task.
    pub fn add_fn_task<F>(&self, name: &str, f: F) -> NetronResult<()>
    where
        F: Fn(TaskContext) -> NetronResult<Value> + Send + Sync + 'static,
    {
        self.add_task(name, Arc::new(FnTask(f)))
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.inner
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Names of registered tasks, sorted.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Run a batch of tasks on behalf of `peer`, concurrently.
    pub async fn run_task(&self, peer: &Arc<RemotePeer>, requests: Vec<TaskRequest>) -> TaskResults {
        let mut results = TaskResults::new();
        let mut running = Vec::new();
        for request in requests {
            let found = self
                .inner
                .tasks
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&request.task)
                .cloned();
            match found {
                Some(task) => {
                    let ctx = TaskContext {
                        netron: self.clone(),
                        peer: Arc::clone(peer),
                        args: request.args,
                    };
                    let name = request.task;
                    running.push(async move { (name, task.run(ctx).await) });
                }
                None => {
                    debug!(task = %request.task, peer = %peer.id(), "netron: unknown task");
                    results.insert(request.task.as_str(), task::missing_task(&request.task));
                }
            }
        }
        for (name, outcome) in join_all(running).await {
            results.insert(name, TaskOutcome::from(outcome));
        }
        results
    }

    // ---- Value conversion ----

    /// Convert a value received from `source`.
    ///
    /// Definitions become interfaces. With `resolve_refs`, references are
    /// resolved to the local instances they point at; otherwise they are
    /// left for the caller.
    pub(crate) fn import_value(
        &self,
        source: &Arc<RemotePeer>,
        value: Value,
        resolve_refs: bool,
    ) -> NetronResult<Value> {
        match value {
            Value::Definition(def) => Ok(Value::Interface(source.register_definition(*def))),
            Value::Reference(reference) if resolve_refs => self.resolve_reference(&reference),
            Value::List(items) => items
                .into_iter()
                .map(|v| self.import_value(source, v, resolve_refs))
                .collect::<NetronResult<Vec<_>>>()
                .map(Value::List),
            Value::Map(map) => map
                .into_iter()
                .map(|(k, v)| self.import_value(source, v, resolve_refs).map(|v| (k, v)))
                .collect::<NetronResult<BTreeMap<_, _>>>()
                .map(Value::Map),
            other => Ok(other),
        }
    }

    /// Convert a value about to be sent to `target`.
    ///
    /// Local contexts become definitions of stubs bound to `target`.
    /// Interfaces to `target`'s own contexts become references; interfaces
    /// to a third peer's contexts become definitions of proxy stubs, created
    /// once per remote definition with `parent` as their parent. References
    /// to our own stubs are rewritten the same way as the stub's instance.
    pub(crate) fn export_value(
        &self,
        target: &Arc<RemotePeer>,
        value: Value,
        parent: Option<DefId>,
    ) -> NetronResult<Value> {
        match value {
            Value::Context(ctx) => Ok(Value::from(self.ref_context(target.id(), &ctx)?)),
            Value::Interface(iface) => self.export_interface(target, &iface, parent),
            Value::Reference(reference) => match self.inner.stubs.get_stub(reference.def_id) {
                Some(stub) => match stub.target() {
                    StubTarget::Local(ctx) => Ok(Value::from(self.ref_context(target.id(), ctx)?)),
                    StubTarget::Remote(iface) if iface.peer_id() == target.id() => {
                        Ok(Value::Reference(Reference::new(iface.def_id())))
                    }
                    StubTarget::Remote(_) => Ok(Value::from(stub.definition().clone())),
                },
                None => Ok(Value::Reference(reference)),
            },
            Value::List(items) => items
                .into_iter()
                .map(|v| self.export_value(target, v, parent))
                .collect::<NetronResult<Vec<_>>>()
                .map(Value::List),
            Value::Map(map) => map
                .into_iter()
                .map(|(k, v)| self.export_value(target, v, parent).map(|v| (k, v)))
                .collect::<NetronResult<BTreeMap<_, _>>>()
                .map(Value::Map),
            other => Ok(other),
        }
    }

    fn export_interface(
        &self,
        target: &Arc<RemotePeer>,
        iface: &Interface,
        parent: Option<DefId>,
    ) -> NetronResult<Value> {
        if iface.peer_id() == target.id() {
            return Ok(Value::Reference(Reference::new(iface.def_id())));
        }
        let owner = iface.peer();
        if let Some(proxy) = owner.proxy_definition(iface.def_id()) {
            if self.inner.stubs.get_stub(proxy.id).is_some() {
                return Ok(Value::from(proxy));
            }
        }
        let mut stub = self.inner.stubs.create_remote_stub(iface.clone());
        stub.set_parent(parent);
        let def = stub.definition().clone();
        self.inner.stubs.add_stub(stub);
        owner.mark_proxied(iface.def_id(), def.clone());
        debug!(
            def_id = def.id,
            owner = %owner.id(),
            target = %target.id(),
            "netron: created proxy stub"
        );
        Ok(Value::from(def))
    }
}

impl std::fmt::Debug for Netron {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Netron").field("id", &self.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflection::Reflection;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Context for Echo {
        fn reflection(&self) -> Reflection {
            Reflection::new("Echo").method("echo")
        }

        async fn get(&self, _name: &str, args: Value) -> NetronResult<Value> {
            Ok(args.into_args().into_iter().next().unwrap_or_default())
        }

        async fn set(&self, _name: &str, _value: Value) -> NetronResult<()> {
            Ok(())
        }
    }

    fn netron() -> Netron {
        Netron::new(NetronConfig::with_peer_id("local"))
    }

    #[test]
    fn test_attach_and_detach_context() {
        let netron = netron();
        let mut events = netron.subscribe_events();

        let def_id = netron.attach_context(Arc::new(Echo), None).unwrap();
        assert!(netron.has_context("Echo"));
        assert!(matches!(
            netron.attach_context(Arc::new(Echo), None),
            Err(NetronError::Exists(_))
        ));
        netron.attach_context(Arc::new(Echo), Some("echo2")).unwrap();
        assert_eq!(netron.context_names(), vec!["Echo", "echo2"]);

        let defs = netron.context_definitions();
        assert_eq!(defs["Echo"].id, def_id);
        assert_eq!(defs["Echo"].ctx_id.as_deref(), Some("Echo"));
        assert_eq!(defs["Echo"].peer_id, "local");

        assert_eq!(netron.detach_context("Echo", false).unwrap(), def_id);
        assert!(matches!(
            netron.detach_context("Echo", false),
            Err(NetronError::NotExists(_))
        ));
        netron.detach_all_contexts();
        assert!(!netron.has_contexts());
        assert!(netron.stub_manager().is_empty());

        let names: Vec<String> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.name)
            .collect();
        assert_eq!(
            names,
            vec![
                event::CONTEXT_ATTACH,
                event::CONTEXT_ATTACH,
                event::CONTEXT_DETACH,
                event::CONTEXT_DETACH
            ]
        );
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let netron = netron();
        assert!(netron.has_task(task::GET_CONFIG));
        assert!(matches!(
            netron.add_fn_task(task::GET_CONFIG, |_| Ok(Value::Null)),
            Err(NetronError::Exists(_))
        ));
        netron.add_fn_task("topaz", |_| Ok(Value::from("gem"))).unwrap();
        assert!(netron.task_names().contains(&"topaz".to_string()));
    }

    #[test]
    fn test_peer_registry() {
        let netron = netron();
        let peer = RemotePeer::new(netron.clone(), "remote");
        netron.add_peer(Arc::clone(&peer)).unwrap();
        assert!(matches!(
            netron.add_peer(RemotePeer::new(netron.clone(), "remote")),
            Err(NetronError::Exists(_))
        ));
        assert!(netron.register_peer(&peer).is_ok());
        assert_eq!(netron.get_peer("remote").unwrap().id(), "remote");
        assert!(netron.delete_peer("remote").is_some());
        assert!(matches!(
            netron.get_peer("remote"),
            Err(NetronError::NotExists(_))
        ));
    }

    #[tokio::test]
    async fn test_run_task_reports_unknown_and_failing_tasks() {
        let netron = netron();
        netron
            .add_fn_task("boom", |_| Err(NetronError::NotValid("bad input".into())))
            .unwrap();
        netron
            .add_fn_task("sum", |ctx| {
                let total: i64 = ctx.args.iter().filter_map(Value::as_i64).sum();
                Ok(Value::from(total))
            })
            .unwrap();
        let peer = RemotePeer::new(netron.clone(), "remote");

        let results = netron
            .run_task(
                &peer,
                vec![
                    TaskRequest::with_args("sum", vec![1.into(), 2.into()]),
                    TaskRequest::new("boom"),
                    TaskRequest::new("topaz"),
                ],
            )
            .await;
        assert_eq!(results.len(), 3);
        assert_eq!(results.result("sum"), Some(&Value::from(3)));
        assert_eq!(
            results.error("boom").map(|e| e.kind),
            Some(netron_types::ErrorKind::NotValid)
        );
        assert_eq!(
            results.error("topaz").map(|e| e.kind),
            Some(netron_types::ErrorKind::NotExists)
        );
    }

    #[tokio::test]
    async fn test_export_and_resolve_local_context() {
        let netron = netron();
        let peer = RemotePeer::new(netron.clone(), "remote");
        let echo: Arc<dyn Context> = Arc::new(Echo);

        let exported = netron
            .export_value(&peer, Value::List(vec![Value::context(Arc::clone(&echo))]), None)
            .unwrap();
        let def = exported.as_list().unwrap()[0].as_definition().unwrap().clone();
        assert_eq!(def.peer_id, "local");
        assert_eq!(def.name, "Echo");

        let again = netron.export_value(&peer, Value::context(Arc::clone(&echo)), None).unwrap();
        assert_eq!(again.as_definition().map(|d| d.id), Some(def.id));

        let resolved = netron
            .import_value(&peer, Value::Reference(Reference::new(def.id)), true)
            .unwrap();
        assert!(resolved
            .as_context()
            .is_some_and(|c| c.same_instance(&LocalContext::new(echo))));

        assert!(matches!(
            netron.import_value(&peer, Value::Reference(Reference::new(999)), true),
            Err(NetronError::NotExists(_))
        ));
        assert_eq!(
            netron
                .import_value(&peer, Value::Reference(Reference::new(999)), false)
                .unwrap(),
            Value::Reference(Reference::new(999))
        );
    }
}
