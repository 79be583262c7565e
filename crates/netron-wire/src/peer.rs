//! RemotePeer: one live connection to another netron.
//!
//! A [`RemotePeer`] owns both directions of a connection. As a client it
//! turns interface calls into GET/SET/TASK requests and correlates their
//! responses. As a server it dispatches incoming requests to the local
//! netron's stubs and tasks. It also keeps the per-connection state: the
//! remote side's definitions, strongly-named contexts, proxified contexts,
//! cached interfaces, and event subscriptions in both directions.
//!
//! Requests are served concurrently, one spawned task per packet, so
//! responses may leave in any order. Relayed events are the exception: they
//! are delivered inline by the reader to keep their emission order.

use crate::correlator::{ResponseCorrelator, ResponseHandler};
use crate::interface::Interface;
use crate::netron::{Netron, NetronEvent};
use crate::packet::{self, Action, FrameDecoder, Packet};
use crate::reflection::Context;
use crate::task::{self, RemoteConfig, TaskOutcome, TaskRequest, TaskResults};
use crate::transport::{BoxedSink, BoxedSource, ConnectionInfo, Transport};
use crate::value::{LocalContext, Value};
use chrono::{DateTime, Utc};
use netron_types::{event, DefId, Definition, NetronError, NetronResult};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Read buffer size for the connection reader.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Handler for an event relayed by the remote side.
pub type EventHandler = Arc<dyn Fn(&Arc<RemotePeer>, &Value) + Send + Sync>;

fn same_handler(a: &EventHandler, b: &EventHandler) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[derive(Default)]
struct PeerState {
    /// Every definition received from the remote side, by id.
    defs: HashMap<DefId, Definition>,
    /// Strongly-named remote contexts.
    ctxid_defs: HashMap<String, DefId>,
    /// Local contexts proxified into the remote netron, with their stub ids.
    proxified_contexts: HashMap<String, DefId>,
    /// Interface cache, by definition id.
    interfaces: HashMap<DefId, Interface>,
    /// Handlers for events the remote side relays to us.
    remote_events: HashMap<String, Vec<EventHandler>>,
    /// Local events the remote side asked us to relay.
    remote_subscriptions: HashSet<String>,
    relay: Option<JoinHandle<()>>,
    /// Most recent outcome of each task we ran on the remote side.
    task_results: TaskResults,
}

/// A connection to a remote netron.
pub struct RemotePeer {
    id: String,
    netron: Netron,
    correlator: ResponseCorrelator,
    connected_time: RwLock<Option<DateTime<Utc>>>,
    writer: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    state: RwLock<PeerState>,
    contexts_changed: Notify,
}

impl RemotePeer {
    /// Create an unbound peer for the remote netron `id`.
    pub fn new(netron: Netron, id: impl Into<String>) -> Arc<Self> {
        let correlator = ResponseCorrelator::new(netron.config().response_timeout());
        Arc::new(Self {
            id: id.into(),
            netron,
            correlator,
            connected_time: RwLock::new(None),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            state: RwLock::new(PeerState::default()),
            contexts_changed: Notify::new(),
        })
    }

    /// Peer id of the remote netron.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn netron(&self) -> &Netron {
        &self.netron
    }

    /// When the current connection was bound.
    pub fn connected_time(&self) -> Option<DateTime<Utc>> {
        *self
            .connected_time
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Number of requests waiting for a response.
    pub fn active_requests(&self) -> usize {
        self.correlator.len()
    }

    // ---- Connection lifecycle ----

    /// Bind to a transport and greet the remote side, or tear the
    /// connection down when no transport is given.
    pub async fn update_connection_info(self: &Arc<Self>, info: ConnectionInfo) -> NetronResult<()> {
        if info.peer_id != self.id {
            return Err(NetronError::NotValid(format!(
                "Connection info for '{}' given to peer '{}'",
                info.peer_id, self.id
            )));
        }
        match info.transport {
            None => {
                self.disconnect();
                Ok(())
            }
            Some(transport) => {
                self.bind(transport)?;
                if let Err(e) = self.greet().await {
                    warn!(peer = %self.id, error = %e, "netron: greeting failed");
                    self.disconnect();
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    fn bind(self: &Arc<Self>, transport: Transport) -> NetronResult<()> {
        self.netron.register_peer(self)?;
        let Transport { source, sink } = transport;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(self.id.clone(), sink, rx));
        *self.writer.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        let peer = Arc::clone(self);
        let handle = tokio::spawn(async move { peer.read_loop(source).await });
        if let Some(old) = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            old.abort();
        }

        *self
            .connected_time
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        debug!(peer = %self.id, "netron: peer bound to transport");
        Ok(())
    }

    /// Learn the remote config and contexts, then follow context changes.
    async fn greet(self: &Arc<Self>) -> NetronResult<()> {
        self.run_task(vec![
            TaskRequest::new(task::GET_CONFIG),
            TaskRequest::new(task::GET_CONTEXT_DEFS),
        ])
        .await?;

        let on_attach: EventHandler =
            Arc::new(|peer: &Arc<RemotePeer>, data: &Value| peer.on_context_attach(data));
        let on_detach: EventHandler =
            Arc::new(|peer: &Arc<RemotePeer>, data: &Value| peer.on_context_detach(data));
        tokio::try_join!(
            self.subscribe(event::CONTEXT_ATTACH, on_attach),
            self.subscribe(event::CONTEXT_DETACH, on_detach),
        )?;

        info!(
            peer = %self.id,
            contexts = self.context_names().len(),
            "netron: peer connected"
        );
        self.netron.emit_special(
            event::PEER_CONNECT,
            Value::map([("id", Value::from(self.id.as_str()))]),
        );
        Ok(())
    }

    /// Tear the connection down.
    ///
    /// Releases every stub bound to this peer, clears all per-connection
    /// state and fails pending requests with `ConnectionClosed`. Calling it
    /// on an unbound peer does nothing.
    pub fn disconnect(self: &Arc<Self>) {
        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if writer.is_none() {
            return;
        }
        drop(writer);
        if let Some(reader) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            reader.abort();
        }

        self.netron.remove_peer(self);

        let old = std::mem::take(&mut *self.state.write().unwrap_or_else(|e| e.into_inner()));
        if let Some(relay) = &old.relay {
            relay.abort();
        }
        drop(old);

        self.correlator.reject_all(|| NetronError::ConnectionClosed);
        self.contexts_changed.notify_waiters();

        info!(peer = %self.id, "netron: peer disconnected");
        self.netron.emit_special(
            event::PEER_DISCONNECT,
            Value::map([("id", Value::from(self.id.as_str()))]),
        );
    }

    async fn read_loop(self: Arc<Self>, mut source: BoxedSource) {
        let mut decoder = FrameDecoder::new();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match source.read(&mut chunk).await {
                Ok(0) => {
                    debug!(peer = %self.id, "netron: connection closed by remote side");
                    break;
                }
                Ok(n) => {
                    for packet in decoder.feed(&chunk[..n]) {
                        self.dispatch(packet).await;
                    }
                }
                Err(e) => {
                    debug!(peer = %self.id, error = %e, "netron: read failed");
                    break;
                }
            }
        }
        self.disconnect();
    }

    async fn dispatch(self: &Arc<Self>, packet: Packet) {
        if !packet.impulse {
            let outcome = if packet.error {
                Err(response_error(packet.data))
            } else {
                Ok(packet.data)
            };
            self.correlator.resolve(packet.id, outcome);
            return;
        }

        if packet.action == Action::Task && TaskRequest::is_event_batch(&packet.data) {
            self.handle_request(packet).await;
            return;
        }

        let peer = Arc::clone(self);
        tokio::spawn(async move { peer.handle_request(packet).await });
    }

    // ---- Server side ----

    async fn handle_request(self: &Arc<Self>, mut packet: Packet) {
        let data = std::mem::take(&mut packet.data);
        let result = match packet.action {
            Action::Get => self.serve_get(data).await,
            Action::Set => self.serve_set(data).await.map(|()| Value::Null),
            Action::Task => self.serve_task(data).await,
        };

        let sent = match result {
            Ok(value) => self.send_response(&packet, value),
            Err(e) => {
                debug!(
                    peer = %self.id,
                    id = packet.id,
                    action = ?packet.action,
                    error = %e,
                    "netron: request failed"
                );
                self.send_error_response(&packet, &e)
            }
        };
        if let Err(e) = sent {
            warn!(peer = %self.id, id = packet.id, error = %e, "netron: failed to send response");
            if let Err(e) = self.send_error_response(&packet, &e) {
                warn!(peer = %self.id, error = %e, "netron: failed to send error response");
            }
        }
    }

    async fn serve_get(self: &Arc<Self>, data: Value) -> NetronResult<Value> {
        let (def_id, name, args) = parse_call(data)?;
        let stub = self.netron.stub(def_id)?;
        let args = self.netron.import_value(self, args, stub.is_local())?;
        let result = stub.get(&name, args).await?;
        self.netron.export_value(self, result, Some(def_id))
    }

    async fn serve_set(self: &Arc<Self>, data: Value) -> NetronResult<()> {
        let (def_id, name, value) = parse_call(data)?;
        let stub = self.netron.stub(def_id)?;
        let value = self.netron.import_value(self, value, stub.is_local())?;
        stub.set(&name, value).await
    }

    async fn serve_task(self: &Arc<Self>, data: Value) -> NetronResult<Value> {
        let requests = TaskRequest::parse_batch(data)?;
        let results = self.netron.run_task(self, requests).await;
        self.netron.export_value(self, results.into_value(), None)
    }

    // ---- Packet I/O ----

    /// Queue a packet on the connection. Without a connection this is a no-op.
    pub fn write(&self, packet: &Packet) -> NetronResult<()> {
        let frame = packet::encode_packet(packet)?;
        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let queued = match writer.as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        };
        if !queued {
            debug!(peer = %self.id, id = packet.id, "netron: no connection, packet dropped");
        }
        Ok(())
    }

    /// Send a request, registering `handler` for its response if given.
    pub fn send_request(
        &self,
        action: Action,
        data: Value,
        handler: Option<ResponseHandler>,
    ) -> NetronResult<u32> {
        let id = self.correlator.next_id();
        let expects_response = handler.is_some();
        if let Some(handler) = handler {
            self.correlator.register(id, handler);
        }
        if let Err(e) = self.write(&Packet::request(id, action, data)) {
            if expects_response {
                self.correlator.remove(id);
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Answer `request` with `data`.
    pub fn send_response(&self, request: &Packet, data: Value) -> NetronResult<()> {
        self.write(&Packet::response_to(request, data, false))
    }

    /// Answer `request` with an error envelope.
    pub fn send_error_response(&self, request: &Packet, err: &NetronError) -> NetronResult<()> {
        self.write(&Packet::response_to(
            request,
            Value::Error(err.to_remote()),
            true,
        ))
    }

    async fn request(&self, action: Action, data: Value) -> NetronResult<Value> {
        if !self.is_connected() {
            return Err(NetronError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.send_request(action, data, Some(tx))?;
        rx.await.map_err(|_| NetronError::ConnectionClosed)?
    }

    // ---- Client side: calls ----

    /// Call method `name` with `data` as its argument list, or read property
    /// `name` with `data` as the default value.
    pub async fn get(self: &Arc<Self>, def_id: DefId, name: &str, data: Value) -> NetronResult<Value> {
        let def = self.definition(def_id)?;
        if def.member(name).is_none() {
            return Err(NetronError::NotExists(format!("'{name}' not exists")));
        }
        let data = self.netron.export_value(self, data, None)?;
        let result = self
            .request(
                Action::Get,
                Value::List(vec![Value::from(def_id), Value::from(name), data]),
            )
            .await?;
        self.netron.import_value(self, result, false)
    }

    /// Write property `name`, or call method `name` ignoring its result.
    pub async fn set(self: &Arc<Self>, def_id: DefId, name: &str, data: Value) -> NetronResult<()> {
        let def = self.definition(def_id)?;
        let member = def
            .member(name)
            .ok_or_else(|| NetronError::NotExists(format!("'{name}' not exists")))?;
        if member.is_readonly_property() {
            return Err(NetronError::InvalidAccess(format!(
                "'{name}' is not writable"
            )));
        }
        let data = self.netron.export_value(self, data, None)?;
        self.request(
            Action::Set,
            Value::List(vec![Value::from(def_id), Value::from(name), data]),
        )
        .await?;
        Ok(())
    }

    pub async fn call(self: &Arc<Self>, def_id: DefId, method: &str, args: Vec<Value>) -> NetronResult<Value> {
        self.get(def_id, method, Value::List(args)).await
    }

    pub async fn call_void(self: &Arc<Self>, def_id: DefId, method: &str, args: Vec<Value>) -> NetronResult<()> {
        self.set(def_id, method, Value::List(args)).await
    }

    // ---- Client side: tasks ----

    /// Run a batch of tasks on the remote side.
    ///
    /// Individual task failures are reported in the returned results; only
    /// transport failures and malformed replies fail the call itself.
    pub async fn run_task(self: &Arc<Self>, tasks: Vec<TaskRequest>) -> NetronResult<TaskResults> {
        let reply = self
            .request(Action::Task, TaskRequest::batch_to_value(&tasks))
            .await?;
        let results = TaskResults::from_value(reply)?;
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            for (name, outcome) in results.iter() {
                state.task_results.insert(name.clone(), outcome.clone());
            }
        }
        for (name, outcome) in results.iter() {
            self.on_task_result(name, outcome);
        }
        Ok(results)
    }

    /// Most recent outcome of `task` run on the remote side.
    pub fn get_task_result(&self, task: &str) -> Option<TaskOutcome> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .task_results
            .get(task)
            .cloned()
    }

    /// Remote config learned while greeting.
    pub fn remote_config(&self) -> Option<RemoteConfig> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .task_results
            .result(task::GET_CONFIG)
            .and_then(RemoteConfig::from_value)
    }

    fn on_task_result(&self, name: &str, outcome: &TaskOutcome) {
        if name == task::GET_CONTEXT_DEFS {
            if let TaskOutcome::Result(defs) = outcome {
                self.update_strong_definitions(defs);
            }
        }
    }

    // ---- Client side: events ----

    /// Register `handler` for a remote event. The remote side is asked to
    /// relay the event only when the first handler for it is added; if that
    /// request fails the handler is not kept.
    pub async fn subscribe(self: &Arc<Self>, event: &str, handler: EventHandler) -> NetronResult<()> {
        let first = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let handlers = state.remote_events.entry(event.to_string()).or_default();
            handlers.push(Arc::clone(&handler));
            handlers.len() == 1
        };
        if first {
            if let Err(e) = self.run_single_task(task::SUBSCRIBE, event).await {
                self.remove_handler(event, &handler);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove `handler`. The remote side stops relaying the event once its
    /// last handler is gone; if that request fails the handler is restored.
    pub async fn unsubscribe(self: &Arc<Self>, event: &str, handler: &EventHandler) -> NetronResult<()> {
        let (removed, empty) = self.remove_handler(event, handler);
        if removed && empty {
            if let Err(e) = self.run_single_task(task::UNSUBSCRIBE, event).await {
                if self.is_connected() {
                    self.state
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .remote_events
                        .entry(event.to_string())
                        .or_default()
                        .push(Arc::clone(handler));
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Run one event-management task and surface its own outcome.
    async fn run_single_task(self: &Arc<Self>, name: &str, event: &str) -> NetronResult<Value> {
        self.run_task(vec![TaskRequest::with_args(name, vec![Value::from(event)])])
            .await?
            .take(name)
    }

    /// Drop `handler` from `event`. Returns whether it was registered and
    /// whether the event has no handlers left.
    fn remove_handler(&self, event: &str, handler: &EventHandler) -> (bool, bool) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let Some(handlers) = state.remote_events.get_mut(event) else {
            return (false, false);
        };
        let before = handlers.len();
        handlers.retain(|h| !same_handler(h, handler));
        let removed = handlers.len() < before;
        let empty = handlers.is_empty();
        if empty {
            state.remote_events.remove(event);
        }
        (removed, empty)
    }

    /// Number of handlers registered for a remote event.
    pub fn event_handler_count(&self, event: &str) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .remote_events
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Run the handlers registered for a relayed event, in registration order.
    pub(crate) fn deliver_remote_event(self: &Arc<Self>, event: &str, data: &Value) {
        let handlers = self
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .remote_events
            .get(event)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            let delivered = catch_unwind(AssertUnwindSafe(|| handler(self, data)));
            if delivered.is_err() {
                warn!(peer = %self.id, event = %event, "netron: event handler panicked");
            }
        }
    }

    // ---- Server side: event relay ----

    /// Start relaying local event `event` to the remote side.
    pub(crate) fn add_remote_subscription(self: &Arc<Self>, event: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.remote_subscriptions.insert(event.to_string());
        if state.relay.is_none() {
            let rx = self.netron.subscribe_events();
            let peer = Arc::downgrade(self);
            state.relay = Some(tokio::spawn(relay_loop(peer, rx)));
        }
    }

    /// Stop relaying local event `event` to the remote side.
    pub(crate) fn remove_remote_subscription(&self, event: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.remote_subscriptions.remove(event);
        if state.remote_subscriptions.is_empty() {
            if let Some(relay) = state.relay.take() {
                relay.abort();
            }
        }
    }

    /// Local events currently relayed to the remote side.
    pub fn remote_subscriptions(&self) -> Vec<String> {
        let mut events: Vec<String> = self
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .remote_subscriptions
            .iter()
            .cloned()
            .collect();
        events.sort();
        events
    }

    fn relay_event(self: &Arc<Self>, event: NetronEvent) {
        let subscribed = self
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .remote_subscriptions
            .contains(&event.name);
        if !subscribed {
            return;
        }
        let data = match self.netron.export_value(self, event.data, None) {
            Ok(data) => data,
            Err(e) => {
                warn!(peer = %self.id, event = %event.name, error = %e, "netron: cannot relay event");
                return;
            }
        };
        let batch = TaskRequest::batch_to_value(&[TaskRequest::with_args(
            task::EMIT_EVENT,
            vec![Value::from(event.name.as_str()), data],
        )]);
        if let Err(e) = self.send_request(Action::Task, batch, None) {
            warn!(peer = %self.id, event = %event.name, error = %e, "netron: cannot relay event");
        }
    }

    // ---- Definitions and interfaces ----

    /// Definition received from the remote side.
    pub fn definition(&self, def_id: DefId) -> NetronResult<Definition> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .defs
            .get(&def_id)
            .cloned()
            .ok_or_else(|| {
                NetronError::NotExists(format!("Definition with id '{def_id}' not exists"))
            })
    }

    /// Record a definition sent by the remote side and return its interface.
    pub(crate) fn register_definition(self: &Arc<Self>, def: Definition) -> Interface {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(iface) = state.interfaces.get(&def.id) {
            return iface.clone();
        }
        let def = state.defs.entry(def.id).or_insert(def).clone();
        let iface = Interface::new(def, Arc::clone(self));
        state.interfaces.insert(iface.def_id(), iface.clone());
        iface
    }

    /// Mark a remote definition as re-exposed through local stub `proxy_def`.
    pub(crate) fn mark_proxied(&self, def_id: DefId, proxy_def: Definition) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(def) = state.defs.get_mut(&def_id) {
            def.set_remote(proxy_def);
        }
    }

    /// Local proxy definition re-exposing remote definition `def_id`.
    pub(crate) fn proxy_definition(&self, def_id: DefId) -> Option<Definition> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .defs
            .get(&def_id)
            .and_then(Definition::proxy_def)
            .cloned()
    }

    /// Interface to the remote context attached under `ctx_id`.
    pub fn query_interface(self: &Arc<Self>, ctx_id: &str) -> NetronResult<Interface> {
        let def = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            state
                .ctxid_defs
                .get(ctx_id)
                .and_then(|id| state.defs.get(id))
                .cloned()
        }
        .ok_or_else(|| NetronError::NotExists(format!("Context '{ctx_id}' not exists")))?;
        Ok(self.register_definition(def))
    }

    /// Interface to a definition already received from the remote side.
    pub fn query_interface_by_definition(self: &Arc<Self>, def_id: DefId) -> NetronResult<Interface> {
        let def = self.definition(def_id)?;
        Ok(self.register_definition(def))
    }

    /// Drop the cached interface for `def_id`. Definitions of weak contexts
    /// are forgotten too, so later calls through the interface fail.
    pub fn release_interface(&self, def_id: DefId) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.interfaces.remove(&def_id);
        let strong = state.ctxid_defs.values().any(|id| *id == def_id);
        if !strong {
            state.defs.remove(&def_id);
        }
    }

    pub fn has_context(&self, ctx_id: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .ctxid_defs
            .contains_key(ctx_id)
    }

    pub fn has_contexts(&self) -> bool {
        !self
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .ctxid_defs
            .is_empty()
    }

    /// Ids of the remote side's attached contexts, sorted.
    pub fn context_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .ctxid_defs
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Wait until the remote side has a context attached under `ctx_id`.
    pub async fn wait_for_context(&self, ctx_id: &str) {
        loop {
            let changed = self.contexts_changed.notified();
            if self.has_context(ctx_id) {
                return;
            }
            changed.await;
        }
    }

    fn update_strong_definitions(&self, defs: &Value) {
        let Some(map) = defs.as_map() else {
            warn!(peer = %self.id, "netron: context definitions are not a map");
            return;
        };
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            for (ctx_id, def) in map {
                match def.as_definition() {
                    Some(def) => insert_strong(&mut state, ctx_id, def.clone()),
                    None => warn!(peer = %self.id, ctx_id = %ctx_id, "netron: skipping malformed context definition"),
                }
            }
        }
        self.contexts_changed.notify_waiters();
    }

    fn on_context_attach(&self, data: &Value) {
        let ctx_id = data.get("id").and_then(Value::as_str);
        let def = data.get("def").and_then(Value::as_definition);
        match (ctx_id, def) {
            (Some(ctx_id), Some(def)) => {
                debug!(peer = %self.id, ctx_id = %ctx_id, "netron: remote context attached");
                let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                insert_strong(&mut state, ctx_id, def.clone());
            }
            _ => {
                warn!(peer = %self.id, "netron: malformed context attach event");
                return;
            }
        }
        self.contexts_changed.notify_waiters();
    }

    fn on_context_detach(&self, data: &Value) {
        let Some(ctx_id) = data.get("id").and_then(Value::as_str) else {
            warn!(peer = %self.id, "netron: malformed context detach event");
            return;
        };
        debug!(peer = %self.id, ctx_id = %ctx_id, "netron: remote context detached");
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let def_id = state
            .ctxid_defs
            .remove(ctx_id)
            .or_else(|| data.get("defId").and_then(Value::as_u64));
        if let Some(def_id) = def_id {
            state.defs.remove(&def_id);
            state.interfaces.remove(&def_id);
        }
    }

    // ---- Context proxification ----

    fn require_proxify(&self) -> NetronResult<()> {
        match self.remote_config() {
            Some(config) if config.proxify_contexts => Ok(()),
            _ => Err(NetronError::NotSupported(format!(
                "Context proxification is not supported by peer '{}'",
                self.id
            ))),
        }
    }

    /// Attach a local context to the remote netron under `ctx_id` (or its
    /// reflected name). Returns the remote proxy stub's definition id.
    pub async fn attach_context(
        self: &Arc<Self>,
        ctx: Arc<dyn Context>,
        ctx_id: Option<&str>,
    ) -> NetronResult<DefId> {
        self.require_proxify()?;
        let stubs = self.netron.stub_manager();
        let stub = stubs.create_stub(LocalContext::new(ctx), Some(self.id.clone()))?;
        let ctx_id = ctx_id.unwrap_or(&stub.definition().name).to_string();
        let def = stub.definition().clone();
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if state.proxified_contexts.contains_key(&ctx_id) {
                return Err(NetronError::Exists(format!(
                    "Context '{ctx_id}' already proxified on the peer '{}' side",
                    self.id
                )));
            }
            state.proxified_contexts.insert(ctx_id.clone(), def.id);
        }
        stubs.add_stub(stub);

        let outcome = self
            .run_task(vec![TaskRequest::with_args(
                task::PROXIFY_CONTEXT,
                vec![Value::from(ctx_id.as_str()), Value::from(def.clone())],
            )])
            .await
            .and_then(|mut results| results.take(task::PROXIFY_CONTEXT));
        match outcome {
            Ok(remote_id) => remote_id.as_u64().ok_or_else(|| {
                NetronError::NotValid(format!("Not valid definition id: {}", remote_id.type_name()))
            }),
            Err(e) => {
                self.forget_proxified(&ctx_id);
                Err(e)
            }
        }
    }

    fn forget_proxified(&self, ctx_id: &str) -> Option<DefId> {
        let def_id = self
            .state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .proxified_contexts
            .remove(ctx_id)?;
        self.netron.stub_manager().delete_stub(def_id);
        Some(def_id)
    }

    /// Detach a context previously attached with [`attach_context`].
    ///
    /// [`attach_context`]: RemotePeer::attach_context
    pub async fn detach_context(self: &Arc<Self>, ctx_id: &str, release_originated: bool) -> NetronResult<DefId> {
        self.require_proxify()?;
        if self.forget_proxified(ctx_id).is_none() {
            return Err(NetronError::NotExists(format!(
                "Context '{ctx_id}' not proxified on the peer '{}' side",
                self.id
            )));
        }
        let mut results = self
            .run_task(vec![TaskRequest::with_args(
                task::DEPROXIFY_CONTEXT,
                vec![Value::from(ctx_id), Value::from(release_originated)],
            )])
            .await?;
        let remote_id = results.take(task::DEPROXIFY_CONTEXT)?;
        remote_id.as_u64().ok_or_else(|| {
            NetronError::NotValid(format!("Not valid definition id: {}", remote_id.type_name()))
        })
    }

    /// Detach every context proxified into the remote netron.
    pub async fn detach_all_contexts(self: &Arc<Self>, release_originated: bool) -> NetronResult<()> {
        let ctx_ids: Vec<String> = self
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .proxified_contexts
            .keys()
            .cloned()
            .collect();
        for ctx_id in ctx_ids {
            self.detach_context(&ctx_id, release_originated).await?;
        }
        Ok(())
    }

    /// Ids of local contexts proxified into the remote netron, sorted.
    pub fn proxified_contexts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .proxified_contexts
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for RemotePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePeer")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn insert_strong(state: &mut PeerState, ctx_id: &str, mut def: Definition) {
    def.ctx_id = Some(ctx_id.to_string());
    let def_id = def.id;
    if let Some(old) = state.ctxid_defs.insert(ctx_id.to_string(), def_id) {
        if old != def_id {
            state.defs.remove(&old);
            state.interfaces.remove(&old);
        }
    }
    state.defs.insert(def_id, def);
}

/// Split a GET/SET payload `[defId, name, data]`.
fn parse_call(data: Value) -> NetronResult<(DefId, String, Value)> {
    let mut items = match data {
        Value::List(items) if items.len() == 3 => items.into_iter(),
        other => {
            return Err(NetronError::NotValid(format!(
                "Not valid request payload: {}",
                other.type_name()
            )))
        }
    };
    match (items.next(), items.next(), items.next()) {
        (Some(def_id), Some(Value::String(name)), Some(data)) => {
            let def_id = def_id.as_u64().ok_or_else(|| {
                NetronError::NotValid("Not valid definition id".to_string())
            })?;
            Ok((def_id, name, data))
        }
        _ => Err(NetronError::NotValid("Not valid request payload".to_string())),
    }
}

/// Error carried by an error response.
fn response_error(data: Value) -> NetronError {
    match data {
        Value::Error(err) => err.into_error(),
        other => NetronError::Remote {
            message: format!("Malformed error response: {}", other.type_name()),
            stack: None,
        },
    }
}

async fn write_loop(peer_id: String, mut sink: BoxedSink, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.write_all(&frame).await {
            debug!(peer = %peer_id, error = %e, "netron: write failed");
            return;
        }
        if let Err(e) = sink.flush().await {
            debug!(peer = %peer_id, error = %e, "netron: flush failed");
            return;
        }
    }
    let _ = sink.shutdown().await;
}

async fn relay_loop(peer: std::sync::Weak<RemotePeer>, mut rx: broadcast::Receiver<NetronEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match peer.upgrade() {
                Some(peer) => peer.relay_event(event),
                None => break,
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "netron: event relay lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
