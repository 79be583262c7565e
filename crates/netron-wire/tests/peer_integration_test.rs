//! Integration tests for connected netrons.
//!
//! Every test wires two or three real netrons together over in-process
//! duplex streams and drives them through their public API: greeting,
//! calls, tasks, events, object graphs that point back at the caller,
//! context proxification across three peers, timeouts and teardown.

use async_trait::async_trait;
use netron_types::{event, NetronConfig, NetronError, NetronResult, Reference};
use netron_wire::task::{GET_CONFIG, GET_CONTEXT_DEFS, SUBSCRIBE, UNSUBSCRIBE};
use netron_wire::transport::BoxedSink;
use netron_wire::{
    Action, ConnectionInfo, Context, EventHandler, FrameDecoder, LocalContext, Netron, Packet,
    Reflection, RemotePeer, TaskRequest, Transport, Value,
};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as PollContext, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;

// ---------------------------------------------------------------------------
// Test contexts
// ---------------------------------------------------------------------------

struct Storage {
    name: Mutex<String>,
    docs: Mutex<HashMap<String, Arc<dyn Context>>>,
}

impl Storage {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            name: Mutex::new("netron".to_string()),
            docs: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl Context for Storage {
    fn reflection(&self) -> Reflection {
        Reflection::new("Storage")
            .description("Document storage")
            .property("name")
            .readonly("size")
            .typed_method("echo", "Object", &[("value", "Object")])
            .method("delay")
            .method("fail")
            .method("getDoc")
    }

    async fn get(&self, name: &str, args: Value) -> NetronResult<Value> {
        match name {
            "name" => Ok(Value::from(self.name.lock().unwrap().clone())),
            "size" => Ok(Value::from(42)),
            "echo" => Ok(args.into_args().into_iter().next().unwrap_or_default()),
            "delay" => {
                let args = args.into_args();
                let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(args.get(1).cloned().unwrap_or_default())
            }
            "fail" => match args.into_args().first().and_then(Value::as_str) {
                Some("generic") => Err(NetronError::Remote {
                    message: "Hello World!".to_string(),
                    stack: Some("at Storage::fail".to_string()),
                }),
                Some("exists") => Err(NetronError::Exists("already there".to_string())),
                _ => Err(NetronError::NotExists("no such thing".to_string())),
            },
            "getDoc" => {
                let title = args
                    .into_args()
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or("untitled")
                    .to_string();
                let doc = self
                    .docs
                    .lock()
                    .unwrap()
                    .entry(title.clone())
                    .or_insert_with(|| Arc::new(Document { title }) as Arc<dyn Context>)
                    .clone();
                Ok(Value::context(doc))
            }
            _ => Ok(Value::Null),
        }
    }

    async fn set(&self, name: &str, value: Value) -> NetronResult<()> {
        if name == "name" {
            if let Some(s) = value.as_str() {
                *self.name.lock().unwrap() = s.to_string();
            }
        }
        Ok(())
    }
}

struct Document {
    title: String,
}

#[async_trait]
impl Context for Document {
    fn reflection(&self) -> Reflection {
        Reflection::new("Document").readonly("title")
    }

    async fn get(&self, _name: &str, _args: Value) -> NetronResult<Value> {
        Ok(Value::from(self.title.as_str()))
    }

    async fn set(&self, _name: &str, _value: Value) -> NetronResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Hub {
    partner: Mutex<Value>,
}

#[async_trait]
impl Context for Hub {
    fn reflection(&self) -> Reflection {
        Reflection::new("Hub")
            .method("setPartner")
            .method("getPartner")
            .method("isContext")
    }

    async fn get(&self, name: &str, args: Value) -> NetronResult<Value> {
        match name {
            "getPartner" => Ok(self.partner.lock().unwrap().clone()),
            "isContext" => Ok(Value::from(
                args.into_args()
                    .first()
                    .is_some_and(|v| v.as_context().is_some()),
            )),
            _ => Ok(Value::Null),
        }
    }

    async fn set(&self, name: &str, value: Value) -> NetronResult<()> {
        if name == "setPartner" {
            *self.partner.lock().unwrap() = value.into_args().into_iter().next().unwrap_or_default();
        }
        Ok(())
    }
}

struct Partner {
    partner: Value,
}

#[async_trait]
impl Context for Partner {
    fn reflection(&self) -> Reflection {
        Reflection::new("Partner").readonly("partner")
    }

    async fn get(&self, _name: &str, _args: Value) -> NetronResult<Value> {
        Ok(self.partner.clone())
    }

    async fn set(&self, _name: &str, _value: Value) -> NetronResult<()> {
        Ok(())
    }
}

struct Calc;

#[async_trait]
impl Context for Calc {
    fn reflection(&self) -> Reflection {
        Reflection::new("Calc")
            .typed_method("add", "Number", &[("a", "Number"), ("b", "Number")])
            .method("applyTwice")
    }

    async fn get(&self, name: &str, args: Value) -> NetronResult<Value> {
        let args = args.into_args();
        match name {
            "add" => Ok(Value::from(
                args.iter().filter_map(Value::as_i64).sum::<i64>(),
            )),
            "applyTwice" => {
                let func = args
                    .first()
                    .and_then(Value::as_interface)
                    .cloned()
                    .ok_or_else(|| NetronError::NotValid("expected an interface".into()))?;
                let x = args.get(1).cloned().unwrap_or_default();
                let once = func.call("run", vec![x]).await?;
                func.call("run", vec![once]).await
            }
            _ => Ok(Value::Null),
        }
    }

    async fn set(&self, _name: &str, _value: Value) -> NetronResult<()> {
        Ok(())
    }
}

struct Doubler;

#[async_trait]
impl Context for Doubler {
    fn reflection(&self) -> Reflection {
        Reflection::new("Doubler").method("run")
    }

    async fn get(&self, _name: &str, args: Value) -> NetronResult<Value> {
        let x = args.into_args().first().and_then(Value::as_i64).unwrap_or(0);
        Ok(Value::from(x * 2))
    }

    async fn set(&self, _name: &str, _value: Value) -> NetronResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("netron_wire=debug"))
        .with_test_writer()
        .try_init();
}

fn config(peer_id: &str) -> NetronConfig {
    NetronConfig::with_peer_id(peer_id)
}

fn proxifying_config(peer_id: &str) -> NetronConfig {
    NetronConfig {
        proxify_contexts: true,
        ..NetronConfig::with_peer_id(peer_id)
    }
}

/// Connect two netrons; returns (a's peer for b, b's peer for a).
async fn connect_pair(a: &Netron, b: &Netron) -> (Arc<RemotePeer>, Arc<RemotePeer>) {
    let (ta, tb) = Transport::pair(64 * 1024);
    let (pa, pb) = tokio::join!(a.connect(b.id(), ta), b.connect(a.id(), tb));
    (pa.unwrap(), pb.unwrap())
}

/// Write half that records every packet passing through it.
struct OutboundTap {
    inner: BoxedSink,
    decoder: FrameDecoder,
    seen: Arc<Mutex<Vec<Packet>>>,
}

impl AsyncWrite for OutboundTap {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut PollContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &polled {
            let packets = this.decoder.feed(&buf[..*n]);
            this.seen.lock().unwrap().extend(packets);
        }
        polled
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Like [`connect_pair`], also recording every packet `a` sends.
async fn connect_tapped(
    a: &Netron,
    b: &Netron,
) -> (Arc<RemotePeer>, Arc<RemotePeer>, Arc<Mutex<Vec<Packet>>>) {
    let (ta, tb) = Transport::pair(64 * 1024);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let tap = OutboundTap {
        inner: ta.sink,
        decoder: FrameDecoder::new(),
        seen: Arc::clone(&seen),
    };
    let ta = Transport::new(ta.source, tap);
    let (pa, pb) = tokio::join!(a.connect(b.id(), ta), b.connect(a.id(), tb));
    (pa.unwrap(), pb.unwrap(), seen)
}

/// Number of `task` requests for `event` among recorded packets.
fn task_requests(seen: &Mutex<Vec<Packet>>, task: &str, event: &str) -> usize {
    seen.lock()
        .unwrap()
        .iter()
        .filter(|p| p.impulse && p.action == Action::Task)
        .filter_map(|p| TaskRequest::parse_batch(p.data.clone()).ok())
        .flatten()
        .filter(|r| r.task == task && r.args.first().and_then(Value::as_str) == Some(event))
        .count()
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

async fn storage_pair() -> (Netron, Netron, Arc<RemotePeer>) {
    init_tracing();
    let server = Netron::new(config("server"));
    server
        .attach_context(Storage::new(), Some("storage"))
        .unwrap();
    let client = Netron::new(config("client"));
    let (to_server, _) = connect_pair(&client, &server).await;
    (server, client, to_server)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_greeting_learns_config_and_contexts() {
    init_tracing();
    let server = Netron::new(proxifying_config("server"));
    server
        .attach_context(Storage::new(), Some("storage"))
        .unwrap();
    let mut events = server.subscribe_events();

    let client = Netron::new(config("client"));
    let (to_server, to_client) = connect_pair(&client, &server).await;

    assert_eq!(to_server.context_names(), vec!["storage"]);
    assert!(to_server.has_contexts());
    assert!(!to_client.has_contexts());
    assert!(to_server.remote_config().unwrap().proxify_contexts);
    assert!(!to_client.remote_config().unwrap().proxify_contexts);
    assert!(to_server.get_task_result(GET_CONTEXT_DEFS).is_some());
    assert!(to_server.connected_time().is_some());

    assert!(server.get_peer("client").is_ok());
    assert!(client.get_peer("server").is_ok());
    assert_eq!(
        to_client.remote_subscriptions(),
        vec![event::CONTEXT_ATTACH, event::CONTEXT_DETACH]
    );

    let connected = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let ev = events.recv().await.unwrap();
            if ev.name == event::PEER_CONNECT {
                return ev;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(connected.data.get("id").and_then(Value::as_str), Some("client"));

    let def = to_server.query_interface("storage").unwrap();
    assert_eq!(def.definition().name, "Storage");
    assert_eq!(def.definition().ctx_id.as_deref(), Some("storage"));
    assert_eq!(
        to_server.query_interface("storage").unwrap().def_id(),
        def.def_id()
    );
    assert!(matches!(
        to_server.query_interface("nope"),
        Err(NetronError::NotExists(_))
    ));
}

#[tokio::test]
async fn test_get_set_and_call() {
    let (_server, _client, to_server) = storage_pair().await;
    let storage = to_server.query_interface("storage").unwrap();

    assert_eq!(storage.get("name").await.unwrap(), Value::from("netron"));
    storage.set("name", "renamed").await.unwrap();
    assert_eq!(storage.get("name").await.unwrap(), Value::from("renamed"));
    assert_eq!(storage.get("size").await.unwrap(), Value::from(42));

    let payload = Value::map([
        ("list", Value::List(vec![1.into(), 2.5.into(), Value::Null])),
        ("bytes", Value::Bytes(vec![0, 1, 255])),
    ]);
    assert_eq!(
        storage.call("echo", vec![payload.clone()]).await.unwrap(),
        payload
    );
    storage.call_void("echo", vec![Value::from(1)]).await.unwrap();
    assert_eq!(to_server.active_requests(), 0);
}

#[tokio::test]
async fn test_access_checks_on_both_sides() {
    let (_server, _client, to_server) = storage_pair().await;
    let storage = to_server.query_interface("storage").unwrap();

    // Caught before anything is sent.
    assert!(matches!(
        storage.set("size", 1).await,
        Err(NetronError::InvalidAccess(_))
    ));
    assert!(matches!(
        storage.call("missing", vec![]).await,
        Err(NetronError::NotExists(_))
    ));
    assert!(matches!(
        to_server.get(9999, "name", Value::Null).await,
        Err(NetronError::NotExists(_))
    ));

    // Enforced again by the serving side.
    let (tx, rx) = oneshot::channel();
    to_server
        .send_request(
            Action::Set,
            Value::List(vec![storage.def_id().into(), "size".into(), 1.into()]),
            Some(tx),
        )
        .unwrap();
    assert!(matches!(
        rx.await.unwrap(),
        Err(NetronError::InvalidAccess(_))
    ));

    let (tx, rx) = oneshot::channel();
    to_server
        .send_request(
            Action::Get,
            Value::List(vec![storage.def_id().into(), "missing".into(), Value::Null]),
            Some(tx),
        )
        .unwrap();
    assert!(matches!(rx.await.unwrap(), Err(NetronError::NotExists(_))));

    let (tx, rx) = oneshot::channel();
    to_server
        .send_request(
            Action::Get,
            Value::List(vec![Value::from(9999), "name".into(), Value::Null]),
            Some(tx),
        )
        .unwrap();
    assert!(matches!(rx.await.unwrap(), Err(NetronError::NotExists(_))));
}

#[tokio::test]
async fn test_remote_errors_keep_their_kind() {
    let (_server, _client, to_server) = storage_pair().await;
    let storage = to_server.query_interface("storage").unwrap();

    match storage.call("fail", vec!["generic".into()]).await {
        Err(NetronError::Remote { message, stack }) => {
            assert_eq!(message, "Hello World!");
            assert_eq!(stack.as_deref(), Some("at Storage::fail"));
        }
        other => panic!("Expected Remote, got {other:?}"),
    }
    assert!(matches!(
        storage.call("fail", vec!["exists".into()]).await,
        Err(NetronError::Exists(_))
    ));
    assert!(matches!(
        storage.call("fail", vec!["other".into()]).await,
        Err(NetronError::NotExists(_))
    ));
}

#[tokio::test]
async fn test_concurrent_calls_resolve_out_of_order() {
    let (_server, _client, to_server) = storage_pair().await;
    let storage = to_server.query_interface("storage").unwrap();

    let (slow, fast) = tokio::join!(
        storage.call("delay", vec![300.into(), "slow".into()]),
        storage.call("delay", vec![10.into(), "fast".into()]),
    );
    assert_eq!(slow.unwrap(), Value::from("slow"));
    assert_eq!(fast.unwrap(), Value::from("fast"));
}

#[tokio::test]
async fn test_returned_contexts_become_interfaces() {
    let (server, _client, to_server) = storage_pair().await;
    let storage = to_server.query_interface("storage").unwrap();
    let stubs_before = server.stub_manager().len();

    let doc = storage.call("getDoc", vec!["readme".into()]).await.unwrap();
    let doc = doc.as_interface().cloned().unwrap();
    assert_eq!(doc.peer_id(), "server");
    assert!(doc.has_property("title"));
    assert_eq!(doc.get("title").await.unwrap(), Value::from("readme"));

    // Same instance, same definition.
    let again = storage.call("getDoc", vec!["readme".into()]).await.unwrap();
    assert_eq!(again.as_interface().map(|i| i.def_id()), Some(doc.def_id()));
    assert_eq!(server.stub_manager().len(), stubs_before + 1);

    // Released weak interfaces can no longer be called.
    to_server.release_interface(doc.def_id());
    assert!(matches!(
        doc.get("title").await,
        Err(NetronError::NotExists(_))
    ));
}

#[tokio::test]
async fn test_tasks() {
    let (server, _client, to_server) = storage_pair().await;
    server
        .add_fn_task("sum", |ctx| {
            Ok(Value::from(
                ctx.args.iter().filter_map(Value::as_i64).sum::<i64>(),
            ))
        })
        .unwrap();

    let results = to_server
        .run_task(vec![
            TaskRequest::new(GET_CONFIG),
            TaskRequest::new("topaz"),
            TaskRequest::with_args("sum", vec![1.into(), 2.into(), 3.into()]),
        ])
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results.result("sum"), Some(&Value::from(6)));
    assert!(results
        .result(GET_CONFIG)
        .and_then(|c| c.get("responseTimeout"))
        .is_some());
    assert_eq!(
        results.error("topaz").map(|e| e.message.as_str()),
        Some("Task 'topaz' not exists")
    );
    assert!(to_server.get_task_result("sum").is_some());
}

#[tokio::test]
async fn test_event_subscriptions_are_coalesced() {
    init_tracing();
    let server = Netron::new(config("server"));
    let client = Netron::new(config("client"));
    let (to_server, to_client, sent) = connect_tapped(&client, &server).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let first_sink = Arc::clone(&seen);
    let first: EventHandler = Arc::new(move |_peer: &Arc<RemotePeer>, data: &Value| {
        first_sink.lock().unwrap().push(("first", data.clone()));
    });
    let second_sink = Arc::clone(&seen);
    let second: EventHandler = Arc::new(move |_peer: &Arc<RemotePeer>, data: &Value| {
        second_sink.lock().unwrap().push(("second", data.clone()));
    });
    let third: EventHandler = Arc::new(|_peer: &Arc<RemotePeer>, _data: &Value| {});

    to_server.subscribe("custom", Arc::clone(&first)).await.unwrap();
    to_server.subscribe("custom", Arc::clone(&second)).await.unwrap();
    to_server.subscribe("custom", Arc::clone(&third)).await.unwrap();
    assert_eq!(to_server.event_handler_count("custom"), 3);
    assert_eq!(task_requests(&sent, SUBSCRIBE, "custom"), 1);
    assert!(to_client.remote_subscriptions().contains(&"custom".to_string()));

    server.emit_special("custom", Value::from(7));
    eventually("both handlers", || seen.lock().unwrap().len() == 2).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![("first", Value::from(7)), ("second", Value::from(7))]
    );

    to_server.unsubscribe("custom", &first).await.unwrap();
    to_server.unsubscribe("custom", &third).await.unwrap();
    assert_eq!(task_requests(&sent, UNSUBSCRIBE, "custom"), 0);
    assert!(to_client.remote_subscriptions().contains(&"custom".to_string()));

    to_server.unsubscribe("custom", &second).await.unwrap();
    assert_eq!(task_requests(&sent, UNSUBSCRIBE, "custom"), 1);
    assert!(!to_client.remote_subscriptions().contains(&"custom".to_string()));
    assert_eq!(to_server.event_handler_count("custom"), 0);

    // Removing a handler twice sends nothing more.
    to_server.unsubscribe("custom", &second).await.unwrap();
    assert_eq!(task_requests(&sent, UNSUBSCRIBE, "custom"), 1);
    assert_eq!(task_requests(&sent, SUBSCRIBE, "custom"), 1);
}

#[tokio::test]
async fn test_panicking_handler_keeps_connection() {
    let (server, _client, to_server) = storage_pair().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let faulty: EventHandler = Arc::new(|_peer: &Arc<RemotePeer>, _data: &Value| {
        panic!("handler failure");
    });
    let healthy: EventHandler = Arc::new(move |_peer: &Arc<RemotePeer>, data: &Value| {
        sink.lock().unwrap().push(data.as_i64().unwrap_or(-1));
    });
    to_server.subscribe("tick", faulty).await.unwrap();
    to_server.subscribe("tick", healthy).await.unwrap();

    server.emit_special("tick", Value::from(1));
    server.emit_special("tick", Value::from(2));
    eventually("both ticks", || seen.lock().unwrap().len() == 2).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);

    assert!(to_server.is_connected());
    let storage = to_server.query_interface("storage").unwrap();
    assert_eq!(
        storage.call("echo", vec![5.into()]).await.unwrap(),
        Value::from(5)
    );
}

#[tokio::test]
async fn test_relayed_events_keep_their_order() {
    let (server, _client, to_server) = storage_pair().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: EventHandler = Arc::new(move |_peer: &Arc<RemotePeer>, data: &Value| {
        sink.lock().unwrap().push(data.as_i64().unwrap_or(-1));
    });
    to_server.subscribe("tick", handler).await.unwrap();

    for i in 0..100 {
        server.emit_special("tick", Value::from(i));
    }
    eventually("all ticks", || seen.lock().unwrap().len() == 100).await;
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, (0..100).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_context_changes_follow_the_remote_side() {
    let (server, _client, to_server) = storage_pair().await;

    server.attach_context(Arc::new(Calc), Some("calc")).unwrap();
    tokio::time::timeout(Duration::from_secs(5), to_server.wait_for_context("calc"))
        .await
        .unwrap();
    let calc = to_server.query_interface("calc").unwrap();
    assert_eq!(
        calc.call("add", vec![2.into(), 3.into()]).await.unwrap(),
        Value::from(5)
    );

    server.detach_context("calc", false).unwrap();
    eventually("calc detached", || !to_server.has_context("calc")).await;
    assert!(matches!(
        calc.call("add", vec![]).await,
        Err(NetronError::NotExists(_))
    ));
}

#[tokio::test]
async fn test_object_graph_pointing_back_resolves_to_references() {
    init_tracing();
    let server = Netron::new(config("server"));
    let hub = Arc::new(Hub::default());
    let hub_ctx: Arc<dyn Context> = hub.clone();
    let hub_def = server.attach_context(Arc::clone(&hub_ctx), Some("hub")).unwrap();

    let client = Netron::new(config("client"));
    let (to_server, _) = connect_pair(&client, &server).await;
    let ihub = to_server.query_interface("hub").unwrap();

    // The client hands the server an object that points back at the hub.
    let partner: Arc<dyn Context> = Arc::new(Partner {
        partner: Value::Interface(ihub.clone()),
    });
    ihub.call_void("setPartner", vec![Value::context(Arc::clone(&partner))])
        .await
        .unwrap();

    // Server side: the stored argument is an interface to the client object.
    let iface_b = hub.partner.lock().unwrap().as_interface().cloned().unwrap();
    assert_eq!(iface_b.peer_id(), "client");

    // Reading B's partner yields a reference to the server's own hub.
    let back = iface_b.get("partner").await.unwrap();
    assert_eq!(back, Value::Reference(Reference::new(hub_def)));
    let resolved = server.resolve_reference(back.as_reference().unwrap()).unwrap();
    assert!(resolved
        .as_context()
        .is_some_and(|c| c.same_instance(&LocalContext::new(Arc::clone(&hub_ctx)))));

    // Client side: the hub hands back the client's own object by reference.
    let mine = ihub.call("getPartner", vec![]).await.unwrap();
    let resolved = client.resolve_reference(mine.as_reference().unwrap()).unwrap();
    assert!(resolved
        .as_context()
        .is_some_and(|c| c.same_instance(&LocalContext::new(partner))));

    // Passing the hub's own interface back arrives as the local instance.
    assert_eq!(
        ihub.call("isContext", vec![Value::Interface(ihub.clone())])
            .await
            .unwrap(),
        Value::from(true)
    );
}

#[tokio::test]
async fn test_context_proxification_across_three_peers() {
    init_tracing();
    let server = Netron::new(proxifying_config("server"));
    let owner = Netron::new(config("owner"));
    let (owner_to_server, server_to_owner) = connect_pair(&owner, &server).await;

    let remote_def = owner_to_server
        .attach_context(Arc::new(Calc), Some("calc"))
        .await
        .unwrap();
    assert!(server.has_context("calc"));
    assert_eq!(
        server.context_stub("calc").map(|s| s.definition().id),
        Some(remote_def)
    );
    assert_eq!(owner_to_server.proxified_contexts(), vec!["calc"]);
    assert!(matches!(
        owner_to_server.attach_context(Arc::new(Calc), Some("calc")).await,
        Err(NetronError::Exists(_))
    ));
    // The owner does not accept proxified contexts itself.
    assert!(matches!(
        server_to_owner.attach_context(Arc::new(Calc), None).await,
        Err(NetronError::NotSupported(_))
    ));

    let user = Netron::new(config("user"));
    let (user_to_server, _) = connect_pair(&user, &server).await;
    let calc = user_to_server.query_interface("calc").unwrap();
    assert_eq!(calc.definition().peer_id, "server");
    assert_eq!(
        calc.call("add", vec![2.into(), 3.into()]).await.unwrap(),
        Value::from(5)
    );

    // An object of the user travels user -> server -> owner and is called back.
    let doubled = calc
        .call("applyTwice", vec![Value::context(Arc::new(Doubler)), 3.into()])
        .await
        .unwrap();
    assert_eq!(doubled, Value::from(12));

    owner_to_server.detach_context("calc", false).await.unwrap();
    assert!(!server.has_context("calc"));
    eventually("calc gone for user", || !user_to_server.has_context("calc")).await;
    assert!(matches!(
        calc.call("add", vec![]).await,
        Err(NetronError::NotExists(_))
    ));
    assert!(matches!(
        owner_to_server.detach_context("calc", false).await,
        Err(NetronError::NotExists(_))
    ));

    // Proxified contexts go away with the connection that created them.
    owner_to_server
        .attach_context(Arc::new(Calc), Some("calc"))
        .await
        .unwrap();
    owner.disconnect("server").unwrap();
    eventually("calc detached on disconnect", || !server.has_context("calc")).await;
}

#[tokio::test]
async fn test_disconnect_cleans_up_both_sides() {
    let (server, client, to_server) = storage_pair().await;
    let storage = to_server.query_interface("storage").unwrap();
    let mut events = server.subscribe_events();

    storage.call("getDoc", vec!["a".into()]).await.unwrap();
    assert_eq!(server.stub_manager().len(), 2);

    let pending = {
        let storage = storage.clone();
        tokio::spawn(async move { storage.call("delay", vec![5000.into(), "x".into()]).await })
    };
    eventually("request in flight", || to_server.active_requests() == 1).await;

    client.disconnect("server").unwrap();
    assert!(!to_server.is_connected());
    assert!(matches!(
        pending.await.unwrap(),
        Err(NetronError::ConnectionClosed)
    ));
    assert!(client.peers().is_empty());
    assert!(!to_server.has_contexts());
    assert!(matches!(
        storage.get("name").await,
        Err(NetronError::NotExists(_))
    ));

    eventually("server dropped the peer", || server.get_peer("client").is_err()).await;
    assert_eq!(server.stub_manager().len(), 1);

    let disconnected = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let ev = events.recv().await.unwrap();
            if ev.name == event::PEER_DISCONNECT {
                return ev;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(
        disconnected.data.get("id").and_then(Value::as_str),
        Some("client")
    );

    // Teardown is idempotent.
    to_server.disconnect();
}

#[tokio::test]
async fn test_connection_info_without_transport_tears_down() {
    let (server, client, to_server) = storage_pair().await;
    let storage = to_server.query_interface("storage").unwrap();
    let mut events = client.subscribe_events();

    // Hand the server one of our objects so a stub is bound to it.
    let echoed = storage
        .call("echo", vec![Value::context(Arc::new(Doubler))])
        .await
        .unwrap();
    assert!(echoed.as_reference().is_some());
    assert_eq!(client.stub_manager().len(), 1);

    assert!(matches!(
        to_server
            .update_connection_info(ConnectionInfo::disconnected("someone-else"))
            .await,
        Err(NetronError::NotValid(_))
    ));
    assert!(to_server.is_connected());

    to_server
        .update_connection_info(ConnectionInfo::disconnected("server"))
        .await
        .unwrap();

    assert!(!to_server.is_connected());
    assert!(matches!(
        client.get_peer("server"),
        Err(NetronError::NotExists(_))
    ));
    assert!(client.stub_manager().is_empty());
    assert!(matches!(
        to_server.get(storage.def_id(), "name", Value::Null).await,
        Err(NetronError::NotExists(_))
    ));

    let disconnected = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let ev = events.recv().await.unwrap();
            if ev.name == event::PEER_DISCONNECT {
                return ev;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(
        disconnected.data.get("id").and_then(Value::as_str),
        Some("server")
    );
    eventually("server dropped the peer", || server.get_peer("client").is_err()).await;
}

#[tokio::test]
async fn test_response_timeout_and_late_response() {
    init_tracing();
    let server = Netron::new(config("server"));
    server
        .attach_context(Storage::new(), Some("storage"))
        .unwrap();
    let client = Netron::new(NetronConfig {
        response_timeout_ms: 100,
        ..config("client")
    });
    let (to_server, _) = connect_pair(&client, &server).await;
    let storage = to_server.query_interface("storage").unwrap();

    match storage.call("delay", vec![300.into(), "late".into()]).await {
        Err(NetronError::Timeout(msg)) => assert!(msg.contains("100ms")),
        other => panic!("Expected Timeout, got {other:?}"),
    }
    assert_eq!(to_server.active_requests(), 0);

    // The late response is dropped and the connection keeps working.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        storage.call("echo", vec![1.into()]).await.unwrap(),
        Value::from(1)
    );
}

#[tokio::test]
async fn test_duplicate_peer_rejected() {
    let (server, client, _to_server) = storage_pair().await;
    let (t, _other) = Transport::pair(1024);
    assert!(matches!(
        client.connect(server.id(), t).await,
        Err(NetronError::Exists(_))
    ));
    tokio_test::assert_ok!(client.get_peer("server"));
}
