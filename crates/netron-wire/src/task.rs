//! Named tasks and the built-in task set.
//!
//! A TASK request carries a batch of [`TaskRequest`]s. The receiving netron
//! runs them concurrently and answers with a single map from task name to
//! [`TaskOutcome`]. A failing task never fails the whole batch.

use crate::netron::Netron;
use crate::peer::RemotePeer;
use crate::value::Value;
use async_trait::async_trait;
use netron_types::{
    DefId, ErrorKind, NetronConfig, NetronError, NetronResult, RemoteError,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Returns the serving netron's config.
pub const GET_CONFIG: &str = "netronGetConfig";
/// Returns the serving netron's attached contexts as `{ctxId: Definition}`.
pub const GET_CONTEXT_DEFS: &str = "netronGetContextDefs";
/// Starts relaying a local event to the calling peer.
pub const SUBSCRIBE: &str = "netronSubscribe";
/// Stops relaying a local event to the calling peer.
pub const UNSUBSCRIBE: &str = "netronUnsubscribe";
/// Attaches a context owned by the caller as a local context.
pub const PROXIFY_CONTEXT: &str = "netronProxifyContext";
/// Detaches a context previously proxified by the caller.
pub const DEPROXIFY_CONTEXT: &str = "netronDeproxifyContext";
/// Delivers a relayed event to the serving side's handlers.
pub const EMIT_EVENT: &str = "netronEmitEvent";

/// Everything a task sees while it runs.
pub struct TaskContext {
    pub netron: Netron,
    /// The peer that asked for the task.
    pub peer: Arc<RemotePeer>,
    pub args: Vec<Value>,
}

impl TaskContext {
    /// Argument `index`, if given.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Argument `index` as a string.
    pub fn arg_str(&self, index: usize) -> NetronResult<&str> {
        self.arg(index).and_then(Value::as_str).ok_or_else(|| {
            NetronError::NotValid(format!("Argument {index} must be a string"))
        })
    }
}

/// A named unit of work a remote peer can trigger.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    async fn run(&self, ctx: TaskContext) -> NetronResult<Value>;
}

/// Adapter turning a synchronous closure into a [`Task`].
pub struct FnTask<F>(pub F);

#[async_trait]
impl<F> Task for FnTask<F>
where
    F: Fn(TaskContext) -> NetronResult<Value> + Send + Sync + 'static,
{
    async fn run(&self, ctx: TaskContext) -> NetronResult<Value> {
        (self.0)(ctx)
    }
}

/// One entry of a task batch.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub task: String,
    pub args: Vec<Value>,
}

impl TaskRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(task: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            task: task.into(),
            args,
        }
    }

    /// Wire form: `{task, args}`.
    pub fn to_value(&self) -> Value {
        Value::map([
            ("task", Value::from(self.task.as_str())),
            ("args", Value::List(self.args.clone())),
        ])
    }

    /// Parse one entry. A bare string names an argument-less task.
    pub fn from_value(value: Value) -> NetronResult<Self> {
        match value {
            Value::String(task) => Ok(Self::new(task)),
            Value::Map(mut map) => {
                let task = match map.remove("task") {
                    Some(Value::String(task)) => task,
                    _ => return Err(NetronError::NotValid("Missing task name".to_string())),
                };
                let args = map.remove("args").map(Value::into_args).unwrap_or_default();
                Ok(Self { task, args })
            }
            other => Err(NetronError::NotValid(format!(
                "Not valid task request: {}",
                other.type_name()
            ))),
        }
    }

    /// Wire form of a whole batch.
    pub fn batch_to_value(requests: &[TaskRequest]) -> Value {
        Value::List(requests.iter().map(TaskRequest::to_value).collect())
    }

    /// Parse a batch; a single entry is accepted as a batch of one.
    pub fn parse_batch(value: Value) -> NetronResult<Vec<TaskRequest>> {
        match value {
            Value::List(items) => items.into_iter().map(TaskRequest::from_value).collect(),
            other => Ok(vec![TaskRequest::from_value(other)?]),
        }
    }

    /// Whether a TASK payload only carries event deliveries.
    pub(crate) fn is_event_batch(value: &Value) -> bool {
        let is_emit = |v: &Value| {
            v.get("task").and_then(Value::as_str) == Some(EMIT_EVENT)
        };
        match value {
            Value::List(items) => !items.is_empty() && items.iter().all(is_emit),
            other => is_emit(other),
        }
    }
}

impl From<&str> for TaskRequest {
    fn from(task: &str) -> Self {
        Self::new(task)
    }
}

/// Result of one task in a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Result(Value),
    Error(RemoteError),
}

impl TaskOutcome {
    pub fn into_result(self) -> NetronResult<Value> {
        match self {
            TaskOutcome::Result(value) => Ok(value),
            TaskOutcome::Error(err) => Err(err.into_error()),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            TaskOutcome::Result(value) => Value::map([("result", value.clone())]),
            TaskOutcome::Error(err) => Value::map([("error", Value::Error(err.clone()))]),
        }
    }

    fn from_value(value: Value) -> NetronResult<Self> {
        let mut map = match value {
            Value::Map(map) => map,
            other => {
                return Err(NetronError::NotValid(format!(
                    "Not valid task outcome: {}",
                    other.type_name()
                )))
            }
        };
        if let Some(result) = map.remove("result") {
            return Ok(TaskOutcome::Result(result));
        }
        match map.remove("error") {
            Some(Value::Error(err)) => Ok(TaskOutcome::Error(err)),
            Some(other) => Err(NetronError::NotValid(format!(
                "Not valid task error: {}",
                other.type_name()
            ))),
            None => Err(NetronError::NotValid(
                "Task outcome has neither result nor error".to_string(),
            )),
        }
    }
}

impl From<NetronResult<Value>> for TaskOutcome {
    fn from(result: NetronResult<Value>) -> Self {
        match result {
            Ok(value) => TaskOutcome::Result(value),
            Err(e) => TaskOutcome::Error(e.to_remote()),
        }
    }
}

/// Outcomes of a task batch, by task name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskResults(BTreeMap<String, TaskOutcome>);

impl TaskResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: impl Into<String>, outcome: TaskOutcome) {
        self.0.insert(task.into(), outcome);
    }

    pub fn get(&self, task: &str) -> Option<&TaskOutcome> {
        self.0.get(task)
    }

    /// Successful result of `task`, if it succeeded.
    pub fn result(&self, task: &str) -> Option<&Value> {
        match self.0.get(task) {
            Some(TaskOutcome::Result(value)) => Some(value),
            _ => None,
        }
    }

    /// Error of `task`, if it failed.
    pub fn error(&self, task: &str) -> Option<&RemoteError> {
        match self.0.get(task) {
            Some(TaskOutcome::Error(err)) => Some(err),
            _ => None,
        }
    }

    /// Take the outcome of `task` as a result.
    pub fn take(&mut self, task: &str) -> NetronResult<Value> {
        match self.0.remove(task) {
            Some(outcome) => outcome.into_result(),
            None => Err(NetronError::NotValid(format!(
                "No outcome for task '{task}'"
            ))),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TaskOutcome)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Wire form: `{name: {result} | {error}}`.
    pub fn into_value(self) -> Value {
        Value::Map(
            self.0
                .iter()
                .map(|(name, outcome)| (name.clone(), outcome.to_value()))
                .collect(),
        )
    }

    /// Parse the wire form; anything but a map of outcomes is `NotValid`.
    pub fn from_value(value: Value) -> NetronResult<Self> {
        match value {
            Value::Map(map) => map
                .into_iter()
                .map(|(name, v)| TaskOutcome::from_value(v).map(|o| (name, o)))
                .collect::<NetronResult<BTreeMap<_, _>>>()
                .map(TaskResults),
            other => Err(NetronError::NotValid(format!(
                "Not valid result: {}",
                other.type_name()
            ))),
        }
    }
}

/// The part of a remote netron's config a peer cares about.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteConfig {
    pub response_timeout_ms: u64,
    pub proxify_contexts: bool,
}

impl RemoteConfig {
    pub fn from_value(value: &Value) -> Option<Self> {
        Some(Self {
            response_timeout_ms: value.get("responseTimeout").and_then(Value::as_u64)?,
            proxify_contexts: value
                .get("proxifyContexts")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

/// Wire form of a netron config, as returned by `netronGetConfig`.
pub fn config_to_value(config: &NetronConfig) -> Value {
    Value::map([
        ("responseTimeout", Value::from(config.response_timeout_ms)),
        ("proxifyContexts", Value::from(config.proxify_contexts)),
    ])
}

struct GetConfig;

#[async_trait]
impl Task for GetConfig {
    async fn run(&self, ctx: TaskContext) -> NetronResult<Value> {
        Ok(config_to_value(ctx.netron.config()))
    }
}

struct GetContextDefs;

#[async_trait]
impl Task for GetContextDefs {
    async fn run(&self, ctx: TaskContext) -> NetronResult<Value> {
        Ok(Value::Map(
            ctx.netron
                .context_definitions()
                .into_iter()
                .map(|(id, def)| (id, Value::from(def)))
                .collect(),
        ))
    }
}

struct Subscribe;

#[async_trait]
impl Task for Subscribe {
    async fn run(&self, ctx: TaskContext) -> NetronResult<Value> {
        ctx.peer.add_remote_subscription(ctx.arg_str(0)?);
        Ok(Value::Null)
    }
}

struct Unsubscribe;

#[async_trait]
impl Task for Unsubscribe {
    async fn run(&self, ctx: TaskContext) -> NetronResult<Value> {
        ctx.peer.remove_remote_subscription(ctx.arg_str(0)?);
        Ok(Value::Null)
    }
}

struct ProxifyContext;

#[async_trait]
impl Task for ProxifyContext {
    async fn run(&self, ctx: TaskContext) -> NetronResult<Value> {
        if !ctx.netron.config().proxify_contexts {
            return Err(NetronError::NotSupported(
                "Context proxification feature is disabled".to_string(),
            ));
        }
        let ctx_id = ctx.arg_str(0)?.to_string();
        let def = ctx
            .arg(1)
            .and_then(Value::as_definition)
            .cloned()
            .ok_or_else(|| NetronError::NotValid("Not valid context definition".to_string()))?;
        let iface = ctx.peer.register_definition(def);
        let def_id: DefId = ctx.netron.attach_remote_context(&ctx_id, iface)?;
        debug!(ctx_id = %ctx_id, def_id, peer = %ctx.peer.id(), "netron: context proxified");
        Ok(Value::from(def_id))
    }
}

struct DeproxifyContext;

#[async_trait]
impl Task for DeproxifyContext {
    async fn run(&self, ctx: TaskContext) -> NetronResult<Value> {
        let ctx_id = ctx.arg_str(0)?;
        let release_originated = ctx.arg(1).and_then(Value::as_bool).unwrap_or(false);
        let proxified_by_caller = ctx
            .netron
            .context_stub(ctx_id)
            .is_some_and(|stub| stub.bound_peer() == Some(ctx.peer.id()));
        if !proxified_by_caller {
            return Err(NetronError::NotExists(format!(
                "Context '{ctx_id}' not proxified by peer '{}'",
                ctx.peer.id()
            )));
        }
        let def_id = ctx.netron.detach_context(ctx_id, release_originated)?;
        Ok(Value::from(def_id))
    }
}

struct EmitEvent;

#[async_trait]
impl Task for EmitEvent {
    async fn run(&self, ctx: TaskContext) -> NetronResult<Value> {
        let event = ctx.arg_str(0)?;
        let data = ctx.arg(1).cloned().unwrap_or_default();
        ctx.peer.deliver_remote_event(event, &data);
        Ok(Value::Null)
    }
}

/// Tasks every netron serves.
pub(crate) fn builtin_tasks() -> Vec<(&'static str, Arc<dyn Task>)> {
    vec![
        (GET_CONFIG, Arc::new(GetConfig)),
        (GET_CONTEXT_DEFS, Arc::new(GetContextDefs)),
        (SUBSCRIBE, Arc::new(Subscribe)),
        (UNSUBSCRIBE, Arc::new(Unsubscribe)),
        (PROXIFY_CONTEXT, Arc::new(ProxifyContext)),
        (DEPROXIFY_CONTEXT, Arc::new(DeproxifyContext)),
        (EMIT_EVENT, Arc::new(EmitEvent)),
    ]
}

/// Outcome reported for a task name nobody registered.
pub(crate) fn missing_task(task: &str) -> TaskOutcome {
    TaskOutcome::Error(RemoteError::new(
        ErrorKind::NotExists,
        format!("Task '{task}' not exists"),
    ))
}
