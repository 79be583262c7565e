//! Payload values carried by netron packets.
//!
//! [`Value`] is a self-describing tree. Besides plain data it has distinct
//! variants for [`Definition`] and [`Reference`], so a receiver can always
//! tell an ordinary object from a remote handle. Two variants only exist
//! in-process: [`Value::Context`] (a local object about to be exposed) and
//! [`Value::Interface`] (a proxy to a remote object). They are converted to
//! definitions or references before anything is written to the wire, and
//! trying to encode them directly is a codec error.

use crate::interface::Interface;
use crate::reflection::Context;
use netron_types::{Definition, Reference, RemoteError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A local context instance carried inside a [`Value`].
#[derive(Clone)]
pub struct LocalContext(pub Arc<dyn Context>);

impl LocalContext {
    /// Wrap a context instance.
    pub fn new(ctx: Arc<dyn Context>) -> Self {
        Self(ctx)
    }

    /// Whether both handles point at the same instance.
    pub fn same_instance(&self, other: &LocalContext) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.0) as *const (),
            Arc::as_ptr(&other.0) as *const (),
        )
    }
}

impl std::ops::Deref for LocalContext {
    type Target = dyn Context;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for LocalContext {
    fn eq(&self, other: &Self) -> bool {
        self.same_instance(other)
    }
}

impl std::fmt::Debug for LocalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LocalContext")
            .field(&self.0.reflection().name())
            .finish()
    }
}

/// A netron payload value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Callable surface of a context owned by the sender.
    Definition(Box<Definition>),
    /// Pointer to a definition owned by the receiver.
    Reference(Reference),
    /// Error envelope.
    Error(RemoteError),
    /// Local context instance, in-process only.
    #[serde(skip)]
    Context(LocalContext),
    /// Proxy to a remote context, in-process only.
    #[serde(skip)]
    Interface(Interface),
}

impl Value {
    /// Build a map value from key/value pairs.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Wrap a local context instance.
    pub fn context(ctx: Arc<dyn Context>) -> Self {
        Value::Context(LocalContext::new(ctx))
    }

    /// Short type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Definition(_) => "definition",
            Value::Reference(_) => "reference",
            Value::Error(_) => "error",
            Value::Context(_) => "context",
            Value::Interface(_) => "interface",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i64().and_then(|i| u64::try_from(i).ok())
    }

    /// Numeric value as a float, accepting integers too.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key of a map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    pub fn as_definition(&self) -> Option<&Definition> {
        match self {
            Value::Definition(def) => Some(def),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Value::Reference(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_interface(&self) -> Option<&Interface> {
        match self {
            Value::Interface(iface) => Some(iface),
            _ => None,
        }
    }

    pub fn as_context(&self) -> Option<&LocalContext> {
        match self {
            Value::Context(ctx) => Some(ctx),
            _ => None,
        }
    }

    /// Turn the value into an argument list: lists are unpacked, null is
    /// empty, anything else becomes a single argument.
    pub fn into_args(self) -> Vec<Value> {
        match self {
            Value::List(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        // Definition ids and timeouts never get near i64::MAX.
        Value::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

impl From<Definition> for Value {
    fn from(def: Definition) -> Self {
        Value::Definition(Box::new(def))
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Value::Reference(r)
    }
}

impl From<RemoteError> for Value {
    fn from(err: RemoteError) -> Self {
        Value::Error(err)
    }
}

impl From<Interface> for Value {
    fn from(iface: Interface) -> Self {
        Value::Interface(iface)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
