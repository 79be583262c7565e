//! Exposable contexts and their reflected surface.
//!
//! A context is any object implementing [`Context`]. Its public surface is
//! declared up front through a [`Reflection`], from which the stub manager
//! builds the [`Definition`] sent to remote peers.

use crate::value::Value;
use async_trait::async_trait;
use netron_types::{ArgInfo, DefId, Definition, MemberInfo, NetronError, NetronResult};
use std::collections::BTreeMap;

/// An object whose methods and properties can be reached by remote peers.
///
/// `get` serves method calls (with the argument list in `args`) and property
/// reads (with the caller's default value in `args`). `set` serves property
/// writes and void method calls (with the argument list in `value`).
/// Member existence and readonly checks happen before either is called.
#[async_trait]
pub trait Context: Send + Sync + 'static {
    /// Describe the public surface of this context.
    fn reflection(&self) -> Reflection;

    /// Call a method or read a property.
    async fn get(&self, name: &str, args: Value) -> NetronResult<Value>;

    /// Write a property or call a method ignoring its result.
    async fn set(&self, name: &str, value: Value) -> NetronResult<()>;
}

/// Builder for a context's public surface.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reflection {
    name: String,
    description: Option<String>,
    members: BTreeMap<String, MemberInfo>,
}

impl Reflection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare an untyped method.
    pub fn method(self, name: &str) -> Self {
        self.member(
            name,
            MemberInfo {
                method: true,
                ..Default::default()
            },
        )
    }

    /// Declare a method with a result type and typed arguments.
    pub fn typed_method(self, name: &str, ty: &str, args: &[(&str, &str)]) -> Self {
        self.member(
            name,
            MemberInfo {
                method: true,
                ty: Some(ty.to_string()),
                args: args
                    .iter()
                    .map(|(arg, ty)| ArgInfo {
                        name: (*arg).to_string(),
                        ty: Some((*ty).to_string()),
                    })
                    .collect(),
                ..Default::default()
            },
        )
    }

    /// Declare a writable property.
    pub fn property(self, name: &str) -> Self {
        self.member(name, MemberInfo::default())
    }

    /// Declare a readonly property.
    pub fn readonly(self, name: &str) -> Self {
        self.member(
            name,
            MemberInfo {
                readonly: true,
                ..Default::default()
            },
        )
    }

    /// Declare a member with full metadata.
    pub fn member(mut self, name: &str, info: MemberInfo) -> Self {
        self.members.insert(name.to_string(), info);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &BTreeMap<String, MemberInfo> {
        &self.members
    }

    /// Reject surfaces that expose nothing.
    pub fn validate(&self) -> NetronResult<()> {
        if self.members.is_empty() {
            return Err(NetronError::NotValid(format!(
                "'{}' must have at least one method or property",
                self.name
            )));
        }
        Ok(())
    }

    /// Human-readable signature of a method, e.g. `String methodA(Number a)`.
    pub fn method_signature(&self, name: &str) -> Option<String> {
        let info = self.members.get(name).filter(|m| m.method)?;
        let args: Vec<String> = info
            .args
            .iter()
            .map(|a| match &a.ty {
                Some(ty) => format!("{ty} {}", a.name),
                None => a.name.clone(),
            })
            .collect();
        let ty = info.ty.as_deref().unwrap_or("undefined");
        Some(format!("{ty} {name}({})", args.join(", ")))
    }

    /// Human-readable signature of a property, e.g. `readonly Number rpropB`.
    pub fn property_signature(&self, name: &str) -> Option<String> {
        let info = self.members.get(name).filter(|m| !m.method)?;
        let ty = info.ty.as_deref().unwrap_or("undefined");
        Some(if info.readonly {
            format!("readonly {ty} {name}")
        } else {
            format!("{ty} {name}")
        })
    }

    /// Build the definition for a stub with id `id` owned by `peer_id`.
    pub fn to_definition(&self, id: DefId, peer_id: &str) -> Definition {
        Definition {
            id,
            peer_id: peer_id.to_string(),
            parent_id: None,
            ctx_id: None,
            name: self.name.clone(),
            description: self.description.clone(),
            schema: self.members.clone(),
            origin: Default::default(),
        }
    }
}
