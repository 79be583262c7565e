//! Context definitions and cycle-breaking references.
//!
//! A [`Definition`] describes the remotely visible surface of a context: its
//! methods and properties, the side that owns it, and where it sits in a
//! proxy chain. A [`Reference`] stands in for a definition the receiving side
//! already owns, so object graphs that point back at the requester are never
//! re-serialized.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Definition identifier, unique within the owning side's stub registry.
pub type DefId = u64;

/// Metadata of a single method argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgInfo {
    /// Declared type name, if any.
    #[serde(rename = "type", default)]
    pub ty: Option<String>,
    /// Argument name.
    pub name: String,
}

/// Metadata of a public method or property.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MemberInfo {
    /// `true` for methods, `false` for properties.
    pub method: bool,
    /// Readonly flag (meaningful for properties only).
    #[serde(default)]
    pub readonly: bool,
    /// Declared result / property type name.
    #[serde(rename = "type", default)]
    pub ty: Option<String>,
    /// Method arguments.
    #[serde(default)]
    pub args: Vec<ArgInfo>,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
}

impl MemberInfo {
    /// Whether a SET on this member must be rejected.
    pub fn is_readonly_property(&self) -> bool {
        !self.method && self.readonly
    }
}

/// Where a definition stands relative to the local side.
///
/// Never transmitted: the marker is set locally when a definition received
/// from one peer is re-exposed to another one through a proxy stub.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DefinitionOrigin {
    /// Plain definition, calls go straight to its owner.
    #[default]
    Local,
    /// The definition is re-exposed locally through `proxy_def`.
    Remote {
        /// Definition of the local stub that proxies this one.
        proxy_def: Box<Definition>,
    },
}

/// Describes a context's callable surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    /// Definition id, unique within the owning stub registry.
    pub id: DefId,
    /// Id of the netron that owns the stub behind this definition.
    pub peer_id: String,
    /// Set when the definition describes a nested or proxied sub-object.
    #[serde(default)]
    pub parent_id: Option<DefId>,
    /// Set for strongly-named top-level contexts.
    #[serde(default)]
    pub ctx_id: Option<String>,
    /// Reflected context name.
    pub name: String,
    /// Context description.
    #[serde(default)]
    pub description: Option<String>,
    /// Public members by name.
    pub schema: BTreeMap<String, MemberInfo>,
    /// Local proxy marker.
    #[serde(skip)]
    pub origin: DefinitionOrigin,
}

impl Definition {
    /// Look up a member of the schema.
    pub fn member(&self, name: &str) -> Option<&MemberInfo> {
        self.schema.get(name)
    }

    /// Whether this definition is re-exposed through a local proxy stub.
    pub fn is_remote(&self) -> bool {
        matches!(self.origin, DefinitionOrigin::Remote { .. })
    }

    /// The local proxy definition, if any.
    pub fn proxy_def(&self) -> Option<&Definition> {
        match &self.origin {
            DefinitionOrigin::Remote { proxy_def } => Some(proxy_def),
            DefinitionOrigin::Local => None,
        }
    }

    /// Mark the definition as re-exposed through `proxy_def`.
    pub fn set_remote(&mut self, proxy_def: Definition) {
        self.origin = DefinitionOrigin::Remote {
            proxy_def: Box::new(proxy_def),
        };
    }
}

/// Cycle-breaking pointer to a definition owned by the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// The referenced definition id.
    pub def_id: DefId,
}

impl Reference {
    /// Create a reference to `def_id`.
    pub fn new(def_id: DefId) -> Self {
        Self { def_id }
    }
}
