//! Core types for the netron distributed-object protocol.
//!
//! This crate defines the data structures shared by every netron component:
//! context definitions, cycle-breaking references, the error taxonomy and its
//! wire envelope, configuration, and well-known event names. It contains no
//! networking logic.

pub mod config;
pub mod definition;
pub mod error;
pub mod event;

pub use config::NetronConfig;
pub use definition::{ArgInfo, DefId, Definition, DefinitionOrigin, MemberInfo, Reference};
pub use error::{ErrorKind, NetronError, NetronResult, RemoteError};
