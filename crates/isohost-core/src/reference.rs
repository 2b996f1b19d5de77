//! Object references and invocation arguments.

use crate::description::{ActivationHostDescription, HostId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an activated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Create a new random object ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to one object activated inside a host.
///
/// The `faulted` flag is caller-side state: it is set by the registry's
/// failure detection and never travels over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectReference {
    id: ObjectId,
    host: HostId,
    description: ActivationHostDescription,
    type_name: String,
    #[serde(skip)]
    faulted: bool,
}

impl ObjectReference {
    /// Create a reference to an object living in `host`.
    pub fn new(
        id: ObjectId,
        host: HostId,
        description: ActivationHostDescription,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            host,
            description,
            type_name: type_name.into(),
            faulted: false,
        }
    }

    /// Object id inside the host.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Id of the owning host.
    pub fn host(&self) -> HostId {
        self.host
    }

    /// Description of the owning host.
    pub fn description(&self) -> &ActivationHostDescription {
        &self.description
    }

    /// Implementation type the object was created from.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Whether the reference was marked faulted.
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub(crate) fn mark_faulted(&mut self) {
        self.faulted = true;
    }
}

/// One positional argument of a member invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeArgument {
    /// Optional parameter name, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Argument value.
    pub value: Value,
}

impl RuntimeArgument {
    /// Unnamed argument.
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            name: None,
            value: value.into(),
        }
    }

    /// Named argument.
    pub fn named(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: Some(name.into()),
            value: value.into(),
        }
    }
}
