//! Components and the server side of the activator contract.
//!
//! Every host variant ends in an [`ActivationServer`]: an object table filled
//! from a [`ComponentCatalog`]. Local hosts call it directly, sandboxed hosts
//! own it on their sandbox thread and the agent process serves it over a
//! socket.

use crate::description::{ActivationHostDescription, HostId};
use crate::error::{ComponentError, HostError, Result};
use crate::reference::{ObjectId, ObjectReference, RuntimeArgument};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// An implementation type that can be activated inside a host.
pub trait Component: Send {
    /// Invoke a member with positional arguments.
    fn invoke(&mut self, member: &str, arguments: &[Value]) -> std::result::Result<Value, ComponentError>;
}

type Factory = Arc<dyn Fn() -> Box<dyn Component> + Send + Sync>;

/// Factories for the implementation types a host can instantiate, keyed by
/// `(module, type)`.
#[derive(Clone, Default)]
pub struct ComponentCatalog {
    factories: HashMap<(String, String), Factory>,
}

impl ComponentCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `module`/`type_name`, replacing any previous one.
    pub fn register<F, C>(&mut self, module: impl Into<String>, type_name: impl Into<String>, factory: F)
    where
        F: Fn() -> C + Send + Sync + 'static,
        C: Component + 'static,
    {
        let factory: Factory = Arc::new(move || Box::new(factory()) as Box<dyn Component>);
        self.factories
            .insert((module.into(), type_name.into()), factory);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F, C>(mut self, module: impl Into<String>, type_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> C + Send + Sync + 'static,
        C: Component + 'static,
    {
        self.register(module, type_name, factory);
        self
    }

    /// Whether a factory exists for the implementation.
    pub fn contains(&self, module: &str, type_name: &str) -> bool {
        self.factories
            .contains_key(&(module.to_string(), type_name.to_string()))
    }

    /// Number of registered implementation types.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    fn instantiate(&self, module: &str, type_name: &str) -> Option<Box<dyn Component>> {
        self.factories
            .get(&(module.to_string(), type_name.to_string()))
            .map(|factory| factory())
    }
}

impl fmt::Debug for ComponentCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .factories
            .keys()
            .map(|(module, type_name)| format!("{module}::{type_name}"))
            .collect();
        keys.sort();
        f.debug_struct("ComponentCatalog").field("types", &keys).finish()
    }
}

/// Object table of one execution context.
pub struct ActivationServer {
    host: HostId,
    catalog: ComponentCatalog,
    objects: HashMap<ObjectId, Box<dyn Component>>,
}

impl ActivationServer {
    /// Create a server for `host` backed by `catalog`.
    pub fn new(host: HostId, catalog: ComponentCatalog) -> Self {
        Self {
            host,
            catalog,
            objects: HashMap::new(),
        }
    }

    /// Id of the host this server runs in.
    pub fn host(&self) -> HostId {
        self.host
    }

    /// Liveness probe. Always succeeds once the server is reachable.
    pub fn heartbeat(&self) -> Result<()> {
        Ok(())
    }

    /// Instantiate `module`/`type_name` and return a reference to it.
    pub fn activate_instance(
        &mut self,
        description: &ActivationHostDescription,
        module: &str,
        type_name: &str,
    ) -> Result<ObjectReference> {
        let component =
            self.catalog
                .instantiate(module, type_name)
                .ok_or_else(|| HostError::UnknownType {
                    module: module.to_string(),
                    type_name: type_name.to_string(),
                })?;

        let id = ObjectId::new();
        self.objects.insert(id, component);
        tracing::debug!(
            host_id = %self.host,
            object_id = %id,
            module = %module,
            type_name = %type_name,
            "Activated instance"
        );

        Ok(ObjectReference::new(
            id,
            self.host,
            description.clone(),
            type_name,
        ))
    }

    /// Invoke `member` on a previously activated object.
    pub fn invoke_member(
        &mut self,
        reference: &ObjectReference,
        member: &str,
        arguments: &[RuntimeArgument],
    ) -> Result<Value> {
        let component = self
            .objects
            .get_mut(&reference.id())
            .ok_or(HostError::ObjectNotFound(reference.id()))?;

        let values: Vec<Value> = arguments.iter().map(|a| a.value.clone()).collect();
        tracing::trace!(object_id = %reference.id(), member = %member, args = values.len(), "Invoking member");

        component
            .invoke(member, &values)
            .map_err(|e| HostError::Invocation {
                member: member.to_string(),
                message: e.to_string(),
            })
    }

    /// Release the server-side state of an object. Unknown objects are ignored.
    pub fn deactivate_instance(&mut self, reference: &ObjectReference) -> Result<()> {
        if self.objects.remove(&reference.id()).is_some() {
            tracing::debug!(host_id = %self.host, object_id = %reference.id(), "Deactivated instance");
        } else {
            tracing::debug!(object_id = %reference.id(), "Deactivate for unknown object ignored");
        }
        Ok(())
    }

    /// Number of live objects.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Drop every live object.
    pub fn clear(&mut self) {
        self.objects.clear();
    }
}
