//! Activation hosts.
//!
//! A [`PartActivationHost`] is one pooled execution context. The registry owns
//! its `started`/`faulted` flags and its activated-type set; the
//! [`HostBackend`] behind it decides how the context is reached:
//!
//! - [`LocalHost`]: direct calls in the current process
//! - [`SandboxedHost`]: a dedicated sandbox thread inside the current process
//! - [`ProcessHost`]: a child `isohost-agent` process over a Unix socket

mod local;
mod process;
mod sandboxed;

pub use local::LocalHost;
pub use process::ProcessHost;
pub use sandboxed::SandboxedHost;

use crate::activator::RemoteActivator;
use crate::component::ComponentCatalog;
use crate::config::RegistryConfig;
use crate::description::{ActivationHostDescription, HostId, IsolationLevel};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// How a host reaches its execution context.
#[async_trait]
pub trait HostBackend: Send + Sync {
    /// Bring up the execution context. Calling it again is a no-op.
    async fn start(&self) -> Result<()>;

    /// Tear down the execution context, best effort.
    async fn stop(&self) -> Result<()>;

    /// Obtain a fresh activator handle. Must be cheap and repeatable.
    async fn activator(&self) -> Result<Box<dyn RemoteActivator>>;
}

/// Builds the backend for a new host.
///
/// This is the only place that switches on the isolation level.
pub trait HostFactory: Send + Sync {
    /// Create the backend for host `id` described by `description`.
    fn create(&self, id: HostId, description: &ActivationHostDescription) -> Result<Box<dyn HostBackend>>;
}

/// Factory for the three built-in host variants.
#[derive(Debug, Clone)]
pub struct DefaultHostFactory {
    catalog: ComponentCatalog,
    config: RegistryConfig,
}

impl DefaultHostFactory {
    /// Create a factory. `catalog` backs local and sandboxed hosts; process
    /// hosts use the agent's own catalog.
    pub fn new(catalog: ComponentCatalog, config: RegistryConfig) -> Self {
        Self { catalog, config }
    }
}

impl HostFactory for DefaultHostFactory {
    fn create(&self, id: HostId, description: &ActivationHostDescription) -> Result<Box<dyn HostBackend>> {
        let backend: Box<dyn HostBackend> = match description.isolation() {
            IsolationLevel::None => Box::new(LocalHost::new(id, self.catalog.clone())),
            IsolationLevel::SandboxedInProcess => {
                Box::new(SandboxedHost::new(id, self.catalog.clone()))
            }
            IsolationLevel::SeparateProcess => Box::new(ProcessHost::new(id, &self.config)),
        };
        Ok(backend)
    }
}

/// One pooled execution context.
pub struct PartActivationHost {
    id: HostId,
    description: ActivationHostDescription,
    backend: Box<dyn HostBackend>,
    started: AtomicBool,
    faulted: AtomicBool,
    fault_guard: Mutex<()>,
    activated_types: Mutex<HashSet<String>>,
    created_at: DateTime<Utc>,
}

impl PartActivationHost {
    pub(crate) fn new(
        id: HostId,
        description: ActivationHostDescription,
        backend: Box<dyn HostBackend>,
    ) -> Self {
        Self {
            id,
            description,
            backend,
            started: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            fault_guard: Mutex::new(()),
            activated_types: Mutex::new(HashSet::new()),
            created_at: Utc::now(),
        }
    }

    /// Get the host ID.
    pub fn id(&self) -> HostId {
        self.id
    }

    /// Get the host description.
    pub fn description(&self) -> &ActivationHostDescription {
        &self.description
    }

    /// Get the creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the connect handshake succeeded.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Whether the host is permanently faulted.
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Implementation types activated in this host.
    pub fn activated_types(&self) -> HashSet<String> {
        self.types().clone()
    }

    /// Whether `type_name` was activated in this host.
    pub fn has_activated(&self, type_name: &str) -> bool {
        self.types().contains(type_name)
    }

    /// Bring up the execution context.
    pub async fn start(&self) -> Result<()> {
        self.backend.start().await
    }

    /// Tear down the execution context.
    pub async fn stop(&self) -> Result<()> {
        self.backend.stop().await
    }

    /// Obtain a fresh activator handle.
    pub async fn activator(&self) -> Result<Box<dyn RemoteActivator>> {
        self.backend.activator().await
    }

    /// Heartbeat through a fresh activator, closing it afterwards.
    pub async fn heartbeat(&self) -> Result<()> {
        let mut activator = self.activator().await?;
        let result = activator.heartbeat().await;
        if let Err(e) = activator.close().await {
            tracing::trace!(host_id = %self.id, error = %e, "Failed to close probe activator");
        }
        result
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Flip the host to faulted. Returns true only for the caller that
    /// performed the transition.
    pub(crate) fn transition_to_faulted(&self) -> bool {
        if self.is_faulted() {
            return false;
        }
        let _guard = self
            .fault_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_faulted() {
            return false;
        }
        self.faulted.store(true, Ordering::Release);
        true
    }

    /// Record `type_name` unless it is already present. Returns whether it was
    /// recorded; check and insert happen under one lock.
    pub(crate) fn claim_type(&self, type_name: &str) -> bool {
        self.types().insert(type_name.to_string())
    }

    /// Forget `type_name`, undoing a claim whose activation failed.
    pub(crate) fn release_type(&self, type_name: &str) {
        self.types().remove(type_name);
    }

    fn types(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.activated_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for PartActivationHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartActivationHost")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("started", &self.is_started())
            .field("faulted", &self.is_faulted())
            .field("activated_types", &self.activated_types())
            .finish()
    }
}
