//! Activation host registry.
//!
//! The registry pools [`PartActivationHost`]s, creates them on demand, runs
//! the connect handshake, heartbeats started hosts in the background and
//! broadcasts [`HostFaulted`] when a host stops answering.
//!
//! # Example
//!
//! ```ignore
//! use isohost_core::{ActivationHostRegistry, ComponentCatalog, IsolationLevel,
//!     IsolationMetadata, RegistryConfig, RuntimeArgument};
//!
//! let registry = ActivationHostRegistry::new(RegistryConfig::from_env(), catalog)?;
//! registry.start();
//!
//! let metadata = IsolationMetadata::new(IsolationLevel::SeparateProcess).group("workers");
//! let mut reference = registry.activate(&metadata, "isohost.builtin", "Counter").await?;
//! let value = registry
//!     .invoke(&mut reference, "increment", vec![RuntimeArgument::new(2)])
//!     .await?;
//! registry.deactivate(&mut reference).await?;
//!
//! registry.shutdown().await;
//! ```

use crate::activator::RemoteActivator;
use crate::component::ComponentCatalog;
use crate::config::RegistryConfig;
use crate::description::{ActivationHostDescription, HostId, IsolationMetadata};
use crate::error::{HostError, Result};
use crate::host::{DefaultHostFactory, HostFactory, PartActivationHost};
use crate::reference::{ObjectReference, RuntimeArgument};
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

/// Notification that a host became permanently faulted.
#[derive(Debug, Clone)]
pub struct HostFaulted {
    /// Id of the faulted host.
    pub host: HostId,
    /// Description of the faulted host.
    pub description: ActivationHostDescription,
    /// Failure that caused the transition.
    pub cause: HostError,
}

type FaultHandler = Arc<dyn Fn(&HostFaulted) + Send + Sync>;

struct RegistryInner {
    /// Append-only list of every host ever created.
    hosts: RwLock<Vec<Arc<PartActivationHost>>>,
    /// Per-description guards serializing select-recheck-create.
    creation: std::sync::Mutex<HashMap<ActivationHostDescription, Arc<Mutex<()>>>>,
    factory: Arc<dyn HostFactory>,
    config: RegistryConfig,
    events: broadcast::Sender<HostFaulted>,
    handlers: std::sync::RwLock<Vec<FaultHandler>>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the process-wide pool of activation hosts.
///
/// Construct one at startup and clone the handle to every call site; all
/// clones share the same pool. Call [`start`](Self::start) to begin the
/// heartbeat sweep and [`shutdown`](Self::shutdown) before exit.
#[derive(Clone)]
pub struct ActivationHostRegistry {
    inner: Arc<RegistryInner>,
}

impl ActivationHostRegistry {
    /// Create a registry using the built-in host variants.
    ///
    /// `catalog` backs hosts with `None` and `SandboxedInProcess` isolation.
    pub fn new(config: RegistryConfig, catalog: ComponentCatalog) -> Result<Self> {
        let factory = Arc::new(DefaultHostFactory::new(catalog, config.clone()));
        Self::with_factory(config, factory)
    }

    /// Create a registry with a custom host factory.
    pub fn with_factory(config: RegistryConfig, factory: Arc<dyn HostFactory>) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            heartbeat_interval_ms = config.heartbeat_interval.as_millis() as u64,
            connect_attempts = config.connect_attempts,
            handshake_budget_ms = config.handshake_budget().as_millis() as u64,
            "Creating activation host registry"
        );

        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            inner: Arc::new(RegistryInner {
                hosts: RwLock::new(Vec::new()),
                creation: std::sync::Mutex::new(HashMap::new()),
                factory,
                config,
                events,
                handlers: std::sync::RwLock::new(Vec::new()),
                shutdown: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
                sweeper: std::sync::Mutex::new(None),
            }),
        })
    }

    /// Get the registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    // =========================================================================
    // Selection and creation
    // =========================================================================

    /// Resolve or create a host for one activation of `implementation_type`.
    ///
    /// Started, non-faulted hosts with the requested description are
    /// eligible. With `host_per_instance` the first one that has not yet
    /// activated the type wins; otherwise the first one wins. Without an
    /// eligible host a new one is created, started and handshaken.
    ///
    /// # Errors
    ///
    /// Any failure while creating a host, including
    /// [`HostError::HandshakeExhausted`]. The failed host is marked faulted.
    pub async fn get_host(
        &self,
        implementation_type: &str,
        metadata: &IsolationMetadata,
    ) -> Result<Arc<PartActivationHost>> {
        self.acquire_host(implementation_type, metadata)
            .await
            .map(|(host, _)| host)
    }

    /// [`get_host`](Self::get_host), also reporting whether this call
    /// recorded `implementation_type` in the returned host.
    async fn acquire_host(
        &self,
        implementation_type: &str,
        metadata: &IsolationMetadata,
    ) -> Result<(Arc<PartActivationHost>, bool)> {
        let description = metadata.description();
        if let Some(found) = self
            .select(&description, implementation_type, metadata.host_per_instance)
            .await
        {
            return Ok(found);
        }

        let guard = self.creation_guard(&description);
        let _creation = guard.lock().await;
        // Another caller may have created an eligible host while we waited.
        if let Some(found) = self
            .select(&description, implementation_type, metadata.host_per_instance)
            .await
        {
            return Ok(found);
        }

        let host = self.create_host(description, implementation_type).await?;
        Ok((host, true))
    }

    /// Creation guard for one description; other descriptions never wait on it.
    fn creation_guard(&self, description: &ActivationHostDescription) -> Arc<Mutex<()>> {
        let mut guards = self
            .inner
            .creation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(guards.entry(description.clone()).or_default())
    }

    async fn select(
        &self,
        description: &ActivationHostDescription,
        implementation_type: &str,
        host_per_instance: bool,
    ) -> Option<(Arc<PartActivationHost>, bool)> {
        let hosts = self.snapshot().await;
        let mut claimed = false;
        let selected = hosts.into_iter().find(|host| {
            if host.is_faulted() || !host.is_started() || host.description() != description {
                return false;
            }
            claimed = host.claim_type(implementation_type);
            claimed || !host_per_instance
        });

        selected.map(|host| {
            tracing::trace!(host_id = %host.id(), description = %description, "Reusing activation host");
            (host, claimed)
        })
    }

    async fn create_host(
        &self,
        description: ActivationHostDescription,
        implementation_type: &str,
    ) -> Result<Arc<PartActivationHost>> {
        let id = HostId::new();
        let start = std::time::Instant::now();
        tracing::info!(host_id = %id, description = %description, "Creating activation host");

        let backend = self.inner.factory.create(id, &description)?;
        let host = Arc::new(PartActivationHost::new(id, description, backend));
        host.claim_type(implementation_type);
        self.inner.hosts.write().await.push(Arc::clone(&host));

        if let Err(e) = host.start().await {
            tracing::error!(host_id = %id, error = %e, "Activation host failed to start");
            self.mark_faulted(&host, e.clone());
            return Err(e);
        }

        self.connect_with_retry(&host).await?;
        host.mark_started();

        tracing::info!(
            host_id = %id,
            description = %host.description(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Activation host ready"
        );
        Ok(host)
    }

    /// Heartbeat a freshly started host until it answers, backing off
    /// exponentially between attempts.
    async fn connect_with_retry(&self, host: &PartActivationHost) -> Result<()> {
        let config = &self.inner.config;
        let mut remaining = config.connect_attempts;
        let mut wait = config.connect_backoff;
        let mut attempts = 0u32;

        while remaining > 0 && !host.is_faulted() {
            attempts += 1;
            match self.probe(host).await {
                Ok(()) => {
                    tracing::debug!(host_id = %host.id(), attempts, "Connect handshake succeeded");
                    return Ok(());
                }
                Err(e) => {
                    tracing::trace!(
                        host_id = %host.id(),
                        attempt = attempts,
                        backoff_ms = wait.as_millis() as u64,
                        error = %e,
                        "Handshake attempt failed, retrying..."
                    );
                    tokio::time::sleep(wait).await;
                    wait *= 2;
                    remaining -= 1;
                }
            }
        }

        let error = HostError::HandshakeExhausted {
            description: host.description().clone(),
            attempts,
        };
        tracing::warn!(host_id = %host.id(), attempts, "Activation host never answered");
        self.mark_faulted(host, error.clone());
        Err(error)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Find the host for `description`.
    ///
    /// Prefers the first non-faulted match; when every match is faulted the
    /// most recently created one is returned.
    pub async fn lookup_by_description(
        &self,
        description: &ActivationHostDescription,
    ) -> Result<Arc<PartActivationHost>> {
        let hosts = self.snapshot().await;
        let mut matches = hosts
            .into_iter()
            .filter(|host| host.description() == description)
            .collect::<Vec<_>>();

        if let Some(index) = matches.iter().position(|host| !host.is_faulted()) {
            return Ok(matches.swap_remove(index));
        }
        matches
            .pop()
            .ok_or_else(|| HostError::NotFound(description.clone()))
    }

    /// Find the host an object lives in.
    pub async fn lookup_by_object_reference(
        &self,
        reference: &ObjectReference,
    ) -> Result<Arc<PartActivationHost>> {
        self.lookup_by_id(reference.host()).await
    }

    /// Find a host by id.
    pub async fn lookup_by_id(&self, id: HostId) -> Result<Arc<PartActivationHost>> {
        self.inner
            .hosts
            .read()
            .await
            .iter()
            .find(|host| host.id() == id)
            .cloned()
            .ok_or(HostError::HostNotFound(id))
    }

    /// Snapshot of every host, faulted ones included, in creation order.
    pub async fn hosts(&self) -> Vec<Arc<PartActivationHost>> {
        self.snapshot().await
    }

    /// Number of hosts ever created.
    pub async fn host_count(&self) -> usize {
        self.inner.hosts.read().await.len()
    }

    async fn snapshot(&self) -> Vec<Arc<PartActivationHost>> {
        self.inner.hosts.read().await.clone()
    }

    // =========================================================================
    // Fault handling
    // =========================================================================

    /// Subscribe to fault notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<HostFaulted> {
        self.inner.events.subscribe()
    }

    /// Register a callback run synchronously for every fault notification.
    ///
    /// A panicking handler is logged and does not affect fault bookkeeping or
    /// the other handlers.
    pub fn on_faulted<F>(&self, handler: F)
    where
        F: Fn(&HostFaulted) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Mark `host` permanently faulted.
    ///
    /// Idempotent: only the first caller flips the flag and emits
    /// [`HostFaulted`]. Returns whether this call performed the transition.
    pub fn mark_faulted(&self, host: &PartActivationHost, cause: HostError) -> bool {
        if !host.transition_to_faulted() {
            return false;
        }

        tracing::warn!(
            host_id = %host.id(),
            description = %host.description(),
            error = %cause,
            "Activation host faulted"
        );
        self.notify(HostFaulted {
            host: host.id(),
            description: host.description().clone(),
            cause,
        });
        true
    }

    fn notify(&self, event: HostFaulted) {
        let handlers = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::warn!(host_id = %event.host, "Fault handler panicked");
            }
        }

        // No receivers is fine: nobody is listening.
        let receivers = self.inner.events.send(event).unwrap_or(0);
        tracing::trace!(receivers, "Fault notification sent");
    }

    /// Decide whether a failed call means the host is gone.
    ///
    /// With `error` set, the host (the reference's host when given, otherwise
    /// the host found by `description`) is probed with a heartbeat. If the
    /// probe fails the reference and the host are marked faulted with the
    /// original error; if it succeeds the error is treated as transient.
    ///
    /// Returns whether the host was found unreachable.
    pub async fn mark_faulted_if_given_error(
        &self,
        description: &ActivationHostDescription,
        error: Option<HostError>,
        reference: Option<&mut ObjectReference>,
    ) -> Result<bool> {
        let Some(error) = error else {
            return Ok(false);
        };

        let host = match reference.as_deref() {
            Some(reference) => self.lookup_by_object_reference(reference).await?,
            None => self.lookup_by_description(description).await?,
        };
        Ok(self.fault_if_unreachable(&host, error, reference).await)
    }

    async fn fault_if_unreachable(
        &self,
        host: &PartActivationHost,
        error: HostError,
        reference: Option<&mut ObjectReference>,
    ) -> bool {
        match self.probe(host).await {
            Ok(()) => {
                tracing::debug!(host_id = %host.id(), error = %error, "Host still answers, treating error as transient");
                false
            }
            Err(probe_error) => {
                tracing::debug!(host_id = %host.id(), error = %probe_error, "Host failed liveness probe");
                if let Some(reference) = reference {
                    reference.mark_faulted();
                }
                self.mark_faulted(host, error);
                true
            }
        }
    }

    /// One heartbeat bounded by the configured timeout.
    async fn probe(&self, host: &PartActivationHost) -> Result<()> {
        let limit = self.inner.config.heartbeat_timeout;
        match timeout(limit, host.heartbeat()).await {
            Ok(result) => result,
            Err(_) => Err(HostError::HeartbeatTimeout(limit)),
        }
    }

    // =========================================================================
    // Activation surface
    // =========================================================================

    /// Activate `module`/`type_name` in a host chosen by `metadata`.
    ///
    /// The type is recorded in the host only once activation succeeds, so a
    /// failed attempt leaves a `host_per_instance` host reusable for it.
    pub async fn activate(
        &self,
        metadata: &IsolationMetadata,
        module: &str,
        type_name: &str,
    ) -> Result<ObjectReference> {
        let (host, claimed) = self.acquire_host(type_name, metadata).await?;

        let result = async {
            let mut activator = host.activator().await?;
            let result = activator
                .activate_instance(host.description(), module, type_name)
                .await;
            close(activator.as_mut()).await;
            result
        }
        .await;

        match &result {
            Ok(_) => {
                // A concurrent failed activation may have released the claim.
                host.claim_type(type_name);
            }
            Err(e) => {
                // Only types actually created in the host stay recorded.
                if claimed {
                    host.release_type(type_name);
                }
                self.fault_if_unreachable(&host, e.clone(), None).await;
            }
        }
        result
    }

    /// Invoke `member` on an activated object.
    ///
    /// A failure marks the reference and its host faulted when the host no
    /// longer answers a heartbeat. Calls through a faulted reference fail
    /// with [`HostError::Faulted`].
    pub async fn invoke(
        &self,
        reference: &mut ObjectReference,
        member: &str,
        arguments: Vec<RuntimeArgument>,
    ) -> Result<Value> {
        let host = self.usable_host(reference).await?;
        let result = invoke_on(&host, reference, member, arguments).await;

        if let Err(e) = &result {
            self.fault_if_unreachable(&host, e.clone(), Some(reference))
                .await;
        }
        result
    }

    /// Release an activated object.
    pub async fn deactivate(&self, reference: &mut ObjectReference) -> Result<()> {
        let host = self.usable_host(reference).await?;
        let result = deactivate_on(&host, reference).await;

        if let Err(e) = &result {
            self.fault_if_unreachable(&host, e.clone(), Some(reference))
                .await;
        }
        result
    }

    async fn usable_host(&self, reference: &ObjectReference) -> Result<Arc<PartActivationHost>> {
        if reference.is_faulted() {
            return Err(HostError::Faulted(reference.description().clone()));
        }
        self.lookup_by_object_reference(reference).await
    }

    // =========================================================================
    // Heartbeat sweep and shutdown
    // =========================================================================

    /// Start the background heartbeat sweep.
    ///
    /// The first tick runs immediately, then every `heartbeat_interval`.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            tracing::warn!("Heartbeat sweep already started");
            return;
        }

        let registry = Arc::downgrade(&self.inner);
        let interval = self.inner.config.heartbeat_interval;
        *sweeper = Some(tokio::spawn(Self::sweep_loop(registry, interval)));
        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            "Heartbeat sweep started"
        );
    }

    /// Check if the sweep task is running.
    pub fn is_running(&self) -> bool {
        let sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        sweeper.is_some() && !self.inner.shutdown.load(Ordering::Relaxed)
    }

    async fn sweep_loop(registry: Weak<RegistryInner>, interval: std::time::Duration) {
        tracing::debug!("Sweep loop started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let Some(inner) = registry.upgrade() else {
                tracing::debug!("Registry dropped, stopping sweep");
                break;
            };

            tokio::select! {
                biased;

                _ = inner.shutdown_notify.notified() => {
                    tracing::info!("Sweep received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    if inner.shutdown.load(Ordering::Relaxed) {
                        tracing::debug!("Sweep detected shutdown flag");
                        break;
                    }
                    let registry = Self { inner: Arc::clone(&inner) };
                    registry.sweep_once().await;
                }
            }
        }

        tracing::debug!("Sweep loop exited");
    }

    /// Heartbeat every started, non-faulted host once.
    ///
    /// Hosts are probed concurrently; each failure marks its host faulted.
    /// Returns the number of hosts faulted by this sweep.
    pub async fn sweep_once(&self) -> usize {
        let candidates: Vec<_> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|host| host.is_started() && !host.is_faulted())
            .collect();

        let outcomes = join_all(candidates.iter().map(|host| async move {
            match self.probe(host).await {
                Ok(()) => false,
                Err(e) => self.mark_faulted(host, e),
            }
        }))
        .await;

        let faulted = outcomes.into_iter().filter(|f| *f).count();
        tracing::trace!(checked = candidates.len(), faulted, "Heartbeat sweep completed");
        faulted
    }

    /// Stop the sweep and every host.
    ///
    /// Hosts are stopped concurrently, each bounded by `stop_timeout`.
    /// Failures are logged and never stop the rest of the shutdown.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down activation host registry");

        self.inner.shutdown.store(true, Ordering::Relaxed);
        self.inner.shutdown_notify.notify_one();

        let sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sweeper {
            tracing::debug!("Waiting for sweep task to complete");
            if let Err(e) = handle.await {
                tracing::error!(error = ?e, "Sweep task panicked during shutdown");
            }
        }

        let hosts = self.snapshot().await;
        let count = hosts.len();
        let limit = self.inner.config.stop_timeout;
        join_all(hosts.iter().map(|host| async move {
            match timeout(limit, host.stop()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(host_id = %host.id(), error = %e, "Failed to stop activation host");
                }
                Err(_) => {
                    tracing::warn!(host_id = %host.id(), timeout_ms = limit.as_millis() as u64, "Timed out stopping activation host");
                }
            }
        }))
        .await;

        tracing::info!(hosts = count, "Registry shutdown complete");
    }
}

async fn invoke_on(
    host: &PartActivationHost,
    reference: &ObjectReference,
    member: &str,
    arguments: Vec<RuntimeArgument>,
) -> Result<Value> {
    let mut activator = host.activator().await?;
    let result = activator.invoke_member(reference, member, arguments).await;
    close(activator.as_mut()).await;
    result
}

async fn deactivate_on(host: &PartActivationHost, reference: &ObjectReference) -> Result<()> {
    let mut activator = host.activator().await?;
    let result = activator.deactivate_instance(reference).await;
    close(activator.as_mut()).await;
    result
}

async fn close(activator: &mut dyn RemoteActivator) {
    if let Err(e) = activator.close().await {
        tracing::trace!(error = %e, "Failed to close activator");
    }
}
