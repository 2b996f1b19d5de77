//! Host without isolation: components live in the caller's process.

use super::HostBackend;
use crate::activator::RemoteActivator;
use crate::component::{ActivationServer, ComponentCatalog};
use crate::description::{ActivationHostDescription, HostId};
use crate::error::{HostError, Result};
use crate::reference::{ObjectReference, RuntimeArgument};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Runs components in the current process with direct calls.
pub struct LocalHost {
    id: HostId,
    server: Arc<Mutex<ActivationServer>>,
    running: Arc<AtomicBool>,
}

impl LocalHost {
    /// Create a local host backed by `catalog`.
    pub fn new(id: HostId, catalog: ComponentCatalog) -> Self {
        Self {
            id,
            server: Arc::new(Mutex::new(ActivationServer::new(id, catalog))),
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl HostBackend for LocalHost {
    async fn start(&self) -> Result<()> {
        if !self.running.swap(true, Ordering::AcqRel) {
            tracing::debug!(host_id = %self.id, "Local host started");
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        lock(&self.server).clear();
        tracing::debug!(host_id = %self.id, "Local host stopped");
        Ok(())
    }

    async fn activator(&self) -> Result<Box<dyn RemoteActivator>> {
        Ok(Box::new(LocalActivator {
            server: Arc::clone(&self.server),
            running: Arc::clone(&self.running),
        }))
    }
}

struct LocalActivator {
    server: Arc<Mutex<ActivationServer>>,
    running: Arc<AtomicBool>,
}

impl LocalActivator {
    fn server(&self) -> Result<MutexGuard<'_, ActivationServer>> {
        if !self.running.load(Ordering::Acquire) {
            return Err(HostError::Unreachable("local host is not running".into()));
        }
        Ok(lock(&self.server))
    }
}

#[async_trait]
impl RemoteActivator for LocalActivator {
    async fn heartbeat(&mut self) -> Result<()> {
        self.server()?.heartbeat()
    }

    async fn activate_instance(
        &mut self,
        description: &ActivationHostDescription,
        module: &str,
        type_name: &str,
    ) -> Result<ObjectReference> {
        self.server()?
            .activate_instance(description, module, type_name)
    }

    async fn invoke_member(
        &mut self,
        reference: &ObjectReference,
        member: &str,
        arguments: Vec<RuntimeArgument>,
    ) -> Result<Value> {
        self.server()?.invoke_member(reference, member, &arguments)
    }

    async fn deactivate_instance(&mut self, reference: &ObjectReference) -> Result<()> {
        self.server()?.deactivate_instance(reference)
    }
}

fn lock(server: &Mutex<ActivationServer>) -> MutexGuard<'_, ActivationServer> {
    server.lock().unwrap_or_else(PoisonError::into_inner)
}
