//! Sandboxed in-process host.
//!
//! Components live on a dedicated OS thread that owns their object table.
//! Calls cross into the sandbox over a channel, and every call runs under
//! `catch_unwind`: a panicking component takes down its sandbox (later calls
//! see [`HostError::Unreachable`]) but never the embedding process.

use super::HostBackend;
use crate::activator::RemoteActivator;
use crate::component::{ActivationServer, ComponentCatalog};
use crate::description::{ActivationHostDescription, HostId};
use crate::error::{HostError, Result};
use crate::reference::{ObjectReference, RuntimeArgument};
use async_trait::async_trait;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Queued calls per sandbox before callers wait.
const CALL_QUEUE_DEPTH: usize = 32;

enum SandboxCall {
    Heartbeat {
        reply: oneshot::Sender<Result<()>>,
    },
    Activate {
        description: ActivationHostDescription,
        module: String,
        type_name: String,
        reply: oneshot::Sender<Result<ObjectReference>>,
    },
    Invoke {
        reference: ObjectReference,
        member: String,
        arguments: Vec<RuntimeArgument>,
        reply: oneshot::Sender<Result<Value>>,
    },
    Deactivate {
        reference: ObjectReference,
        reply: oneshot::Sender<Result<()>>,
    },
}

struct Sandbox {
    sender: mpsc::Sender<SandboxCall>,
    thread: JoinHandle<()>,
}

/// Runs components on a dedicated sandbox thread.
pub struct SandboxedHost {
    id: HostId,
    catalog: ComponentCatalog,
    sandbox: Mutex<Option<Sandbox>>,
}

impl SandboxedHost {
    /// Create a sandboxed host backed by `catalog`.
    pub fn new(id: HostId, catalog: ComponentCatalog) -> Self {
        Self {
            id,
            catalog,
            sandbox: Mutex::new(None),
        }
    }
}

#[async_trait]
impl HostBackend for SandboxedHost {
    async fn start(&self) -> Result<()> {
        let mut sandbox = self.sandbox.lock().await;
        if sandbox.is_some() {
            tracing::trace!(host_id = %self.id, "Sandbox already started");
            return Ok(());
        }

        let (sender, receiver) = mpsc::channel(CALL_QUEUE_DEPTH);
        let server = ActivationServer::new(self.id, self.catalog.clone());
        let host_id = self.id;
        let thread = std::thread::Builder::new()
            .name(format!("isohost-sandbox-{host_id}"))
            .spawn(move || sandbox_loop(host_id, server, receiver))?;

        tracing::info!(host_id = %self.id, "Sandbox thread started");
        *sandbox = Some(Sandbox { sender, thread });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(sandbox) = self.sandbox.lock().await.take() else {
            return Ok(());
        };

        // Closing the channel ends the sandbox loop.
        drop(sandbox.sender);
        let joined = tokio::task::spawn_blocking(move || sandbox.thread.join()).await;
        match joined {
            Ok(Ok(())) => tracing::debug!(host_id = %self.id, "Sandbox thread stopped"),
            Ok(Err(_)) => tracing::warn!(host_id = %self.id, "Sandbox thread ended with a panic"),
            Err(e) => tracing::warn!(host_id = %self.id, error = %e, "Failed to join sandbox thread"),
        }
        Ok(())
    }

    async fn activator(&self) -> Result<Box<dyn RemoteActivator>> {
        let sandbox = self.sandbox.lock().await;
        let sender = sandbox
            .as_ref()
            .map(|s| s.sender.clone())
            .ok_or_else(|| HostError::Unreachable("sandbox is not running".into()))?;
        Ok(Box::new(SandboxActivator { sender }))
    }
}

fn sandbox_loop(
    host_id: HostId,
    mut server: ActivationServer,
    mut receiver: mpsc::Receiver<SandboxCall>,
) {
    tracing::debug!(host_id = %host_id, "Sandbox loop started");

    while let Some(call) = receiver.blocking_recv() {
        let outcome = catch_unwind(AssertUnwindSafe(|| dispatch(&mut server, call)));
        if outcome.is_err() {
            tracing::error!(host_id = %host_id, "Component panicked, tearing down sandbox");
            break;
        }
    }

    tracing::debug!(host_id = %host_id, objects = server.object_count(), "Sandbox loop exited");
}

fn dispatch(server: &mut ActivationServer, call: SandboxCall) {
    // A dropped reply receiver only means the caller gave up waiting.
    match call {
        SandboxCall::Heartbeat { reply } => {
            let _ = reply.send(server.heartbeat());
        }
        SandboxCall::Activate {
            description,
            module,
            type_name,
            reply,
        } => {
            let _ = reply.send(server.activate_instance(&description, &module, &type_name));
        }
        SandboxCall::Invoke {
            reference,
            member,
            arguments,
            reply,
        } => {
            let _ = reply.send(server.invoke_member(&reference, &member, &arguments));
        }
        SandboxCall::Deactivate { reference, reply } => {
            let _ = reply.send(server.deactivate_instance(&reference));
        }
    }
}

struct SandboxActivator {
    sender: mpsc::Sender<SandboxCall>,
}

impl SandboxActivator {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> SandboxCall,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(make(reply))
            .await
            .map_err(|_| HostError::Unreachable("sandbox has shut down".into()))?;
        response
            .await
            .map_err(|_| HostError::Unreachable("sandbox dropped the call".into()))?
    }
}

#[async_trait]
impl RemoteActivator for SandboxActivator {
    async fn heartbeat(&mut self) -> Result<()> {
        self.call(|reply| SandboxCall::Heartbeat { reply }).await
    }

    async fn activate_instance(
        &mut self,
        description: &ActivationHostDescription,
        module: &str,
        type_name: &str,
    ) -> Result<ObjectReference> {
        let description = description.clone();
        let module = module.to_string();
        let type_name = type_name.to_string();
        self.call(|reply| SandboxCall::Activate {
            description,
            module,
            type_name,
            reply,
        })
        .await
    }

    async fn invoke_member(
        &mut self,
        reference: &ObjectReference,
        member: &str,
        arguments: Vec<RuntimeArgument>,
    ) -> Result<Value> {
        let reference = reference.clone();
        let member = member.to_string();
        self.call(|reply| SandboxCall::Invoke {
            reference,
            member,
            arguments,
            reply,
        })
        .await
    }

    async fn deactivate_instance(&mut self, reference: &ObjectReference) -> Result<()> {
        let reference = reference.clone();
        self.call(|reply| SandboxCall::Deactivate { reference, reply })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::description::IsolationLevel;
    use crate::error::ComponentError;
    use serde_json::json;

    struct Fragile;

    impl Component for Fragile {
        fn invoke(&mut self, member: &str, _arguments: &[Value]) -> std::result::Result<Value, ComponentError> {
            match member {
                "ping" => Ok(json!("pong")),
                _ => panic!("fragile component broke on {member}"),
            }
        }
    }

    fn host() -> SandboxedHost {
        SandboxedHost::new(
            HostId::new(),
            ComponentCatalog::new().with("tests", "Fragile", || Fragile),
        )
    }

    fn description() -> ActivationHostDescription {
        ActivationHostDescription::new(IsolationLevel::SandboxedInProcess, "tests")
    }

    #[tokio::test]
    async fn test_activator_before_start_is_unreachable() {
        let host = host();
        assert!(matches!(
            host.activator().await.map(|_| ()),
            Err(HostError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_calls_cross_into_sandbox() {
        let host = host();
        host.start().await.expect("start");
        host.start().await.expect("second start is a no-op");

        let mut activator = host.activator().await.expect("activator");
        activator.heartbeat().await.expect("heartbeat");
        let reference = activator
            .activate_instance(&description(), "tests", "Fragile")
            .await
            .expect("activate");
        let value = activator
            .invoke_member(&reference, "ping", Vec::new())
            .await
            .expect("invoke");
        assert_eq!(value, json!("pong"));
        activator.deactivate_instance(&reference).await.expect("deactivate");
        activator.close().await.expect("close");

        host.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_panicking_component_kills_only_the_sandbox() {
        let host = host();
        host.start().await.expect("start");

        let mut activator = host.activator().await.expect("activator");
        let reference = activator
            .activate_instance(&description(), "tests", "Fragile")
            .await
            .expect("activate");
        let result = activator.invoke_member(&reference, "explode", Vec::new()).await;
        assert!(matches!(result, Err(HostError::Unreachable(_))));

        let mut probe = host.activator().await.expect("activator");
        assert!(probe.heartbeat().await.is_err());

        host.stop().await.expect("stop after panic");
    }
}
