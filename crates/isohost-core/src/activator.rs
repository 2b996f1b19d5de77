//! The remote activator contract every host exposes.

use crate::description::ActivationHostDescription;
use crate::error::Result;
use crate::reference::{ObjectReference, RuntimeArgument};
use async_trait::async_trait;
use serde_json::Value;

/// Call surface of one host.
///
/// An activator is a short-lived handle: obtain it from
/// [`PartActivationHost::activator`](crate::PartActivationHost::activator),
/// use it for one call sequence and [`close`](Self::close) it whatever the
/// outcome, since it may hold a transport connection.
#[async_trait]
pub trait RemoteActivator: Send {
    /// Liveness probe without side effects.
    async fn heartbeat(&mut self) -> Result<()>;

    /// Instantiate `module`/`type_name` inside the host.
    async fn activate_instance(
        &mut self,
        description: &ActivationHostDescription,
        module: &str,
        type_name: &str,
    ) -> Result<ObjectReference>;

    /// Invoke `member` on a previously activated object.
    async fn invoke_member(
        &mut self,
        reference: &ObjectReference,
        member: &str,
        arguments: Vec<RuntimeArgument>,
    ) -> Result<Value>;

    /// Release the server-side state of an object.
    async fn deactivate_instance(&mut self, reference: &ObjectReference) -> Result<()>;

    /// Release the handle and its transport resources.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
