//! Separate-process host backed by a child `isohost-agent`.

use super::HostBackend;
use crate::activator::RemoteActivator;
use crate::client::AgentClient;
use crate::config::RegistryConfig;
use crate::description::HostId;
use crate::error::Result;
use crate::protocol::{AGENT_HOST_ENV, AGENT_SOCKET_ENV};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Runs components in a child agent process reached over a Unix socket.
pub struct ProcessHost {
    id: HostId,
    agent_path: PathBuf,
    socket_path: PathBuf,
    call_timeout: Duration,
    child: Mutex<Option<Child>>,
}

impl ProcessHost {
    /// Create a process host. Nothing is spawned until [`HostBackend::start`].
    pub fn new(id: HostId, config: &RegistryConfig) -> Self {
        Self {
            id,
            agent_path: config.agent_path.clone(),
            socket_path: config.runtime_dir.join(format!("{id}.sock")),
            call_timeout: config.call_timeout,
            child: Mutex::new(None),
        }
    }

    /// Socket the agent listens on.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// OS process id of the running agent, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }
}

#[async_trait]
impl HostBackend for ProcessHost {
    async fn start(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        if let Some(running) = child.as_mut() {
            if running.try_wait()?.is_none() {
                tracing::trace!(host_id = %self.id, "Agent already running");
                return Ok(());
            }
            tracing::debug!(host_id = %self.id, "Previous agent exited, respawning");
        }

        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        remove_socket(&self.socket_path).await;

        let spawned = Command::new(&self.agent_path)
            .env(AGENT_SOCKET_ENV, &self.socket_path)
            .env(AGENT_HOST_ENV, self.id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                tracing::error!(
                    host_id = %self.id,
                    agent = %self.agent_path.display(),
                    error = %e,
                    "Failed to spawn agent"
                );
                e
            })?;

        tracing::info!(
            host_id = %self.id,
            pid = spawned.id(),
            socket = %self.socket_path.display(),
            "Agent process spawned"
        );
        *child = Some(spawned);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        tracing::debug!(host_id = %self.id, pid = child.id(), "Stopping agent process");
        if let Err(e) = child.kill().await {
            tracing::warn!(host_id = %self.id, error = %e, "Failed to kill agent process");
        }
        remove_socket(&self.socket_path).await;
        tracing::info!(host_id = %self.id, "Agent process stopped");
        Ok(())
    }

    async fn activator(&self) -> Result<Box<dyn RemoteActivator>> {
        let client = AgentClient::connect(&self.socket_path, self.call_timeout).await?;
        Ok(Box::new(client))
    }
}

async fn remove_socket(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::trace!(path = %path.display(), "Removed agent socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove agent socket"),
    }
}
