//! isohost-agent: out-of-process activation host.
//!
//! Spawned by the registry for `SeparateProcess` hosts. Listens on the Unix
//! socket named by `ISOHOST_AGENT_SOCKET` and serves the built-in catalog
//! until Ctrl-C.

use anyhow::Context;
use isohost_agent::{builtin_catalog, serve};
use isohost_core::protocol::{AGENT_HOST_ENV, AGENT_SOCKET_ENV};
use isohost_core::{ActivationServer, HostId};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; the registry owns stdout of its children.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("isohost_agent=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let socket_path = PathBuf::from(
        std::env::var(AGENT_SOCKET_ENV).with_context(|| format!("{AGENT_SOCKET_ENV} is not set"))?,
    );
    let host_id = match std::env::var(AGENT_HOST_ENV) {
        Ok(value) => value
            .parse::<HostId>()
            .with_context(|| format!("invalid {AGENT_HOST_ENV}: {value}"))?,
        Err(_) => HostId::new(),
    };

    info!(host_id = %host_id, "isohost-agent starting...");

    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;
        debug!("removed existing socket file");
    }

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    info!(path = %socket_path.display(), "listening for connections");

    let server = Arc::new(Mutex::new(ActivationServer::new(host_id, builtin_catalog())));

    tokio::select! {
        _ = serve(listener, server) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
        }
    }

    if let Err(e) = std::fs::remove_file(&socket_path) {
        warn!(error = %e, "failed to remove socket file");
    }
    info!("isohost-agent stopped");
    Ok(())
}
