//! isohost-agent: out-of-process activation host.
//!
//! Serves an [`ActivationServer`] over newline-delimited JSON-RPC on a Unix
//! socket. The `isohost-agent` binary runs [`serve`] with the
//! [`builtin_catalog`]; embedders can run it with their own catalog.

mod builtin;
mod handler;

pub use builtin::{builtin_catalog, BUILTIN_MODULE};
pub use handler::handle_request;

use isohost_core::protocol::{error_codes, Request, Response};
use isohost_core::ActivationServer;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, warn};

/// Accept connections forever, serving each on its own task.
///
/// All connections share `server`, so objects activated over one connection
/// are visible to the next.
pub async fn serve(listener: UnixListener, server: Arc<Mutex<ActivationServer>>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                debug!("accepted new connection");
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &server).await {
                        warn!(error = %e, "connection error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "failed to accept connection");
            }
        }
    }
}

/// Handle a single client connection.
///
/// Reads newline-delimited JSON-RPC requests and writes responses.
async fn handle_connection(stream: UnixStream, server: &Mutex<ActivationServer>) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            debug!("client disconnected");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        debug!(request = %trimmed, "received request");

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(req) => handle_request(server, req),
            Err(e) => {
                warn!(error = %e, "failed to parse request");
                Response::error(0, error_codes::PARSE_ERROR, format!("parse error: {}", e))
            }
        };

        let json = serde_json::to_string(&response)?;
        debug!(response = %json, "sending response");
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    Ok(())
}
