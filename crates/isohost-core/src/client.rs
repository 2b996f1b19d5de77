//! Agent client for communicating with isohost-agent processes.
//!
//! This module implements the socket connection and JSON-RPC message
//! exchange with an agent, and exposes it as a [`RemoteActivator`].

use crate::activator::RemoteActivator;
use crate::description::ActivationHostDescription;
use crate::error::HostError;
use crate::protocol::{
    error_codes, methods, ActivateParams, DeactivateParams, HeartbeatResult, InvokeParams,
    Request, Response,
};
use crate::reference::{ObjectReference, RuntimeArgument};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::timeout;

/// Client for one connection to an isohost-agent.
///
/// Connections are cheap; the registry opens one per activator and closes it
/// after the call sequence. Connection retries belong to the registry's
/// connect handshake, so [`connect`](Self::connect) makes a single attempt.
pub struct AgentClient {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    next_id: u64,
    call_timeout: Duration,
}

impl AgentClient {
    /// Connect to the agent listening on `socket_path`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Unreachable`] if the socket does not accept the
    /// connection.
    pub async fn connect(socket_path: &Path, call_timeout: Duration) -> Result<Self, HostError> {
        tracing::trace!(path = %socket_path.display(), "Attempting socket connection");
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            HostError::Unreachable(format!(
                "socket connect to {} failed: {e}",
                socket_path.display()
            ))
        })?;

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            next_id: 1,
            call_timeout,
        })
    }

    /// Send a JSON-RPC request and wait for response.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, times out, the connection is
    /// closed or the agent returns an error.
    pub async fn call<P: Serialize, R: DeserializeOwned>(
        &mut self,
        method: &str,
        params: P,
    ) -> Result<R, HostError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = Request::new(id, method, serde_json::to_value(params)?);
        let request_str = serde_json::to_string(&request)?;
        tracing::debug!(method = %method, id, "Sending RPC request");
        tracing::trace!(request = %request_str, "RPC request body");

        self.writer.write_all(request_str.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        // Read response with timeout
        let mut response_str = String::new();
        match timeout(self.call_timeout, self.reader.read_line(&mut response_str)).await {
            Ok(Ok(0)) => {
                tracing::warn!(method = %method, id, "Agent closed the connection");
                return Err(HostError::Unreachable("agent closed the connection".into()));
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(method = %method, id, error = %e, "RPC read error");
                return Err(e.into());
            }
            Err(_) => {
                tracing::warn!(
                    method = %method,
                    id,
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "RPC response timeout"
                );
                return Err(HostError::Unreachable(format!(
                    "no response to {method} within {:?}",
                    self.call_timeout
                )));
            }
        }

        tracing::trace!(response = %response_str.trim(), "RPC response body");
        let response: Response = serde_json::from_str(&response_str)?;

        if response.id != id {
            tracing::warn!(method = %method, id, response_id = response.id, "RPC response id mismatch");
            return Err(HostError::Rpc {
                code: error_codes::INVALID_REQUEST,
                message: format!("response id {} does not match request id {id}", response.id),
            });
        }

        if let Some(error) = response.error {
            tracing::debug!(method = %method, id, code = error.code, message = %error.message, "RPC error response");
            return Err(error.into_host_error());
        }

        let result = response.result.ok_or_else(|| HostError::Rpc {
            code: -1,
            message: "missing result in response".into(),
        })?;

        tracing::debug!(method = %method, id, "RPC call successful");
        serde_json::from_value(result).map_err(HostError::from)
    }
}

#[async_trait]
impl RemoteActivator for AgentClient {
    async fn heartbeat(&mut self) -> Result<(), HostError> {
        let _: HeartbeatResult = self.call(methods::HEARTBEAT, serde_json::json!({})).await?;
        Ok(())
    }

    async fn activate_instance(
        &mut self,
        description: &ActivationHostDescription,
        module: &str,
        type_name: &str,
    ) -> Result<ObjectReference, HostError> {
        tracing::debug!(module = %module, type_name = %type_name, "Activating instance via agent");
        self.call(
            methods::ACTIVATE_INSTANCE,
            ActivateParams {
                description: description.clone(),
                module: module.to_string(),
                type_name: type_name.to_string(),
            },
        )
        .await
    }

    async fn invoke_member(
        &mut self,
        reference: &ObjectReference,
        member: &str,
        arguments: Vec<RuntimeArgument>,
    ) -> Result<Value, HostError> {
        self.call(
            methods::INVOKE_MEMBER,
            InvokeParams {
                reference: reference.clone(),
                member: member.to_string(),
                arguments,
            },
        )
        .await
    }

    async fn deactivate_instance(&mut self, reference: &ObjectReference) -> Result<(), HostError> {
        let _: Value = self
            .call(
                methods::DEACTIVATE_INSTANCE,
                DeactivateParams {
                    reference: reference.clone(),
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), HostError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
