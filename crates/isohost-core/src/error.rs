//! Error types for isohost-core.

use crate::description::{ActivationHostDescription, HostId};
use crate::reference::ObjectId;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for isohost-core operations.
pub type Result<T> = std::result::Result<T, HostError>;

/// Errors that can occur while managing activation hosts.
///
/// `HostError` is `Clone` so that a single failure can be returned to the
/// caller and carried by a [`HostFaulted`](crate::HostFaulted) event.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    /// A freshly started host never answered its connect handshake.
    #[error("cannot start host {description}: no heartbeat after {attempts} attempts")]
    HandshakeExhausted {
        /// Description of the host that failed to come up.
        description: ActivationHostDescription,
        /// Number of heartbeat attempts made.
        attempts: u32,
    },

    /// The execution context behind a host cannot be reached.
    #[error("host unreachable: {0}")]
    Unreachable(String),

    /// A heartbeat did not complete in time.
    #[error("heartbeat timeout after {0:?}")]
    HeartbeatTimeout(Duration),

    /// No host matches the description.
    #[error("no activation host matches {0}")]
    NotFound(ActivationHostDescription),

    /// No host has the given id.
    #[error("activation host not found: {0}")]
    HostNotFound(HostId),

    /// The object is not (or no longer) activated in its host.
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// The host catalog has no factory for the implementation.
    #[error("unknown implementation type {type_name} in module {module}")]
    UnknownType {
        /// Module identifier.
        module: String,
        /// Type identifier.
        type_name: String,
    },

    /// A component member failed.
    #[error("member {member} failed: {message}")]
    Invocation {
        /// Member name.
        member: String,
        /// Failure message reported by the component.
        message: String,
    },

    /// The host or object reference is already faulted.
    #[error("host {0} is faulted")]
    Faulted(ActivationHostDescription),

    /// JSON-RPC error returned by an agent.
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// Error code from the agent
        code: i32,
        /// Error message from the agent
        message: String,
    },

    /// Invalid registry configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for HostError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for HostError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

/// Errors raised by component implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ComponentError {
    /// The component has no such member.
    #[error("unknown member: {0}")]
    UnknownMember(String),

    /// Arguments do not fit the member.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The member ran and failed.
    #[error("{0}")]
    Failed(String),
}
