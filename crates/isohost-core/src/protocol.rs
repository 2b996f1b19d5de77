//! JSON-RPC 2.0 protocol spoken between separate-process hosts and the agent.
//!
//! Messages are newline-delimited JSON over a Unix stream socket.

use crate::description::ActivationHostDescription;
use crate::error::HostError;
use crate::reference::{ObjectId, ObjectReference, RuntimeArgument};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Environment variable carrying the agent's socket path.
pub const AGENT_SOCKET_ENV: &str = "ISOHOST_AGENT_SOCKET";

/// Environment variable carrying the id of the host the agent backs.
pub const AGENT_HOST_ENV: &str = "ISOHOST_HOST_ID";

/// Method names.
pub mod methods {
    /// Liveness probe.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Instantiate an implementation type.
    pub const ACTIVATE_INSTANCE: &str = "activate_instance";
    /// Invoke a member of an activated object.
    pub const INVOKE_MEMBER: &str = "invoke_member";
    /// Release an activated object.
    pub const DEACTIVATE_INSTANCE: &str = "deactivate_instance";
}

/// JSON-RPC 2.0 standard error codes, plus the activator's application codes.
pub mod error_codes {
    /// Parse error - Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// The referenced object is not activated in this host.
    pub const OBJECT_NOT_FOUND: i32 = -32001;
    /// The catalog has no such implementation type.
    pub const UNKNOWN_TYPE: i32 = -32002;
    /// A component member failed.
    pub const INVOCATION_FAILED: i32 = -32003;
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version, must be "2.0".
    pub jsonrpc: String,
    /// Request identifier.
    pub id: u64,
    /// Method name to invoke.
    pub method: String,
    /// Method parameters (can be object or array).
    #[serde(default)]
    pub params: Value,
}

impl Request {
    /// Create a request.
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Request identifier (matches request).
    pub id: u64,
    /// Result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Create a success response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Create an error response from an activation failure.
    ///
    /// Application failures carry an [`ErrorDetail`] in `data` so the client
    /// can rebuild the same [`HostError`] variant.
    pub fn from_host_error(id: u64, err: &HostError) -> Self {
        let (code, detail) = match err {
            HostError::ObjectNotFound(object) => (
                error_codes::OBJECT_NOT_FOUND,
                Some(ErrorDetail::ObjectNotFound { object: *object }),
            ),
            HostError::UnknownType { module, type_name } => (
                error_codes::UNKNOWN_TYPE,
                Some(ErrorDetail::UnknownType {
                    module: module.clone(),
                    type_name: type_name.clone(),
                }),
            ),
            HostError::Invocation { member, message } => (
                error_codes::INVOCATION_FAILED,
                Some(ErrorDetail::Invocation {
                    member: member.clone(),
                    message: message.clone(),
                }),
            ),
            _ => (error_codes::INTERNAL_ERROR, None),
        };

        let mut response = Self::error(id, code, err.to_string());
        if let Some(error) = response.error.as_mut() {
            error.data = detail.and_then(|d| serde_json::to_value(d).ok());
        }
        response
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
    /// Additional error data (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Rebuild the [`HostError`] the agent reported.
    ///
    /// Application codes with a matching [`ErrorDetail`] map back to their
    /// variants; everything else becomes [`HostError::Rpc`].
    pub fn into_host_error(self) -> HostError {
        let detail = self
            .data
            .clone()
            .and_then(|data| serde_json::from_value::<ErrorDetail>(data).ok());

        match (self.code, detail) {
            (error_codes::OBJECT_NOT_FOUND, Some(ErrorDetail::ObjectNotFound { object })) => {
                HostError::ObjectNotFound(object)
            }
            (error_codes::UNKNOWN_TYPE, Some(ErrorDetail::UnknownType { module, type_name })) => {
                HostError::UnknownType { module, type_name }
            }
            (error_codes::INVOCATION_FAILED, Some(ErrorDetail::Invocation { member, message })) => {
                HostError::Invocation { member, message }
            }
            _ => HostError::Rpc {
                code: self.code,
                message: self.message,
            },
        }
    }
}

/// Structured `data` of an application error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorDetail {
    /// The referenced object is not activated in the host.
    ObjectNotFound {
        /// Missing object.
        object: ObjectId,
    },
    /// The catalog has no such implementation type.
    UnknownType {
        /// Module identifier.
        module: String,
        /// Type identifier.
        type_name: String,
    },
    /// A component member failed.
    Invocation {
        /// Member name.
        member: String,
        /// Failure message reported by the component.
        message: String,
    },
}

// Parameter types for the activator methods

/// Parameters for the `activate_instance` method.
#[derive(Debug, Serialize, Deserialize)]
pub struct ActivateParams {
    /// Description of the host the caller believes it talks to.
    pub description: ActivationHostDescription,
    /// Module identifier.
    pub module: String,
    /// Type identifier.
    pub type_name: String,
}

/// Parameters for the `invoke_member` method.
#[derive(Debug, Serialize, Deserialize)]
pub struct InvokeParams {
    /// Target object.
    pub reference: ObjectReference,
    /// Member name.
    pub member: String,
    /// Ordered arguments.
    #[serde(default)]
    pub arguments: Vec<RuntimeArgument>,
}

/// Parameters for the `deactivate_instance` method.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeactivateParams {
    /// Object to release.
    pub reference: ObjectReference,
}

/// Result of the `heartbeat` method.
#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResult {
    /// Always true when the agent answers.
    pub alive: bool,
}
