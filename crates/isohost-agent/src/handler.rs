//! Request handler for isohost-agent.
//!
//! Routes JSON-RPC requests to the agent's [`ActivationServer`].

use isohost_core::protocol::{
    error_codes, methods, ActivateParams, DeactivateParams, HeartbeatResult, InvokeParams,
    Request, Response,
};
use isohost_core::{ActivationServer, HostError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// Handle a JSON-RPC request and return a response.
///
/// Supported methods:
/// - `heartbeat` - Liveness probe, returns `{alive: true}`.
/// - `activate_instance` - Instantiate a catalog type, returns its reference.
/// - `invoke_member` - Invoke a member on an activated object.
/// - `deactivate_instance` - Release an activated object.
pub fn handle_request(server: &Mutex<ActivationServer>, req: Request) -> Response {
    debug!(method = %req.method, id = req.id, "handling request");
    trace!(params = ?req.params, "request params");

    let response = match req.method.as_str() {
        methods::HEARTBEAT => {
            let alive = lock(server).heartbeat().map(|()| HeartbeatResult { alive: true });
            reply(req.id, alive)
        }

        methods::ACTIVATE_INSTANCE => with_params(req.id, req.params, |p: ActivateParams| {
            lock(server).activate_instance(&p.description, &p.module, &p.type_name)
        }),

        methods::INVOKE_MEMBER => with_params(req.id, req.params, |p: InvokeParams| {
            lock(server).invoke_member(&p.reference, &p.member, &p.arguments)
        }),

        methods::DEACTIVATE_INSTANCE => with_params(req.id, req.params, |p: DeactivateParams| {
            lock(server)
                .deactivate_instance(&p.reference)
                .map(|()| json!({"deactivated": true}))
        }),

        _ => {
            warn!(method = %req.method, "unknown method");
            Response::error(
                req.id,
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {}", req.method),
            )
        }
    };

    if response.error.is_some() {
        debug!(id = req.id, error = ?response.error, "request failed");
    } else {
        debug!(id = req.id, "request succeeded");
        trace!(result = ?response.result, "response result");
    }

    response
}

/// Decode `params` as `P` and run `op`, mapping failures to JSON-RPC errors.
fn with_params<P, T, F>(id: u64, params: Value, op: F) -> Response
where
    P: DeserializeOwned,
    T: Serialize,
    F: FnOnce(P) -> Result<T, HostError>,
{
    match serde_json::from_value::<P>(params) {
        Ok(p) => reply(id, op(p)),
        Err(e) => {
            warn!(id = id, error = %e, "invalid params");
            Response::error(
                id,
                error_codes::INVALID_PARAMS,
                format!("invalid params: {}", e),
            )
        }
    }
}

fn reply<T: Serialize>(id: u64, result: Result<T, HostError>) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(&value) {
            Ok(v) => Response::success(id, v),
            Err(e) => Response::error(id, error_codes::INTERNAL_ERROR, e.to_string()),
        },
        Err(e) => Response::from_host_error(id, &e),
    }
}

fn lock(server: &Mutex<ActivationServer>) -> MutexGuard<'_, ActivationServer> {
    server.lock().unwrap_or_else(PoisonError::into_inner)
}
