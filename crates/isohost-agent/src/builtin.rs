//! Built-in diagnostic components.
//!
//! Every agent serves these under [`BUILTIN_MODULE`] so a registry can probe
//! an out-of-process host without shipping components of its own.

use isohost_core::{Component, ComponentCatalog, ComponentError};
use serde_json::{json, Value};

/// Module name of the built-in components.
pub const BUILTIN_MODULE: &str = "isohost.builtin";

/// Catalog with `Echo`, `Counter` and `Terminator`.
pub fn builtin_catalog() -> ComponentCatalog {
    ComponentCatalog::new()
        .with(BUILTIN_MODULE, "Echo", || Echo)
        .with(BUILTIN_MODULE, "Counter", Counter::default)
        .with(BUILTIN_MODULE, "Terminator", || Terminator)
}

/// `echo(value)` returns its argument, or null without one.
struct Echo;

impl Component for Echo {
    fn invoke(&mut self, member: &str, arguments: &[Value]) -> Result<Value, ComponentError> {
        match member {
            "echo" => Ok(arguments.first().cloned().unwrap_or(Value::Null)),
            _ => Err(ComponentError::UnknownMember(member.to_string())),
        }
    }
}

/// Per-object counter: `increment(by = 1)` and `get()`.
#[derive(Default)]
struct Counter {
    value: i64,
}

impl Component for Counter {
    fn invoke(&mut self, member: &str, arguments: &[Value]) -> Result<Value, ComponentError> {
        match member {
            "increment" => {
                let by = match arguments.first() {
                    None => 1,
                    Some(v) => v.as_i64().ok_or_else(|| {
                        ComponentError::InvalidArguments(format!("expected an integer, got {v}"))
                    })?,
                };
                self.value = self.value.saturating_add(by);
                Ok(json!(self.value))
            }
            "get" => Ok(json!(self.value)),
            _ => Err(ComponentError::UnknownMember(member.to_string())),
        }
    }
}

/// `exit(code = 0)` ends the agent process without replying.
struct Terminator;

impl Component for Terminator {
    fn invoke(&mut self, member: &str, arguments: &[Value]) -> Result<Value, ComponentError> {
        match member {
            "exit" => {
                let code = exit_code(arguments);
                tracing::warn!(code, "Terminator invoked, exiting agent");
                std::process::exit(code)
            }
            _ => Err(ComponentError::UnknownMember(member.to_string())),
        }
    }
}

/// Exit status requested by `exit`; codes outside `i32` become 1.
fn exit_code(arguments: &[Value]) -> i32 {
    let code = arguments.first().and_then(Value::as_i64).unwrap_or(0);
    i32::try_from(code).unwrap_or(1)
}
