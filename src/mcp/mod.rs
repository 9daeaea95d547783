pub mod http;
pub mod stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use rmcp::model::{CallToolResult, RawContent};

pub(crate) const STATE_HEALTHY: u8 = 0;
pub(crate) const STATE_UNHEALTHY: u8 = 1;
pub(crate) const STATE_CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionHealth {
    Healthy,
    Unhealthy,
    Closed,
}

pub(crate) fn health_from_atomic(state: &AtomicU8) -> SessionHealth {
    match state.load(Ordering::Acquire) {
        STATE_HEALTHY => SessionHealth::Healthy,
        STATE_UNHEALTHY => SessionHealth::Unhealthy,
        _ => SessionHealth::Closed,
    }
}

pub(crate) fn store_health(atomic: &AtomicU8, health: SessionHealth) {
    let val = match health {
        SessionHealth::Healthy => STATE_HEALTHY,
        SessionHealth::Unhealthy => STATE_UNHEALTHY,
        SessionHealth::Closed => STATE_CLOSED,
    };
    atomic.store(val, Ordering::Release);
}

/// One descriptor of a tool as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A JSON-RPC 2.0 session over stdio or HTTP: handshake, request/response
/// correlation, timeouts, cancellation. Owned exclusively by whichever
/// component opened it (gateway pool, client, or one-shot tool probe) and
/// must be closed on every exit path.
#[async_trait]
pub trait Session: Send + Sync {
    async fn call_tool(&self, tool_name: &str, arguments: Option<Value>) -> Result<Value>;
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;
    fn health(&self) -> SessionHealth;
    async fn close(&self) -> Result<()>;
}

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn map_timeout<T>(result: std::result::Result<T, tokio::time::error::Elapsed>) -> Result<T> {
    result.map_err(|_| Error::Timeout)
}

/// Map an rmcp `CallToolResult` down to a JSON value: a single text content
/// item collapses to a bare string, multiple items become an array.
pub(crate) fn map_call_tool_result(result: CallToolResult) -> Value {
    let contents: Vec<Value> = result
        .content
        .into_iter()
        .map(|c| match c.raw {
            RawContent::Text(t) => Value::String(t.text),
            _ => Value::String("[non-text content]".to_string()),
        })
        .collect();

    if contents.len() == 1 {
        contents.into_iter().next().expect("len checked above")
    } else {
        Value::Array(contents)
    }
}
