//! A narrow library surface over the MCP Connection and Tool Manager
//! layers: connect, list, call, disconnect. Deliberately excludes any
//! deployment lifecycle method — starting, stopping, or listing backend
//! deployments belongs to the Deployment Manager. An operator who wants a
//! deploy-then-call flow composes both types directly; the `DashMap`
//! connection registry mirrors the teacher's own `BackendManager` map.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::configresolve::ResolvedConfig;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::mcp::http::{HttpSession, HttpSessionConfig};
use crate::mcp::stdio::{StdioSession, StdioSessionConfig};
use crate::mcp::{Session, SessionHealth, ToolDescriptor};
use crate::tools::{self, ToolManager, ToolSource};

#[derive(Debug, Clone)]
pub enum ConnectOptions {
    Stdio(StdioSessionConfig),
    Http(HttpSessionConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
}

#[derive(Clone, Serialize)]
pub struct ConnectionDescriptor {
    pub connection_id: String,
    pub transport: TransportKind,
    pub health: SessionHealth,
    pub opened_at: SystemTime,
}

struct Connection {
    session: Arc<dyn Session>,
    transport: TransportKind,
    opened_at: SystemTime,
}

/// Adapts a single already-open connection to `ToolSource` so C7's cache
/// and single-flight lock can sit in front of it: the connection itself
/// is the only source, there is no image to probe and no separate
/// "running deployment" to look up — the open session already is one.
struct ConnectionToolSource {
    session: Arc<dyn Session>,
}

#[async_trait]
impl ToolSource for ConnectionToolSource {
    async fn discover_dynamic(&self, _connection_id: &str) -> Result<Vec<ToolDescriptor>> {
        self.session.list_tools().await
    }

    async fn discover_image(
        &self,
        _manifest: &Manifest,
        _config: &ResolvedConfig,
    ) -> Result<Vec<ToolDescriptor>> {
        Err(Error::ProtocolIncompatible(
            "no image probe for an already-open connection".to_string(),
        ))
    }

    fn has_running_deployment(&self, _template_id: &str) -> Option<String> {
        None
    }
}

/// `connect`/`list_connected`/`list_tools`/`call_tool`/`disconnect`/
/// `close_all` over C6 sessions, with `list_tools`/`call_tool` routed
/// through the Tool Manager (C7) for TTL-cached discovery and argument
/// validation — the same way the gateway's own tool routes do. Holds no
/// deployment state.
pub struct Client {
    connections: DashMap<String, Connection>,
    tool_manager: Arc<ToolManager>,
}

impl Client {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            tool_manager: ToolManager::with_default_ttl(),
        })
    }

    pub async fn connect(&self, options: ConnectOptions) -> Result<String> {
        let connection_id = Uuid::new_v4().to_string();
        let (session, transport): (Arc<dyn Session>, TransportKind) = match options {
            ConnectOptions::Stdio(config) => {
                (Arc::new(StdioSession::open(config).await?), TransportKind::Stdio)
            }
            ConnectOptions::Http(config) => {
                (Arc::new(HttpSession::open(config).await?), TransportKind::Http)
            }
        };

        self.connections.insert(
            connection_id.clone(),
            Connection {
                session,
                transport,
                opened_at: SystemTime::now(),
            },
        );

        Ok(connection_id)
    }

    pub fn list_connected(&self) -> Vec<ConnectionDescriptor> {
        self.connections
            .iter()
            .map(|e| ConnectionDescriptor {
                connection_id: e.key().clone(),
                transport: e.value().transport,
                health: e.value().session.health(),
                opened_at: e.value().opened_at,
            })
            .collect()
    }

    fn get(&self, connection_id: &str) -> Result<Arc<dyn Session>> {
        self.connections
            .get(connection_id)
            .map(|e| Arc::clone(&e.value().session))
            .ok_or_else(|| Error::SessionDropped(format!("no connection '{connection_id}'")))
    }

    pub async fn list_tools(&self, connection_id: &str) -> Result<Vec<ToolDescriptor>> {
        let session = self.get(connection_id)?;
        let source = ConnectionToolSource { session };
        let (tools, _) = self
            .tool_manager
            .discover_for_connection(connection_id, &source, false)
            .await?;
        Ok(tools)
    }

    pub async fn call_tool(
        &self,
        connection_id: &str,
        tool_name: &str,
        arguments: Option<Value>,
    ) -> Result<Value> {
        let session = self.get(connection_id)?;
        let source = ConnectionToolSource {
            session: Arc::clone(&session),
        };
        let (tools, _) = self
            .tool_manager
            .discover_for_connection(connection_id, &source, false)
            .await?;
        if let Some(tool) = tools.iter().find(|t| t.name == tool_name) {
            tools::validate_arguments(tool, arguments.as_ref().unwrap_or(&Value::Null))?;
        }
        session.call_tool(tool_name, arguments).await
    }

    pub async fn disconnect(&self, connection_id: &str) -> Result<()> {
        let (_, connection) = self
            .connections
            .remove(connection_id)
            .ok_or_else(|| Error::SessionDropped(format!("no connection '{connection_id}'")))?;
        connection.session.close().await
    }

    pub async fn close_all(&self) -> Result<()> {
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, connection)) = self.connections.remove(&id)
                && let Err(e) = connection.session.close().await
            {
                tracing::warn!(connection = %id, error = %e, "error closing connection");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_connection_returns_session_dropped() {
        let client = Client::new();
        let result = client.list_tools("nonexistent").await;
        assert!(matches!(result, Err(Error::SessionDropped(_))));
    }

    #[tokio::test]
    async fn list_connected_is_empty_initially() {
        let client = Client::new();
        assert!(client.list_connected().is_empty());
    }

    #[tokio::test]
    async fn disconnect_unknown_connection_fails() {
        let client = Client::new();
        let result = client.disconnect("nonexistent").await;
        assert!(matches!(result, Err(Error::SessionDropped(_))));
    }

    #[tokio::test]
    async fn close_all_on_empty_client_succeeds() {
        let client = Client::new();
        assert!(client.close_all().await.is_ok());
    }
}
