use std::sync::atomic::AtomicU8;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::{
    ServiceExt, model::*, service::RunningService,
    transport::streamable_http_client::{
        StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
    },
};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::{
    health_from_atomic, map_call_tool_result, map_timeout, store_health, Session, SessionHealth,
    ToolDescriptor, DEFAULT_CALL_TIMEOUT, STATE_HEALTHY,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct HttpSessionConfig {
    pub url: String,
    pub headers: std::collections::HashMap<String, String>,
    pub call_timeout: Duration,
}

impl Default for HttpSessionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: std::collections::HashMap::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// A streamable-HTTP MCP session. One TCP connection is reused per
/// session; no server push.
pub struct HttpSession {
    config: HttpSessionConfig,
    service: RwLock<Option<RunningService<rmcp::RoleClient, ()>>>,
    state: AtomicU8,
}

impl HttpSession {
    pub async fn open(config: HttpSessionConfig) -> Result<Self> {
        let mut transport_config = StreamableHttpClientTransportConfig::with_uri(config.url.clone());
        if let Some(auth) = config.headers.get("Authorization") {
            let token = auth.strip_prefix("Bearer ").unwrap_or(auth);
            transport_config = transport_config.auth_header(token);
        }

        let mut default_headers = reqwest::header::HeaderMap::new();
        for (key, value) in &config.headers {
            if key.eq_ignore_ascii_case("Authorization") {
                continue;
            }
            match (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                (Ok(name), Ok(val)) => {
                    default_headers.insert(name, val);
                }
                _ => warn!(header = %key, "skipping unparseable custom header"),
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(|e| Error::ProtocolError(format!("failed to build HTTP client: {e}")))?;

        let transport = StreamableHttpClientTransport::with_client(client, transport_config);

        let service = ().serve(transport).await.map_err(|e| {
            Error::ProtocolIncompatible(format!(
                "MCP handshake failed against {}: {e}",
                config.url
            ))
        })?;

        if let Some(peer) = service.peer_info() {
            info!(
                url = %config.url,
                server_name = %peer.server_info.name,
                server_version = %peer.server_info.version,
                "MCP http handshake complete"
            );
        } else {
            info!(url = %config.url, "MCP http handshake complete (no peer info)");
        }

        Ok(Self {
            config,
            service: RwLock::new(Some(service)),
            state: AtomicU8::new(STATE_HEALTHY),
        })
    }
}

#[async_trait]
impl Session for HttpSession {
    async fn call_tool(&self, tool_name: &str, arguments: Option<Value>) -> Result<Value> {
        let guard = self.service.read().await;
        let Some(service) = guard.as_ref() else {
            return Err(Error::SessionDropped("http session closed".to_string()));
        };

        let params = CallToolRequestParams {
            meta: None,
            name: tool_name.to_string().into(),
            arguments: arguments.and_then(|v| v.as_object().cloned()),
            task: None,
        };

        let result = map_timeout(
            tokio::time::timeout(self.config.call_timeout, service.call_tool(params)).await,
        )?;

        match result {
            Ok(result) => Ok(map_call_tool_result(result)),
            Err(e) => {
                store_health(&self.state, SessionHealth::Unhealthy);
                Err(Error::ProtocolError(e.to_string()))
            }
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let guard = self.service.read().await;
        let Some(service) = guard.as_ref() else {
            return Err(Error::SessionDropped("http session closed".to_string()));
        };

        let tools = service
            .list_all_tools()
            .await
            .map_err(|e| Error::ProtocolError(e.to_string()))?;

        Ok(tools
            .into_iter()
            .map(|t| ToolDescriptor {
                name: t.name.to_string(),
                description: t.description.unwrap_or_default().to_string(),
                input_schema: serde_json::to_value(&t.input_schema).unwrap_or(Value::Null),
            })
            .collect())
    }

    fn health(&self) -> SessionHealth {
        health_from_atomic(&self.state)
    }

    async fn close(&self) -> Result<()> {
        store_health(&self.state, SessionHealth::Closed);
        if let Some(service) = self.service.write().await.take()
            && let Err(e) = service.cancel().await
        {
            warn!(error = %e, "error cancelling http service");
        }
        Ok(())
    }
}
