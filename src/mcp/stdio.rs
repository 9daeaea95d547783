use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::AtomicU8;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::{ServiceExt, model::*, service::RunningService};
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    health_from_atomic, map_call_tool_result, map_timeout, store_health, Session, SessionHealth,
    ToolDescriptor, DEFAULT_CALL_TIMEOUT, STATE_HEALTHY,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct StdioSessionConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub call_timeout: Duration,
}

impl Default for StdioSessionConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// A stdio child-process MCP session. Spawns the child directly (rather
/// than going through a higher-level process pool) to retain the `Child`
/// handle for instant crash detection and process-group isolation on
/// close.
pub struct StdioSession {
    config: StdioSessionConfig,
    service: RwLock<Option<RunningService<rmcp::RoleClient, ()>>>,
    child: RwLock<Option<tokio::process::Child>>,
    state: AtomicU8,
}

impl StdioSession {
    /// Spawn the child process and perform the MCP handshake.
    pub async fn open(config: StdioSessionConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        for (k, v) in &config.env {
            cmd.env(k, v);
        }
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::null());

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ProtocolError(format!("failed to spawn '{}': {e}", config.command)))?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ProtocolError("failed to capture stdout".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::ProtocolError("failed to capture stdin".to_string()))?;

        let service = ().serve((stdout, stdin)).await.map_err(|e| {
            Error::ProtocolIncompatible(format!("MCP handshake failed: {e}"))
        })?;

        if let Some(peer) = service.peer_info() {
            info!(
                pid = ?pid,
                server_name = %peer.server_info.name,
                server_version = %peer.server_info.version,
                "MCP stdio handshake complete"
            );
        } else {
            info!(pid = ?pid, "MCP stdio handshake complete (no peer info)");
        }

        Ok(Self {
            config,
            service: RwLock::new(Some(service)),
            child: RwLock::new(Some(child)),
            state: AtomicU8::new(STATE_HEALTHY),
        })
    }

    /// SIGTERM the process group, then ensure the child is dead regardless.
    async fn kill_child(&self, child: &mut tokio::process::Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
            if ret == 0 {
                debug!(pid, "sent SIGTERM to process group");
                tokio::time::sleep(Duration::from_millis(200)).await;
            } else {
                warn!(pid, "failed to signal process group, killing child directly");
            }
        }
        let _ = child.kill().await;
    }

    /// Wait for unexpected process exit; used by the stdio pool to detect a
    /// crashed worker without an idle health probe.
    pub async fn wait_for_exit(&self) -> Option<std::process::ExitStatus> {
        let mut guard = self.child.write().await;
        guard.as_mut()?.wait().await.ok()
    }
}

#[async_trait]
impl Session for StdioSession {
    async fn call_tool(&self, tool_name: &str, arguments: Option<Value>) -> Result<Value> {
        let guard = self.service.read().await;
        let Some(service) = guard.as_ref() else {
            return Err(Error::SessionDropped("stdio session closed".to_string()));
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
            return Err(Error::SessionDropped("stdio session closed".to_string()));
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
            warn!(error = %e, "error cancelling stdio service");
        }

        if let Some(mut child) = self.child.write().await.take() {
            self.kill_child(&mut child).await;
        }

        Ok(())
    }
}
