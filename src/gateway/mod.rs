pub mod health;
pub mod pool_http;
pub mod pool_stdio;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{GatewayRegistryFile, LoadBalancePolicy, RegistryEntry};
use crate::configresolve::{self, Layers, ResolvedConfig};
use crate::deploy::{DeployOptions, DeploymentManager, Endpoint};
use crate::error::{Error, Result};
use crate::manifest::{Manifest, Transport};
use crate::mcp::stdio::StdioSessionConfig;
use crate::template_registry::TemplateRegistry;
use crate::tools::source::DeploymentToolSource;
use crate::tools::{self, DiscoveryMode, ToolManager};
use pool_http::HttpPool;
use pool_stdio::StdioPool;

/// Manifest + discovery mode + resolved config backing a pool that was
/// expanded from a `Template` registry entry, kept so `list_tools`/
/// `call_tool` can route through the Tool Manager's cache and argument
/// validation instead of only forwarding blind to the live pool.
struct TemplateBinding {
    manifest: Arc<Manifest>,
    mode: DiscoveryMode,
    config: ResolvedConfig,
}

#[derive(Clone)]
pub enum ServerPool {
    Http(Arc<HttpPool>),
    Stdio(Arc<StdioPool>),
}

impl ServerPool {
    fn kind(&self) -> &'static str {
        match self {
            ServerPool::Http(_) => "http",
            ServerPool::Stdio(_) => "stdio",
        }
    }

    async fn drain(&self) {
        if let ServerPool::Stdio(pool) = self {
            pool.drain().await;
        }
    }
}

/// The HTTP front door: routes `/{server_id}/...` to downstream MCP
/// servers, holding one pool per registry entry. Template entries are
/// expanded into an Http or Stdio pool at load time by consulting the
/// template registry and, for http-transport templates, the Deployment
/// Manager.
pub struct Gateway {
    pools: Arc<DashMap<String, ServerPool>>,
    template_bindings: DashMap<String, TemplateBinding>,
    current: arc_swap::ArcSwap<GatewayRegistryFile>,
    template_registry: Option<Arc<TemplateRegistry>>,
    deployment_manager: Option<Arc<DeploymentManager>>,
    tool_manager: Arc<ToolManager>,
    tool_source: Option<Arc<DeploymentToolSource>>,
}

impl Gateway {
    /// Exposes the pool map for the background health-check task, which
    /// needs to iterate it on every tick without taking a dependency on the
    /// rest of `Gateway`'s state.
    pub fn pools_for_health_checker(&self) -> Arc<DashMap<String, ServerPool>> {
        Arc::clone(&self.pools)
    }

    /// Exposes the deployment-backed tool source for the background task
    /// that keeps its running-deployment snapshot fresh; `None` when the
    /// gateway was built with no deployment manager (pure http/stdio
    /// registries, nothing to probe).
    pub fn tool_source_for_refresh(&self) -> Option<Arc<DeploymentToolSource>> {
        self.tool_source.clone()
    }

    pub async fn load(
        registry: GatewayRegistryFile,
        template_registry: Option<Arc<TemplateRegistry>>,
        deployment_manager: Option<Arc<DeploymentManager>>,
    ) -> Result<Arc<Self>> {
        let pools = Arc::new(DashMap::new());
        let template_bindings = DashMap::new();
        for (id, entry) in &registry.servers {
            let (pool, binding) =
                Self::build_pool(entry, template_registry.as_ref(), deployment_manager.as_ref())
                    .await?;
            pools.insert(id.clone(), pool);
            if let Some(binding) = binding {
                template_bindings.insert(id.clone(), binding);
            }
        }

        let tool_source = deployment_manager.as_ref().map(|m| DeploymentToolSource::new(Arc::clone(m)));

        Ok(Arc::new(Self {
            pools,
            template_bindings,
            current: arc_swap::ArcSwap::from_pointee(registry),
            template_registry,
            deployment_manager,
            tool_manager: ToolManager::with_default_ttl(),
            tool_source,
        }))
    }

    async fn build_pool(
        entry: &RegistryEntry,
        template_registry: Option<&Arc<TemplateRegistry>>,
        deployment_manager: Option<&Arc<DeploymentManager>>,
    ) -> Result<(ServerPool, Option<TemplateBinding>)> {
        match entry {
            RegistryEntry::Http {
                instances,
                health_check_path,
                load_balance: LoadBalancePolicy::RoundRobin,
            } => Ok((
                ServerPool::Http(Arc::new(HttpPool::new(instances.clone(), health_check_path.clone()))),
                None,
            )),
            RegistryEntry::Stdio {
                command,
                args,
                env,
                cwd,
                pool_size,
                queue_capacity,
            } => {
                let config = StdioSessionConfig {
                    command: command.clone(),
                    args: args.clone(),
                    env: env.clone(),
                    cwd: cwd.clone(),
                    ..Default::default()
                };
                Ok((
                    ServerPool::Stdio(Arc::new(StdioPool::new(config, *pool_size, *queue_capacity))),
                    None,
                ))
            }
            RegistryEntry::Template {
                template_id,
                replica_count,
                config_override,
                discovery_mode,
            } => {
                Self::expand_template(
                    template_id,
                    *replica_count,
                    config_override,
                    *discovery_mode,
                    template_registry,
                    deployment_manager,
                )
                .await
            }
        }
    }

    async fn expand_template(
        template_id: &str,
        replica_count: usize,
        config_override: &HashMap<String, Value>,
        discovery_mode: DiscoveryMode,
        template_registry: Option<&Arc<TemplateRegistry>>,
        deployment_manager: Option<&Arc<DeploymentManager>>,
    ) -> Result<(ServerPool, Option<TemplateBinding>)> {
        let registry = template_registry
            .ok_or_else(|| Error::TemplateNotFound(template_id.to_string()))?;
        let manifest = registry
            .get(template_id)
            .ok_or_else(|| Error::TemplateNotFound(template_id.to_string()))?;

        let layers = Layers {
            file: config_override.clone(),
            ..Default::default()
        };
        let resolved = configresolve::resolve(&manifest, &layers)?;

        let pool = match manifest.transport.default {
            Transport::Http => {
                let manager = deployment_manager.ok_or_else(|| {
                    Error::BackendUnreachable(
                        "template entry requires a deployment manager for http transport".to_string(),
                    )
                })?;

                let mut instances = Vec::with_capacity(replica_count);
                for _ in 0..replica_count {
                    let descriptor = manager
                        .deploy(template_id, &layers, DeployOptions::default(), None)
                        .await?;
                    if let Some(Endpoint::Http { host, port }) = descriptor.endpoint {
                        instances.push(format!("http://{host}:{port}"));
                    } else {
                        warn!(template = %template_id, "deployed replica has no http endpoint");
                    }
                }
                ServerPool::Http(Arc::new(HttpPool::new(instances, "/health".to_string())))
            }
            Transport::Stdio => {
                let (command, args) = manifest
                    .command
                    .as_ref()
                    .and_then(|c| c.split_first())
                    .map(|(cmd, rest)| (cmd.clone(), rest.to_vec()))
                    .ok_or_else(|| {
                        Error::TemplateMalformed {
                            id: template_id.to_string(),
                            reason: "stdio template has no command to spawn pool sessions from"
                                .to_string(),
                        }
                    })?;
                let env: HashMap<String, String> = resolved.env.clone().into_iter().collect();
                let config = StdioSessionConfig {
                    command,
                    args,
                    env,
                    cwd: None,
                    ..Default::default()
                };
                ServerPool::Stdio(Arc::new(StdioPool::new(config, replica_count, 16)))
            }
        };

        let binding = TemplateBinding {
            manifest,
            mode: discovery_mode,
            config: resolved,
        };
        Ok((pool, Some(binding)))
    }

    /// Diff the current registry against `new_registry` and apply it: new
    /// entries spun up, removed entries drained then closed, modified
    /// entries built side-by-side before the route swaps — no in-flight
    /// request sees a partial swap because the new pool replaces the old
    /// one in a single map write.
    pub async fn apply_reload(&self, new_registry: GatewayRegistryFile) -> Result<()> {
        let diff = self.current.load().diff_servers(&new_registry);

        for id in &diff.removed {
            if let Some((_, pool)) = self.pools.remove(id) {
                pool.drain().await;
            }
            self.template_bindings.remove(id);
            info!(server = %id, "registry reload: removed entry");
        }

        for (id, entry) in diff.added.iter().chain(diff.changed.iter()) {
            let (new_pool, binding) = Self::build_pool(
                entry,
                self.template_registry.as_ref(),
                self.deployment_manager.as_ref(),
            )
            .await?;
            if let Some(old) = self.pools.insert(id.clone(), new_pool) {
                old.drain().await;
            }
            match binding {
                Some(binding) => {
                    self.template_bindings.insert(id.clone(), binding);
                }
                None => {
                    self.template_bindings.remove(id);
                }
            }
            info!(server = %id, "registry reload: applied entry");
        }

        self.current.store(Arc::new(new_registry));
        Ok(())
    }

    pub fn into_router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", get(list_entries))
            .route("/health", get(health))
            .route("/servers", get(list_servers))
            .route("/servers/{id}", get(server_detail))
            .route("/{id}/tools", get(list_tools))
            .route("/{id}/tools/{tool_name}", post(call_tool))
            .route("/{id}/{*rest}", any(forward_verbatim))
            .with_state(self)
    }
}

#[derive(Serialize)]
struct EntrySummary {
    id: String,
    r#type: &'static str,
}

async fn list_entries(State(gateway): State<Arc<Gateway>>) -> Json<Vec<EntrySummary>> {
    let entries = gateway
        .pools
        .iter()
        .map(|e| EntrySummary {
            id: e.key().clone(),
            r#type: e.value().kind(),
        })
        .collect();
    Json(entries)
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Serialize)]
struct ServerSummary {
    id: String,
    r#type: &'static str,
    healthy_instances: usize,
    total_instances: usize,
}

async fn list_servers(State(gateway): State<Arc<Gateway>>) -> Json<Vec<ServerSummary>> {
    let servers = gateway
        .pools
        .iter()
        .map(|e| summarize(e.key(), e.value()))
        .collect();
    Json(servers)
}

async fn server_detail(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
) -> std::result::Result<Json<ServerSummary>, Error> {
    let pool = gateway
        .pools
        .get(&id)
        .map(|e| e.value().clone())
        .ok_or_else(|| Error::TemplateNotFound(id.clone()))?;
    Ok(Json(summarize(&id, &pool)))
}

fn summarize(id: &str, pool: &ServerPool) -> ServerSummary {
    match pool {
        ServerPool::Http(http) => ServerSummary {
            id: id.to_string(),
            r#type: "http",
            healthy_instances: http.healthy_count(),
            total_instances: http.instances.len(),
        },
        ServerPool::Stdio(stdio) => ServerSummary {
            id: id.to_string(),
            r#type: "stdio",
            healthy_instances: stdio.healthy_count(),
            total_instances: stdio.pool_size(),
        },
    }
}

async fn list_tools(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
) -> std::result::Result<Json<Value>, Error> {
    if let Some(binding) = gateway.template_bindings.get(&id).map(|b| {
        (
            Arc::clone(&b.manifest),
            b.mode,
            b.config.clone(),
        )
    }) {
        let (manifest, mode, config) = binding;
        if let Some(source) = &gateway.tool_source {
            let (tools, source_tag) = gateway
                .tool_manager
                .discover(&manifest, &config, mode, source.as_ref(), false)
                .await?;
            return Ok(Json(serde_json::json!({ "tools": tools, "source": source_tag })));
        }
    }

    let pool = gateway
        .pools
        .get(&id)
        .map(|e| e.value().clone())
        .ok_or_else(|| Error::TemplateNotFound(id.clone()))?;

    match &pool {
        ServerPool::Stdio(stdio) => {
            let tools = stdio.list_tools().await?;
            Ok(Json(serde_json::json!({ "tools": tools })))
        }
        ServerPool::Http(http) => {
            let (status, bytes) = http.forward(Method::GET, "/tools", None).await?;
            if !status.is_success() {
                return Err(Error::ToolRemoteError {
                    tool: id,
                    message: format!("downstream returned {status}"),
                });
            }
            let value: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            Ok(Json(value))
        }
    }
}

async fn call_tool(
    State(gateway): State<Arc<Gateway>>,
    Path((id, tool_name)): Path<(String, String)>,
    body: axum::body::Bytes,
) -> std::result::Result<Json<Value>, Error> {
    let pool = gateway
        .pools
        .get(&id)
        .map(|e| e.value().clone())
        .ok_or_else(|| Error::TemplateNotFound(id.clone()))?;

    let arguments: Option<Value> = if body.is_empty() {
        None
    } else {
        Some(serde_json::from_slice(&body).map_err(|e| Error::ToolArgumentInvalid {
            tool: tool_name.clone(),
            details: e.to_string(),
        })?)
    };

    if let Some(binding) = gateway
        .template_bindings
        .get(&id)
        .map(|b| (Arc::clone(&b.manifest), b.mode, b.config.clone()))
        && let Some(source) = &gateway.tool_source
    {
        let (manifest, mode, config) = binding;
        let (tools, _) = gateway
            .tool_manager
            .discover(&manifest, &config, mode, source.as_ref(), false)
            .await?;
        if let Some(tool) = tools.iter().find(|t| t.name == tool_name) {
            tools::validate_arguments(tool, arguments.as_ref().unwrap_or(&Value::Null))?;
        }
    }

    match &pool {
        ServerPool::Stdio(stdio) => {
            let result = stdio.call_tool(&tool_name, arguments).await?;
            Ok(Json(result))
        }
        ServerPool::Http(http) => {
            let path = format!("/tools/{tool_name}");
            let body = arguments.map(|v| serde_json::to_vec(&v)).transpose().map_err(|e| {
                Error::ToolArgumentInvalid {
                    tool: tool_name.clone(),
                    details: e.to_string(),
                }
            })?;
            let (status, bytes) = http.forward(Method::POST, &path, body).await?;
            if !status.is_success() {
                return Err(Error::ToolRemoteError {
                    tool: tool_name,
                    message: format!("downstream returned {status}"),
                });
            }
            let value: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            Ok(Json(value))
        }
    }
}

/// Any path under `/{id}/...` that isn't `/tools` or `/tools/{name}`: for
/// http-typed entries, forwarded verbatim; stdio/template entries have no
/// equivalent, so this always 404s for them.
async fn forward_verbatim(
    State(gateway): State<Arc<Gateway>>,
    Path((id, rest)): Path<(String, String)>,
    method: Method,
    body: axum::body::Bytes,
) -> std::result::Result<impl IntoResponse, Error> {
    let pool = gateway
        .pools
        .get(&id)
        .map(|e| e.value().clone())
        .ok_or_else(|| Error::TemplateNotFound(id.clone()))?;

    let ServerPool::Http(http) = &pool else {
        return Err(Error::TemplateNotFound(format!("{id}/{rest}")));
    };

    let path = format!("/{rest}");
    let forward_body = if body.is_empty() { None } else { Some(body.to_vec()) };
    let (status, bytes) = http.forward(method, &path, forward_body).await?;
    Ok((status, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn demo_registry() -> GatewayRegistryFile {
        let mut servers = HashMap::new();
        servers.insert(
            "unreachable".to_string(),
            RegistryEntry::Http {
                instances: vec!["http://127.0.0.1:1".to_string()],
                health_check_path: "/health".to_string(),
                load_balance: LoadBalancePolicy::RoundRobin,
            },
        );
        GatewayRegistryFile {
            gateway: GatewayConfig::default(),
            servers,
        }
    }

    #[tokio::test]
    async fn load_builds_one_pool_per_entry() {
        let gateway = Gateway::load(demo_registry(), None, None).await.unwrap();
        assert_eq!(gateway.pools.len(), 1);
        assert!(matches!(
            gateway.pools.get("unreachable").unwrap().value(),
            ServerPool::Http(_)
        ));
    }

    #[tokio::test]
    async fn reload_adds_and_removes_entries() {
        let gateway = Gateway::load(demo_registry(), None, None).await.unwrap();

        let mut next = demo_registry();
        next.servers.remove("unreachable");
        next.servers.insert(
            "new-one".to_string(),
            RegistryEntry::Stdio {
                command: "echo".to_string(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
                pool_size: 1,
                queue_capacity: 4,
            },
        );

        gateway.apply_reload(next).await.unwrap();
        assert!(gateway.pools.get("unreachable").is_none());
        assert!(gateway.pools.get("new-one").is_some());
    }

    #[tokio::test]
    async fn template_entry_without_registry_fails() {
        let mut registry = demo_registry();
        registry.servers.clear();
        registry.servers.insert(
            "templated".to_string(),
            RegistryEntry::Template {
                template_id: "demo".to_string(),
                replica_count: 1,
                config_override: HashMap::new(),
                discovery_mode: crate::tools::DiscoveryMode::Auto,
            },
        );
        let result = Gateway::load(registry, None, None).await;
        assert!(result.is_err());
    }
}
