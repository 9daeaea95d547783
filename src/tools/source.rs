//! Concrete `ToolSource`: wires dynamic/image discovery to the Deployment
//! Manager and live C6 sessions so `ToolManager` is reachable end to end
//! instead of only unit-testable against a fake source.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

use crate::configresolve::{Layers, ResolvedConfig};
use crate::deploy::manager::{DeploymentManager, StopFilter};
use crate::deploy::{DeployOptions, DeploymentStatus, Endpoint, ListFilter};
use crate::error::{Error, Result};
use crate::manifest::{Manifest, Transport};
use crate::mcp::http::{HttpSession, HttpSessionConfig};
use crate::mcp::stdio::{StdioSession, StdioSessionConfig};
use crate::mcp::{Session, ToolDescriptor};
use crate::tools::ToolSource;

/// Snapshot of running deployments, refreshed periodically so the
/// synchronous `has_running_deployment` lookup the Tool Manager needs has
/// something to consult without itself becoming async.
pub struct DeploymentToolSource {
    manager: Arc<DeploymentManager>,
    running: DashMap<String, (String, Option<Endpoint>)>,
}

impl DeploymentToolSource {
    pub fn new(manager: Arc<DeploymentManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            running: DashMap::new(),
        })
    }

    /// Rebuild the running-deployment snapshot. Call this on a timer
    /// alongside the gateway's health-check tick, or before a batch of
    /// `auto`/`dynamic` discoveries when freshness matters more than cost.
    pub async fn refresh(&self) {
        let descriptors = self.manager.multi_list(ListFilter::default()).await;
        self.running.clear();
        for d in descriptors {
            if d.status == DeploymentStatus::Running {
                self.running
                    .insert(d.template_id.clone(), (d.deployment_id.clone(), d.endpoint.clone()));
            }
        }
    }
}

#[async_trait]
impl ToolSource for DeploymentToolSource {
    async fn discover_dynamic(&self, deployment_id: &str) -> Result<Vec<ToolDescriptor>> {
        let entry = self
            .running
            .iter()
            .find(|e| e.value().0 == deployment_id)
            .map(|e| e.value().1.clone());

        match entry.flatten() {
            Some(Endpoint::Http { host, port }) => {
                let session = HttpSession::open(HttpSessionConfig {
                    url: format!("http://{host}:{port}"),
                    ..Default::default()
                })
                .await?;
                let tools = session.list_tools().await;
                let _ = session.close().await;
                tools
            }
            // A running stdio-transport deployment has no externally
            // attachable session: the pipes belong to whichever process
            // spawned it. Auto mode falls through to the image probe.
            _ => Err(Error::ProtocolIncompatible(format!(
                "deployment '{deployment_id}' has no attachable session for dynamic discovery"
            ))),
        }
    }

    async fn discover_image(
        &self,
        manifest: &Manifest,
        config: &ResolvedConfig,
    ) -> Result<Vec<ToolDescriptor>> {
        if manifest.transport.supported.contains(&Transport::Http) {
            let layers = Layers {
                env: config.env.iter().cloned().collect::<HashMap<String, String>>(),
                ..Default::default()
            };

            let descriptor = self
                .manager
                .deploy(
                    &manifest.id,
                    &layers,
                    DeployOptions {
                        transport: Some(Transport::Http),
                        pull: false,
                        ..Default::default()
                    },
                    None,
                )
                .await?;

            let result = async {
                let Some(Endpoint::Http { host, port }) = &descriptor.endpoint else {
                    return Err(Error::BackendUnreachable(
                        "image probe deployment has no http endpoint".into(),
                    ));
                };
                let session = HttpSession::open(HttpSessionConfig {
                    url: format!("http://{host}:{port}"),
                    ..Default::default()
                })
                .await?;
                let tools = session.list_tools().await;
                let _ = session.close().await;
                tools
            }
            .await;

            if let Err(e) = self
                .manager
                .stop(StopFilter::Id(descriptor.deployment_id.clone()), None)
                .await
            {
                warn!(deployment = %descriptor.deployment_id, error = %e, "failed to tear down image-probe deployment");
            }

            result
        } else {
            // Stdio-only templates have no container network endpoint to
            // probe; spawn the manifest's own command directly, same as
            // stdio template pool sessions do, for a one-shot handshake.
            let command = manifest.command.clone().ok_or_else(|| {
                Error::TemplateMalformed {
                    id: manifest.id.clone(),
                    reason: "stdio transport with no command to probe".into(),
                }
            })?;
            let (bin, args) = command
                .split_first()
                .map(|(bin, rest)| (bin.clone(), rest.to_vec()))
                .ok_or_else(|| Error::TemplateMalformed {
                    id: manifest.id.clone(),
                    reason: "empty command".into(),
                })?;

            let session = StdioSession::open(StdioSessionConfig {
                command: bin,
                args,
                env: config.env.iter().cloned().collect(),
                cwd: None,
                ..Default::default()
            })
            .await?;
            let tools = session.list_tools().await;
            let _ = session.close().await;
            tools
        }
    }

    fn has_running_deployment(&self, template_id: &str) -> Option<String> {
        self.running.get(template_id).map(|e| e.value().0.clone())
    }
}
