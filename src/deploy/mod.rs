pub mod docker;
pub mod kubernetes;
pub mod manager;
pub mod mock;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::configresolve::ResolvedConfig;
use crate::error::Result;
use crate::manifest::{Manifest, Transport};

pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const LABEL_MANAGED_BY_VALUE: &str = "mcp-platform";
pub const LABEL_TEMPLATE: &str = "template";
pub const LABEL_DEPLOYMENT: &str = "deployment";
pub const LABEL_TRANSPORT: &str = "mcp.transport";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Stopped,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Http { host: String, port: u16 },
    Stdio,
}

/// Produced by a deploy; stored in the backend and re-read on listing.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub deployment_id: String,
    pub template_id: String,
    pub backend: String,
    pub image: String,
    pub status: DeploymentStatus,
    pub transport: Transport,
    pub endpoint: Option<Endpoint>,
    pub created_at: std::time::SystemTime,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub name: Option<String>,
    pub transport: Option<Transport>,
    pub port: Option<u16>,
    pub pull: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub template_id: Option<String>,
    pub status: Option<DeploymentStatus>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub lines: Option<usize>,
    pub since: Option<std::time::SystemTime>,
    pub follow: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupFilter {
    pub template_id: Option<String>,
    pub older_than: Option<Duration>,
    pub statuses: Vec<DeploymentStatus>,
}

pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Abstract deployment operations. Docker, Kubernetes, and Mock are
/// interchangeable behind this contract; higher components are
/// driver-agnostic (tagged dispatch, not an inheritance hierarchy).
#[async_trait]
pub trait BackendPort: Send + Sync {
    fn tag(&self) -> &str;

    async fn deploy(
        &self,
        manifest: &Manifest,
        config: &ResolvedConfig,
        options: &DeployOptions,
    ) -> Result<Descriptor>;

    async fn stop(&self, deployment_id: &str, timeout: Duration, force: bool) -> Result<()>;

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Descriptor>>;

    async fn status(&self, deployment_id: &str) -> Result<Descriptor>;

    async fn logs(&self, deployment_id: &str, options: &LogOptions) -> Result<Vec<u8>>;

    async fn exec(
        &self,
        deployment_id: &str,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecResult>;

    async fn cleanup(&self, filter: &CleanupFilter) -> Result<Vec<String>>;
}

pub(crate) fn base_labels(template_id: &str, deployment_id: &str, transport: Transport) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(LABEL_MANAGED_BY.to_string(), LABEL_MANAGED_BY_VALUE.to_string());
    labels.insert(LABEL_TEMPLATE.to_string(), template_id.to_string());
    labels.insert(LABEL_DEPLOYMENT.to_string(), deployment_id.to_string());
    let transport_str = match transport {
        Transport::Stdio => "stdio",
        Transport::Http => "http",
    };
    labels.insert(LABEL_TRANSPORT.to_string(), transport_str.to_string());
    labels
}
