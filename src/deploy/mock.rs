use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::configresolve::ResolvedConfig;
use crate::deploy::{
    base_labels, BackendPort, CleanupFilter, DeployOptions, DeploymentStatus, Descriptor,
    Endpoint, ExecResult, ListFilter, LogOptions,
};
use crate::error::{Error, Result};
use crate::manifest::{Manifest, Transport};

/// In-memory backend; operations succeed immediately. Used in tests and as
/// the reference implementation higher components are validated against.
pub struct MockBackend {
    deployments: DashMap<String, Descriptor>,
    next_id: AtomicU64,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            deployments: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Inject a failure for the next `stop` call on a given id, used by
    /// tests exercising the stop-all partial-failure scenario.
    pub fn fail_stop(&self, deployment_id: &str) {
        if let Some(mut d) = self.deployments.get_mut(deployment_id) {
            d.labels.insert("mock.fail_stop".to_string(), "true".to_string());
        }
    }
}

#[async_trait]
impl BackendPort for MockBackend {
    fn tag(&self) -> &str {
        "mock"
    }

    async fn deploy(
        &self,
        manifest: &Manifest,
        _config: &ResolvedConfig,
        options: &DeployOptions,
    ) -> Result<Descriptor> {
        let deployment_id = options
            .name
            .clone()
            .unwrap_or_else(|| format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));

        let transport = options.transport.unwrap_or(manifest.transport.default);
        let endpoint = match transport {
            Transport::Http => Some(Endpoint::Http {
                host: "127.0.0.1".to_string(),
                port: options.port.unwrap_or(0),
            }),
            Transport::Stdio => Some(Endpoint::Stdio),
        };

        let descriptor = Descriptor {
            deployment_id: deployment_id.clone(),
            template_id: manifest.id.clone(),
            backend: self.tag().to_string(),
            image: manifest.image.clone(),
            status: DeploymentStatus::Running,
            transport,
            endpoint,
            created_at: std::time::SystemTime::now(),
            labels: base_labels(&manifest.id, &deployment_id, transport),
        };

        self.deployments.insert(deployment_id, descriptor.clone());
        Ok(descriptor)
    }

    async fn stop(&self, deployment_id: &str, _timeout: Duration, _force: bool) -> Result<()> {
        let should_fail = self
            .deployments
            .get(deployment_id)
            .map(|d| d.labels.contains_key("mock.fail_stop"))
            .unwrap_or(false);

        if should_fail {
            return Err(Error::BackendPermissionDenied(format!(
                "mock backend refused to stop '{deployment_id}'"
            )));
        }

        match self.deployments.remove(deployment_id) {
            Some(_) => Ok(()),
            None => Err(Error::DeploymentNotFound(deployment_id.to_string())),
        }
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Descriptor>> {
        let mut results: Vec<Descriptor> = self
            .deployments
            .iter()
            .map(|r| r.value().clone())
            .filter(|d| {
                filter
                    .template_id
                    .as_ref()
                    .is_none_or(|t| &d.template_id == t)
            })
            .filter(|d| filter.status.is_none_or(|s| d.status == s))
            .filter(|d| {
                filter
                    .labels
                    .iter()
                    .all(|(k, v)| d.labels.get(k) == Some(v))
            })
            .collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(results)
    }

    async fn status(&self, deployment_id: &str) -> Result<Descriptor> {
        self.deployments
            .get(deployment_id)
            .map(|d| d.value().clone())
            .ok_or_else(|| Error::DeploymentNotFound(deployment_id.to_string()))
    }

    async fn logs(&self, deployment_id: &str, _options: &LogOptions) -> Result<Vec<u8>> {
        if !self.deployments.contains_key(deployment_id) {
            return Err(Error::DeploymentNotFound(deployment_id.to_string()));
        }
        Ok(format!("mock logs for {deployment_id}\n").into_bytes())
    }

    async fn exec(
        &self,
        deployment_id: &str,
        _argv: &[String],
        _stdin: Option<&[u8]>,
    ) -> Result<ExecResult> {
        if !self.deployments.contains_key(deployment_id) {
            return Err(Error::DeploymentNotFound(deployment_id.to_string()));
        }
        Ok(ExecResult {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }

    async fn cleanup(&self, filter: &CleanupFilter) -> Result<Vec<String>> {
        let targets: Vec<String> = self
            .deployments
            .iter()
            .filter(|r| {
                filter
                    .template_id
                    .as_ref()
                    .is_none_or(|t| &r.value().template_id == t)
            })
            .filter(|r| {
                filter.statuses.is_empty() || filter.statuses.contains(&r.value().status)
            })
            .map(|r| r.key().clone())
            .collect();

        for id in &targets {
            self.deployments.remove(id);
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ConfigSchema, TransportSpec};
    use std::collections::HashMap;

    fn demo_manifest() -> Manifest {
        Manifest {
            id: "demo".into(),
            name: "Demo".into(),
            description: String::new(),
            version: "1.0.0".into(),
            author: String::new(),
            tags: vec![],
            image: "demo:latest".into(),
            command: None,
            transport: TransportSpec {
                default: Transport::Stdio,
                supported: vec![Transport::Stdio],
                port: None,
            },
            ports: HashMap::new(),
            volumes: HashMap::new(),
            config_schema: ConfigSchema {
                properties: HashMap::new(),
                required: vec![],
            },
            tools: None,
        }
    }

    #[tokio::test]
    async fn deploy_then_stop_removes_deployment() {
        let backend = MockBackend::new();
        let manifest = demo_manifest();
        let config = ResolvedConfig::default();
        let descriptor = backend
            .deploy(&manifest, &config, &DeployOptions::default())
            .await
            .unwrap();
        assert_eq!(descriptor.status, DeploymentStatus::Running);

        backend
            .stop(&descriptor.deployment_id, Duration::from_secs(1), false)
            .await
            .unwrap();

        let listed = backend.list(&ListFilter::default()).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn list_only_returns_managed_labels() {
        let backend = MockBackend::new();
        let manifest = demo_manifest();
        let config = ResolvedConfig::default();
        backend
            .deploy(&manifest, &config, &DeployOptions::default())
            .await
            .unwrap();
        let listed = backend.list(&ListFilter::default()).await.unwrap();
        assert!(listed.iter().all(|d| d.labels.get("managed-by") == Some(&"mcp-platform".to_string())));
    }

    #[tokio::test]
    async fn stop_all_reports_partial_failure() {
        let backend = MockBackend::new();
        let manifest = demo_manifest();
        let config = ResolvedConfig::default();
        let d1 = backend
            .deploy(&manifest, &config, &DeployOptions::default())
            .await
            .unwrap();
        let d2 = backend
            .deploy(&manifest, &config, &DeployOptions::default())
            .await
            .unwrap();
        let d3 = backend
            .deploy(&manifest, &config, &DeployOptions::default())
            .await
            .unwrap();
        backend.fail_stop(&d2.deployment_id);

        let mut stopped = Vec::new();
        let mut failed = Vec::new();
        for id in [&d1.deployment_id, &d2.deployment_id, &d3.deployment_id] {
            match backend.stop(id, Duration::from_secs(1), false).await {
                Ok(()) => stopped.push(id.clone()),
                Err(e) => failed.push((id.clone(), e)),
            }
        }

        assert_eq!(stopped, vec![d1.deployment_id.clone(), d3.deployment_id.clone()]);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, d2.deployment_id);

        let remaining = backend.list(&ListFilter::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].deployment_id, d2.deployment_id);
    }
}
