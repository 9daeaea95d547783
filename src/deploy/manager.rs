use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::configresolve::{self, Layers};
use crate::deploy::{
    BackendPort, CleanupFilter, DeployOptions, DeploymentStatus, Descriptor, Endpoint, ListFilter,
    LogOptions,
};
use crate::error::{Error, Result};
use crate::template_registry::TemplateRegistry;

const DEFAULT_RUNNING_WAIT: Duration = Duration::from_secs(60);
const DEFAULT_HTTP_PROBE_DEADLINE: Duration = Duration::from_secs(10);

/// Filter selecting deployments for a stop request.
pub enum StopFilter {
    Id(String),
    Name(String),
    TemplateAll(String),
}

pub struct StopOutcome {
    pub stopped: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

/// Orchestrates a deploy: resolves the template (C3), resolves config (C2),
/// picks a backend (C4), executes, and returns a descriptor. Also fans
/// out `list` across all configured backends.
pub struct DeploymentManager {
    registry: Arc<TemplateRegistry>,
    backends: HashMap<String, Arc<dyn BackendPort>>,
    default_backend: String,
    http_client: reqwest::Client,
}

impl DeploymentManager {
    pub fn new(
        registry: Arc<TemplateRegistry>,
        backends: HashMap<String, Arc<dyn BackendPort>>,
        default_backend: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            backends,
            default_backend: default_backend.into(),
            http_client: reqwest::Client::new(),
        }
    }

    fn pick_backend(&self, requested: Option<&str>) -> Result<&Arc<dyn BackendPort>> {
        let tag = requested.unwrap_or(&self.default_backend);
        self.backends
            .get(tag)
            .ok_or_else(|| Error::BackendUnreachable(format!("no backend registered for tag '{tag}'")))
    }

    pub async fn deploy(
        &self,
        template_id: &str,
        layers: &Layers,
        options: DeployOptions,
        backend_tag: Option<&str>,
    ) -> Result<Descriptor> {
        let manifest = self
            .registry
            .get(template_id)
            .ok_or_else(|| Error::TemplateNotFound(template_id.to_string()))?;

        let resolved = configresolve::resolve(&manifest, layers)?;

        let backend = self.pick_backend(backend_tag)?;

        let mut options = options;
        if options.transport.is_none() {
            options.transport = Some(manifest.transport.default);
        }

        let mut descriptor = backend.deploy(&manifest, &resolved, &options).await?;
        info!(
            deployment = %descriptor.deployment_id,
            template = %template_id,
            "deploy submitted"
        );

        descriptor = self.wait_for_running(backend, descriptor).await;

        if descriptor.transport == crate::manifest::Transport::Http
            && descriptor.status == DeploymentStatus::Running
        {
            descriptor.status = self.probe_http_health(&descriptor).await;
        }

        Ok(descriptor)
    }

    async fn wait_for_running(
        &self,
        backend: &Arc<dyn BackendPort>,
        initial: Descriptor,
    ) -> Descriptor {
        if initial.status == DeploymentStatus::Running {
            return initial;
        }

        let deadline = tokio::time::Instant::now() + DEFAULT_RUNNING_WAIT;
        let mut current = initial;
        while tokio::time::Instant::now() < deadline {
            match backend.status(&current.deployment_id).await {
                Ok(d) if d.status == DeploymentStatus::Running => return d,
                Ok(d) if d.status == DeploymentStatus::Failed => return d,
                Ok(d) => current = d,
                Err(e) => {
                    warn!(deployment = %current.deployment_id, error = %e, "status probe failed while waiting");
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        // Per the algorithm: never fail outright here — return pending so
        // the caller can poll further.
        current.status = DeploymentStatus::Pending;
        current
    }

    async fn probe_http_health(&self, descriptor: &Descriptor) -> DeploymentStatus {
        let Some(Endpoint::Http { host, port }) = &descriptor.endpoint else {
            return descriptor.status;
        };
        let url = format!("http://{host}:{port}/health");
        let deadline = tokio::time::Instant::now() + DEFAULT_HTTP_PROBE_DEADLINE;

        while tokio::time::Instant::now() < deadline {
            if let Ok(resp) = self.http_client.get(&url).send().await
                && resp.status().is_success()
            {
                return DeploymentStatus::Running;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        DeploymentStatus::Pending
    }

    /// `stop(all, template=T)` fetches the current list then issues stops
    /// concurrently with a bounded pool; aggregate errors do not abort
    /// siblings.
    pub async fn stop(&self, filter: StopFilter, backend_tag: Option<&str>) -> Result<StopOutcome> {
        let backend = self.pick_backend(backend_tag)?;

        let ids: Vec<String> = match filter {
            StopFilter::Id(id) => vec![id],
            StopFilter::Name(name) => vec![name],
            StopFilter::TemplateAll(template_id) => {
                let list_filter = ListFilter {
                    template_id: Some(template_id),
                    status: None,
                    labels: HashMap::new(),
                };
                backend
                    .list(&list_filter)
                    .await?
                    .into_iter()
                    .map(|d| d.deployment_id)
                    .collect()
            }
        };

        const MAX_CONCURRENT_STOPS: usize = 8;
        let mut join_set = tokio::task::JoinSet::new();
        let mut pending = ids.into_iter();
        let mut in_flight = 0usize;
        let mut stopped = Vec::new();
        let mut failed = Vec::new();

        loop {
            while in_flight < MAX_CONCURRENT_STOPS
                && let Some(id) = pending.next()
            {
                let backend = Arc::clone(backend);
                join_set.spawn(async move {
                    let result = backend.stop(&id, Duration::from_secs(30), false).await;
                    (id, result)
                });
                in_flight += 1;
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            in_flight -= 1;
            match joined {
                Ok((id, Ok(()))) => stopped.push(id),
                Ok((id, Err(e))) => failed.push((id, e)),
                Err(join_err) => warn!(error = %join_err, "stop task panicked"),
            }
        }

        Ok(StopOutcome { stopped, failed })
    }

    pub async fn logs(
        &self,
        deployment_id: &str,
        options: LogOptions,
        backend_tag: Option<&str>,
    ) -> Result<Vec<u8>> {
        let backend = self.pick_backend(backend_tag)?;
        backend.logs(deployment_id, &options).await
    }

    pub async fn cleanup(
        &self,
        filter: CleanupFilter,
        backend_tag: Option<&str>,
    ) -> Result<Vec<String>> {
        let backend = self.pick_backend(backend_tag)?;
        backend.cleanup(&filter).await
    }

    /// Fans out `list` across all configured backends concurrently,
    /// tagging each descriptor with its backend and ordering results by
    /// (backend, created_at desc).
    pub async fn multi_list(&self, filter: ListFilter) -> Vec<Descriptor> {
        let mut join_set = tokio::task::JoinSet::new();
        for (tag, backend) in &self.backends {
            let backend = Arc::clone(backend);
            let tag = tag.clone();
            let filter = filter.clone();
            join_set.spawn(async move {
                match backend.list(&filter).await {
                    Ok(list) => list,
                    Err(e) => {
                        warn!(backend = %tag, error = %e, "multi_list: backend listing failed");
                        Vec::new()
                    }
                }
            });
        }

        let mut all = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok(mut list) = joined {
                all.append(&mut list);
            }
        }

        all.sort_by(|a, b| {
            a.backend
                .cmp(&b.backend)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configresolve::Layers;
    use crate::deploy::mock::MockBackend;
    use crate::manifest::{ConfigSchema, Manifest, Transport, TransportSpec};
    use std::collections::HashMap as Map;

    fn write_template(dir: &std::path::Path) {
        std::fs::create_dir_all(dir.join("demo")).unwrap();
        std::fs::write(dir.join("demo/Dockerfile"), "FROM scratch\n").unwrap();
        let manifest = serde_json::json!({
            "id": "demo",
            "name": "Demo",
            "version": "1.0.0",
            "image": "demo:latest",
            "transport": {"default": "stdio", "supported": ["stdio"]},
            "config_schema": {"properties": {}, "required": []}
        });
        std::fs::write(
            dir.join("demo/template.json"),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();
    }

    fn make_manager(dir: &std::path::Path) -> DeploymentManager {
        write_template(dir);
        let registry = TemplateRegistry::discover(dir).unwrap();
        let mut backends: HashMap<String, Arc<dyn BackendPort>> = HashMap::new();
        backends.insert("mock".to_string(), Arc::new(MockBackend::new()));
        DeploymentManager::new(registry, backends, "mock")
    }

    #[tokio::test]
    async fn deploy_happy_path_returns_running() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path());
        let descriptor = manager
            .deploy("demo", &Layers::default(), DeployOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(descriptor.status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn deploy_unknown_template_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path());
        let result = manager
            .deploy("nope", &Layers::default(), DeployOptions::default(), None)
            .await;
        assert!(matches!(result, Err(Error::TemplateNotFound(_))));
    }

    #[tokio::test]
    async fn multi_list_only_returns_managed_deployments() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path());
        manager
            .deploy("demo", &Layers::default(), DeployOptions::default(), None)
            .await
            .unwrap();
        let all = manager.multi_list(ListFilter::default()).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].labels.get("managed-by"), Some(&"mcp-platform".to_string()));
    }

    #[tokio::test]
    async fn stop_all_aggregates_partial_failures() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path());
        let registry = TemplateRegistry::discover(dir.path()).unwrap();
        let mock = Arc::new(MockBackend::new());
        let mut backends: HashMap<String, Arc<dyn BackendPort>> = HashMap::new();
        backends.insert("mock".to_string(), mock.clone() as Arc<dyn BackendPort>);
        let manager = DeploymentManager::new(registry, backends, "mock");

        let d1 = manager
            .deploy("demo", &Layers::default(), DeployOptions::default(), None)
            .await
            .unwrap();
        let d2 = manager
            .deploy("demo", &Layers::default(), DeployOptions::default(), None)
            .await
            .unwrap();
        mock.fail_stop(&d2.deployment_id);

        let outcome = manager
            .stop(StopFilter::TemplateAll("demo".to_string()), None)
            .await
            .unwrap();

        assert_eq!(outcome.stopped, vec![d1.deployment_id]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, d2.deployment_id);
    }
}
