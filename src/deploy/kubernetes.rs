use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::configresolve::ResolvedConfig;
use crate::deploy::{
    base_labels, BackendPort, CleanupFilter, DeployOptions, DeploymentStatus, Descriptor,
    Endpoint, ExecResult, ListFilter, LogOptions, LABEL_DEPLOYMENT,
};
use crate::error::{Error, Result};
use crate::manifest::{Manifest, Transport};

const IMAGE_PULL_MAX_ATTEMPTS: u32 = 3;
const IMAGE_PULL_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const IMAGE_PULL_MAX_BACKOFF: Duration = Duration::from_secs(8);

fn image_pull_backoff(attempt: u32) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
    (IMAGE_PULL_INITIAL_BACKOFF * multiplier).min(IMAGE_PULL_MAX_BACKOFF)
}

/// Typed Kubernetes manifest fragments, serialized to YAML with
/// `serde_yaml_ng` and piped into `kubectl apply -f -`. A templating
/// engine is deliberately not introduced for this; the Deployment/
/// Service/ConfigMap shapes below are narrow enough that typed structs
/// are simpler and keep the whole manifest serde-checked.
#[derive(Serialize)]
struct KubeDeployment {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    metadata: KubeMetadata,
    spec: KubeDeploymentSpec,
}

#[derive(Serialize)]
struct KubeMetadata {
    name: String,
    namespace: String,
    labels: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct KubeDeploymentSpec {
    replicas: u32,
    selector: KubeSelector,
    template: KubePodTemplate,
}

#[derive(Serialize)]
struct KubeSelector {
    #[serde(rename = "matchLabels")]
    match_labels: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct KubePodTemplate {
    metadata: KubeTemplateMetadata,
    spec: KubePodSpec,
}

#[derive(Serialize)]
struct KubeTemplateMetadata {
    labels: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct KubePodSpec {
    containers: Vec<KubeContainer>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<KubeVolume>,
}

#[derive(Serialize)]
struct KubeContainer {
    name: String,
    image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    command: Vec<String>,
    env: Vec<KubeEnvVar>,
    #[serde(skip_serializing_if = "Vec::is_empty", rename = "volumeMounts")]
    volume_mounts: Vec<KubeVolumeMount>,
}

#[derive(Serialize)]
struct KubeEnvVar {
    name: String,
    value: String,
}

#[derive(Serialize)]
struct KubeVolumeMount {
    name: String,
    #[serde(rename = "mountPath")]
    mount_path: String,
}

#[derive(Serialize)]
struct KubeVolume {
    name: String,
    #[serde(rename = "configMap")]
    config_map: KubeVolumeConfigMapRef,
}

#[derive(Serialize)]
struct KubeVolumeConfigMapRef {
    name: String,
}

#[derive(Serialize)]
struct KubeService {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    metadata: KubeMetadata,
    spec: KubeServiceSpec,
}

#[derive(Serialize)]
struct KubeServiceSpec {
    selector: BTreeMap<String, String>,
    ports: Vec<KubeServicePort>,
    #[serde(rename = "type")]
    service_type: &'static str,
}

#[derive(Serialize)]
struct KubeServicePort {
    port: u16,
    #[serde(rename = "targetPort")]
    target_port: u16,
}

#[derive(Serialize)]
struct KubeConfigMap {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    metadata: KubeMetadata,
    data: BTreeMap<String, String>,
}

pub struct KubernetesBackend {
    kubectl_bin: String,
    namespace: String,
}

impl KubernetesBackend {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            kubectl_bin: "kubectl".to_string(),
            namespace: namespace.into(),
        }
    }

    async fn apply_yaml(&self, yaml: &str) -> Result<()> {
        let mut child = Command::new(&self.kubectl_bin)
            .args(["apply", "-n", &self.namespace, "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::BackendUnreachable(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(yaml.as_bytes())
                .await
                .map_err(|e| Error::BackendUnreachable(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::BackendUnreachable(e.to_string()))?;

        if !output.status.success() {
            return Err(Error::BackendUnreachable(format!(
                "kubectl apply failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    /// Polls pod status for the freshly-applied Deployment until its
    /// containers leave `ErrImagePull`/`ImagePullBackOff`, retrying up to
    /// `IMAGE_PULL_MAX_ATTEMPTS` with the same doubling-with-a-cap backoff
    /// the Docker backend uses for `docker pull`. A Deployment has no
    /// standalone pull step to retry directly — the kubelet pulls as part
    /// of scheduling the pod — so this watches for the kubelet's own
    /// retry-exhausted signal instead.
    async fn await_image_pull(&self, deployment_id: &str, image: &str) -> Result<()> {
        let selector = format!("{LABEL_DEPLOYMENT}={deployment_id}");
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let output = Command::new(&self.kubectl_bin)
                .args(["get", "pods", "-n", &self.namespace, "-l", &selector, "-o", "json"])
                .output()
                .await
                .map_err(|e| Error::BackendUnreachable(e.to_string()))?;

            if !output.status.success() {
                return Err(Error::BackendUnreachable(format!(
                    "kubectl get pods failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                )));
            }

            let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
                .map_err(|e| Error::BackendUnreachable(format!("failed to parse pod list: {e}")))?;
            let empty = Vec::new();
            let items = parsed["items"].as_array().unwrap_or(&empty);

            let pull_failure = items.iter().find_map(|pod| {
                pod["status"]["containerStatuses"]
                    .as_array()?
                    .iter()
                    .find_map(|c| {
                        let reason = c["state"]["waiting"]["reason"].as_str()?;
                        matches!(reason, "ErrImagePull" | "ImagePullBackOff").then(|| reason.to_string())
                    })
            });

            match pull_failure {
                None => return Ok(()),
                Some(reason) if attempt >= IMAGE_PULL_MAX_ATTEMPTS => {
                    return Err(Error::BackendImagePullFailed {
                        image: image.to_string(),
                        reason,
                    });
                }
                Some(reason) => {
                    let backoff = image_pull_backoff(attempt);
                    warn!(
                        deployment = %deployment_id,
                        attempt,
                        reason = %reason,
                        backoff_ms = backoff.as_millis() as u64,
                        "image pull failing, waiting before recheck"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn delete(&self, kind: &str, name: &str) -> Result<()> {
        let output = Command::new(&self.kubectl_bin)
            .args(["delete", kind, name, "-n", &self.namespace, "--ignore-not-found"])
            .output()
            .await
            .map_err(|e| Error::BackendUnreachable(e.to_string()))?;
        if !output.status.success() {
            return Err(Error::BackendUnreachable(format!(
                "kubectl delete {kind}/{name} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendPort for KubernetesBackend {
    fn tag(&self) -> &str {
        "kubernetes"
    }

    async fn deploy(
        &self,
        manifest: &Manifest,
        config: &ResolvedConfig,
        options: &DeployOptions,
    ) -> Result<Descriptor> {
        let deployment_id = options
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", manifest.id, uuid::Uuid::new_v4()));
        let transport = options.transport.unwrap_or(manifest.transport.default);
        let labels: BTreeMap<String, String> = base_labels(&manifest.id, &deployment_id, transport)
            .into_iter()
            .collect();

        let mut docs = String::new();

        if !config.mounts.is_empty() {
            let mut data = BTreeMap::new();
            for (i, mount) in config.mounts.iter().enumerate() {
                data.insert(format!("mount-{i}"), mount.host_path.clone());
            }
            let config_map = KubeConfigMap {
                api_version: "v1",
                kind: "ConfigMap",
                metadata: KubeMetadata {
                    name: format!("{deployment_id}-config"),
                    namespace: self.namespace.clone(),
                    labels: labels.clone(),
                },
                data,
            };
            docs.push_str(&serde_yaml_ng::to_string(&config_map).map_err(|e| {
                Error::BackendUnreachable(format!("failed to render ConfigMap: {e}"))
            })?);
            docs.push_str("---\n");
        }

        let env_vars: Vec<KubeEnvVar> = config
            .env
            .iter()
            .map(|(name, value)| KubeEnvVar {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();

        let volume_mounts: Vec<KubeVolumeMount> = config
            .mounts
            .iter()
            .map(|m| KubeVolumeMount {
                name: "config".to_string(),
                mount_path: m.container_path.clone(),
            })
            .collect();

        let volumes = if config.mounts.is_empty() {
            Vec::new()
        } else {
            vec![KubeVolume {
                name: "config".to_string(),
                config_map: KubeVolumeConfigMapRef {
                    name: format!("{deployment_id}-config"),
                },
            }]
        };

        let deployment = KubeDeployment {
            api_version: "apps/v1",
            kind: "Deployment",
            metadata: KubeMetadata {
                name: deployment_id.clone(),
                namespace: self.namespace.clone(),
                labels: labels.clone(),
            },
            spec: KubeDeploymentSpec {
                replicas: 1,
                selector: KubeSelector {
                    match_labels: labels.clone(),
                },
                template: KubePodTemplate {
                    metadata: KubeTemplateMetadata {
                        labels: labels.clone(),
                    },
                    spec: KubePodSpec {
                        containers: vec![KubeContainer {
                            name: deployment_id.clone(),
                            image: manifest.image.clone(),
                            command: manifest.command.clone().unwrap_or_default(),
                            env: env_vars,
                            volume_mounts,
                        }],
                        volumes,
                    },
                },
            },
        };
        docs.push_str(&serde_yaml_ng::to_string(&deployment).map_err(|e| {
            Error::BackendUnreachable(format!("failed to render Deployment: {e}"))
        })?);

        if let Transport::Http = transport {
            docs.push_str("---\n");
            let container_port = manifest.transport.port.unwrap_or(8080);
            let service = KubeService {
                api_version: "v1",
                kind: "Service",
                metadata: KubeMetadata {
                    name: deployment_id.clone(),
                    namespace: self.namespace.clone(),
                    labels: labels.clone(),
                },
                spec: KubeServiceSpec {
                    selector: labels.clone(),
                    ports: vec![KubeServicePort {
                        port: container_port,
                        target_port: container_port,
                    }],
                    service_type: "ClusterIP",
                },
            };
            docs.push_str(&serde_yaml_ng::to_string(&service).map_err(|e| {
                Error::BackendUnreachable(format!("failed to render Service: {e}"))
            })?);
        }

        debug!(deployment = %deployment_id, "kubectl apply");
        if let Err(e) = self.apply_yaml(&docs).await {
            // Clean up anything that did apply before the failure.
            let _ = self.delete("deployment", &deployment_id).await;
            let _ = self.delete("service", &deployment_id).await;
            let _ = self
                .delete("configmap", &format!("{deployment_id}-config"))
                .await;
            return Err(e);
        }

        if let Err(e) = self.await_image_pull(&deployment_id, &manifest.image).await {
            let _ = self.delete("deployment", &deployment_id).await;
            let _ = self.delete("service", &deployment_id).await;
            let _ = self
                .delete("configmap", &format!("{deployment_id}-config"))
                .await;
            return Err(e);
        }

        let endpoint = match transport {
            Transport::Http => Some(Endpoint::Http {
                host: format!("{deployment_id}.{}.svc.cluster.local", self.namespace),
                port: manifest.transport.port.unwrap_or(8080),
            }),
            Transport::Stdio => Some(Endpoint::Stdio),
        };

        Ok(Descriptor {
            deployment_id,
            template_id: manifest.id.clone(),
            backend: self.tag().to_string(),
            image: manifest.image.clone(),
            status: DeploymentStatus::Pending,
            transport,
            endpoint,
            created_at: std::time::SystemTime::now(),
            labels: labels.into_iter().collect(),
        })
    }

    async fn stop(&self, deployment_id: &str, _timeout: Duration, _force: bool) -> Result<()> {
        // Deployment, then Service, then ConfigMap, in that order; partial
        // failure surfaces in the error but cleanup continues regardless.
        let mut errors = Vec::new();
        if let Err(e) = self.delete("deployment", deployment_id).await {
            errors.push(e.to_string());
        }
        if let Err(e) = self.delete("service", deployment_id).await {
            errors.push(e.to_string());
        }
        if let Err(e) = self
            .delete("configmap", &format!("{deployment_id}-config"))
            .await
        {
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            warn!(deployment = %deployment_id, errors = ?errors, "partial failure deleting kubernetes objects");
            Err(Error::BackendUnreachable(errors.join("; ")))
        }
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Descriptor>> {
        let output = Command::new(&self.kubectl_bin)
            .args([
                "get",
                "deployments",
                "-n",
                &self.namespace,
                "-l",
                "managed-by=mcp-platform",
                "-o",
                "json",
            ])
            .output()
            .await
            .map_err(|e| Error::BackendUnreachable(e.to_string()))?;

        if !output.status.success() {
            return Err(Error::BackendUnreachable(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::BackendUnreachable(format!("failed to parse kubectl output: {e}")))?;

        let items = parsed["items"].as_array().cloned().unwrap_or_default();
        let mut descriptors = Vec::new();
        for item in items {
            let name = item["metadata"]["name"].as_str().unwrap_or_default().to_string();
            let template_id = item["metadata"]["labels"]["template"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let available = item["status"]["availableReplicas"].as_u64().unwrap_or(0);
            let status = if available > 0 {
                DeploymentStatus::Running
            } else {
                DeploymentStatus::Pending
            };

            if let Some(t) = &filter.template_id
                && t != &template_id
            {
                continue;
            }
            if let Some(s) = filter.status
                && s != status
            {
                continue;
            }

            let labels = base_labels(&template_id, &name, Transport::Http);
            if !filter
                .labels
                .iter()
                .all(|(k, v)| labels.get(k) == Some(v))
            {
                continue;
            }

            descriptors.push(Descriptor {
                deployment_id: name.clone(),
                template_id: template_id.clone(),
                backend: self.tag().to_string(),
                image: item["spec"]["template"]["spec"]["containers"][0]["image"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                status,
                transport: Transport::Http,
                endpoint: None,
                created_at: std::time::SystemTime::now(),
                labels,
            });
        }
        Ok(descriptors)
    }

    async fn status(&self, deployment_id: &str) -> Result<Descriptor> {
        self.list(&ListFilter::default())
            .await?
            .into_iter()
            .find(|d| d.deployment_id == deployment_id)
            .ok_or_else(|| Error::DeploymentNotFound(deployment_id.to_string()))
    }

    async fn logs(&self, deployment_id: &str, options: &LogOptions) -> Result<Vec<u8>> {
        // Aggregate across replicas with pod-name prefix.
        let pods = Command::new(&self.kubectl_bin)
            .args([
                "get",
                "pods",
                "-n",
                &self.namespace,
                "-l",
                &format!("deployment={deployment_id}"),
                "-o",
                "name",
            ])
            .output()
            .await
            .map_err(|e| Error::BackendUnreachable(e.to_string()))?;

        let mut combined = Vec::new();
        for pod in String::from_utf8_lossy(&pods.stdout).lines() {
            let mut args = vec!["logs".to_string(), "-n".to_string(), self.namespace.clone()];
            if let Some(lines) = options.lines {
                args.push("--tail".to_string());
                args.push(lines.to_string());
            }
            args.push(pod.to_string());
            let output = Command::new(&self.kubectl_bin)
                .args(&args)
                .output()
                .await
                .map_err(|e| Error::BackendUnreachable(e.to_string()))?;
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                combined.extend_from_slice(format!("[{pod}] {line}\n").as_bytes());
            }
        }
        Ok(combined)
    }

    async fn exec(
        &self,
        deployment_id: &str,
        argv: &[String],
        _stdin: Option<&[u8]>,
    ) -> Result<ExecResult> {
        let mut args = vec![
            "exec".to_string(),
            "-n".to_string(),
            self.namespace.clone(),
            format!("deployment/{deployment_id}"),
            "--".to_string(),
        ];
        args.extend(argv.iter().cloned());
        let output = Command::new(&self.kubectl_bin)
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::BackendUnreachable(e.to_string()))?;
        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn cleanup(&self, filter: &CleanupFilter) -> Result<Vec<String>> {
        let list_filter = ListFilter {
            template_id: filter.template_id.clone(),
            status: None,
            labels: HashMap::new(),
        };
        let candidates = self.list(&list_filter).await?;
        let mut removed = Vec::new();
        for descriptor in candidates {
            if !filter.statuses.is_empty() && !filter.statuses.contains(&descriptor.status) {
                continue;
            }
            if self
                .stop(&descriptor.deployment_id, Duration::from_secs(10), true)
                .await
                .is_ok()
            {
                removed.push(descriptor.deployment_id);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_deployment_without_volumes() {
        let labels: BTreeMap<String, String> =
            base_labels("demo", "demo-1", Transport::Stdio).into_iter().collect();
        let deployment = KubeDeployment {
            api_version: "apps/v1",
            kind: "Deployment",
            metadata: KubeMetadata {
                name: "demo-1".to_string(),
                namespace: "default".to_string(),
                labels: labels.clone(),
            },
            spec: KubeDeploymentSpec {
                replicas: 1,
                selector: KubeSelector {
                    match_labels: labels.clone(),
                },
                template: KubePodTemplate {
                    metadata: KubeTemplateMetadata { labels },
                    spec: KubePodSpec {
                        containers: vec![KubeContainer {
                            name: "demo-1".to_string(),
                            image: "demo:latest".to_string(),
                            command: vec![],
                            env: vec![],
                            volume_mounts: vec![],
                        }],
                        volumes: vec![],
                    },
                },
            },
        };
        let yaml = serde_yaml_ng::to_string(&deployment).unwrap();
        assert!(yaml.contains("kind: Deployment"));
        assert!(!yaml.contains("volumes:"));
    }
}
