use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::configresolve::ResolvedConfig;
use crate::deploy::{
    base_labels, BackendPort, CleanupFilter, DeployOptions, DeploymentStatus, Descriptor,
    Endpoint, ExecResult, ListFilter, LogOptions,
};
use crate::error::{Error, Result};
use crate::manifest::{Manifest, Transport};

const NETWORK_NAME: &str = "mcp-platform";

/// Drives the `docker` CLI the same way the MCP connection layer drives a
/// stdio child process: spawn, capture output, interpret exit status. No
/// Docker Engine HTTP client is introduced — the decision is recorded in
/// DESIGN.md.
pub struct DockerBackend {
    docker_bin: String,
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerBackend {
    pub fn new() -> Self {
        Self {
            docker_bin: "docker".to_string(),
        }
    }

    async fn ensure_network(&self) -> Result<()> {
        let output = Command::new(&self.docker_bin)
            .args(["network", "inspect", NETWORK_NAME])
            .output()
            .await
            .map_err(|e| Error::BackendUnreachable(e.to_string()))?;

        if output.status.success() {
            return Ok(());
        }

        let create = Command::new(&self.docker_bin)
            .args(["network", "create", NETWORK_NAME])
            .output()
            .await
            .map_err(|e| Error::BackendUnreachable(e.to_string()))?;

        if !create.status.success() {
            return Err(Error::BackendUnreachable(format!(
                "failed to create network '{NETWORK_NAME}': {}",
                String::from_utf8_lossy(&create.stderr)
            )));
        }
        Ok(())
    }

    async fn run_output(&self, args: &[String]) -> Result<std::process::Output> {
        Command::new(&self.docker_bin)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::BackendUnreachable(e.to_string()))
    }

    /// Pulls an image, retrying retriable failures (registry timeouts,
    /// connection resets) up to `PULL_MAX_ATTEMPTS` times with the same
    /// doubling-with-a-cap backoff the health checker uses for restarts.
    /// Non-retriable failures (image not found, auth denied) surface
    /// immediately on the first attempt.
    async fn pull_with_retry(&self, image: &str) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let pull = self
                .run_output(&["pull".to_string(), image.to_string()])
                .await?;
            if pull.status.success() {
                return Ok(());
            }

            let reason = String::from_utf8_lossy(&pull.stderr).to_string();
            if attempt >= PULL_MAX_ATTEMPTS || !is_retriable_pull_failure(&reason) {
                return Err(Error::BackendImagePullFailed {
                    image: image.to_string(),
                    reason,
                });
            }

            let backoff = pull_backoff(attempt);
            warn!(
                image = %image,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                reason = %reason,
                "docker pull failed, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

const PULL_MAX_ATTEMPTS: u32 = 3;
const PULL_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const PULL_MAX_BACKOFF: Duration = Duration::from_secs(8);

fn pull_backoff(attempt: u32) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
    (PULL_INITIAL_BACKOFF * multiplier).min(PULL_MAX_BACKOFF)
}

/// Image-not-found and auth-denied failures will not succeed on retry;
/// everything else (timeouts, connection resets, TLS hiccups) is worth
/// another attempt.
fn is_retriable_pull_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    let permanent = ["not found", "manifest unknown", "unauthorized", "denied", "no such host"];
    !permanent.iter().any(|p| lower.contains(p))
}

#[async_trait]
impl BackendPort for DockerBackend {
    fn tag(&self) -> &str {
        "docker"
    }

    async fn deploy(
        &self,
        manifest: &Manifest,
        config: &ResolvedConfig,
        options: &DeployOptions,
    ) -> Result<Descriptor> {
        self.ensure_network().await?;

        let deployment_id = options
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", manifest.id, uuid::Uuid::new_v4()));

        let transport = options.transport.unwrap_or(manifest.transport.default);
        let labels = base_labels(&manifest.id, &deployment_id, transport);

        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            deployment_id.clone(),
            "--network".to_string(),
            NETWORK_NAME.to_string(),
        ];

        for (k, v) in &labels {
            args.push("--label".to_string());
            args.push(format!("{k}={v}"));
        }

        for (env_name, env_value) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{env_name}={env_value}"));
        }

        for mount in &config.mounts {
            args.push("-v".to_string());
            args.push(format!("{}:{}", mount.host_path, mount.container_path));
        }

        if let Transport::Http = transport {
            let host_port = options.port.unwrap_or(0);
            let container_port = manifest.transport.port.unwrap_or(8080);
            args.push("-p".to_string());
            args.push(format!("{host_port}:{container_port}"));
        }

        if options.pull {
            self.pull_with_retry(&manifest.image).await?;
        }

        args.push(manifest.image.clone());
        if let Some(command) = &manifest.command {
            args.extend(command.clone());
        }

        debug!(deployment = %deployment_id, "docker run");
        let run = self.run_output(&args).await?;
        if !run.status.success() {
            // Best-effort cleanup of the container docker managed to create
            // before failing (e.g. bad port binding after container start).
            let _ = self
                .run_output(&["rm".to_string(), "-f".to_string(), deployment_id.clone()])
                .await;
            return Err(Error::BackendUnreachable(format!(
                "docker run failed: {}",
                String::from_utf8_lossy(&run.stderr)
            )));
        }

        let endpoint = match transport {
            Transport::Http => Some(Endpoint::Http {
                host: "127.0.0.1".to_string(),
                port: self.resolved_host_port(&deployment_id).await.unwrap_or(0),
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
            labels,
        })
    }

    async fn stop(&self, deployment_id: &str, timeout: Duration, force: bool) -> Result<()> {
        if force {
            let kill = self
                .run_output(&["kill".to_string(), deployment_id.to_string()])
                .await?;
            if !kill.status.success() {
                warn!(deployment = %deployment_id, "docker kill reported failure, continuing to rm");
            }
        } else {
            let stop = self
                .run_output(&[
                    "stop".to_string(),
                    "-t".to_string(),
                    timeout.as_secs().to_string(),
                    deployment_id.to_string(),
                ])
                .await?;
            if !stop.status.success() {
                return Err(Error::DeploymentStopTimeout {
                    id: deployment_id.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }
        }

        let rm = self
            .run_output(&["rm".to_string(), "-f".to_string(), deployment_id.to_string()])
            .await?;
        if !rm.status.success() {
            return Err(Error::BackendUnreachable(format!(
                "docker rm failed: {}",
                String::from_utf8_lossy(&rm.stderr)
            )));
        }
        Ok(())
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Descriptor>> {
        let output = self
            .run_output(&[
                "ps".to_string(),
                "-a".to_string(),
                "--filter".to_string(),
                "label=managed-by=mcp-platform".to_string(),
                "--format".to_string(),
                "{{.ID}}\t{{.Names}}\t{{.Status}}\t{{.Image}}\t{{.Label \"template\"}}".to_string(),
            ])
            .await?;

        if !output.status.success() {
            return Err(Error::BackendUnreachable(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let mut descriptors = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let fields: Vec<&str> = line.split('\t').collect();
            let [_, name, status_text, image, template_id] = fields[..] else {
                continue;
            };
            let status = parse_docker_status(status_text);

            if let Some(t) = &filter.template_id
                && t != template_id
            {
                continue;
            }
            if let Some(s) = filter.status
                && s != status
            {
                continue;
            }

            let labels = base_labels(template_id, name, Transport::Stdio);
            if !filter
                .labels
                .iter()
                .all(|(k, v)| labels.get(k) == Some(v))
            {
                continue;
            }

            descriptors.push(Descriptor {
                deployment_id: name.to_string(),
                template_id: template_id.to_string(),
                backend: self.tag().to_string(),
                image: image.to_string(),
                status,
                transport: Transport::Stdio,
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
        let mut args = vec!["logs".to_string()];
        if let Some(lines) = options.lines {
            args.push("--tail".to_string());
            args.push(lines.to_string());
        }
        args.push(deployment_id.to_string());
        let output = self.run_output(&args).await?;
        Ok(output.stdout)
    }

    async fn exec(
        &self,
        deployment_id: &str,
        argv: &[String],
        _stdin: Option<&[u8]>,
    ) -> Result<ExecResult> {
        let mut args = vec!["exec".to_string(), deployment_id.to_string()];
        args.extend(argv.iter().cloned());
        let output = self.run_output(&args).await?;
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

impl DockerBackend {
    async fn resolved_host_port(&self, deployment_id: &str) -> Option<u16> {
        let output = self
            .run_output(&["port".to_string(), deployment_id.to_string()])
            .await
            .ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        text.lines()
            .next()
            .and_then(|l| l.rsplit(':').next())
            .and_then(|p| p.trim().parse().ok())
    }
}

fn parse_docker_status(status_text: &str) -> DeploymentStatus {
    let lower = status_text.to_ascii_lowercase();
    if lower.starts_with("up") {
        DeploymentStatus::Running
    } else if lower.starts_with("exited (0)") {
        DeploymentStatus::Stopped
    } else if lower.starts_with("exited") {
        DeploymentStatus::Failed
    } else if lower.starts_with("created") {
        DeploymentStatus::Pending
    } else {
        DeploymentStatus::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_running_status() {
        assert_eq!(parse_docker_status("Up 3 minutes"), DeploymentStatus::Running);
    }

    #[test]
    fn parses_clean_exit_as_stopped() {
        assert_eq!(
            parse_docker_status("Exited (0) 2 minutes ago"),
            DeploymentStatus::Stopped
        );
    }

    #[test]
    fn parses_nonzero_exit_as_failed() {
        assert_eq!(
            parse_docker_status("Exited (1) 2 minutes ago"),
            DeploymentStatus::Failed
        );
    }
}
