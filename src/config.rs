//! The gateway registry file: `{gateway:{...}, servers:{<id>:entry}}`.
//! Loading, diffing, and hot-reload watching, mirroring the way the
//! teacher's own backend config is loaded and watched — retargeted from
//! per-backend process configs to gateway registry entries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub reload_registry: bool,
    #[serde(default = "default_health_check_interval", with = "humantime_duration")]
    pub health_check_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            reload_registry: false,
            health_check_interval: default_health_check_interval(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8731
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancePolicy {
    #[default]
    RoundRobin,
}

/// One `servers.<id>` entry as loaded from the registry file. `Template`
/// entries are expanded into an `Http` or `Stdio` runtime pool at load time;
/// this enum is the on-disk shape, not the runtime one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RegistryEntry {
    Http {
        instances: Vec<String>,
        #[serde(default = "default_health_check_path")]
        health_check_path: String,
        #[serde(default)]
        load_balance: LoadBalancePolicy,
    },
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default = "default_pool_size")]
        pool_size: usize,
        #[serde(default = "default_queue_capacity")]
        queue_capacity: usize,
    },
    Template {
        template_id: String,
        #[serde(default = "default_replica_count")]
        replica_count: usize,
        #[serde(default)]
        config_override: HashMap<String, serde_json::Value>,
        #[serde(default)]
        discovery_mode: crate::tools::DiscoveryMode,
    },
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

fn default_pool_size() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    16
}

fn default_replica_count() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRegistryFile {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub servers: HashMap<String, RegistryEntry>,
}

impl GatewayRegistryFile {
    /// Load from a JSON or YAML registry file, expanding `${VAR}` process
    /// environment references the same way the teacher expands backend
    /// config files.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read registry file: {}", path.display()))?;
        let expanded = shellexpand::env(&raw)
            .map_err(|e| anyhow::anyhow!("env var interpolation failed: {e}"))?;
        let registry: GatewayRegistryFile = serde_yaml_ng::from_str(&expanded)
            .with_context(|| format!("failed to parse registry file: {}", path.display()))?;
        Ok(registry)
    }
}

/// Diff between old and new registries. Added/removed/changed entries are
/// handled distinctly by the gateway: new entries spun up, removed entries
/// drained then closed, modified entries replaced side-by-side before the
/// route swaps.
pub struct RegistryDiff {
    pub added: Vec<(String, RegistryEntry)>,
    pub removed: Vec<String>,
    pub changed: Vec<(String, RegistryEntry)>,
}

impl GatewayRegistryFile {
    pub fn diff_servers(&self, new: &GatewayRegistryFile) -> RegistryDiff {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut changed = Vec::new();

        for (id, new_entry) in &new.servers {
            match self.servers.get(id) {
                None => added.push((id.clone(), new_entry.clone())),
                Some(old_entry) if old_entry != new_entry => {
                    changed.push((id.clone(), new_entry.clone()))
                }
                _ => {}
            }
        }

        for id in self.servers.keys() {
            if !new.servers.contains_key(id) {
                removed.push(id.clone());
            }
        }

        RegistryDiff {
            added,
            removed,
            changed,
        }
    }
}

/// Watch the registry file for changes and apply a diff to a running
/// gateway. Runs until `shutdown` is notified.
pub async fn watch_registry(
    registry_path: PathBuf,
    gateway: Arc<crate::gateway::Gateway>,
    shutdown: Arc<tokio::sync::Notify>,
) {
    use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
    use tracing::{error, info, warn};

    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);

    let watcher_result: std::result::Result<RecommendedWatcher, _> =
        notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            if let Ok(event) = res
                && matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                )
            {
                let _ = tx.try_send(());
            }
        });

    let mut watcher = match watcher_result {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to create registry file watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&registry_path, RecursiveMode::NonRecursive) {
        error!(path = %registry_path.display(), error = %e, "failed to watch registry file");
        return;
    }

    info!(path = %registry_path.display(), "registry file watcher started");

    let debounce = Duration::from_millis(500);

    loop {
        tokio::select! {
            Some(()) = rx.recv() => {
                tokio::time::sleep(debounce).await;
                while rx.try_recv().is_ok() {}

                info!("registry file changed, reloading");

                let new_registry = match GatewayRegistryFile::load(&registry_path) {
                    Ok(r) => r,
                    Err(e) => {
                        error!(error = %e, "failed to parse reloaded registry, keeping current");
                        continue;
                    }
                };

                if let Err(e) = gateway.apply_reload(new_registry).await {
                    error!(error = %e, "failed to apply registry reload, keeping current");
                }
            }
            _ = shutdown.notified() => {
                info!("registry watcher shutting down");
                return;
            }
            else => {
                warn!("registry watcher channel closed unexpectedly");
                return;
            }
        }
    }
}

mod humantime_duration {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    fn format(d: &Duration) -> String {
        let secs = d.as_secs();
        if secs.is_multiple_of(60) && secs >= 60 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    fn parse(s: &str) -> std::result::Result<Duration, String> {
        let s = s.trim();
        if let Some(n) = s.strip_suffix('s') {
            n.parse::<u64>().map(Duration::from_secs).map_err(|e| e.to_string())
        } else if let Some(n) = s.strip_suffix('m') {
            n.parse::<u64>().map(|m| Duration::from_secs(m * 60)).map_err(|e| e.to_string())
        } else if let Some(n) = s.strip_suffix('h') {
            n.parse::<u64>().map(|h| Duration::from_secs(h * 3600)).map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| format!("invalid duration '{s}': expected format like '30s', '5m', '1h'"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_detects_added_removed_changed() {
        let mut old = GatewayRegistryFile {
            gateway: GatewayConfig::default(),
            servers: HashMap::new(),
        };
        old.servers.insert(
            "stays".to_string(),
            RegistryEntry::Http {
                instances: vec!["http://a".into()],
                health_check_path: "/health".into(),
                load_balance: LoadBalancePolicy::RoundRobin,
            },
        );
        old.servers.insert(
            "removed".to_string(),
            RegistryEntry::Http {
                instances: vec!["http://b".into()],
                health_check_path: "/health".into(),
                load_balance: LoadBalancePolicy::RoundRobin,
            },
        );

        let mut new = old.clone();
        new.servers.remove("removed");
        new.servers.insert(
            "added".to_string(),
            RegistryEntry::Http {
                instances: vec!["http://c".into()],
                health_check_path: "/health".into(),
                load_balance: LoadBalancePolicy::RoundRobin,
            },
        );
        new.servers.insert(
            "stays".to_string(),
            RegistryEntry::Http {
                instances: vec!["http://a".into(), "http://a2".into()],
                health_check_path: "/health".into(),
                load_balance: LoadBalancePolicy::RoundRobin,
            },
        );

        let diff = old.diff_servers(&new);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].0, "added");
        assert_eq!(diff.removed, vec!["removed".to_string()]);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].0, "stays");
    }

    #[test]
    fn registry_file_parses_yaml() {
        let yaml = r#"
gateway:
  host: "127.0.0.1"
  port: 9000
  health_check_interval: 15s
servers:
  demo:
    type: stdio
    command: echo
    pool_size: 2
"#;
        let registry: GatewayRegistryFile = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(registry.gateway.port, 9000);
        assert_eq!(registry.gateway.health_check_interval, Duration::from_secs(15));
        assert!(matches!(
            registry.servers.get("demo"),
            Some(RegistryEntry::Stdio { pool_size: 2, .. })
        ));
    }
}
