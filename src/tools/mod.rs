pub mod source;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::configresolve::ResolvedConfig;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::mcp::ToolDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    Static,
    Dynamic,
    Image,
    Auto,
}

impl Default for DiscoveryMode {
    fn default() -> Self {
        DiscoveryMode::Auto
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSourceTag {
    Static,
    Dynamic,
    Image,
}

/// Opens the upstream connections the Tool Manager needs for dynamic and
/// image discovery. The gateway's pools and the Deployment Manager each
/// implement this over their own connection machinery; the Tool Manager
/// stays agnostic of how a session was actually opened.
#[async_trait]
pub trait ToolSource: Send + Sync {
    async fn discover_dynamic(&self, deployment_id: &str) -> Result<Vec<ToolDescriptor>>;
    async fn discover_image(
        &self,
        manifest: &Manifest,
        config: &ResolvedConfig,
    ) -> Result<Vec<ToolDescriptor>>;
    fn has_running_deployment(&self, template_id: &str) -> Option<String>;
}

struct CacheEntry {
    tools: Vec<ToolDescriptor>,
    source: ToolSourceTag,
    inserted_at: Instant,
}

/// Tool discovery with a TTL cache; validates invocation arguments against
/// the tool's input schema before any call reaches the server.
pub struct ToolManager {
    cache: DashMap<String, CacheEntry>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    ttl: Duration,
}

impl ToolManager {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            cache: DashMap::new(),
            locks: DashMap::new(),
            ttl,
        })
    }

    pub fn with_default_ttl() -> Arc<Self> {
        Self::new(Duration::from_secs(6 * 3600))
    }

    fn cache_key(manifest: &Manifest, mode: DiscoveryMode, config: &ResolvedConfig) -> String {
        match mode {
            DiscoveryMode::Static => manifest.id.clone(),
            _ => {
                let config_hash = config_hash(config);
                format!("{}-{}", manifest.image, config_hash)
            }
        }
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Discover a template's tools per the requested mode, consulting and
    /// populating the TTL cache. `force_refresh` bypasses a fresh cache hit.
    pub async fn discover(
        &self,
        manifest: &Manifest,
        config: &ResolvedConfig,
        mode: DiscoveryMode,
        source: &dyn ToolSource,
        force_refresh: bool,
    ) -> Result<(Vec<ToolDescriptor>, ToolSourceTag)> {
        let key = Self::cache_key(manifest, mode, config);

        if !force_refresh
            && let Some(entry) = self.cache.get(&key)
            && entry.inserted_at.elapsed() < self.ttl
        {
            return Ok((entry.tools.clone(), entry.source));
        }

        // Single-flight: a short per-key lock held only for the duration
        // of the upstream call so concurrent discoveries of the same key
        // coalesce into one call.
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        // Re-check after acquiring the lock: a concurrent caller may have
        // already populated the cache while we waited.
        if !force_refresh
            && let Some(entry) = self.cache.get(&key)
            && entry.inserted_at.elapsed() < self.ttl
        {
            return Ok((entry.tools.clone(), entry.source));
        }

        let (tools, tag) = self.discover_uncached(manifest, config, mode, source).await?;

        self.cache.insert(
            key,
            CacheEntry {
                tools: tools.clone(),
                source: tag,
                inserted_at: Instant::now(),
            },
        );

        Ok((tools, tag))
    }

    async fn discover_uncached(
        &self,
        manifest: &Manifest,
        config: &ResolvedConfig,
        mode: DiscoveryMode,
        source: &dyn ToolSource,
    ) -> Result<(Vec<ToolDescriptor>, ToolSourceTag)> {
        match mode {
            DiscoveryMode::Static => static_tools(manifest).map(|t| (t, ToolSourceTag::Static)),
            DiscoveryMode::Dynamic => {
                let deployment_id = source
                    .has_running_deployment(&manifest.id)
                    .ok_or_else(|| Error::DeploymentNotFound(manifest.id.clone()))?;
                let tools = source.discover_dynamic(&deployment_id).await?;
                Ok((tools, ToolSourceTag::Dynamic))
            }
            DiscoveryMode::Image => {
                let tools = source.discover_image(manifest, config).await?;
                Ok((tools, ToolSourceTag::Image))
            }
            DiscoveryMode::Auto => {
                if let Some(deployment_id) = source.has_running_deployment(&manifest.id)
                    && let Ok(tools) = source.discover_dynamic(&deployment_id).await
                {
                    return Ok((tools, ToolSourceTag::Dynamic));
                }
                if let Ok(tools) = source.discover_image(manifest, config).await {
                    return Ok((tools, ToolSourceTag::Image));
                }
                static_tools(manifest).map(|t| (t, ToolSourceTag::Static))
            }
        }
    }

    /// Discover tools for an already-open connection (C9): there is no
    /// manifest behind an ad hoc `connect`, so the cache is keyed by
    /// connection id rather than template/image, and the source is
    /// always queried in `dynamic` mode — the connection itself is the
    /// only place tools could come from.
    pub async fn discover_for_connection(
        &self,
        connection_id: &str,
        source: &dyn ToolSource,
        force_refresh: bool,
    ) -> Result<(Vec<ToolDescriptor>, ToolSourceTag)> {
        let key = format!("connection:{connection_id}");

        if !force_refresh
            && let Some(entry) = self.cache.get(&key)
            && entry.inserted_at.elapsed() < self.ttl
        {
            return Ok((entry.tools.clone(), entry.source));
        }

        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        if !force_refresh
            && let Some(entry) = self.cache.get(&key)
            && entry.inserted_at.elapsed() < self.ttl
        {
            return Ok((entry.tools.clone(), entry.source));
        }

        let tools = source.discover_dynamic(connection_id).await?;
        self.cache.insert(
            key,
            CacheEntry {
                tools: tools.clone(),
                source: ToolSourceTag::Dynamic,
                inserted_at: Instant::now(),
            },
        );

        Ok((tools, ToolSourceTag::Dynamic))
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}

fn static_tools(manifest: &Manifest) -> Result<Vec<ToolDescriptor>> {
    manifest
        .tools
        .as_ref()
        .map(|tools| {
            tools
                .iter()
                .map(|t| ToolDescriptor {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.input_schema.clone(),
                })
                .collect()
        })
        .ok_or_else(|| {
            Error::ToolUnknown(format!(
                "template '{}' advertises no static tool list",
                manifest.id
            ))
        })
}

fn config_hash(config: &ResolvedConfig) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    let mut keys: Vec<&String> = config.values.keys().collect();
    keys.sort();
    for key in keys {
        key.hash(&mut hasher);
        config.values[key].to_string().hash(&mut hasher);
    }
    hasher.finish()
}

/// Validate invocation arguments against a tool's input schema: required
/// keys present, declared primitive types match. Arrays and objects are
/// validated structurally only. Unknown extra keys are a warning, not an
/// error.
pub fn validate_arguments(tool: &ToolDescriptor, args: &Value) -> Result<()> {
    let schema = &tool.input_schema;
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    let args_obj = args.as_object().cloned().unwrap_or_default();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required {
            let Some(key) = key.as_str() else { continue };
            if !args_obj.contains_key(key) {
                return Err(Error::ToolArgumentInvalid {
                    tool: tool.name.clone(),
                    details: format!("missing required argument '{key}'"),
                });
            }
        }
    }

    for (key, value) in &args_obj {
        let Some(prop) = properties.get(key) else {
            tracing::warn!(tool = %tool.name, key, "unknown argument, ignoring");
            continue;
        };
        let Some(expected_type) = prop.get("type").and_then(Value::as_str) else {
            continue;
        };
        if !matches_primitive_type(expected_type, value) {
            return Err(Error::ToolArgumentInvalid {
                tool: tool.name.clone(),
                details: format!(
                    "argument '{key}' expected type '{expected_type}', got '{}'",
                    value_type_name(value)
                ),
            });
        }
    }

    Ok(())
}

fn matches_primitive_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{AdvertisedTool, ConfigSchema, Transport, TransportSpec};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        running_deployment: Option<String>,
    }

    #[async_trait]
    impl ToolSource for CountingSource {
        async fn discover_dynamic(&self, _deployment_id: &str) -> Result<Vec<ToolDescriptor>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(vec![ToolDescriptor {
                name: "say_hello".into(),
                description: String::new(),
                input_schema: serde_json::json!({"properties": {}, "required": []}),
            }])
        }

        async fn discover_image(
            &self,
            _manifest: &Manifest,
            _config: &ResolvedConfig,
        ) -> Result<Vec<ToolDescriptor>> {
            Err(Error::BackendUnreachable("no image probe in test".into()))
        }

        fn has_running_deployment(&self, _template_id: &str) -> Option<String> {
            self.running_deployment.clone()
        }
    }

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
            tools: Some(vec![AdvertisedTool {
                name: "say_hello".into(),
                description: "Say hello".into(),
                input_schema: serde_json::json!({
                    "properties": {"name": {"type": "string"}},
                    "required": []
                }),
            }]),
        }
    }

    #[tokio::test]
    async fn static_discovery_reads_manifest() {
        let manager = ToolManager::with_default_ttl();
        let manifest = demo_manifest();
        let source = CountingSource {
            calls: AtomicUsize::new(0),
            running_deployment: None,
        };
        let (tools, tag) = manager
            .discover(
                &manifest,
                &ResolvedConfig::default(),
                DiscoveryMode::Static,
                &source,
                false,
            )
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tag, ToolSourceTag::Static);
    }

    #[tokio::test]
    async fn concurrent_dynamic_discovery_coalesces_to_one_upstream_call() {
        let manager = ToolManager::with_default_ttl();
        let manifest = demo_manifest();
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            running_deployment: Some("demo-1".into()),
        });

        let mut handles = Vec::new();
        for _ in 0..5 {
            let manager = manager.clone();
            let manifest = manifest.clone();
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .discover(
                        &manifest,
                        &ResolvedConfig::default(),
                        DiscoveryMode::Dynamic,
                        source.as_ref(),
                        false,
                    )
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn validate_arguments_rejects_missing_required() {
        let tool = ToolDescriptor {
            name: "say_hello".into(),
            description: String::new(),
            input_schema: serde_json::json!({
                "properties": {"name": {"type": "string"}},
                "required": ["name"]
            }),
        };
        let result = validate_arguments(&tool, &serde_json::json!({}));
        assert!(matches!(result, Err(Error::ToolArgumentInvalid { .. })));
    }

    #[test]
    fn validate_arguments_rejects_wrong_type() {
        let tool = ToolDescriptor {
            name: "say_hello".into(),
            description: String::new(),
            input_schema: serde_json::json!({
                "properties": {"name": {"type": "string"}},
                "required": []
            }),
        };
        let result = validate_arguments(&tool, &serde_json::json!({"name": 5}));
        assert!(matches!(result, Err(Error::ToolArgumentInvalid { .. })));
    }

    #[test]
    fn validate_arguments_allows_unknown_extra_keys() {
        let tool = ToolDescriptor {
            name: "say_hello".into(),
            description: String::new(),
            input_schema: serde_json::json!({
                "properties": {"name": {"type": "string"}},
                "required": []
            }),
        };
        let result = validate_arguments(&tool, &serde_json::json!({"name": "World", "extra": 1}));
        assert!(result.is_ok());
    }
}
