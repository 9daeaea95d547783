use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

/// Typed representation of `template.json`, the immutable bundle a template
/// author ships alongside the container image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub tags: Vec<String>,

    pub image: String,
    #[serde(default)]
    pub command: Option<Vec<String>>,

    pub transport: TransportSpec,

    #[serde(default)]
    pub ports: HashMap<String, u16>,
    #[serde(default)]
    pub volumes: HashMap<String, String>,

    pub config_schema: ConfigSchema,

    #[serde(default)]
    pub tools: Option<Vec<AdvertisedTool>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSpec {
    pub default: Transport,
    pub supported: Vec<Transport>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSchema {
    #[serde(default)]
    pub properties: HashMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub ty: PropertyType,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: String,
    pub env_mapping: Option<String>,
    #[serde(default)]
    pub env_separator: Option<String>,
    #[serde(default)]
    pub volume_mount: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvertisedTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

fn id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("static id regex is valid"))
}

/// One validation failure. Accumulated, never bail-on-first — a malformed
/// manifest should be reported with every defect found, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestError {
    pub field: String,
    pub message: String,
}

impl ManifestError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a manifest's invariants. Returns every defect found; an empty
/// vec means the manifest is valid.
pub fn validate(manifest: &Manifest) -> Vec<ManifestError> {
    let mut errors = Vec::new();

    if !id_regex().is_match(&manifest.id) {
        errors.push(ManifestError::new(
            "id",
            format!(
                "'{}' does not match [a-z0-9][a-z0-9-]*",
                manifest.id
            ),
        ));
    }

    for key in &manifest.config_schema.required {
        if !manifest.config_schema.properties.contains_key(key) {
            errors.push(ManifestError::new(
                "config_schema.required",
                format!("required key '{key}' has no matching property"),
            ));
        }
    }

    for (key, prop) in &manifest.config_schema.properties {
        let is_required = manifest.config_schema.required.iter().any(|r| r == key);
        if !is_required && prop.default.is_none() {
            errors.push(ManifestError::new(
                format!("config_schema.properties.{key}"),
                "property is neither required nor has a default".to_string(),
            ));
        }
    }

    if !manifest
        .transport
        .supported
        .contains(&manifest.transport.default)
    {
        errors.push(ManifestError::new(
            "transport.default",
            "default transport is not listed in supported transports".to_string(),
        ));
    }

    if manifest.transport.supported.contains(&Transport::Http) && manifest.transport.port.is_none()
    {
        errors.push(ManifestError::new(
            "transport.port",
            "http is a supported transport but no port is declared".to_string(),
        ));
    }

    // env_mapping collisions: two properties that publish to the same
    // container env var. Resolving open question (c): this is a hard
    // validation error, not a silent last-write-wins.
    let mut seen: HashMap<&str, &str> = HashMap::new();
    let mut collided: HashSet<String> = HashSet::new();
    for (key, prop) in &manifest.config_schema.properties {
        if let Some(env) = prop.env_mapping.as_deref() {
            if let Some(other_key) = seen.get(env) {
                collided.insert(format!(
                    "config_schema.properties: '{key}' and '{other_key}' both map to env '{env}'"
                ));
            } else {
                seen.insert(env, key);
            }
        }
    }
    for message in collided {
        errors.push(ManifestError::new("config_schema.properties", message));
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn base_manifest() -> Manifest {
        let mut properties = Map::new();
        properties.insert(
            "greeting".to_string(),
            PropertySchema {
                ty: PropertyType::String,
                default: Some(Value::String("hello".into())),
                description: String::new(),
                env_mapping: Some("GREETING".into()),
                env_separator: None,
                volume_mount: false,
            },
        );
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
            ports: Map::new(),
            volumes: Map::new(),
            config_schema: ConfigSchema {
                properties,
                required: vec![],
            },
            tools: None,
        }
    }

    #[test]
    fn valid_manifest_has_no_errors() {
        assert!(validate(&base_manifest()).is_empty());
    }

    #[test]
    fn rejects_bad_id() {
        let mut m = base_manifest();
        m.id = "Demo_App".into();
        let errors = validate(&m);
        assert!(errors.iter().any(|e| e.field == "id"));
    }

    #[test]
    fn rejects_required_key_without_property() {
        let mut m = base_manifest();
        m.config_schema.required.push("missing_key".into());
        let errors = validate(&m);
        assert!(errors.iter().any(|e| e.field == "config_schema.required"));
    }

    #[test]
    fn rejects_property_without_default_or_required() {
        let mut m = base_manifest();
        m.config_schema.properties.insert(
            "no_default".into(),
            PropertySchema {
                ty: PropertyType::String,
                default: None,
                description: String::new(),
                env_mapping: None,
                env_separator: None,
                volume_mount: false,
            },
        );
        let errors = validate(&m);
        assert!(
            errors
                .iter()
                .any(|e| e.field == "config_schema.properties.no_default")
        );
    }

    #[test]
    fn rejects_http_without_port() {
        let mut m = base_manifest();
        m.transport.supported.push(Transport::Http);
        let errors = validate(&m);
        assert!(errors.iter().any(|e| e.field == "transport.port"));
    }

    #[test]
    fn rejects_env_mapping_collision() {
        let mut m = base_manifest();
        m.config_schema.properties.insert(
            "greeting2".into(),
            PropertySchema {
                ty: PropertyType::String,
                default: Some(Value::String("hi".into())),
                description: String::new(),
                env_mapping: Some("GREETING".into()),
                env_separator: None,
                volume_mount: false,
            },
        );
        let errors = validate(&m);
        assert!(
            errors
                .iter()
                .any(|e| e.message.contains("both map to env 'GREETING'"))
        );
    }
}
