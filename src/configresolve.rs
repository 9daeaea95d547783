use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::manifest::{Manifest, PropertyType};

/// The merged, coerced configuration for one deploy. Consumed by the
/// Backend Port drivers, never persisted by the core.
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    pub values: HashMap<String, Value>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
}

/// One configuration layer, lowest to highest precedence above manifest
/// defaults: file → CLI key=value pairs → process environment.
#[derive(Debug, Clone, Default)]
pub struct Layers {
    pub file: HashMap<String, Value>,
    pub cli: HashMap<String, String>,
    pub env: HashMap<String, String>,
}

const VOLUME_MOUNT_ROOT: &str = "/mnt/config";

/// Merge layered configuration per the manifest's schema and project it to
/// env-var assignments and bind mounts.
pub fn resolve(manifest: &Manifest, layers: &Layers) -> Result<ResolvedConfig> {
    let mut values: HashMap<String, Value> = HashMap::new();

    for (key, prop) in &manifest.config_schema.properties {
        if let Some(default) = &prop.default {
            values.insert(key.clone(), default.clone());
        }
    }

    for (key, value) in &layers.file {
        apply_raw(&mut values, manifest, key, value.clone())?;
    }

    for (key, raw) in &layers.cli {
        let key = denest(key);
        apply_string(&mut values, manifest, &key, raw)?;
    }

    for (key, prop) in &manifest.config_schema.properties {
        let Some(env_name) = prop.env_mapping.as_deref() else {
            continue;
        };
        if let Some(raw) = layers.env.get(env_name) {
            apply_string(&mut values, manifest, key, raw)?;
        }
    }

    for key in &manifest.config_schema.required {
        if !values.contains_key(key) {
            return Err(Error::ConfigMissingRequired(key.clone()));
        }
    }

    let env = project_env(manifest, &values);
    let mounts = project_mounts(manifest, &values);

    Ok(ResolvedConfig {
        values,
        env,
        mounts,
    })
}

/// `security__read_only` -> `security.read_only`. The schema in this
/// platform is one level deep in practice, so this only needs to replace
/// the double underscore; nested object properties are addressed by their
/// own top-level schema key.
fn denest(key: &str) -> String {
    key.replace("__", ".")
}

fn apply_raw(
    values: &mut HashMap<String, Value>,
    manifest: &Manifest,
    key: &str,
    value: Value,
) -> Result<()> {
    let Some(prop) = manifest.config_schema.properties.get(key) else {
        // Unknown key: warning, not error; passed through as-is.
        tracing::warn!(key, "config key not declared in schema, passing through");
        values.insert(key.to_string(), value);
        return Ok(());
    };

    let coerced = coerce_value(prop.ty, prop.env_separator.as_deref(), value, key)?;
    values.insert(key.to_string(), coerced);
    Ok(())
}

fn apply_string(
    values: &mut HashMap<String, Value>,
    manifest: &Manifest,
    key: &str,
    raw: &str,
) -> Result<()> {
    let Some(prop) = manifest.config_schema.properties.get(key) else {
        tracing::warn!(key, "config key not declared in schema, passing through");
        values.insert(key.to_string(), Value::String(raw.to_string()));
        return Ok(());
    };

    let coerced = coerce_string(prop.ty, prop.env_separator.as_deref(), raw, key)?;
    values.insert(key.to_string(), coerced);
    Ok(())
}

fn coerce_value(
    ty: PropertyType,
    separator: Option<&str>,
    value: Value,
    key: &str,
) -> Result<Value> {
    match (ty, &value) {
        (PropertyType::String, Value::String(_)) => Ok(value),
        (PropertyType::Boolean, Value::Bool(_)) => Ok(value),
        (PropertyType::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(value),
        (PropertyType::Number, Value::Number(_)) => Ok(value),
        (PropertyType::Array, Value::Array(_)) => Ok(value),
        (PropertyType::Object, Value::Object(_)) => Ok(value),
        (_, Value::String(s)) => coerce_string(ty, separator, s, key),
        _ => Err(Error::ConfigTypeError {
            key: key.to_string(),
            value: value.to_string(),
            expected: format!("{ty:?}"),
        }),
    }
}

fn coerce_string(
    ty: PropertyType,
    separator: Option<&str>,
    raw: &str,
    key: &str,
) -> Result<Value> {
    let type_error = || Error::ConfigTypeError {
        key: key.to_string(),
        value: raw.to_string(),
        expected: format!("{ty:?}"),
    };

    match ty {
        PropertyType::String => Ok(Value::String(raw.to_string())),
        PropertyType::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
            "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
            _ => Err(type_error()),
        },
        PropertyType::Integer => raw
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .map_err(|_| type_error()),
        PropertyType::Number => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(type_error),
        PropertyType::Array => {
            let sep = separator.unwrap_or(",");
            let items = raw
                .split(sep)
                .map(|s| Value::String(s.trim().to_string()))
                .collect();
            Ok(Value::Array(items))
        }
        PropertyType::Object => {
            serde_json::from_str::<Value>(raw).map_err(|_| type_error())
        }
    }
}

fn project_env(manifest: &Manifest, values: &HashMap<String, Value>) -> Vec<(String, String)> {
    let mut env = Vec::new();
    for (key, prop) in &manifest.config_schema.properties {
        let Some(env_name) = prop.env_mapping.as_deref() else {
            continue;
        };
        let Some(value) = values.get(key) else {
            continue;
        };
        let rendered = render_env_value(value, prop.env_separator.as_deref());
        env.push((env_name.to_string(), rendered));
    }
    env.sort();
    env
}

fn render_env_value(value: &Value, separator: Option<&str>) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => {
            let sep = separator.unwrap_or(",");
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(sep)
        }
        Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
        Value::Null => String::new(),
    }
}

fn project_mounts(manifest: &Manifest, values: &HashMap<String, Value>) -> Vec<Mount> {
    let mut mounts = Vec::new();
    let mut basename_counts: HashMap<String, usize> = HashMap::new();

    let mut keys: Vec<&String> = manifest.config_schema.properties.keys().collect();
    keys.sort();

    for key in keys {
        let prop = &manifest.config_schema.properties[key];
        if !prop.volume_mount {
            continue;
        }
        let Some(value) = values.get(key) else {
            continue;
        };
        let host_paths: Vec<String> = match value {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => continue,
        };

        for host_path in host_paths {
            let basename = host_path
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or(&host_path)
                .to_string();

            let count = basename_counts.entry(basename.clone()).or_insert(0);
            let container_basename = if *count == 0 {
                basename.clone()
            } else {
                format!("{basename}-{count}")
            };
            *count += 1;

            mounts.push(Mount {
                host_path,
                container_path: format!("{VOLUME_MOUNT_ROOT}/{container_basename}"),
            });
        }
    }

    mounts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ConfigSchema, PropertySchema, Transport, TransportSpec};
    use std::collections::HashMap as Map;

    fn manifest_with(properties: Map<String, PropertySchema>, required: Vec<&str>) -> Manifest {
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
                required: required.into_iter().map(String::from).collect(),
            },
            tools: None,
        }
    }

    #[test]
    fn defaults_only_round_trips_to_defaults() {
        let mut props = Map::new();
        props.insert(
            "greeting".into(),
            PropertySchema {
                ty: PropertyType::String,
                default: Some(Value::String("hello".into())),
                description: String::new(),
                env_mapping: Some("GREETING".into()),
                env_separator: None,
                volume_mount: false,
            },
        );
        let manifest = manifest_with(props, vec![]);
        let resolved = resolve(&manifest, &Layers::default()).unwrap();
        assert_eq!(
            resolved.values.get("greeting"),
            Some(&Value::String("hello".into()))
        );
    }

    #[test]
    fn env_wins_over_file_and_cli() {
        let mut props = Map::new();
        props.insert(
            "timeout".into(),
            PropertySchema {
                ty: PropertyType::Integer,
                default: Some(Value::Number(30.into())),
                description: String::new(),
                env_mapping: Some("TO".into()),
                env_separator: None,
                volume_mount: false,
            },
        );
        let manifest = manifest_with(props, vec![]);

        let mut layers = Layers::default();
        layers.file.insert("timeout".into(), Value::Number(60.into()));
        layers.cli.insert("timeout".into(), "90".into());
        layers.env.insert("TO".into(), "120".into());

        let resolved = resolve(&manifest, &layers).unwrap();
        assert_eq!(resolved.values.get("timeout"), Some(&Value::Number(120.into())));
        assert_eq!(
            resolved.env,
            vec![("TO".to_string(), "120".to_string())]
        );
    }

    #[test]
    fn boolean_coercion_is_case_insensitive() {
        let mut props = Map::new();
        props.insert(
            "security.read_only".into(),
            PropertySchema {
                ty: PropertyType::Boolean,
                default: Some(Value::Bool(false)),
                description: String::new(),
                env_mapping: Some("READ_ONLY".into()),
                env_separator: None,
                volume_mount: false,
            },
        );
        let manifest = manifest_with(props, vec![]);
        let mut layers = Layers::default();
        layers
            .cli
            .insert("security__read_only".into(), "TRUE".into());
        let resolved = resolve(&manifest, &layers).unwrap();
        assert_eq!(
            resolved.values.get("security.read_only"),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn array_projects_with_separator() {
        let mut props = Map::new();
        props.insert(
            "paths".into(),
            PropertySchema {
                ty: PropertyType::Array,
                default: Some(Value::Array(vec![])),
                description: String::new(),
                env_mapping: Some("ENV".into()),
                env_separator: Some(":".into()),
                volume_mount: false,
            },
        );
        let manifest = manifest_with(props, vec![]);
        let mut layers = Layers::default();
        layers.file.insert(
            "paths".into(),
            Value::Array(vec![Value::String("/a".into()), Value::String("/b".into())]),
        );
        let resolved = resolve(&manifest, &layers).unwrap();
        assert_eq!(resolved.env, vec![("ENV".to_string(), "/a:/b".to_string())]);
    }

    #[test]
    fn missing_required_fails() {
        let mut props = Map::new();
        props.insert(
            "api_key".into(),
            PropertySchema {
                ty: PropertyType::String,
                default: None,
                description: String::new(),
                env_mapping: Some("API_KEY".into()),
                env_separator: None,
                volume_mount: false,
            },
        );
        let manifest = manifest_with(props, vec!["api_key"]);
        let result = resolve(&manifest, &Layers::default());
        assert!(matches!(result, Err(Error::ConfigMissingRequired(k)) if k == "api_key"));
    }

    #[test]
    fn volume_mounts_disambiguate_repeated_basenames() {
        let mut props = Map::new();
        props.insert(
            "data_dirs".into(),
            PropertySchema {
                ty: PropertyType::Array,
                default: Some(Value::Array(vec![])),
                description: String::new(),
                env_mapping: None,
                env_separator: None,
                volume_mount: true,
            },
        );
        let manifest = manifest_with(props, vec![]);
        let mut layers = Layers::default();
        layers.file.insert(
            "data_dirs".into(),
            Value::Array(vec![
                Value::String("/home/a/data".into()),
                Value::String("/home/b/data".into()),
            ]),
        );
        let resolved = resolve(&manifest, &layers).unwrap();
        assert_eq!(resolved.mounts.len(), 2);
        assert_eq!(resolved.mounts[0].container_path, "/mnt/config/data");
        assert_eq!(resolved.mounts[1].container_path, "/mnt/config/data-1");
    }
}
