use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::manifest::{self, Manifest};

/// Discovers template bundles on disk, validates their manifests, and
/// exposes lookup/listing/search. Built once, snapshot-read; `refresh()`
/// atomically swaps the snapshot pointer so concurrent readers never see a
/// partially-rebuilt registry.
pub struct TemplateRegistry {
    root: PathBuf,
    snapshot: ArcSwap<Snapshot>,
}

struct Snapshot {
    templates: HashMap<String, Arc<Manifest>>,
}

impl TemplateRegistry {
    /// Scan `root` and build the initial snapshot.
    pub fn discover(root: impl AsRef<Path>) -> Result<Arc<Self>> {
        let root = root.as_ref().to_path_buf();
        let templates = scan(&root)?;
        Ok(Arc::new(Self {
            root,
            snapshot: ArcSwap::new(Arc::new(Snapshot { templates })),
        }))
    }

    /// Force a rescan, atomically replacing the snapshot.
    pub fn refresh(&self) -> Result<()> {
        let templates = scan(&self.root)?;
        self.snapshot.store(Arc::new(Snapshot { templates }));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Manifest>> {
        self.snapshot.load().templates.get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Manifest>> {
        self.snapshot.load().templates.values().cloned().collect()
    }

    pub fn categories(&self) -> Vec<String> {
        // Templates in this platform have no dedicated category field;
        // the first tag conventionally doubles as the category, matching
        // how templates are organized on disk (one directory per category
        // under the template root in the common case).
        let mut cats: Vec<String> = self
            .snapshot
            .load()
            .templates
            .values()
            .filter_map(|m| m.tags.first().cloned())
            .collect();
        cats.sort();
        cats.dedup();
        cats
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .snapshot
            .load()
            .templates
            .values()
            .flat_map(|m| m.tags.iter().cloned())
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }

    /// BM25 search over name/description/tags, retargeting the corpus-wide
    /// ranking this platform already uses for tool search (§ C7) onto
    /// templates instead of tools — both are "rank short documents by a
    /// short query" problems over the same scoring constants.
    pub fn search(&self, query: &str, by: SearchBy, limit: usize) -> Vec<Arc<Manifest>> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let snapshot = self.snapshot.load();
        let corpus: Vec<(Arc<Manifest>, Vec<String>)> = snapshot
            .templates
            .values()
            .map(|m| {
                let mut tokens = tokenize(&m.name);
                let name_tokens = tokens.clone();
                tokens.extend(name_tokens); // name gets 2x weight
                match by {
                    SearchBy::Name => {}
                    SearchBy::Description => tokens.extend(tokenize(&m.description)),
                    SearchBy::Tag => {
                        for tag in &m.tags {
                            tokens.extend(tokenize(tag));
                        }
                    }
                    SearchBy::Any => {
                        tokens.extend(tokenize(&m.description));
                        for tag in &m.tags {
                            tokens.extend(tokenize(tag));
                        }
                    }
                }
                (m.clone(), tokens)
            })
            .collect();

        let n = corpus.len() as f64;
        if n == 0.0 {
            return Vec::new();
        }
        let avgdl: f64 = corpus.iter().map(|(_, t)| t.len() as f64).sum::<f64>() / n;

        let mut df: HashMap<&str, f64> = HashMap::new();
        for term in &query_terms {
            let count = corpus
                .iter()
                .filter(|(_, tokens)| tokens.iter().any(|t| t == term))
                .count();
            df.insert(term.as_str(), count as f64);
        }

        const K1: f64 = 1.2;
        const B: f64 = 0.75;

        let mut scored: Vec<(Arc<Manifest>, f64)> = corpus
            .into_iter()
            .filter_map(|(manifest, tokens)| {
                let dl = tokens.len() as f64;
                let mut tf: HashMap<&str, f64> = HashMap::new();
                for term in &query_terms {
                    let count = tokens.iter().filter(|t| t.as_str() == term.as_str()).count();
                    tf.insert(term.as_str(), count as f64);
                }

                let mut score = 0.0f64;
                for term in &query_terms {
                    let term_freq = tf.get(term.as_str()).copied().unwrap_or(0.0);
                    if term_freq == 0.0 {
                        continue;
                    }
                    let doc_freq = df.get(term.as_str()).copied().unwrap_or(0.0);
                    let idf = ((n - doc_freq + 0.5) / (doc_freq + 0.5) + 1.0).ln();
                    let tf_norm =
                        (term_freq * (K1 + 1.0)) / (term_freq + K1 * (1.0 - B + B * dl / avgdl));
                    score += idf * tf_norm;
                }

                (score > 0.0).then_some((manifest, score))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        scored.truncate(limit);
        scored.into_iter().map(|(m, _)| m).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchBy {
    Name,
    Description,
    Tag,
    Any,
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_lowercase())
        .collect()
}

fn scan(root: &Path) -> Result<HashMap<String, Arc<Manifest>>> {
    let mut templates: HashMap<String, Arc<Manifest>> = HashMap::new();
    let mut seen_ids: DashMap<String, PathBuf> = DashMap::new();

    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "template root unreadable");
            return Ok(templates);
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let manifest_path = path.join("template.json");
        let dockerfile_present =
            path.join("Dockerfile").is_file() || path.join("Containerfile").is_file();

        let raw = match std::fs::read_to_string(&manifest_path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(candidate = %path.display(), error = %e, "skipping candidate: no readable template.json");
                continue;
            }
        };

        let manifest: Manifest = match serde_json::from_str(&raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(candidate = %path.display(), error = %e, "skipping malformed manifest");
                continue;
            }
        };

        let errors = manifest::validate(&manifest);
        if !errors.is_empty() {
            warn!(
                candidate = %path.display(),
                errors = ?errors,
                "skipping manifest that fails validation"
            );
            continue;
        }

        if !dockerfile_present && !manifest.image.contains(':') {
            warn!(
                candidate = %path.display(),
                "skipping candidate: no Dockerfile and image reference has no resolvable tag"
            );
            continue;
        }

        if let Some((_, existing_path)) = seen_ids.remove(&manifest.id) {
            return Err(Error::TemplateIdCollision(format!(
                "{} (candidates: {} and {})",
                manifest.id,
                existing_path.display(),
                path.display()
            )));
        }
        seen_ids.insert(manifest.id.clone(), path.clone());

        info!(id = %manifest.id, path = %path.display(), "discovered template");
        templates.insert(manifest.id.clone(), Arc::new(manifest));
    }

    Ok(templates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_template(dir: &Path, id: &str, name: &str) {
        let template_dir = dir.join(id);
        fs::create_dir_all(&template_dir).unwrap();
        fs::write(template_dir.join("Dockerfile"), "FROM scratch\n").unwrap();
        let manifest = serde_json::json!({
            "id": id,
            "name": name,
            "version": "1.0.0",
            "image": format!("{id}:latest"),
            "transport": {"default": "stdio", "supported": ["stdio"]},
            "config_schema": {"properties": {}, "required": []}
        });
        fs::write(
            template_dir.join("template.json"),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn discovers_valid_templates() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "demo", "Demo Server");
        let registry = TemplateRegistry::discover(dir.path()).unwrap();
        assert!(registry.get("demo").is_some());
    }

    #[test]
    fn skips_malformed_and_keeps_others() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "good", "Good Server");
        let bad_dir = dir.path().join("bad");
        fs::create_dir_all(&bad_dir).unwrap();
        fs::write(bad_dir.join("template.json"), "{ not json").unwrap();
        let registry = TemplateRegistry::discover(dir.path()).unwrap();
        assert!(registry.get("good").is_some());
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn id_collision_fails_discovery() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "demo", "Demo One");
        let clash_dir = dir.path().join("demo-clone");
        fs::create_dir_all(&clash_dir).unwrap();
        fs::write(clash_dir.join("Dockerfile"), "FROM scratch\n").unwrap();
        let manifest = serde_json::json!({
            "id": "demo",
            "name": "Demo Two",
            "version": "1.0.0",
            "image": "demo:latest",
            "transport": {"default": "stdio", "supported": ["stdio"]},
            "config_schema": {"properties": {}, "required": []}
        });
        fs::write(
            clash_dir.join("template.json"),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();

        let result = TemplateRegistry::discover(dir.path());
        assert!(matches!(result, Err(Error::TemplateIdCollision(_))));
    }

    #[test]
    fn search_ranks_name_matches_first() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "filesystem", "Filesystem Server");
        write_template(dir.path(), "weather", "Weather API wrapping filesystem cache");
        let registry = TemplateRegistry::discover(dir.path()).unwrap();
        let results = registry.search("filesystem", SearchBy::Any, 10);
        assert_eq!(results.first().map(|m| m.id.as_str()), Some("filesystem"));
    }

    #[test]
    fn refresh_picks_up_new_templates() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "demo", "Demo Server");
        let registry = TemplateRegistry::discover(dir.path()).unwrap();
        assert_eq!(registry.all().len(), 1);
        write_template(dir.path(), "second", "Second Server");
        registry.refresh().unwrap();
        assert_eq!(registry.all().len(), 2);
    }
}
