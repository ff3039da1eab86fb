//! Skill manifest loading (SPEC_FULL.md §3 "Skill Manifest", §4.E).
//!
//! Grounded on `skynet-agent/src/tools/skill.rs`'s directory-walking loader:
//! the teacher walks `~/.skynet/skills/<name>/SKILL.md` instruction documents
//! and dedupes by name; here the tree is `apps/<app_id>/skills/<skill_id>/*.yml`
//! executable tool manifests, deduped by the `(app_id, skill_id)` pair and
//! validated as JSON Schema rather than parsed as prose frontmatter.

use std::collections::HashMap;
use std::path::Path;

use openmates_core::types::ExecutionMode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Result, SkillError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillStage {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pricing {
    #[serde(default)]
    pub base: f64,
    #[serde(default)]
    pub per_unit: f64,
}

impl Pricing {
    pub fn cost(&self, units: f64) -> f64 {
        self.base + self.per_unit * units
    }
}

/// What's actually declared in `<skill_id>.yml` on disk.
#[derive(Debug, Clone, Deserialize)]
struct ManifestFile {
    description: String,
    stage: SkillStage,
    execution_mode: ExecutionMode,
    tool_schema: serde_json::Value,
    #[serde(default)]
    pricing: Pricing,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// One loaded, schema-validated skill manifest, keyed by `(app_id, skill_id)`.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub app_id: String,
    pub skill_id: String,
    pub description: String,
    pub stage: SkillStage,
    pub execution_mode: ExecutionMode,
    pub tool_schema: serde_json::Value,
    pub pricing: Pricing,
    pub timeout_secs: Option<u64>,
}

impl Manifest {
    pub fn key(&self) -> (String, String) {
        (self.app_id.clone(), self.skill_id.clone())
    }

    /// Full tool name as surfaced to the model: `app_id.skill_id`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.app_id, self.skill_id)
    }

    fn from_file(app_id: &str, skill_id: &str, path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| SkillError::Manifest {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let file: ManifestFile = serde_yaml::from_str(&raw).map_err(|e| SkillError::Manifest {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        jsonschema::validator_for(&file.tool_schema).map_err(|e| SkillError::Manifest {
            path: path.display().to_string(),
            message: format!("tool_schema is not a valid JSON Schema: {e}"),
        })?;

        Ok(Manifest {
            app_id: app_id.to_string(),
            skill_id: skill_id.to_string(),
            description: file.description,
            stage: file.stage,
            execution_mode: file.execution_mode,
            tool_schema: file.tool_schema,
            pricing: file.pricing,
            timeout_secs: file.timeout_secs,
        })
    }
}

/// Immutable, built-at-startup map of every manifest found under `root`.
#[derive(Debug, Default, Clone)]
pub struct SkillRegistry {
    manifests: HashMap<(String, String), Manifest>,
}

impl SkillRegistry {
    pub fn load_from_root(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut manifests = HashMap::new();

        let Ok(app_dirs) = std::fs::read_dir(root) else {
            warn!(root = %root.display(), "skill manifest root does not exist; starting with an empty registry");
            return Ok(Self { manifests });
        };

        for app_entry in app_dirs.flatten() {
            let app_path = app_entry.path();
            if !app_path.is_dir() {
                continue;
            }
            let app_id = app_entry.file_name().to_string_lossy().to_string();
            let skills_dir = app_path.join("skills");
            let Ok(skill_dirs) = std::fs::read_dir(&skills_dir) else {
                continue;
            };

            for skill_entry in skill_dirs.flatten() {
                let skill_path = skill_entry.path();
                if !skill_path.is_dir() {
                    continue;
                }
                let skill_id = skill_entry.file_name().to_string_lossy().to_string();

                let Ok(files) = std::fs::read_dir(&skill_path) else {
                    continue;
                };
                for file_entry in files.flatten() {
                    let file_path = file_entry.path();
                    let is_yaml = file_path.extension().is_some_and(|e| e == "yml" || e == "yaml");
                    if !is_yaml {
                        continue;
                    }

                    let manifest = Manifest::from_file(&app_id, &skill_id, &file_path)?;
                    let key = manifest.key();
                    if manifests.contains_key(&key) {
                        warn!(app_id, skill_id, "duplicate skill manifest, keeping the first one loaded");
                        continue;
                    }
                    debug!(app_id, skill_id, path = %file_path.display(), "loaded skill manifest");
                    manifests.insert(key, manifest);
                }
            }
        }

        Ok(Self { manifests })
    }

    pub fn get(&self, app_id: &str, skill_id: &str) -> Option<&Manifest> {
        self.manifests.get(&(app_id.to_string(), skill_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Manifest> {
        self.manifests.values()
    }

    /// Validate `args` against a manifest's `tool_schema`. Schema failures are
    /// never retried transport-side (SPEC_FULL.md §4.E) — they come back as a
    /// structured error the dispatcher turns into a tool result.
    pub fn validate_args(manifest: &Manifest, args: &serde_json::Value) -> Result<()> {
        let validator = jsonschema::validator_for(&manifest.tool_schema)
            .map_err(|e| SkillError::InvalidArgs(format!("invalid tool_schema: {e}")))?;
        if let Err(e) = validator.validate(args) {
            return Err(SkillError::InvalidArgs(e.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_manifest(dir: &Path, app_id: &str, skill_id: &str, yaml: &str) {
        let skill_dir = dir.join(app_id).join("skills").join(skill_id);
        std::fs::create_dir_all(&skill_dir).unwrap();
        let mut f = std::fs::File::create(skill_dir.join("manifest.yml")).unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
    }

    const DOCS_YAML: &str = r#"
description: "Fetch library documentation for {AVAILABLE_APPS}."
stage: prod
execution_mode: inline
tool_schema:
  type: object
  properties:
    library:
      type: string
    question:
      type: string
  required: ["library", "question"]
pricing:
  base: 1.0
  per_unit: 0.0
"#;

    #[test]
    fn loads_manifests_from_a_directory_tree() {
        let tmp = std::env::temp_dir().join(format!("openmates-skills-test-{}", uuid::Uuid::new_v4()));
        write_manifest(&tmp, "code", "get_docs", DOCS_YAML);

        let registry = SkillRegistry::load_from_root(&tmp).unwrap();
        assert_eq!(registry.len(), 1);
        let m = registry.get("code", "get_docs").unwrap();
        assert_eq!(m.qualified_name(), "code.get_docs");
        assert_eq!(m.execution_mode, ExecutionMode::Inline);
        assert_eq!(m.pricing.cost(0.0), 1.0);

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn missing_root_yields_an_empty_registry() {
        let registry = SkillRegistry::load_from_root("/does/not/exist/ever").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn validate_args_rejects_missing_required_field() {
        let tmp = std::env::temp_dir().join(format!("openmates-skills-test-{}", uuid::Uuid::new_v4()));
        write_manifest(&tmp, "code", "get_docs", DOCS_YAML);
        let registry = SkillRegistry::load_from_root(&tmp).unwrap();
        let m = registry.get("code", "get_docs").unwrap();

        assert!(SkillRegistry::validate_args(m, &serde_json::json!({"library": "x"})).is_err());
        assert!(SkillRegistry::validate_args(m, &serde_json::json!({"library": "x", "question": "y"})).is_ok());

        std::fs::remove_dir_all(&tmp).ok();
    }
}
