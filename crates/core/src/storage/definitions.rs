use crate::types::WorkflowDefinition;
use crate::workflow::parser;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// One revision of an authored workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDefinition {
    pub workflow_id: String,
    pub revision: u32,
    pub definition: WorkflowDefinition,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub is_deprecated: bool,
}

/// Source of workflow definitions for `execute` and sub-workflow steps
#[async_trait::async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Look up by workflow id or name slug; `None` revision means latest
    async fn get(&self, reference: &str, revision: Option<u32>)
        -> Result<Option<StoredDefinition>>;

    /// Store a new revision and return it
    async fn save(
        &self,
        workflow_id: &str,
        definition: WorkflowDefinition,
        author: &str,
    ) -> Result<StoredDefinition>;
}

/// Lowercase, hyphen-separated form of a workflow name
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

/// In-memory, versioned definition registry
#[derive(Default)]
pub struct DefinitionRegistry {
    versions: RwLock<HashMap<String, Vec<StoredDefinition>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new revision of a workflow
    pub async fn register_version(
        &self,
        workflow_id: &str,
        definition: WorkflowDefinition,
        created_by: &str,
    ) -> StoredDefinition {
        let mut versions = self.versions.write().await;
        let revisions = versions.entry(workflow_id.to_string()).or_default();

        let stored = StoredDefinition {
            workflow_id: workflow_id.to_string(),
            revision: revisions.len() as u32 + 1,
            definition,
            created_at: Utc::now(),
            created_by: created_by.to_string(),
            is_deprecated: false,
        };
        revisions.push(stored.clone());

        tracing::info!(
            workflow_id,
            revision = stored.revision,
            "Registered workflow revision"
        );

        stored
    }

    /// Latest non-deprecated revision
    pub async fn get_latest_version(&self, workflow_id: &str) -> Option<StoredDefinition> {
        self.versions
            .read()
            .await
            .get(workflow_id)
            .and_then(|revisions| revisions.iter().rev().find(|v| !v.is_deprecated).cloned())
    }

    /// Specific revision, deprecated or not
    pub async fn get_version(&self, workflow_id: &str, revision: u32) -> Option<StoredDefinition> {
        self.versions
            .read()
            .await
            .get(workflow_id)
            .and_then(|revisions| revisions.iter().find(|v| v.revision == revision).cloned())
    }

    pub async fn list_versions(&self, workflow_id: &str) -> Vec<StoredDefinition> {
        self.versions
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn deprecate_version(&self, workflow_id: &str, revision: u32) -> Result<()> {
        let mut versions = self.versions.write().await;
        let entry = versions
            .get_mut(workflow_id)
            .with_context(|| format!("Workflow not found: {}", workflow_id))?
            .iter_mut()
            .find(|v| v.revision == revision)
            .with_context(|| format!("Revision {} not found", revision))?;

        entry.is_deprecated = true;
        tracing::info!(workflow_id, revision, "Deprecated workflow revision");
        Ok(())
    }

    /// Resolve a slug of the workflow name to its id
    async fn id_for_slug(&self, slug: &str) -> Option<String> {
        self.versions
            .read()
            .await
            .iter()
            .find(|(_, revisions)| {
                revisions
                    .last()
                    .is_some_and(|latest| slugify(&latest.definition.name) == slug)
            })
            .map(|(id, _)| id.clone())
    }
}

#[async_trait::async_trait]
impl DefinitionStore for DefinitionRegistry {
    async fn get(
        &self,
        reference: &str,
        revision: Option<u32>,
    ) -> Result<Option<StoredDefinition>> {
        let workflow_id = if self.versions.read().await.contains_key(reference) {
            reference.to_string()
        } else {
            match self.id_for_slug(&slugify(reference)).await {
                Some(id) => id,
                None => return Ok(None),
            }
        };

        Ok(match revision {
            Some(revision) => self.get_version(&workflow_id, revision).await,
            None => self.get_latest_version(&workflow_id).await,
        })
    }

    async fn save(
        &self,
        workflow_id: &str,
        definition: WorkflowDefinition,
        author: &str,
    ) -> Result<StoredDefinition> {
        Ok(self.register_version(workflow_id, definition, author).await)
    }
}

/// Definitions loaded from `*.json`, `*.yaml` and `*.yml` files under a directory.
/// The workflow id is the file stem.
pub struct FilesystemDefinitionStore {
    root: PathBuf,
    registry: DefinitionRegistry,
}

impl FilesystemDefinitionStore {
    pub async fn load(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root).context("Failed to create definitions directory")?;
        let registry = DefinitionRegistry::new();

        for entry in walkdir::WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.context("Failed to walk definitions directory")?;
            let path = entry.path();
            if !entry.file_type().is_file() || !is_definition_file(path) {
                continue;
            }

            let Some(workflow_id) = path.file_stem().map(|s| s.to_string_lossy().to_string())
            else {
                continue;
            };

            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let definition = parser::definition_from_str(&text)
                .with_context(|| format!("Invalid workflow definition in {}", path.display()))?;

            registry
                .register_version(&workflow_id, definition, "filesystem")
                .await;
        }

        Ok(Self { root, registry })
    }

    pub fn registry(&self) -> &DefinitionRegistry {
        &self.registry
    }
}

fn is_definition_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json" | "yaml" | "yml")
    )
}

#[async_trait::async_trait]
impl DefinitionStore for FilesystemDefinitionStore {
    async fn get(
        &self,
        reference: &str,
        revision: Option<u32>,
    ) -> Result<Option<StoredDefinition>> {
        self.registry.get(reference, revision).await
    }

    async fn save(
        &self,
        workflow_id: &str,
        definition: WorkflowDefinition,
        author: &str,
    ) -> Result<StoredDefinition> {
        let yaml = serde_yaml_ng::to_string(&definition).context("Failed to serialize workflow")?;
        let path = self.root.join(format!("{}.yaml", workflow_id));
        tokio::fs::write(&path, yaml)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(self
            .registry
            .register_version(workflow_id, definition, author)
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn definition(name: &str) -> WorkflowDefinition {
        parser::definition_from_str(&format!(
            r#"{{"name": "{name}", "version": "1", "steps": [{{"id": "a", "agent": "x"}}]}}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Bug Triage"), "bug-triage");
        assert_eq!(slugify("  Notify -- Team! "), "notify-team");
    }

    #[tokio::test]
    async fn test_registry_versions() {
        let registry = DefinitionRegistry::new();
        registry
            .register_version("triage", definition("Bug Triage"), "user1")
            .await;
        registry
            .register_version("triage", definition("Bug Triage"), "user2")
            .await;

        let latest = registry.get_latest_version("triage").await.unwrap();
        assert_eq!(latest.revision, 2);
        assert_eq!(registry.list_versions("triage").await.len(), 2);

        registry.deprecate_version("triage", 2).await.unwrap();
        let latest = registry.get_latest_version("triage").await.unwrap();
        assert_eq!(latest.revision, 1);

        let deprecated = registry.get_version("triage", 2).await.unwrap();
        assert!(deprecated.is_deprecated);

        assert!(registry.deprecate_version("missing", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_lookup_by_slug() {
        let registry = DefinitionRegistry::new();
        registry
            .register_version("wf-001", definition("Bug Triage"), "user1")
            .await;

        let found = registry.get("bug-triage", None).await.unwrap().unwrap();
        assert_eq!(found.workflow_id, "wf-001");
        assert!(registry.get("unknown", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_filesystem_store_loads_json_and_yaml() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("notify.json"),
            r#"{"name": "Notify", "version": 2, "steps": [{"id": "send", "agent": "mailer"}]}"#,
        )
        .unwrap();
        std::fs::create_dir_all(temp_dir.path().join("nested")).unwrap();
        std::fs::write(
            temp_dir.path().join("nested/triage.yaml"),
            "name: Triage\nversion: '1.0'\nsteps:\n  - id: classify\n    agent: triager\n",
        )
        .unwrap();
        std::fs::write(temp_dir.path().join("README.md"), "ignored").unwrap();

        let store = FilesystemDefinitionStore::load(temp_dir.path().to_path_buf())
            .await
            .unwrap();

        let notify = store.get("notify", None).await.unwrap().unwrap();
        assert_eq!(notify.definition.version, "2");
        let triage = store.get("triage", None).await.unwrap().unwrap();
        assert_eq!(triage.definition.steps[0].id.as_str(), "classify");

        store
            .save("extra", definition("Extra"), "tester")
            .await
            .unwrap();
        assert!(temp_dir.path().join("extra.yaml").exists());
    }
}
