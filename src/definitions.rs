//! In-process registry of parsed workflow definitions.
//!
//! Keyed by `(name, version)`, matching the node-tree cache. Definitions come
//! from YAML files or programmatic registration; a database-backed definition
//! store would sit behind the same lookups.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use snafu::prelude::*;
use tokio::sync::RwLock;
use tracing::info;

use crate::dsl::{self, WorkflowDefinition};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("I/O error reading {path}: {source}"))]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse {path}: {source}"))]
    Parse { path: String, source: dsl::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Default)]
pub struct DefinitionRegistry {
    definitions: RwLock<HashMap<(String, String), Arc<WorkflowDefinition>>>,
}

impl DefinitionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, definition: WorkflowDefinition) -> Arc<WorkflowDefinition> {
        let key = (
            definition.document.name.clone(),
            definition.document.version.clone(),
        );
        let definition = Arc::new(definition);
        self.definitions
            .write()
            .await
            .insert(key, Arc::clone(&definition));
        definition
    }

    pub async fn get(&self, name: &str, version: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .await
            .get(&(name.to_string(), version.to_string()))
            .map(Arc::clone)
    }

    pub async fn load_file(&self, path: &Path) -> Result<Arc<WorkflowDefinition>> {
        let text = tokio::fs::read_to_string(path).await.context(IoSnafu {
            path: path.display().to_string(),
        })?;
        let definition = WorkflowDefinition::from_yaml(&text).context(ParseSnafu {
            path: path.display().to_string(),
        })?;
        info!(
            name = %definition.document.name,
            version = %definition.document.version,
            "registered workflow definition"
        );
        Ok(self.register(definition).await)
    }

    /// Load every `.yaml`/`.yml`/`.json` file in a directory; returns how many
    /// definitions were registered.
    pub async fn load_dir(&self, dir: &Path) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(dir).await.context(IoSnafu {
            path: dir.display().to_string(),
        })?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await.context(IoSnafu {
            path: dir.display().to_string(),
        })? {
            let path = entry.path();
            let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if matches!(extension, "yaml" | "yml" | "json") {
                self.load_file(&path).await?;
                count += 1;
            }
        }
        Ok(count)
    }
}
