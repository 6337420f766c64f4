use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sandbox::{DEFAULT_TIMEOUT, ExecutionRequest, ExecutionResult, Sandbox};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{RunnerError, RunnerResult};
use crate::sanitize::sanitize_name;
use crate::store::{CollectionStore, SCRIPT_EXTENSION, ScriptMetadata};

/// A stored script body with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedScript {
    pub source: String,
    pub metadata: ScriptMetadata,
}

/// One row of a cross-collection listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListedScript {
    pub collection: String,
    #[serde(flatten)]
    pub metadata: ScriptMetadata,
}

/// Execution plus script storage behind one API.
///
/// Execution is delegated to the sandbox untouched. Storage goes through
/// [`CollectionStore`] after script names are sanitized into file names.
pub struct ScriptRunner {
    sandbox: Arc<dyn Sandbox>,
    store: CollectionStore,
    default_timeout: Duration,
}

impl ScriptRunner {
    pub fn new(sandbox: Arc<dyn Sandbox>, store: CollectionStore) -> Self {
        Self {
            sandbox,
            store,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Deadline used by [`execute`](Self::execute).
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn store(&self) -> &CollectionStore {
        &self.store
    }

    pub async fn execute(&self, source: &str, stdin: &str) -> ExecutionResult {
        let mut request = ExecutionRequest::new(source, stdin);
        if let Ok(with_default) = request.clone().with_timeout(self.default_timeout) {
            request = with_default;
        }
        self.sandbox.execute(&request).await
    }

    /// Execute with an explicit deadline. Only a zero timeout is an error;
    /// script failures are reported inside the result.
    pub async fn execute_with_timeout(
        &self,
        source: &str,
        stdin: &str,
        timeout_secs: u64,
    ) -> RunnerResult<ExecutionResult> {
        let request = ExecutionRequest::new(source, stdin).with_timeout_secs(timeout_secs)?;
        Ok(self.sandbox.execute(&request).await)
    }

    /// Store a script. Returns `false` if the collection does not exist.
    pub async fn save_script(
        &self,
        name: &str,
        source: &str,
        collection: &str,
        description: &str,
        tags: impl IntoIterator<Item = String>,
    ) -> RunnerResult<bool> {
        let file_stem = sanitized(name)?;

        let now = Utc::now();
        let metadata = ScriptMetadata {
            name: name.to_owned(),
            filename: format!("{file_stem}.{SCRIPT_EXTENSION}"),
            description: description.to_owned(),
            tags: tags.into_iter().collect::<BTreeSet<_>>(),
            created_at: now,
            modified_at: now,
        };
        let saved = self
            .store
            .save_script(collection, &file_stem, source, metadata)
            .await?;
        if saved {
            info!(script = name, collection, "script saved");
        } else {
            debug!(collection, "save into missing collection");
        }
        Ok(saved)
    }

    /// `None` if the script or its collection does not exist.
    pub async fn load_script(
        &self,
        name: &str,
        collection: &str,
    ) -> RunnerResult<Option<LoadedScript>> {
        let file_stem = sanitized(name)?;

        let Some(metadata) = self.store.find_metadata(collection, name).await? else {
            return Ok(None);
        };
        let source = self.store.read_script_body(collection, &file_stem).await?;
        Ok(source.map(|source| LoadedScript { source, metadata }))
    }

    /// Returns `false` if there was nothing to delete.
    pub async fn delete_script(&self, name: &str, collection: &str) -> RunnerResult<bool> {
        let file_stem = sanitized(name)?;

        let deleted = self
            .store
            .delete_script(collection, name, &file_stem)
            .await?
            .is_some();
        if deleted {
            info!(script = name, collection, "script deleted");
        }
        Ok(deleted)
    }

    /// Every script, grouped by collection in collection creation order.
    pub async fn list_all_scripts(&self) -> RunnerResult<Vec<ListedScript>> {
        let mut all = Vec::new();
        for collection in self.store.list_collections().await? {
            let scripts = self.store.list_scripts(&collection).await?;
            all.extend(scripts.into_iter().map(|metadata| ListedScript {
                collection: collection.clone(),
                metadata,
            }));
        }
        Ok(all)
    }

    /// Case-insensitive substring match on script name or any tag.
    pub async fn search_scripts(&self, query: &str) -> RunnerResult<Vec<ListedScript>> {
        let query = query.to_lowercase();
        let mut all = self.list_all_scripts().await?;
        all.retain(|s| {
            s.metadata.name.to_lowercase().contains(&query)
                || s.metadata
                    .tags
                    .iter()
                    .any(|t| t.to_lowercase().contains(&query))
        });
        Ok(all)
    }

    pub async fn create_collection(&self, name: &str) -> RunnerResult<bool> {
        Ok(self.store.create_collection(name).await?)
    }

    pub async fn delete_collection(&self, name: &str) -> RunnerResult<bool> {
        Ok(self.store.delete_collection(name).await?)
    }

    pub async fn list_collections(&self) -> RunnerResult<Vec<String>> {
        Ok(self.store.list_collections().await?)
    }
}

fn sanitized(name: &str) -> RunnerResult<String> {
    sanitize_name(name).ok_or_else(|| RunnerError::NameRejected(name.to_owned()))
}
