//! On-disk script collections.
//!
//! ```text
//! <base_dir>/
//!   collections.json          index: name, directory, created_at (creation order)
//!   .collections.lock
//!   <collection dir>/
//!     scripts.json            manifest: ScriptMetadata per script
//!     .lock
//!     <sanitized name>.rhai   script body
//! ```
//!
//! Metadata files are replaced atomically (temp file + rename). Writers of
//! one collection are serialized; unrelated collections never wait on each
//! other.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nix::fcntl::Flock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::lock;
use crate::sanitize::sanitize_name;

/// The collection every store starts with. It cannot be deleted.
pub const DEFAULT_COLLECTION: &str = "Uncategorized";

/// Extension of stored script bodies.
pub const SCRIPT_EXTENSION: &str = "rhai";

const INDEX_FILE: &str = "collections.json";
const INDEX_LOCK: &str = ".collections.lock";
const MANIFEST_FILE: &str = "scripts.json";
const COLLECTION_LOCK: &str = ".lock";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("collection name {0:?} contains no usable characters")]
    InvalidCollectionName(String),

    #[error("collection '{0}' cannot be deleted")]
    Protected(String),

    #[error("corrupt {path}: {detail}")]
    Corrupt { path: String, detail: String },

    #[error("lock error: {0}")]
    Lock(String),

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptMetadata {
    /// Name as given by the user; the identity within a collection.
    pub name: String,
    /// Body file name inside the collection directory.
    pub filename: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionEntry {
    name: String,
    dir: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CollectionIndex {
    collections: Vec<CollectionEntry>,
}

impl CollectionIndex {
    fn find(&self, name: &str) -> Option<&CollectionEntry> {
        self.collections.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    scripts: Vec<ScriptMetadata>,
}

/// Held while mutating the index or one collection.
struct WriteGuard {
    _local: OwnedMutexGuard<()>,
    _file: Flock<std::fs::File>,
}

pub struct CollectionStore {
    base_dir: PathBuf,
    registry: Arc<Mutex<()>>,
    /// Per-collection locks, keyed by collection directory.
    collections: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CollectionStore {
    /// Open (creating if needed) the store rooted at `base_dir`.
    pub async fn open(base_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(io_error(&base_dir))?;
        let store = Self {
            base_dir,
            registry: Arc::new(Mutex::new(())),
            collections: Mutex::new(HashMap::new()),
        };
        store.ensure_default().await?;
        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    async fn ensure_default(&self) -> StoreResult<()> {
        let _guard = self.lock_registry().await?;
        let mut index = self.read_index().await?;
        if index.find(DEFAULT_COLLECTION).is_none() {
            index.collections.insert(
                0,
                CollectionEntry {
                    name: DEFAULT_COLLECTION.to_owned(),
                    dir: DEFAULT_COLLECTION.to_owned(),
                    created_at: Utc::now(),
                },
            );
            self.write_index(&index).await?;
        }
        let dir = self.base_dir.join(DEFAULT_COLLECTION);
        tokio::fs::create_dir_all(&dir).await.map_err(io_error(&dir))
    }

    // -----------------------------------------------------------------------
    // Collections
    // -----------------------------------------------------------------------

    /// Returns `false` if a collection with that name (or directory) exists.
    pub async fn create_collection(&self, name: &str) -> StoreResult<bool> {
        let dir = sanitize_name(name)
            .ok_or_else(|| StoreError::InvalidCollectionName(name.to_owned()))?;

        let _guard = self.lock_registry().await?;
        let mut index = self.read_index().await?;
        if index.find(name).is_some() {
            return Ok(false);
        }
        if let Some(other) = index.collections.iter().find(|c| c.dir == dir) {
            warn!(collection = name, existing = %other.name, "collection directory already in use");
            return Ok(false);
        }

        let path = self.base_dir.join(&dir);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(io_error(&path))?;
        index.collections.push(CollectionEntry {
            name: name.to_owned(),
            dir,
            created_at: Utc::now(),
        });
        self.write_index(&index).await?;
        debug!(collection = name, "collection created");
        Ok(true)
    }

    /// Remove a collection and every script in it. Returns `false` if it
    /// does not exist.
    pub async fn delete_collection(&self, name: &str) -> StoreResult<bool> {
        if name == DEFAULT_COLLECTION {
            return Err(StoreError::Protected(name.to_owned()));
        }

        let _guard = self.lock_registry().await?;
        let mut index = self.read_index().await?;
        let Some(pos) = index.collections.iter().position(|c| c.name == name) else {
            return Ok(false);
        };
        let entry = index.collections.remove(pos);
        self.write_index(&index).await?;

        let _collection = self.lock_collection(&entry.dir).await?;
        let path = self.base_dir.join(&entry.dir);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&path)(e)),
        }
        self.collections.lock().await.remove(&entry.dir);
        debug!(collection = name, "collection deleted");
        Ok(true)
    }

    /// Collection names in creation order.
    pub async fn list_collections(&self) -> StoreResult<Vec<String>> {
        let index = self.read_index().await?;
        Ok(index.collections.into_iter().map(|c| c.name).collect())
    }

    pub async fn collection_exists(&self, name: &str) -> StoreResult<bool> {
        Ok(self.read_index().await?.find(name).is_some())
    }

    // -----------------------------------------------------------------------
    // Scripts
    // -----------------------------------------------------------------------

    /// Scripts in a collection; empty if the collection does not exist.
    pub async fn list_scripts(&self, collection: &str) -> StoreResult<Vec<ScriptMetadata>> {
        let Some(dir) = self.collection_dir(collection).await? else {
            return Ok(Vec::new());
        };
        Ok(self.read_manifest(&dir).await?.scripts)
    }

    pub async fn find_metadata(
        &self,
        collection: &str,
        name: &str,
    ) -> StoreResult<Option<ScriptMetadata>> {
        let scripts = self.list_scripts(collection).await?;
        Ok(scripts.into_iter().find(|s| s.name == name))
    }

    /// Write `<collection>/<sanitized>.rhai`. Returns `false` if the
    /// collection does not exist.
    pub async fn write_script_body(
        &self,
        collection: &str,
        sanitized: &str,
        source: &str,
    ) -> StoreResult<bool> {
        let Some(dir) = self.collection_dir(collection).await? else {
            return Ok(false);
        };
        let _guard = self.lock_collection(&dir).await?;
        let path = self.body_path(&dir, sanitized);
        write_atomic(&path, source.as_bytes()).await?;
        Ok(true)
    }

    pub async fn read_script_body(
        &self,
        collection: &str,
        sanitized: &str,
    ) -> StoreResult<Option<String>> {
        let Some(dir) = self.collection_dir(collection).await? else {
            return Ok(None);
        };
        let path = self.body_path(&dir, sanitized);
        match tokio::fs::read_to_string(&path).await {
            Ok(source) => Ok(Some(source)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    pub async fn delete_script_body(&self, collection: &str, sanitized: &str) -> StoreResult<bool> {
        let Some(dir) = self.collection_dir(collection).await? else {
            return Ok(false);
        };
        let _guard = self.lock_collection(&dir).await?;
        let path = self.body_path(&dir, sanitized);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    /// Insert or replace metadata for `metadata.name`.
    ///
    /// Any entry with the same name or body file is replaced; the earliest
    /// `created_at` among replaced entries is kept. Returns `false` if the
    /// collection does not exist.
    pub async fn upsert_metadata(
        &self,
        collection: &str,
        metadata: ScriptMetadata,
    ) -> StoreResult<bool> {
        let Some(dir) = self.collection_dir(collection).await? else {
            return Ok(false);
        };
        let _guard = self.lock_collection(&dir).await?;
        self.upsert_locked(collection, &dir, metadata).await?;
        Ok(true)
    }

    /// Remove and return the metadata for `name`, if present.
    pub async fn remove_metadata(
        &self,
        collection: &str,
        name: &str,
    ) -> StoreResult<Option<ScriptMetadata>> {
        let Some(dir) = self.collection_dir(collection).await? else {
            return Ok(None);
        };
        let _guard = self.lock_collection(&dir).await?;
        self.remove_locked(&dir, name).await
    }

    /// Write the body and upsert its metadata under one collection lock, so
    /// concurrent saves of one name never pair one body with another's
    /// metadata. Returns `false` if the collection does not exist.
    pub async fn save_script(
        &self,
        collection: &str,
        sanitized: &str,
        source: &str,
        metadata: ScriptMetadata,
    ) -> StoreResult<bool> {
        let Some(dir) = self.collection_dir(collection).await? else {
            return Ok(false);
        };
        let _guard = self.lock_collection(&dir).await?;
        write_atomic(&self.body_path(&dir, sanitized), source.as_bytes()).await?;
        self.upsert_locked(collection, &dir, metadata).await?;
        Ok(true)
    }

    /// Remove metadata and body together. `None` if there was no entry.
    pub async fn delete_script(
        &self,
        collection: &str,
        name: &str,
        sanitized: &str,
    ) -> StoreResult<Option<ScriptMetadata>> {
        let Some(dir) = self.collection_dir(collection).await? else {
            return Ok(None);
        };
        let _guard = self.lock_collection(&dir).await?;
        let Some(removed) = self.remove_locked(&dir, name).await? else {
            return Ok(None);
        };
        let path = self.body_path(&dir, sanitized);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&path)(e)),
        }
        Ok(Some(removed))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Caller holds the collection lock.
    async fn upsert_locked(
        &self,
        collection: &str,
        dir: &str,
        mut metadata: ScriptMetadata,
    ) -> StoreResult<()> {
        let manifest = self.read_manifest(dir).await?;
        let (replaced, mut kept): (Vec<_>, Vec<_>) = manifest
            .scripts
            .into_iter()
            .partition(|s| s.name == metadata.name || s.filename == metadata.filename);
        if let Some(created) = replaced.iter().map(|s| s.created_at).min() {
            metadata.created_at = created;
        }
        for old in replaced.iter().filter(|s| s.name != metadata.name) {
            warn!(collection, replaced = %old.name, by = %metadata.name, "script file name collision");
        }

        kept.push(metadata);
        self.write_manifest(dir, &Manifest { scripts: kept }).await
    }

    /// Caller holds the collection lock.
    async fn remove_locked(&self, dir: &str, name: &str) -> StoreResult<Option<ScriptMetadata>> {
        let mut manifest = self.read_manifest(dir).await?;
        let Some(pos) = manifest.scripts.iter().position(|s| s.name == name) else {
            return Ok(None);
        };
        let removed = manifest.scripts.remove(pos);
        self.write_manifest(dir, &manifest).await?;
        Ok(Some(removed))
    }

    fn body_path(&self, dir: &str, sanitized: &str) -> PathBuf {
        self.base_dir
            .join(dir)
            .join(format!("{sanitized}.{SCRIPT_EXTENSION}"))
    }

    async fn collection_dir(&self, name: &str) -> StoreResult<Option<String>> {
        Ok(self.read_index().await?.find(name).map(|c| c.dir.clone()))
    }

    async fn lock_registry(&self) -> StoreResult<WriteGuard> {
        let local = self.registry.clone().lock_owned().await;
        let file = lock::acquire(self.base_dir.join(INDEX_LOCK)).await?;
        Ok(WriteGuard {
            _local: local,
            _file: file,
        })
    }

    async fn lock_collection(&self, dir: &str) -> StoreResult<WriteGuard> {
        let mutex = self
            .collections
            .lock()
            .await
            .entry(dir.to_owned())
            .or_default()
            .clone();
        let local = mutex.lock_owned().await;
        let file = lock::acquire(self.base_dir.join(dir).join(COLLECTION_LOCK)).await?;
        Ok(WriteGuard {
            _local: local,
            _file: file,
        })
    }

    async fn read_index(&self) -> StoreResult<CollectionIndex> {
        read_json(&self.base_dir.join(INDEX_FILE)).await
    }

    async fn write_index(&self, index: &CollectionIndex) -> StoreResult<()> {
        write_json(&self.base_dir.join(INDEX_FILE), index).await
    }

    async fn read_manifest(&self, dir: &str) -> StoreResult<Manifest> {
        read_json(&self.base_dir.join(dir).join(MANIFEST_FILE)).await
    }

    async fn write_manifest(&self, dir: &str, manifest: &Manifest) -> StoreResult<()> {
        write_json(&self.base_dir.join(dir).join(MANIFEST_FILE), manifest).await
    }
}

/// Missing file reads as the default value.
async fn read_json<T: DeserializeOwned + Default>(path: &Path) -> StoreResult<T> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(io_error(path)(e)),
    };
    serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
        path: path.display().to_string(),
        detail: e.to_string(),
    })
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| StoreError::Corrupt {
        path: path.display().to_string(),
        detail: e.to_string(),
    })?;
    write_atomic(path, json.as_bytes()).await
}

/// Atomic write: write to a temp file in the same directory, then rename.
async fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await.map_err(io_error(&tmp))?;
    tokio::fs::rename(&tmp, path).await.map_err(io_error(path))
}
