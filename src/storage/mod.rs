//! Pluggable storage backend abstraction for backupd.
//!
//! Every destination a model can write to implements `StorageBackend`.
//! The pipeline and the retention cycler only ever hold a
//! `&dyn StorageBackend`, so adding a backend never touches retention logic.
//!
//! Backends:
//! - `local`: a directory on the local filesystem (reference implementation)
//! - `s3`: any S3-compatible object store
pub mod local;
pub mod s3;

use std::future::Future;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ModelConfig, StorageConfig};
use crate::error::{BackupError, Result};

pub use local::LocalBackend;
pub use s3::S3Backend;

/// One entry returned by `StorageBackend::list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileItem {
    pub filename: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Fields every backend instance shares: who it belongs to and what it uploads.
#[derive(Debug, Clone)]
pub struct StorageContext {
    /// Owning model name.
    pub model: String,
    /// Model working directory; relative backend paths resolve against it.
    pub work_dir: PathBuf,
    /// The run's finished local archive (a file, or a directory of parts).
    pub archive_path: PathBuf,
    /// Resolved storage configuration.
    pub storage: StorageConfig,
}

impl StorageContext {
    pub fn new(model: &ModelConfig, storage: &StorageConfig, archive_path: impl Into<PathBuf>) -> Self {
        Self {
            model: model.name.clone(),
            work_dir: model.work_dir.clone(),
            archive_path: archive_path.into(),
            storage: storage.clone(),
        }
    }

    /// Resolve a configured path against the model's working directory.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }
}

/// Trait for pluggable storage backends.
///
/// Keys are `/`-separated. A key ending in `/` names a directory (or prefix).
/// Backends are stateless with respect to retention; they never track history.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend kind for logs (e.g., "local", "s3").
    fn name(&self) -> &str;

    /// Prepare for a run. Idempotent; called once before any transfer.
    async fn open(&self) -> Result<()>;

    /// Release whatever `open` acquired.
    async fn close(&self);

    /// Store the run's local archive at `file_key`, creating intermediate
    /// structure as needed. No partial object is ever visible under the final key.
    async fn upload(&self, file_key: &str) -> Result<()>;

    /// Fetch `file_key` into a local temp path and return that path.
    /// Backends that cannot do this return `BackupError::Unsupported`.
    async fn download(&self, file_key: &str) -> Result<PathBuf>;

    /// Remove `file_key`; a trailing `/` removes everything beneath it.
    /// Removing something that is already gone succeeds.
    async fn delete(&self, file_key: &str) -> Result<()>;

    /// Immediate, non-directory entries under `parent`.
    async fn list(&self, parent: &str) -> Result<Vec<FileItem>>;
}

/// Build the backend variant named by the storage's `type`.
pub fn new_backend(ctx: StorageContext) -> Result<Box<dyn StorageBackend>> {
    match ctx.storage.kind.as_str() {
        "local" => Ok(Box::new(LocalBackend::new(ctx)?)),
        "s3" => Ok(Box::new(S3Backend::new(ctx)?)),
        other => Err(BackupError::Config(format!(
            "storage {} has unknown type `{other}`",
            ctx.storage.name
        ))),
    }
}

/// Run `f` between `open` and `close`.
///
/// `close` runs whenever `open` succeeded, whatever `f` returns.
pub async fn with_storage<'b, T, F, Fut>(backend: &'b dyn StorageBackend, f: F) -> Result<T>
where
    F: FnOnce(&'b dyn StorageBackend) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    backend.open().await?;
    let result = f(backend).await;
    backend.close().await;
    result
}

/// True when `key` names a directory.
pub fn is_dir_key(key: &str) -> bool {
    key.ends_with('/')
}

/// Join a key prefix and a key with exactly one `/` between them.
pub fn join_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let key = key.trim_start_matches('/');
    match (prefix.is_empty(), key.is_empty()) {
        (true, _) => key.to_string(),
        (false, true) => format!("{prefix}/"),
        (false, false) => format!("{prefix}/{key}"),
    }
}

/// Every regular file beneath `root`, as `/`-separated paths relative to it, sorted.
pub async fn collect_files(root: &Path) -> Result<Vec<String>> {
    Ok(collect_tree(root).await?.1)
}

/// Sub-directories and regular files beneath `root`, both as sorted
/// `/`-separated relative paths. A parent always sorts before its children.
pub async fn collect_tree(root: &Path) -> Result<(Vec<String>, Vec<String>)> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(relative) = pending.pop() {
        let mut entries = tokio::fs::read_dir(root.join(&relative)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let child = relative.join(entry.file_name());
            let parts: Vec<String> = child
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            if entry.file_type().await?.is_dir() {
                dirs.push(parts.join("/"));
                pending.push(child);
            } else {
                files.push(parts.join("/"));
            }
        }
    }

    dirs.sort();
    files.sort();
    Ok((dirs, files))
}
