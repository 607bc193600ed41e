/// Local filesystem storage backend.
///
/// The reference implementation of the storage contract. Archives are
/// copied under a root directory, keyed by their `/`-separated file key.
///
/// Configuration:
/// - `path`: root directory; relative paths resolve against the model's `work_dir`
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use super::{collect_tree, is_dir_key, FileItem, StorageBackend, StorageContext};
use crate::error::{BackupError, Result};

/// Local storage backend.
pub struct LocalBackend {
    ctx: StorageContext,
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(ctx: StorageContext) -> Result<Self> {
        let root = ctx.resolve_path(ctx.storage.require_str("path")?);
        Ok(Self { ctx, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto the filesystem, refusing anything that would escape the root.
    fn target(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(BackupError::storage(
                "local",
                format!("key {key:?} escapes the storage root"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

/// Hidden sibling of `target` used while a copy is in progress.
fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.{}.partial", Uuid::now_v7()))
}

/// Copy one file, keeping its permissions and modification time.
///
/// The mode is applied last so read-only sources still copy.
async fn copy_preserving(source: &Path, target: &Path) -> Result<()> {
    let meta = tokio::fs::metadata(source).await?;

    let mut reader = tokio::fs::File::open(source).await?;
    let mut writer = tokio::fs::File::create(target).await?;
    tokio::io::copy(&mut reader, &mut writer).await?;
    writer.sync_all().await?;

    let file = writer.into_std().await;
    file.set_modified(meta.modified()?)?;
    drop(file);

    tokio::fs::set_permissions(target, meta.permissions()).await?;
    Ok(())
}

/// Give `target` the mode and modification time of the directory `source`.
async fn copy_dir_metadata(source: &Path, target: &Path) -> Result<()> {
    let meta = tokio::fs::metadata(source).await?;
    let dir = tokio::fs::File::open(target).await?.into_std().await;
    dir.set_modified(meta.modified()?)?;
    drop(dir);
    tokio::fs::set_permissions(target, meta.permissions()).await?;
    Ok(())
}

/// Copy a directory tree into a fresh directory at `target`.
async fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    let (dirs, files) = collect_tree(source).await?;

    tokio::fs::create_dir_all(target).await?;
    for relative in &dirs {
        tokio::fs::create_dir_all(target.join(relative)).await?;
    }
    for relative in &files {
        copy_preserving(&source.join(relative), &target.join(relative)).await?;
    }

    // Children before parents: writing into a directory bumps its mtime,
    // and a read-only mode would block the writes.
    for relative in dirs.iter().rev() {
        copy_dir_metadata(&source.join(relative), &target.join(relative)).await?;
    }
    copy_dir_metadata(source, target).await
}

async fn remove_any(path: &Path) -> std::io::Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn open(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            BackupError::storage(
                "local",
                format!("cannot create root {}: {e}", self.root.display()),
            )
        })
    }

    async fn close(&self) {
        debug!(root = %self.root.display(), "Local storage closed");
    }

    async fn upload(&self, file_key: &str) -> Result<()> {
        let source = &self.ctx.archive_path;
        let target = self.target(file_key)?;
        if target == self.root {
            return Err(BackupError::storage("local", "cannot upload to an empty key"));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let staging = partial_path(&target);
        let copied = if tokio::fs::metadata(source).await?.is_dir() {
            copy_tree(source, &staging).await
        } else {
            copy_preserving(source, &staging).await
        };
        if let Err(e) = copied {
            let _ = remove_any(&staging).await;
            return Err(e);
        }

        // rename(2) will not replace a non-empty directory.
        if tokio::fs::metadata(&target).await.is_ok_and(|m| m.is_dir()) {
            tokio::fs::remove_dir_all(&target).await?;
        }
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = remove_any(&staging).await;
            return Err(e.into());
        }

        info!(
            model = %self.ctx.model,
            storage = %self.ctx.storage.name,
            target = %target.display(),
            "Store succeeded"
        );
        Ok(())
    }

    async fn download(&self, _file_key: &str) -> Result<PathBuf> {
        Err(BackupError::Unsupported {
            backend: "local",
            operation: "download",
        })
    }

    async fn delete(&self, file_key: &str) -> Result<()> {
        let target = self.target(file_key)?;
        if target == self.root {
            return Err(BackupError::storage("local", "refusing to delete the storage root"));
        }
        info!(target = %target.display(), recursive = is_dir_key(file_key), "Deleting");

        match remove_any(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(target = %target.display(), "Already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, parent: &str) -> Result<Vec<FileItem>> {
        let dir = self.target(parent)?;
        let mut items = Vec::new();

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                continue;
            }
            items.push(FileItem {
                filename: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                last_modified: DateTime::<Utc>::from(meta.modified()?),
            });
        }

        items.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(items)
    }
}
