//! Keep-last-N retention for backup artifacts.
//!
//! Each (model, storage) pair owns one ledger file under the cycler
//! directory. A cycle:
//! 1. Loads the ledger (bootstrapping `[]` on first use)
//! 2. Appends the new artifact at the tail
//! 3. Persists, so the new artifact is recorded before anything is deleted
//! 4. Evicts from the head while more than `keep` artifacts remain,
//!    deleting every physical key through the storage backend
//! 5. Persists again
//!
//! Deletion failures are collected in the `CycleReport` and never abort
//! the cycle. `keep == 0` disables eviction.
pub mod ledger;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{BackupError, Result};
use crate::storage::StorageBackend;

pub use ledger::{Artifact, Ledger};

/// Stable ledger name for a (model, storage) pair.
///
/// Both parts are percent-encoded, which never yields `@`, so distinct
/// pairs always get distinct names.
pub fn ledger_name(model: &str, storage: &str) -> String {
    format!(
        "{}@{}",
        urlencoding::encode(model),
        urlencoding::encode(storage)
    )
}

/// Exclusive advisory lock on `<dir>/<name>.lock`, released when the file is dropped.
async fn lock_ledger_file(dir: &Path, name: &str) -> Result<std::fs::File> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{name}.lock"));
    let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.lock()?;
        Ok(file)
    })
    .await
    .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;
    Ok(file)
}

/// A physical key that could not be deleted during eviction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDelete {
    pub key: String,
    pub error: String,
}

/// What one `cycle` call did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// The artifact appended by this cycle.
    pub recorded: Option<Artifact>,
    /// Artifacts dropped from the ledger, oldest first.
    pub evicted: Vec<Artifact>,
    /// Physical keys deleted, in call order.
    pub deleted: Vec<String>,
    pub failed: Vec<FailedDelete>,
    /// Whether the final ledger state reached disk.
    pub persisted: bool,
    /// Ledger load/save problem, if any.
    pub ledger_error: Option<String>,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.persisted && self.ledger_error.is_none()
    }
}

/// Retention cycler bound to one ledger.
pub struct Cycler {
    name: String,
    ledger: Ledger,
}

impl Cycler {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ledger: Ledger::new(dir.join(format!("{name}.json"))),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Record `file_key` and evict the oldest artifacts beyond `keep`.
    ///
    /// `delete` is called once per physical key of every evicted artifact.
    pub async fn cycle<F, Fut>(
        &mut self,
        file_key: &str,
        member_keys: &[String],
        keep: usize,
        mut delete: F,
    ) -> CycleReport
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut report = CycleReport::default();

        if let Err(e) = self.ledger.load().await {
            error!(ledger = %self.name, error = %e, "Load ledger failed");
            report.ledger_error = Some(e.to_string());
        }

        let recorded = self.ledger.push(file_key, member_keys.to_vec()).clone();
        report.recorded = Some(recorded);
        report.persisted = self.persist(&mut report).await;

        if keep == 0 {
            return report;
        }
        if !self.ledger.is_loaded() {
            warn!(ledger = %self.name, "Skip eviction because ledger history is unknown");
            return report;
        }

        while let Some(artifact) = self.ledger.pop_oldest_beyond(keep) {
            for key in artifact.physical_keys() {
                match delete(key.clone()).await {
                    Ok(()) => {
                        info!(ledger = %self.name, key = %key, "Removed");
                        report.deleted.push(key);
                    }
                    Err(e) => {
                        warn!(ledger = %self.name, key = %key, error = %e, "Remove failed");
                        report.failed.push(FailedDelete {
                            key,
                            error: e.to_string(),
                        });
                    }
                }
            }
            report.evicted.push(artifact);
        }

        if !report.evicted.is_empty() {
            report.persisted = self.persist(&mut report).await;
        }
        report
    }

    async fn persist(&self, report: &mut CycleReport) -> bool {
        match self.ledger.save().await {
            Ok(saved) => saved,
            Err(e) => {
                error!(ledger = %self.name, error = %e, "Save ledger failed");
                report.ledger_error = Some(e.to_string());
                false
            }
        }
    }
}

/// Owns the cycler directory and serializes cycles per (model, storage),
/// within the process and across processes sharing the directory.
#[derive(Debug)]
pub struct CyclerRegistry {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CyclerRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ledger_path(&self, model: &str, storage: &str) -> PathBuf {
        self.dir.join(format!("{}.json", ledger_name(model, storage)))
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Run one cycle for the pair; at most one runs per pair at a time.
    pub async fn cycle<F, Fut>(
        &self,
        model: &str,
        storage: &str,
        file_key: &str,
        member_keys: &[String],
        keep: usize,
        delete: F,
    ) -> CycleReport
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let name = ledger_name(model, storage);
        let lock = self.lock_for(&name);
        let _guard = lock.lock().await;

        // Another process may be cycling the same pair.
        let _file_lock = match lock_ledger_file(&self.dir, &name).await {
            Ok(file) => file,
            Err(e) => {
                error!(ledger = %name, error = %e, "Lock ledger failed");
                return CycleReport {
                    ledger_error: Some(e.to_string()),
                    ..CycleReport::default()
                };
            }
        };

        Cycler::new(&self.dir, &name)
            .cycle(file_key, member_keys, keep, delete)
            .await
    }

    /// Cycle with deletions routed to `backend`.
    pub async fn cycle_with_backend(
        &self,
        model: &str,
        storage: &str,
        backend: &dyn StorageBackend,
        file_key: &str,
        member_keys: &[String],
        keep: usize,
    ) -> CycleReport {
        self.cycle(model, storage, file_key, member_keys, keep, move |key| async move {
            backend.delete(&key).await
        })
        .await
    }

    /// Current history of a pair, oldest first.
    pub async fn artifacts(&self, model: &str, storage: &str) -> Result<Vec<Artifact>> {
        Ledger::read(&self.ledger_path(model, storage)).await
    }
}
