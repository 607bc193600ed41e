/// On-disk retention ledger.
///
/// One JSON file per (model, storage) pair holding the artifact history,
/// oldest first:
///
/// ```json
/// [{"file_key":"a.tar","created_at":"2024-05-01T02:00:00Z"},
///  {"file_key":"gen5","file_keys":["gen5/part1","gen5/part2"],"created_at":"..."}]
/// ```
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::{BackupError, Result};

/// One retained generation of a backup.
///
/// When `member_keys` is non-empty, `key` is the directory that encloses them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(rename = "file_key")]
    pub key: String,
    #[serde(
        rename = "file_keys",
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub member_keys: Vec<String>,
    pub created_at: DateTime<Utc>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Artifact {
    /// Every key that has to go for this artifact to be fully removed.
    ///
    /// Member keys come first, then the artifact's own key. For a composite
    /// artifact the own key gets a trailing `/` so the backend recurses.
    pub fn physical_keys(&self) -> Vec<String> {
        let mut keys = self.member_keys.clone();
        let mut own = self.key.clone();
        if !self.member_keys.is_empty() && !own.ends_with('/') {
            own.push('/');
        }
        keys.push(own);
        keys
    }
}

/// Persisted, ordered artifact history for one (model, storage) pair.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    artifacts: VecDeque<Artifact>,
    loaded: bool,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            artifacts: VecDeque::new(),
            loaded: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn artifacts(&self) -> &VecDeque<Artifact> {
        &self.artifacts
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Read the ledger, creating it as `[]` first if it does not exist.
    ///
    /// On error the ledger is left unloaded and in-memory history is empty.
    pub async fn load(&mut self) -> Result<()> {
        self.loaded = false;
        self.artifacts.clear();

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        match tokio::fs::metadata(&self.path).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tokio::fs::write(&self.path, b"[]").await?;
            }
            Err(e) => return Err(e.into()),
        }

        let bytes = tokio::fs::read(&self.path).await?;
        self.artifacts = serde_json::from_slice(&bytes).map_err(|e| {
            BackupError::Serialization(format!("{}: {e}", self.path.display()))
        })?;
        self.loaded = true;
        Ok(())
    }

    /// Read-only view of a ledger file. A missing file is an empty history.
    pub async fn read(path: &Path) -> Result<Vec<Artifact>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append a new artifact at the tail.
    ///
    /// `created_at` never goes below the previous tail's, even if the clock steps back.
    pub fn push(&mut self, key: &str, member_keys: Vec<String>) -> &Artifact {
        let mut created_at = Utc::now();
        if let Some(last) = self.artifacts.back() {
            created_at = created_at.max(last.created_at);
        }
        self.artifacts.push_back(Artifact {
            key: key.to_string(),
            member_keys,
            created_at,
        });
        &self.artifacts[self.artifacts.len() - 1]
    }

    /// Remove and return the oldest artifact while more than `keep` remain.
    pub fn pop_oldest_beyond(&mut self, keep: usize) -> Option<Artifact> {
        if self.artifacts.len() <= keep {
            return None;
        }
        self.artifacts.pop_front()
    }

    /// Write the ledger back. Returns `Ok(false)` without touching disk
    /// when the ledger was never loaded.
    pub async fn save(&self) -> Result<bool> {
        if !self.loaded {
            warn!(
                ledger = %self.path.display(),
                "Skip saving ledger because it was not loaded"
            );
            return Ok(false);
        }

        let data = serde_json::to_vec(&self.artifacts)?;
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, &data).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(true)
    }
}
