/// Backup pipeline orchestrator.
///
/// Takes the finished local archive of a model run and, for every storage
/// configured on the model (concurrently):
/// 1. Builds the backend and opens it
/// 2. Uploads the archive under the run's file key
/// 3. Records the artifact in that storage's retention ledger and evicts
///    generations beyond `keep`, deleting through the same backend
/// 4. Closes the backend
///
/// Compression, encryption and splitting happen before this point; the
/// pipeline only sees the resulting archive (a file, or a directory of parts).
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{error, info};

use crate::config::{Config, ModelConfig, StorageConfig};
use crate::cycler::{CycleReport, CyclerRegistry};
use crate::error::{BackupError, Result};
use crate::storage::{collect_files, join_key, new_backend, with_storage, FileItem, StorageContext};

/// One run of a model: what to upload and under which key.
#[derive(Debug, Clone)]
pub struct BackupRun {
    pub model: String,
    pub archive_path: PathBuf,
    pub file_key: String,
    /// Non-empty when the archive is a directory; one key per contained file.
    pub member_keys: Vec<String>,
}

impl BackupRun {
    /// Describe a run with an explicit file key.
    pub async fn new(model: &str, archive_path: impl Into<PathBuf>, file_key: &str) -> Result<Self> {
        let archive_path = archive_path.into();
        let file_key = file_key.trim_matches('/').to_string();
        if file_key.is_empty() {
            return Err(BackupError::Config("file key must not be empty".to_string()));
        }

        let member_keys = if tokio::fs::metadata(&archive_path).await?.is_dir() {
            collect_files(&archive_path)
                .await?
                .iter()
                .map(|relative| join_key(&file_key, relative))
                .collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            model: model.to_string(),
            archive_path,
            file_key,
            member_keys,
        })
    }

    /// Describe a run keyed by `now` and the archive's file name.
    pub async fn at(model: &str, archive_path: impl Into<PathBuf>, now: DateTime<Utc>) -> Result<Self> {
        let archive_path = archive_path.into();
        let file_key = file_key_for(&archive_path, now)?;
        Self::new(model, archive_path, &file_key).await
    }
}

/// `YYYY.MM.DD.HH.MM.SS-<archive file name>`.
pub fn file_key_for(archive_path: &Path, now: DateTime<Utc>) -> Result<String> {
    let name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            BackupError::Config(format!(
                "archive path {} has no file name",
                archive_path.display()
            ))
        })?;
    Ok(format!("{}-{name}", now.format("%Y.%m.%d.%H.%M.%S")))
}

/// Result for a single storage of a run.
#[derive(Debug)]
pub struct StorageOutcome {
    pub storage: String,
    pub kind: String,
    /// `Err` when the backend could not be built, opened, or uploaded to.
    pub result: Result<CycleReport>,
}

/// Result of a completed pipeline run.
#[derive(Debug)]
pub struct BackupResult {
    pub model: String,
    pub file_key: String,
    pub outcomes: Vec<StorageOutcome>,
}

impl BackupResult {
    /// Eviction problems do not count; only open/upload failures do.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn outcome(&self, storage: &str) -> Option<&StorageOutcome> {
        self.outcomes.iter().find(|o| o.storage == storage)
    }
}

/// Run the pipeline for `run` against every storage of its model.
pub async fn run_backup(config: &Config, registry: &CyclerRegistry, run: &BackupRun) -> Result<BackupResult> {
    let model = config.model(&run.model)?;
    if model.storages.is_empty() {
        return Err(BackupError::Config(format!(
            "model {} has no storages configured",
            model.name
        )));
    }

    info!(
        model = %model.name,
        file_key = %run.file_key,
        members = run.member_keys.len(),
        storages = model.storages.len(),
        "Starting backup pipeline"
    );

    let outcomes = join_all(
        model
            .storages
            .values()
            .map(|storage| run_storage(model, storage, registry, run)),
    )
    .await;

    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    info!(
        model = %model.name,
        succeeded = outcomes.len() - failed,
        failed,
        "Backup pipeline complete"
    );

    Ok(BackupResult {
        model: model.name.clone(),
        file_key: run.file_key.clone(),
        outcomes,
    })
}

async fn run_storage(
    model: &ModelConfig,
    storage: &StorageConfig,
    registry: &CyclerRegistry,
    run: &BackupRun,
) -> StorageOutcome {
    let result = store_and_cycle(model, storage, registry, run).await;
    match &result {
        Ok(report) if !report.is_clean() => {
            info!(
                model = %model.name,
                storage = %storage.name,
                failed_deletes = report.failed.len(),
                persisted = report.persisted,
                "Stored with retention warnings"
            );
        }
        Ok(_) => {}
        Err(e) => {
            error!(
                model = %model.name,
                storage = %storage.name,
                error = %e,
                "Storage run failed"
            );
        }
    }
    StorageOutcome {
        storage: storage.name.clone(),
        kind: storage.kind.clone(),
        result,
    }
}

async fn store_and_cycle(
    model: &ModelConfig,
    storage: &StorageConfig,
    registry: &CyclerRegistry,
    run: &BackupRun,
) -> Result<CycleReport> {
    let backend = new_backend(StorageContext::new(model, storage, &run.archive_path))?;

    with_storage(backend.as_ref(), |backend| async move {
        backend.upload(&run.file_key).await?;
        Ok(registry
            .cycle_with_backend(
                &model.name,
                &storage.name,
                backend,
                &run.file_key,
                &run.member_keys,
                storage.keep,
            )
            .await)
    })
    .await
}

/// List `parent` on one storage of a model.
pub async fn list_storage(config: &Config, model: &str, storage: &str, parent: &str) -> Result<Vec<FileItem>> {
    let model = config.model(model)?;
    let storage = model.storage(storage)?;
    let backend = new_backend(StorageContext::new(model, storage, PathBuf::new()))?;
    with_storage(backend.as_ref(), |backend| async move { backend.list(parent).await }).await
}

/// Fetch `file_key` from one storage of a model into a local temp path.
pub async fn download_from_storage(config: &Config, model: &str, storage: &str, file_key: &str) -> Result<PathBuf> {
    let model = config.model(model)?;
    let storage = model.storage(storage)?;
    let backend = new_backend(StorageContext::new(model, storage, PathBuf::new()))?;
    with_storage(backend.as_ref(), |backend| async move { backend.download(file_key).await }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        config: Config,
        registry: CyclerRegistry,
    }

    fn fixture(storages_yaml: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "data_dir: {}\nmodels:\n  db:\n    storages:\n{storages_yaml}",
            dir.path().join("state").display()
        );
        let config = Config::from_yaml_str(&yaml, dir.path()).unwrap();
        let registry = CyclerRegistry::new(config.cycler_dir());
        Fixture {
            dir,
            config,
            registry,
        }
    }

    const TWO_DISKS: &str = "      near:\n        type: local\n        keep: 2\n        path: near\n      far:\n        type: local\n        path: far\n";

    fn archive(fx: &Fixture, name: &str, body: &[u8]) -> PathBuf {
        let path = fx.dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn stored_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_run_uploads_and_cycles_each_storage() {
        let fx = fixture(TWO_DISKS);
        let archive = archive(&fx, "db.tar", b"dump");

        for key in ["g1.tar", "g2.tar", "g3.tar"] {
            let run = BackupRun::new("db", &archive, key).await.unwrap();
            let result = run_backup(&fx.config, &fx.registry, &run).await.unwrap();
            assert!(result.is_success());
            assert_eq!(result.outcomes.len(), 2);
        }

        assert_eq!(stored_names(&fx.dir.path().join("near")), vec!["g2.tar", "g3.tar"]);
        assert_eq!(
            stored_names(&fx.dir.path().join("far")),
            vec!["g1.tar", "g2.tar", "g3.tar"]
        );

        let near = fx.registry.artifacts("db", "near").await.unwrap();
        assert_eq!(near.len(), 2);
        let far = fx.registry.artifacts("db", "far").await.unwrap();
        assert_eq!(far.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_storage_does_not_block_others() {
        let fx = fixture(TWO_DISKS);
        // A regular file where the `near` root should be makes `open` fail.
        std::fs::write(fx.dir.path().join("near"), b"").unwrap();
        let archive = archive(&fx, "db.tar", b"dump");

        let run = BackupRun::new("db", &archive, "g1.tar").await.unwrap();
        let result = run_backup(&fx.config, &fx.registry, &run).await.unwrap();

        assert!(!result.is_success());
        assert!(result.outcome("near").unwrap().result.is_err());
        assert!(result.outcome("far").unwrap().result.is_ok());
        assert!(fx.registry.artifacts("db", "near").await.unwrap().is_empty());
        assert_eq!(fx.registry.artifacts("db", "far").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_directory_archive_is_composite() {
        let fx = fixture("      near:\n        type: local\n        keep: 1\n        path: near\n");
        let parts = fx.dir.path().join("parts");
        std::fs::create_dir_all(&parts).unwrap();
        std::fs::write(parts.join("db.tar.part1"), b"1").unwrap();
        std::fs::write(parts.join("db.tar.part2"), b"2").unwrap();

        let first = BackupRun::new("db", &parts, "gen5").await.unwrap();
        assert_eq!(first.member_keys, vec!["gen5/db.tar.part1", "gen5/db.tar.part2"]);
        run_backup(&fx.config, &fx.registry, &first).await.unwrap();
        assert!(fx.dir.path().join("near/gen5/db.tar.part2").is_file());

        let second = BackupRun::new("db", &parts, "gen6").await.unwrap();
        let result = run_backup(&fx.config, &fx.registry, &second).await.unwrap();

        let report = result.outcome("near").unwrap().result.as_ref().unwrap();
        assert_eq!(
            report.deleted,
            vec!["gen5/db.tar.part1", "gen5/db.tar.part2", "gen5/"]
        );
        assert!(report.failed.is_empty());
        assert_eq!(stored_names(&fx.dir.path().join("near")), vec!["gen6"]);
    }

    #[tokio::test]
    async fn test_list_and_download_helpers() {
        let fx = fixture(TWO_DISKS);
        let archive = archive(&fx, "db.tar", b"dump");
        let run = BackupRun::new("db", &archive, "2024/full.tar").await.unwrap();
        run_backup(&fx.config, &fx.registry, &run).await.unwrap();

        let items = list_storage(&fx.config, "db", "far", "2024").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].filename, "full.tar");
        assert_eq!(items[0].size, 4);

        let err = download_from_storage(&fx.config, "db", "far", "2024/full.tar")
            .await
            .unwrap_err();
        assert!(err.is_unsupported());
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let fx = fixture(TWO_DISKS);
        let archive = archive(&fx, "db.tar", b"dump");
        let run = BackupRun::new("nope", &archive, "k").await.unwrap();
        let err = run_backup(&fx.config, &fx.registry, &run).await.unwrap_err();
        assert!(matches!(err, BackupError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_timestamped_file_key() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T02:03:04Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            file_key_for(Path::new("/tmp/run/db.tar.gz"), now).unwrap(),
            "2024.05.01.02.03.04-db.tar.gz"
        );
        assert!(file_key_for(Path::new("/"), now).is_err());

        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("db.tar");
        std::fs::write(&archive, b"x").unwrap();
        let run = BackupRun::at("db", &archive, now).await.unwrap();
        assert_eq!(run.file_key, "2024.05.01.02.03.04-db.tar");
        assert!(run.member_keys.is_empty());
    }
}
