/// S3-compatible object storage backend.
///
/// Works against AWS S3 and any gateway speaking the same API
/// (MinIO, Storj, Ceph RGW, ...). `PutObject` is atomic, so an upload is
/// either fully visible under its key or not at all.
///
/// Configuration:
/// - `bucket` (required)
/// - `access_key_id`, `secret_access_key` (required)
/// - `region` (default `us-east-1`)
/// - `endpoint` for non-AWS gateways; enables path-style addressing
/// - `path`: key prefix inside the bucket
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{BehaviorVersion, Builder as S3ConfigBuilder, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::Object;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use super::{collect_files, is_dir_key, join_key, FileItem, StorageBackend, StorageContext};
use crate::error::{BackupError, Result};

const DEFAULT_REGION: &str = "us-east-1";

fn s3_err(e: impl std::error::Error) -> BackupError {
    BackupError::storage("s3", DisplayErrorContext(e))
}

/// S3 storage backend.
pub struct S3Backend {
    ctx: StorageContext,
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3Backend {
    /// Create a new S3 backend from the storage settings.
    pub fn new(ctx: StorageContext) -> Result<Self> {
        let storage = &ctx.storage;
        let bucket = storage.require_str("bucket")?.to_string();
        let credentials = Credentials::new(
            storage.require_str("access_key_id")?,
            storage.require_str("secret_access_key")?,
            None,
            None,
            "backupd",
        );
        let region = storage.setting_str("region").unwrap_or(DEFAULT_REGION);

        let mut builder = S3ConfigBuilder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials);
        if let Some(endpoint) = storage.setting_str("endpoint") {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let prefix = storage
            .setting_str("path")
            .unwrap_or_default()
            .trim_matches('/')
            .to_string();

        Ok(Self {
            client: S3Client::from_conf(builder.build()),
            bucket,
            prefix,
            ctx,
        })
    }

    fn object_key(&self, key: &str) -> String {
        join_key(&self.prefix, key)
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path).await.map_err(s3_err)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(s3_err)?;
        Ok(())
    }

    /// All objects under `prefix`; with a delimiter only the immediate level.
    async fn list_objects(&self, prefix: &str, delimiter: Option<&str>) -> Result<Vec<Object>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(delimiter) = delimiter {
                request = request.delimiter(delimiter);
            }
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let resp = request.send().await.map_err(s3_err)?;
            objects.extend(resp.contents().iter().cloned());

            match resp.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(objects)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        // S3 answers 204 for keys that do not exist.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(s3_err)?;
        Ok(())
    }
}

/// The prefix `list(parent)` scans: the parent's key plus a trailing `/`.
fn list_prefix(object_key: &str) -> String {
    if object_key.is_empty() || object_key.ends_with('/') {
        object_key.to_string()
    } else {
        format!("{object_key}/")
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        "s3"
    }

    async fn open(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(s3_err)?;
        debug!(bucket = %self.bucket, "S3 bucket reachable");
        Ok(())
    }

    async fn close(&self) {
        debug!(bucket = %self.bucket, "S3 storage closed");
    }

    async fn upload(&self, file_key: &str) -> Result<()> {
        let source = &self.ctx.archive_path;
        let key = self.object_key(file_key);

        if tokio::fs::metadata(source).await?.is_dir() {
            for relative in collect_files(source).await? {
                self.put_file(&join_key(&key, &relative), &source.join(&relative))
                    .await?;
            }
        } else {
            self.put_file(&key, source).await?;
        }

        info!(
            model = %self.ctx.model,
            storage = %self.ctx.storage.name,
            bucket = %self.bucket,
            key = %key,
            "Store succeeded"
        );
        Ok(())
    }

    async fn download(&self, file_key: &str) -> Result<PathBuf> {
        if is_dir_key(file_key) || file_key.trim_matches('/').is_empty() {
            return Err(BackupError::storage(
                "s3",
                format!("cannot download directory key {file_key:?}"),
            ));
        }
        let key = self.object_key(file_key);
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(s3_err)?;

        let file_name = key.rsplit('/').next().unwrap_or("download").to_string();
        let dir = std::env::temp_dir()
            .join("backupd")
            .join(Uuid::now_v7().to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(file_name);

        let mut body = resp.body.into_async_read();
        let mut file = tokio::fs::File::create(&path).await?;
        tokio::io::copy(&mut body, &mut file).await?;

        info!(key = %key, path = %path.display(), "Downloaded");
        Ok(path)
    }

    async fn delete(&self, file_key: &str) -> Result<()> {
        if file_key.trim_matches('/').is_empty() {
            return Err(BackupError::storage("s3", "refusing to delete the storage root"));
        }
        let key = self.object_key(file_key);
        info!(bucket = %self.bucket, key = %key, "Deleting");

        if !is_dir_key(&key) {
            return self.delete_object(&key).await;
        }
        for object in self.list_objects(&key, None).await? {
            if let Some(child) = object.key() {
                self.delete_object(child).await?;
            }
        }
        Ok(())
    }

    async fn list(&self, parent: &str) -> Result<Vec<FileItem>> {
        let prefix = list_prefix(&self.object_key(parent));
        let items = self
            .list_objects(&prefix, Some("/"))
            .await?
            .iter()
            .filter_map(|object| {
                let name = object.key()?.strip_prefix(&prefix)?;
                if name.is_empty() || name.ends_with('/') {
                    return None;
                }
                let last_modified = object
                    .last_modified()
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
                    .unwrap_or_default();
                Some(FileItem {
                    filename: name.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified,
                })
            })
            .collect();
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn context(settings: &[(&str, &str)]) -> StorageContext {
        let settings = settings
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::from(*v)))
            .collect();
        StorageContext {
            model: "db".to_string(),
            work_dir: PathBuf::from("/srv/db"),
            archive_path: PathBuf::from("/tmp/archive.tar"),
            storage: StorageConfig {
                name: "offsite".to_string(),
                kind: "s3".to_string(),
                keep: 5,
                settings,
            },
        }
    }

    const CREDS: [(&str, &str); 3] = [
        ("bucket", "archive"),
        ("access_key_id", "AKIA"),
        ("secret_access_key", "secret"),
    ];

    #[tokio::test]
    async fn test_requires_bucket_and_credentials() {
        let err = S3Backend::new(context(&[("access_key_id", "a")])).err().unwrap();
        assert!(matches!(err, BackupError::Config(_)));

        let err = S3Backend::new(context(&[("bucket", "b")])).err().unwrap();
        assert!(matches!(err, BackupError::Config(_)));

        assert!(S3Backend::new(context(&CREDS)).is_ok());
    }

    #[tokio::test]
    async fn test_object_keys_carry_prefix() {
        let mut settings = CREDS.to_vec();
        settings.push(("path", "/mydb/"));
        settings.push(("endpoint", "http://127.0.0.1:9000"));
        let backend = S3Backend::new(context(&settings)).unwrap();

        assert_eq!(backend.object_key("2024/full.tar"), "mydb/2024/full.tar");
        assert_eq!(backend.object_key("gen5/"), "mydb/gen5/");

        let bare = S3Backend::new(context(&CREDS)).unwrap();
        assert_eq!(bare.object_key("a.tar"), "a.tar");
    }

    #[tokio::test]
    async fn test_download_rejects_directory_keys() {
        let mut settings = CREDS.to_vec();
        settings.push(("endpoint", "http://127.0.0.1:1"));
        let backend = S3Backend::new(context(&settings)).unwrap();

        for key in ["gen5/", "/", ""] {
            let err = backend.download(key).await.unwrap_err();
            assert!(
                matches!(&err, BackupError::Storage { message, .. } if message.contains("directory key")),
                "{key:?}: {err}"
            );
        }
    }

    #[test]
    fn test_list_prefix() {
        assert_eq!(list_prefix(""), "");
        assert_eq!(list_prefix("mydb/2024"), "mydb/2024/");
        assert_eq!(list_prefix("mydb/"), "mydb/");
    }
}
