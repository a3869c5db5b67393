use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use tdp_core::RawCapture;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object path {0:?}")]
    InvalidPath(String),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("object {path} already holds different content (stored sha256 {stored}, new {incoming})")]
    Conflict {
        path: String,
        stored: String,
        incoming: String,
    },
    #[error("encoding metadata for {path}: {source}")]
    Metadata {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    pub path: String,
    pub byte_size: usize,
    pub sha256: String,
    pub deduplicated: bool,
}

/// Opaque durable key/value blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        metadata: &BTreeMap<String, String>,
    ) -> Result<StorageLocation, StorageError>;
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Filesystem-backed blob store. Objects are immutable: an existing key is never rewritten,
/// and writing different bytes to it is a [`StorageError::Conflict`].
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn metadata_path(object_path: &Path) -> PathBuf {
        let mut name = object_path.as_os_str().to_owned();
        name.push(".meta.json");
        PathBuf::from(name)
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let clean = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

async fn write_atomically(target: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let io_err = |action: &'static str, path: &Path| {
        let path = path.display().to_string();
        move |source| StorageError::Io {
            action,
            path,
            source,
        }
    };

    let parent = target
        .parent()
        .ok_or_else(|| StorageError::InvalidPath(target.display().to_string()))?;
    fs::create_dir_all(parent)
        .await
        .map_err(io_err("creating directory", parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err("opening temp file", &temp_path))?;
    file.write_all(bytes)
        .await
        .map_err(io_err("writing temp file", &temp_path))?;
    file.flush()
        .await
        .map_err(io_err("flushing temp file", &temp_path))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err("renaming temp file onto", target)(err));
    }
    Ok(())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        metadata: &BTreeMap<String, String>,
    ) -> Result<StorageLocation, StorageError> {
        let absolute = self.resolve(path)?;
        let sha256 = sha256_hex(bytes);

        let exists = fs::try_exists(&absolute)
            .await
            .map_err(|source| StorageError::Io {
                action: "checking",
                path: absolute.display().to_string(),
                source,
            })?;
        if exists {
            let stored = fs::read(&absolute)
                .await
                .map_err(|source| StorageError::Io {
                    action: "reading",
                    path: absolute.display().to_string(),
                    source,
                })?;
            let stored = sha256_hex(&stored);
            if stored != sha256 {
                return Err(StorageError::Conflict {
                    path: path.to_string(),
                    stored,
                    incoming: sha256,
                });
            }
            return Ok(StorageLocation {
                path: path.to_string(),
                byte_size: bytes.len(),
                sha256,
                deduplicated: true,
            });
        }

        let meta_bytes =
            serde_json::to_vec_pretty(metadata).map_err(|source| StorageError::Metadata {
                path: path.to_string(),
                source,
            })?;
        // Payload last, so a visible object always has its sidecar.
        write_atomically(&Self::metadata_path(&absolute), &meta_bytes).await?;
        write_atomically(&absolute, bytes).await?;

        Ok(StorageLocation {
            path: path.to_string(),
            byte_size: bytes.len(),
            sha256,
            deduplicated: false,
        })
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` so an item id is a single safe path segment.
pub fn sanitize_object_segment(input: &str) -> String {
    let cleaned: String = input
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// `{prefix}/{YYYY}/{MM}/{DD}/{run_token}_{source_item_id}`, with `_r{attempt}` appended
/// for retries so every attempt that got a response has its own key.
pub fn raw_object_path(
    prefix: &str,
    fetched_at: DateTime<Utc>,
    run_token: &str,
    source_item_id: &str,
    attempt: u32,
) -> String {
    let mut path = format!(
        "{}/{}/{}_{}",
        prefix.trim_matches('/'),
        fetched_at.format("%Y/%m/%d"),
        sanitize_object_segment(run_token),
        sanitize_object_segment(source_item_id)
    );
    if attempt > 0 {
        path.push_str(&format!("_r{attempt}"));
    }
    path
}

/// Writes each raw capture once, with its provenance envelope, under a date-partitioned key.
#[derive(Clone)]
pub struct RawArchiver {
    store: Arc<dyn BlobStore>,
    prefix: String,
    run_id: Uuid,
    run_token: String,
}

impl RawArchiver {
    pub fn new(
        store: Arc<dyn BlobStore>,
        prefix: impl Into<String>,
        run_id: Uuid,
        run_token: impl Into<String>,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            run_id,
            run_token: run_token.into(),
        }
    }

    pub fn path_for(&self, capture: &RawCapture) -> String {
        raw_object_path(
            &self.prefix,
            capture.fetched_at,
            &self.run_token,
            &capture.source_item_id,
            capture.attempt,
        )
    }

    pub fn envelope(&self, capture: &RawCapture) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("source_item_id".to_string(), capture.source_item_id.clone()),
            (
                "fetched_at".to_string(),
                capture
                    .fetched_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            ("pipeline_run_id".to_string(), self.run_id.to_string()),
            ("content_type".to_string(), capture.content_type.clone()),
            ("source_url".to_string(), capture.source_url.clone()),
            ("http_status".to_string(), capture.http_status.to_string()),
            ("attempt".to_string(), capture.attempt.to_string()),
            ("sha256".to_string(), sha256_hex(&capture.payload)),
        ])
    }

    pub async fn archive(&self, capture: &RawCapture) -> Result<StorageLocation, StorageError> {
        let path = self.path_for(capture);
        let location = self
            .store
            .put(&path, &capture.payload, &self.envelope(capture))
            .await?;
        tracing::debug!(
            source_item_id = %capture.source_item_id,
            path = %location.path,
            bytes = location.byte_size,
            "archived raw capture"
        );
        Ok(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn capture(id: &str, body: &[u8]) -> RawCapture {
        RawCapture {
            source_item_id: id.to_string(),
            source_url: format!("https://en.wikipedia.org/wiki/{id}"),
            fetched_at: DateTime::parse_from_rfc3339("2024-05-01T08:30:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            http_status: 200,
            content_type: "text/html".to_string(),
            payload: body.to_vec(),
            attempt: 0,
        }
    }

    #[test]
    fn payload_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn object_path_is_date_partitioned_and_sanitized() {
        let cap = capture("New York City", b"");
        let path = raw_object_path("raw/wiki", cap.fetched_at, "20240501_083000_ab12cd34", &cap.source_item_id, 0);
        assert_eq!(path, "raw/wiki/2024/05/01/20240501_083000_ab12cd34_New_York_City");
        let retry = raw_object_path("raw/wiki", cap.fetched_at, "20240501_083000_ab12cd34", &cap.source_item_id, 2);
        assert_eq!(retry, "raw/wiki/2024/05/01/20240501_083000_ab12cd34_New_York_City_r2");
        assert_eq!(sanitize_object_segment("London|UK"), "London_UK");
        assert_eq!(sanitize_object_segment("../etc"), "_etc");
    }

    #[tokio::test]
    async fn archive_writes_payload_and_envelope_once() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(FsBlobStore::new(dir.path()));
        let run_id = Uuid::new_v4();
        let archiver = RawArchiver::new(store, "raw/wiki", run_id, "20240501_083000_ab12cd34");
        let cap = capture("Paris", b"<html>paris</html>");

        let first = archiver.archive(&cap).await.expect("first archive");
        let second = archiver.archive(&cap).await.expect("second archive");
        assert!(!first.deduplicated);
        assert!(second.deduplicated);

        let object = dir.path().join(&first.path);
        assert_eq!(std::fs::read(&object).expect("payload"), b"<html>paris</html>");
        let meta: BTreeMap<String, String> = serde_json::from_slice(
            &std::fs::read(FsBlobStore::metadata_path(&object)).expect("sidecar"),
        )
        .expect("meta json");
        assert_eq!(meta["source_item_id"], "Paris");
        assert_eq!(meta["pipeline_run_id"], run_id.to_string());
        assert_eq!(meta["fetched_at"], "2024-05-01T08:30:00.000Z");
        assert_eq!(meta["sha256"], first.sha256);
    }

    #[tokio::test]
    async fn concurrent_runs_use_distinct_keys() {
        let dir = tempdir().expect("tempdir");
        let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(dir.path()));
        let a = RawArchiver::new(store.clone(), "raw/wiki", Uuid::new_v4(), "run_a");
        let b = RawArchiver::new(store, "raw/wiki", Uuid::new_v4(), "run_b");
        let cap = capture("Rome", b"x");
        let la = a.archive(&cap).await.expect("a");
        let lb = b.archive(&cap).await.expect("b");
        assert_ne!(la.path, lb.path);
        assert!(!lb.deduplicated);
    }

    #[tokio::test]
    async fn each_attempt_of_an_item_is_archived_separately() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(FsBlobStore::new(dir.path()));
        let archiver = RawArchiver::new(store, "raw/wiki", Uuid::new_v4(), "20240501_083000_ab12cd34");
        let mut unavailable = capture("Paris", b"service unavailable");
        unavailable.http_status = 503;
        let mut ok = capture("Paris", b"<html>paris</html>");
        ok.attempt = 1;

        let first = archiver.archive(&unavailable).await.expect("503 capture");
        let second = archiver.archive(&ok).await.expect("200 capture");
        assert_ne!(first.path, second.path);
        assert!(!second.deduplicated);
        assert_eq!(std::fs::read(dir.path().join(&first.path)).expect("503 body"), b"service unavailable");
        assert_eq!(std::fs::read(dir.path().join(&second.path)).expect("200 body"), b"<html>paris</html>");
    }

    #[tokio::test]
    async fn different_bytes_under_an_existing_key_conflict() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        store
            .put("raw/wiki/a", b"first", &BTreeMap::new())
            .await
            .expect("first put");

        let err = store
            .put("raw/wiki/a", b"second", &BTreeMap::new())
            .await
            .expect_err("must conflict");
        assert!(matches!(err, StorageError::Conflict { .. }));
        assert_eq!(std::fs::read(dir.path().join("raw/wiki/a")).expect("object"), b"first");
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        let err = store
            .put("../outside", b"x", &BTreeMap::new())
            .await
            .expect_err("must reject");
        assert!(matches!(err, StorageError::InvalidPath(_)));
    }
}
