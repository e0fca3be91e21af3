use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, instrument};
use uuid::Uuid;
use walkdir::WalkDir;

use parley_core::ids::ConversationId;

use crate::error::StoreError;

const PROBE_FILE: &str = ".parley-health-probe";

/// Outcome of a blob store health probe.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BlobHealth {
    pub healthy: bool,
    pub total_size: u64,
    pub file_count: u64,
    pub errors: Vec<String>,
}

/// Location and size of a stored blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoredBlob {
    /// Path relative to the store root.
    pub path: String,
    pub size: u64,
}

/// Attachment storage backend.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        conversation_id: &ConversationId,
        filename: &str,
        bytes: &[u8],
    ) -> Result<StoredBlob, StoreError>;

    async fn read(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    async fn delete(&self, path: &str) -> Result<bool, StoreError>;

    async fn check_health(&self) -> BlobHealth;
}

/// Blob store on the local filesystem, sharded by conversation id.
#[derive(Clone, Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create the root directory if needed and return a store rooted there.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| StoreError::Io(format!("create blob root {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, StoreError> {
        let candidate = Path::new(relative);
        let safe = candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || relative.is_empty() {
            return Err(StoreError::InvalidPath(relative.to_string()));
        }
        Ok(self.root.join(candidate))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    #[instrument(skip(self, bytes), fields(conversation_id = %conversation_id, size = bytes.len()))]
    async fn put(
        &self,
        conversation_id: &ConversationId,
        filename: &str,
        bytes: &[u8],
    ) -> Result<StoredBlob, StoreError> {
        let shard = sanitize_component(conversation_id.as_str());
        let name = format!("{}-{}", Uuid::now_v7().simple(), sanitize_component(filename));
        let relative = format!("{shard}/{name}");

        let dir = self.root.join(&shard);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&name), bytes).await?;

        debug!(path = %relative, "stored blob");
        Ok(StoredBlob {
            path: relative,
            size: bytes.len() as u64,
        })
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("blob {path}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, path: &str) -> Result<bool, StoreError> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn check_health(&self) -> BlobHealth {
        let root = self.root.clone();
        match tokio::task::spawn_blocking(move || probe(&root)).await {
            Ok(health) => health,
            Err(e) => BlobHealth {
                healthy: false,
                errors: vec![format!("health probe panicked: {e}")],
                ..Default::default()
            },
        }
    }
}

fn probe(root: &Path) -> BlobHealth {
    let mut health = BlobHealth::default();

    if !root.is_dir() {
        health
            .errors
            .push(format!("blob root {} is not a directory", root.display()));
        return health;
    }

    let probe_path = root.join(PROBE_FILE);
    if let Err(e) = std::fs::write(&probe_path, b"ok") {
        health.errors.push(format!("blob root not writable: {e}"));
    } else if let Err(e) = std::fs::remove_file(&probe_path) {
        health.errors.push(format!("probe cleanup failed: {e}"));
    }

    for entry in WalkDir::new(root) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => match entry.metadata() {
                Ok(meta) => {
                    health.file_count += 1;
                    health.total_size += meta.len();
                }
                Err(e) => health.errors.push(format!("metadata: {e}")),
            },
            Ok(_) => {}
            Err(e) => health.errors.push(format!("walk: {e}")),
        }
    }

    health.healthy = health.errors.is_empty();
    health
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::create(dir.path().join("blobs")).unwrap();
        let conv = ConversationId::from_raw("conv_1");

        let stored = store.put(&conv, "report.pdf", b"%PDF-1.7").await.unwrap();
        assert!(stored.path.starts_with("conv_1/"));
        assert!(stored.path.ends_with("-report.pdf"));
        assert_eq!(stored.size, 8);

        assert_eq!(store.read(&stored.path).await.unwrap(), b"%PDF-1.7");
        assert!(store.delete(&stored.path).await.unwrap());
        assert!(!store.delete(&stored.path).await.unwrap());
        assert!(matches!(
            store.read(&stored.path).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::create(dir.path()).unwrap();
        assert!(matches!(
            store.read("../etc/passwd").await,
            Err(StoreError::InvalidPath(_))
        ));
        assert!(matches!(
            store.delete("/etc/passwd").await,
            Err(StoreError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::create(dir.path()).unwrap();
        let conv = ConversationId::from_raw("conv_2");
        store.put(&conv, "a.txt", b"abc").await.unwrap();
        store.put(&conv, "b.txt", b"defgh").await.unwrap();

        let health = store.check_health().await;
        assert!(health.healthy, "errors: {:?}", health.errors);
        assert_eq!(health.file_count, 2);
        assert_eq!(health.total_size, 8);
    }

    #[tokio::test]
    async fn health_fails_when_root_removed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("gone");
        let store = FsBlobStore::create(&root).unwrap();
        std::fs::remove_dir_all(&root).unwrap();

        let health = store.check_health().await;
        assert!(!health.healthy);
        assert!(!health.errors.is_empty());
    }

    #[test]
    fn create_fails_when_root_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();
        assert!(FsBlobStore::create(&file).is_err());
    }

    #[test]
    fn sanitize_strips_separators() {
        assert_eq!(sanitize_component("../../secret"), "_.._secret");
        assert_eq!(sanitize_component("my file.txt"), "my_file.txt");
        assert_eq!(sanitize_component("..."), "file");
    }
}
