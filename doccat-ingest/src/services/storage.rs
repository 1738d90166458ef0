//! Storage collaborator
//!
//! Byte-addressable object store keyed by opaque path strings. The pipeline
//! only needs `put`, `get` and `delete`; storage internals stay behind the
//! [`BlobStore`] trait.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Io(_))
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under `path`, returning the path actually used
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String, StorageError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Delete objects; missing paths are ignored
    async fn delete(&self, paths: &[String]) -> Result<(), StorageError>;
}

/// Filesystem-backed store rooted at a directory
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolve a relative object path, rejecting anything that escapes the root
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        if path.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, bytes).await?;
        tracing::debug!(path, "Stored object");
        Ok(path.to_string())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, paths: &[String]) -> Result<(), StorageError> {
        for path in paths {
            let full = self.resolve(path)?;
            match tokio::fs::remove_file(&full).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// In-memory store for tests and dry runs
///
/// Paths registered with [`MemoryBlobStore::fail_path`] return
/// `Unavailable` on `get`, for failure-injection tests.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    failing: Arc<RwLock<HashSet<String>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.objects.write().await.insert(path.into(), bytes.into());
    }

    pub async fn fail_path(&self, path: impl Into<String>) {
        self.failing.write().await.insert(path.into());
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.objects.read().await.contains_key(path)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        if path.is_empty() {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        self.objects.write().await.insert(path.to_string(), bytes);
        Ok(path.to_string())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        if self.failing.read().await.contains(path) {
            return Err(StorageError::Unavailable(format!("injected failure for {}", path)));
        }
        self.objects
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn delete(&self, paths: &[String]) -> Result<(), StorageError> {
        let mut objects = self.objects.write().await;
        for path in paths {
            objects.remove(path);
        }
        Ok(())
    }
}
