//! Storage Backend Adapter
//!
//! A uniform put/get/list/delete surface over a blob container. The archiver and
//! snapshot engine only see [`BlobStore`]; which backend sits behind it is decided by
//! a [`BackendResolver`] from the [`StorageBackend`] in the cluster spec.
//!
//! Prefixes are directories: `list("a/b")` returns keys under `a/b/` only, never keys of
//! a sibling such as `a/b-2/`. Callers rely on this for per-record isolation.

pub mod layout;
mod local;
mod memory;
mod object;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::crd::StorageBackend;

pub use local::LocalStore;
pub use memory::{MemoryResolver, MemoryStore};
pub use object::{ObjectStoreBackend, ObjectStoreResolver, build_object_store};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("container does not exist: {0}")]
    ContainerNotFound(String),

    #[error("access denied: {0}")]
    Unauthorized(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("backend misconfigured: {0}")]
    Config(String),

    #[error("storage I/O error: {0}")]
    Io(String),
}

impl StorageError {
    /// I/O failures may succeed on retry; everything else needs a spec or credential change
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Io(_))
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, prefix: &str, key: &str, data: Bytes) -> StorageResult<()>;

    async fn get(&self, prefix: &str, key: &str) -> StorageResult<Bytes>;

    /// Keys below `prefix`, relative to it, sorted
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Deleting a missing key succeeds
    async fn delete(&self, prefix: &str, key: &str) -> StorageResult<()>;

    /// Delete every key below `prefix` and confirm nothing is left
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let keys = self.list(prefix).await?;
        for key in &keys {
            self.delete(prefix, key).await?;
        }
        let left = self.list(prefix).await?;
        if !left.is_empty() {
            return Err(StorageError::Io(format!(
                "{} objects remain under {} after delete",
                left.len(),
                prefix
            )));
        }
        Ok(keys.len())
    }
}

/// Opens the blob store described by a backend spec
#[async_trait]
pub trait BackendResolver: Send + Sync {
    async fn open(
        &self,
        namespace: &str,
        backend: &StorageBackend,
    ) -> StorageResult<Arc<dyn BlobStore>>;
}

/// Join a prefix and key, normalising slashes
pub fn object_path(prefix: &str, key: &str) -> StorageResult<String> {
    validate_key(key)?;
    let prefix = prefix.trim_matches('/');
    let key = key.trim_matches('/');
    Ok(if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", prefix, key)
    })
}

/// Directory form of a prefix: trimmed and ending in `/`, or empty for the root
pub fn dir_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

fn validate_key(key: &str) -> StorageResult<()> {
    let trimmed = key.trim_matches('/');
    if trimmed.is_empty() || trimmed.split('/').any(|part| part == ".." || part == ".") {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}
