use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use super::{BlobStore, StorageError, StorageResult, dir_prefix, object_path};

/// Blob store on a mounted directory
#[derive(Clone, Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// The directory must already exist, like a cloud bucket must
    pub async fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => Ok(Self { root }),
            Ok(_) => Err(StorageError::Config(format!(
                "{} is not a directory",
                root.display()
            ))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::ContainerNotFound(root.display().to_string()))
            }
            Err(e) => Err(io_error(&root, e)),
        }
    }

    fn path(&self, prefix: &str, key: &str) -> StorageResult<PathBuf> {
        Ok(self.root.join(object_path(prefix, key)?))
    }
}

fn io_error(path: &Path, e: std::io::Error) -> StorageError {
    match e.kind() {
        ErrorKind::NotFound => StorageError::NotFound(path.display().to_string()),
        ErrorKind::PermissionDenied => StorageError::Unauthorized(path.display().to_string()),
        _ => StorageError::Io(format!("{}: {}", path.display(), e)),
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn put(&self, prefix: &str, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.path(prefix, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        // Write then rename so readers never see a partial object
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))
    }

    async fn get(&self, prefix: &str, key: &str) -> StorageResult<Bytes> {
        let path = self.path(prefix, key)?;
        tokio::fs::read(&path)
            .await
            .map(Bytes::from)
            .map_err(|e| io_error(&path, e))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let dir = dir_prefix(prefix);
        let base = self.root.join(&dir);
        let mut keys = Vec::new();
        let mut pending = vec![base.clone()];

        while let Some(current) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&current, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error(&current, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| io_error(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&base) {
                    let rel = rel.to_string_lossy().replace('\\', "/");
                    if !rel.ends_with(".partial") {
                        keys.push(rel);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, prefix: &str, key: &str) -> StorageResult<()> {
        let path = self.path(prefix, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}
