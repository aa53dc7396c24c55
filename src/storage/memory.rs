use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    BackendResolver, BlobStore, StorageError, StorageResult, dir_prefix, object_path,
};
use crate::crd::StorageBackend;

/// Blob store held in process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<BTreeMap<String, Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> StorageResult<MutexGuard<'_, BTreeMap<String, Bytes>>> {
        self.objects
            .lock()
            .map_err(|_| StorageError::Io("memory store lock poisoned".to_string()))
    }

    /// Total number of objects across all prefixes
    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite an object in place, bypassing framing; lets tests corrupt data
    pub fn tamper(&self, path: &str, data: Bytes) -> bool {
        match self.objects.lock() {
            Ok(mut objects) => match objects.get_mut(path) {
                Some(slot) => {
                    *slot = data;
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn put(&self, prefix: &str, key: &str, data: Bytes) -> StorageResult<()> {
        let path = object_path(prefix, key)?;
        self.objects()?.insert(path, data);
        Ok(())
    }

    async fn get(&self, prefix: &str, key: &str) -> StorageResult<Bytes> {
        let path = object_path(prefix, key)?;
        self.objects()?
            .get(&path)
            .cloned()
            .ok_or(StorageError::NotFound(path))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let dir = dir_prefix(prefix);
        Ok(self
            .objects()?
            .keys()
            .filter_map(|k| k.strip_prefix(dir.as_str()).map(String::from))
            .collect())
    }

    async fn delete(&self, prefix: &str, key: &str) -> StorageResult<()> {
        let path = object_path(prefix, key)?;
        self.objects()?.remove(&path);
        Ok(())
    }
}

/// Resolves backends to in-memory containers keyed by bucket/container name.
///
/// Unknown containers fail with [`StorageError::ContainerNotFound`], the same way a
/// missing cloud bucket does.
#[derive(Clone, Default)]
pub struct MemoryResolver {
    containers: Arc<Mutex<HashMap<String, MemoryStore>>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or return) the container with this name
    pub fn create_container(&self, name: &str) -> MemoryStore {
        match self.containers.lock() {
            Ok(mut containers) => containers.entry(name.to_string()).or_default().clone(),
            Err(_) => MemoryStore::new(),
        }
    }

    pub fn container(&self, name: &str) -> Option<MemoryStore> {
        self.containers
            .lock()
            .ok()
            .and_then(|c| c.get(name).cloned())
    }
}

#[async_trait]
impl BackendResolver for MemoryResolver {
    async fn open(
        &self,
        _namespace: &str,
        backend: &StorageBackend,
    ) -> StorageResult<Arc<dyn BlobStore>> {
        let name = backend
            .container()
            .ok_or_else(|| StorageError::Config("backend must set exactly one variant".into()))?;
        self.container(name)
            .map(|store| Arc::new(store) as Arc<dyn BlobStore>)
            .ok_or_else(|| StorageError::ContainerNotFound(name.to_string()))
    }
}
