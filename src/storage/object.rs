//! Cloud object stores (S3, GCS, Azure, Swift through its S3 API) and local
//! directories, resolved from a [`StorageBackend`] plus its credentials secret.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tracing::debug;

use super::{
    BackendResolver, BlobStore, LocalStore, StorageError, StorageResult, dir_prefix, object_path,
};
use crate::crd::{BackendKind, StorageBackend};

/// Credential keys read from the backend's storage secret
pub mod secret_keys {
    pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
    pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
    pub const GOOGLE_SERVICE_ACCOUNT_JSON_KEY: &str = "GOOGLE_SERVICE_ACCOUNT_JSON_KEY";
    pub const AZURE_ACCOUNT_NAME: &str = "AZURE_ACCOUNT_NAME";
    pub const AZURE_ACCOUNT_KEY: &str = "AZURE_ACCOUNT_KEY";
    pub const ST_USER: &str = "ST_USER";
    pub const ST_KEY: &str = "ST_KEY";
}

/// [`BlobStore`] over any `object_store` implementation
pub struct ObjectStoreBackend {
    inner: Arc<dyn ObjectStore>,
    container: String,
}

impl ObjectStoreBackend {
    pub fn new(inner: Arc<dyn ObjectStore>, container: impl Into<String>) -> Self {
        Self {
            inner,
            container: container.into(),
        }
    }

    /// Fails fast on a missing bucket or bad credentials
    async fn verify(&self) -> StorageResult<()> {
        self.inner
            .list_with_delimiter(None)
            .await
            .map(|_| ())
            .map_err(|e| map_error(&self.container, e))
    }
}

fn map_error(container: &str, err: object_store::Error) -> StorageError {
    match err {
        object_store::Error::NotFound { path, .. } => StorageError::NotFound(path),
        object_store::Error::PermissionDenied { path, .. }
        | object_store::Error::Unauthenticated { path, .. } => StorageError::Unauthorized(path),
        object_store::Error::InvalidPath { source } => StorageError::InvalidKey(source.to_string()),
        other => {
            let message = other.to_string();
            if message.contains("NoSuchBucket")
                || message.contains("ContainerNotFound")
                || message.contains("The specified bucket does not exist")
            {
                StorageError::ContainerNotFound(container.to_string())
            } else if message.contains("AccessDenied") || message.contains("InvalidAccessKeyId") {
                StorageError::Unauthorized(container.to_string())
            } else {
                StorageError::Io(message)
            }
        }
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBackend {
    async fn put(&self, prefix: &str, key: &str, data: Bytes) -> StorageResult<()> {
        let path = ObjectPath::from(object_path(prefix, key)?);
        self.inner
            .put(&path, PutPayload::from(data))
            .await
            .map(|_| ())
            .map_err(|e| map_error(&self.container, e))
    }

    async fn get(&self, prefix: &str, key: &str) -> StorageResult<Bytes> {
        let path = ObjectPath::from(object_path(prefix, key)?);
        let result = self
            .inner
            .get(&path)
            .await
            .map_err(|e| map_error(&self.container, e))?;
        result
            .bytes()
            .await
            .map_err(|e| map_error(&self.container, e))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let dir = dir_prefix(prefix);
        let listing_root = ObjectPath::from(dir.trim_end_matches('/'));
        let root = if dir.is_empty() {
            None
        } else {
            Some(&listing_root)
        };
        let metas: Vec<_> = self
            .inner
            .list(root)
            .try_collect()
            .await
            .map_err(|e| map_error(&self.container, e))?;
        let mut keys: Vec<String> = metas
            .into_iter()
            .filter_map(|m| {
                m.location
                    .as_ref()
                    .strip_prefix(dir.as_str())
                    .map(String::from)
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, prefix: &str, key: &str) -> StorageResult<()> {
        let path = ObjectPath::from(object_path(prefix, key)?);
        match self.inner.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_error(&self.container, e)),
        }
    }
}

/// Resolves backends against real storage, reading credentials from Kubernetes secrets
#[derive(Clone)]
pub struct ObjectStoreResolver {
    client: Client,
}

impl ObjectStoreResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn credentials(
        &self,
        namespace: &str,
        backend: &StorageBackend,
    ) -> StorageResult<BTreeMap<String, String>> {
        let Some(name) = backend.storage_secret_name.as_deref() else {
            return Ok(BTreeMap::new());
        };
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets.get(name).await.map_err(|e| match e {
            kube::Error::Api(ref api) if api.code == 404 => {
                StorageError::Config(format!("storage secret {} not found", name))
            }
            other => StorageError::Io(other.to_string()),
        })?;
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
            .collect())
    }
}

fn config_error(e: object_store::Error) -> StorageError {
    StorageError::Config(e.to_string())
}

/// Build the object store for a cloud backend from its spec and credentials
pub fn build_object_store(
    backend: &StorageBackend,
    creds: &BTreeMap<String, String>,
) -> StorageResult<ObjectStoreBackend> {
    let get = |k: &str| creds.get(k).cloned();
    let kind = backend
        .kind()
        .ok_or_else(|| StorageError::Config("backend must set exactly one variant".into()))?;

    let (store, container): (Arc<dyn ObjectStore>, String) = match kind {
        BackendKind::S3 => {
            let s3 = backend
                .s3
                .as_ref()
                .ok_or_else(|| StorageError::Config("missing s3 block".into()))?;
            let mut builder = AmazonS3Builder::new()
                .with_bucket_name(&s3.bucket)
                .with_region(s3.region.as_deref().unwrap_or("us-east-1"));
            if let Some(endpoint) = &s3.endpoint {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
            }
            if let (Some(id), Some(secret)) = (
                get(secret_keys::AWS_ACCESS_KEY_ID),
                get(secret_keys::AWS_SECRET_ACCESS_KEY),
            ) {
                builder = builder
                    .with_access_key_id(id)
                    .with_secret_access_key(secret);
            }
            (Arc::new(builder.build().map_err(config_error)?), s3.bucket.clone())
        }
        BackendKind::Swift => {
            let swift = backend
                .swift
                .as_ref()
                .ok_or_else(|| StorageError::Config("missing swift block".into()))?;
            let mut builder = AmazonS3Builder::new()
                .with_bucket_name(&swift.container)
                .with_endpoint(&swift.endpoint)
                .with_allow_http(swift.endpoint.starts_with("http://"))
                .with_virtual_hosted_style_request(false)
                .with_region("us-east-1");
            if let (Some(user), Some(key)) = (get(secret_keys::ST_USER), get(secret_keys::ST_KEY)) {
                builder = builder.with_access_key_id(user).with_secret_access_key(key);
            }
            (
                Arc::new(builder.build().map_err(config_error)?),
                swift.container.clone(),
            )
        }
        BackendKind::Gcs => {
            let gcs = backend
                .gcs
                .as_ref()
                .ok_or_else(|| StorageError::Config("missing gcs block".into()))?;
            let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(&gcs.bucket);
            if let Some(key) = get(secret_keys::GOOGLE_SERVICE_ACCOUNT_JSON_KEY) {
                builder = builder.with_service_account_key(key);
            }
            (Arc::new(builder.build().map_err(config_error)?), gcs.bucket.clone())
        }
        BackendKind::Azure => {
            let azure = backend
                .azure
                .as_ref()
                .ok_or_else(|| StorageError::Config("missing azure block".into()))?;
            let mut builder = MicrosoftAzureBuilder::new().with_container_name(&azure.container);
            if let Some(account) = get(secret_keys::AZURE_ACCOUNT_NAME) {
                builder = builder.with_account(account);
            }
            if let Some(key) = get(secret_keys::AZURE_ACCOUNT_KEY) {
                builder = builder.with_access_key(key);
            }
            (
                Arc::new(builder.build().map_err(config_error)?),
                azure.container.clone(),
            )
        }
        BackendKind::Local => {
            return Err(StorageError::Config(
                "local backends are opened as directories".into(),
            ));
        }
    };

    Ok(ObjectStoreBackend::new(store, container))
}

#[async_trait]
impl BackendResolver for ObjectStoreResolver {
    async fn open(
        &self,
        namespace: &str,
        backend: &StorageBackend,
    ) -> StorageResult<Arc<dyn BlobStore>> {
        if let Some(local) = &backend.local
            && backend.variant_count() == 1
        {
            let store = LocalStore::open(&local.mount_path).await?;
            return Ok(Arc::new(store));
        }

        let creds = self.credentials(namespace, backend).await?;
        let store = build_object_store(backend, &creds)?;
        store.verify().await?;
        debug!(
            kind = ?backend.kind(),
            container = backend.container().unwrap_or_default(),
            "Opened storage backend"
        );
        Ok(Arc::new(store))
    }
}
