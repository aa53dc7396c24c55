//! Storage backend selection shared by archiver, schedule, snapshot and init specs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Where blobs live. Exactly one of the variant fields must be set.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageBackend {
    /// Secret holding credentials for the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_secret_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalBackendSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3BackendSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<BucketBackendSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureBackendSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swift: Option<SwiftBackendSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalBackendSpec {
    /// Directory the repository is mounted at
    pub mount_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3BackendSpec {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BucketBackendSpec {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureBackendSpec {
    pub container: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SwiftBackendSpec {
    pub container: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// S3-compatible endpoint of the Swift deployment
    pub endpoint: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Local,
    S3,
    Gcs,
    Azure,
    Swift,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::S3 => write!(f, "s3"),
            BackendKind::Gcs => write!(f, "gcs"),
            BackendKind::Azure => write!(f, "azure"),
            BackendKind::Swift => write!(f, "swift"),
        }
    }
}

impl StorageBackend {
    /// Number of variant fields that are set
    pub fn variant_count(&self) -> usize {
        [
            self.local.is_some(),
            self.s3.is_some(),
            self.gcs.is_some(),
            self.azure.is_some(),
            self.swift.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }

    /// The selected variant, if exactly one is set
    pub fn kind(&self) -> Option<BackendKind> {
        if self.variant_count() != 1 {
            return None;
        }
        if self.local.is_some() {
            Some(BackendKind::Local)
        } else if self.s3.is_some() {
            Some(BackendKind::S3)
        } else if self.gcs.is_some() {
            Some(BackendKind::Gcs)
        } else if self.azure.is_some() {
            Some(BackendKind::Azure)
        } else {
            Some(BackendKind::Swift)
        }
    }

    /// Bucket, container or directory name
    pub fn container(&self) -> Option<&str> {
        match self.kind()? {
            BackendKind::Local => self.local.as_ref().map(|l| l.mount_path.as_str()),
            BackendKind::S3 => self.s3.as_ref().map(|s| s.bucket.as_str()),
            BackendKind::Gcs => self.gcs.as_ref().map(|g| g.bucket.as_str()),
            BackendKind::Azure => self.azure.as_ref().map(|a| a.container.as_str()),
            BackendKind::Swift => self.swift.as_ref().map(|s| s.container.as_str()),
        }
    }

    /// Key prefix configured inside the container, without surrounding slashes
    pub fn prefix(&self) -> &str {
        let raw = match self.kind() {
            Some(BackendKind::Local) => self.local.as_ref().and_then(|l| l.sub_path.as_deref()),
            Some(BackendKind::S3) => self.s3.as_ref().and_then(|s| s.prefix.as_deref()),
            Some(BackendKind::Gcs) => self.gcs.as_ref().and_then(|g| g.prefix.as_deref()),
            Some(BackendKind::Azure) => self.azure.as_ref().and_then(|a| a.prefix.as_deref()),
            Some(BackendKind::Swift) => self.swift.as_ref().and_then(|s| s.prefix.as_deref()),
            None => None,
        };
        raw.unwrap_or("").trim_matches('/')
    }

    /// Human-readable location of a key, e.g. `s3://bucket/path`
    pub fn location(&self, key: &str) -> String {
        let scheme = match self.kind() {
            Some(BackendKind::Local) => "file",
            Some(BackendKind::S3) => "s3",
            Some(BackendKind::Gcs) => "gs",
            Some(BackendKind::Azure) => "azure",
            Some(BackendKind::Swift) => "swift",
            None => "unknown",
        };
        format!(
            "{}://{}/{}",
            scheme,
            self.container().unwrap_or("").trim_end_matches('/'),
            key.trim_start_matches('/')
        )
    }

    pub fn local(mount_path: impl Into<String>) -> Self {
        Self {
            local: Some(LocalBackendSpec {
                mount_path: mount_path.into(),
                sub_path: None,
            }),
            ..Default::default()
        }
    }

    pub fn s3(bucket: impl Into<String>, prefix: Option<&str>) -> Self {
        Self {
            s3: Some(S3BackendSpec {
                bucket: bucket.into(),
                prefix: prefix.map(String::from),
                endpoint: None,
                region: None,
            }),
            ..Default::default()
        }
    }
}
