use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DeleteParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Api, Client};
use rand::Rng;
use tracing::info;

use crate::cluster::model::ClusterKey;
use crate::cluster::ports::{CollaboratorError, CredentialStore, PortResult};
use crate::resources::common::standard_labels;

/// Superuser created by the server image
pub const SUPERUSER: &str = "postgres";

/// Key holding the password inside the credentials secret
pub const PASSWORD_KEY: &str = "POSTGRES_PASSWORD";

/// Key holding the user name inside the credentials secret
pub const USER_KEY: &str = "POSTGRES_USER";

/// Name of the secret generated for a cluster without `databaseSecret`
pub fn credentials_secret_name(cluster: &str) -> String {
    format!("{}-auth", cluster)
}

/// Generate a secure random password
pub fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET.get(idx).copied().map(char::from).unwrap_or('x')
        })
        .collect()
}

/// Generate the credentials Secret. It carries no owner reference: credentials outlive
/// the cluster under Pause and Delete.
pub fn generate_credentials_secret(cluster: &ClusterKey) -> Secret {
    let string_data = BTreeMap::from([
        (USER_KEY.to_string(), SUPERUSER.to_string()),
        (PASSWORD_KEY.to_string(), generate_password(32)),
    ]);

    Secret {
        metadata: ObjectMeta {
            name: Some(credentials_secret_name(&cluster.name)),
            namespace: Some(cluster.namespace.clone()),
            labels: Some(standard_labels(&cluster.name)),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}

/// Read the superuser password out of a credentials secret
pub fn secret_password(secret: &Secret) -> Option<String> {
    if let Some(value) = secret.data.as_ref().and_then(|d| d.get(PASSWORD_KEY)) {
        return String::from_utf8(value.0.clone()).ok();
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(PASSWORD_KEY))
        .cloned()
}

/// Credentials kept as Kubernetes Secrets
#[derive(Clone)]
pub struct KubeCredentialStore {
    client: Client,
}

impl KubeCredentialStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl CredentialStore for KubeCredentialStore {
    async fn ensure(&self, cluster: &ClusterKey, existing: Option<&str>) -> PortResult<String> {
        let api = self.api(&cluster.namespace);
        if let Some(name) = existing {
            return match api.get_opt(name).await? {
                Some(_) => Ok(name.to_string()),
                None => Err(CollaboratorError::NotFound(format!(
                    "secret {}/{}",
                    cluster.namespace, name
                ))),
            };
        }

        let name = credentials_secret_name(&cluster.name);
        if api.get_opt(&name).await?.is_some() {
            return Ok(name);
        }
        match api
            .create(&PostParams::default(), &generate_credentials_secret(cluster))
            .await
        {
            Ok(_) => {
                info!(cluster = %cluster, secret = %name, "Generated credentials");
                Ok(name)
            }
            // Created concurrently
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(name),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, cluster: &ClusterKey, name: &str) -> PortResult<bool> {
        Ok(self.api(&cluster.namespace).get_opt(name).await?.is_some())
    }

    async fn delete(&self, cluster: &ClusterKey, name: &str) -> PortResult<()> {
        match self
            .api(&cluster.namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
