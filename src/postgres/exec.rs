//! Command execution inside member pods
//!
//! Bulk data (dumps, WAL segments) moves through the exec stream rather than a SQL
//! connection, so the operator never needs filesystem access to a member.

use bytes::Bytes;
use k8s_openapi::api::core::v1::Pod;
use kube::api::AttachParams;
use kube::{Api, Client};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::cluster::ports::{CollaboratorError, PortResult};

/// Container running the server in every member pod
pub const POSTGRES_CONTAINER: &str = "postgres";

/// Runs commands in one namespace's member pods
#[derive(Clone)]
pub struct PodExec {
    client: Client,
}

impl PodExec {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Run `command` in `pod`, optionally feeding `stdin`, and return its stdout.
    /// A non-success exit status is an error.
    pub async fn run(
        &self,
        namespace: &str,
        pod: &str,
        command: &[&str],
        stdin: Option<Bytes>,
    ) -> PortResult<Bytes> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams {
            container: Some(POSTGRES_CONTAINER.to_string()),
            stdin: stdin.is_some(),
            stdout: true,
            stderr: false,
            tty: false,
            ..Default::default()
        };
        let command_strings: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        let mut attached = pods.exec(pod, command_strings, &params).await?;

        if let Some(input) = stdin {
            let mut writer = attached.stdin().ok_or_else(|| {
                CollaboratorError::Unavailable(format!("no stdin on exec in {}", pod))
            })?;
            writer
                .write_all(&input)
                .await
                .map_err(|e| CollaboratorError::Unavailable(format!("writing to {}: {}", pod, e)))?;
            writer
                .shutdown()
                .await
                .map_err(|e| CollaboratorError::Unavailable(format!("closing stdin of {}: {}", pod, e)))?;
        }

        let mut reader = attached.stdout().ok_or_else(|| {
            CollaboratorError::Unavailable(format!("no stdout on exec in {}", pod))
        })?;
        let mut output = Vec::new();
        reader
            .read_to_end(&mut output)
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("reading from {}: {}", pod, e)))?;

        if let Some(status) = attached.take_status()
            && let Some(result) = status.await
            && let Some(status) = result.status
            && status != "Success"
        {
            debug!(pod, status = %status, "Command exited with non-success status");
            return Err(CollaboratorError::Rejected(format!(
                "{} in {}: {}",
                command.first().copied().unwrap_or_default(),
                pod,
                result.message.unwrap_or(status)
            )));
        }
        Ok(Bytes::from(output))
    }

    /// Run a shell snippet through `sh -c`
    pub async fn shell(
        &self,
        namespace: &str,
        pod: &str,
        script: &str,
        stdin: Option<Bytes>,
    ) -> PortResult<Bytes> {
        self.run(namespace, pod, &["sh", "-c", script], stdin).await
    }
}

/// Quote a value for interpolation into a `sh -c` script
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
