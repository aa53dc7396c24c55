//! Member pods and data volumes
//!
//! Every member is a bare Pod named `{cluster}-{ordinal}` with its own volume claim
//! `data-{cluster}-{ordinal}`. Members are not grouped in a StatefulSet because each one
//! is bootstrapped, rejoined and deleted individually by the engine.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar as K8sEnvVar, EnvVarSource, ExecAction,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod,
    PodSpec, Probe, SecretKeySelector, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::core::v1::EmptyDirVolumeSource;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use crate::cluster::model::{ClusterKey, MemberHealth, MemberId};
use crate::cluster::ports::{
    Bootstrap, CollaboratorError, ComputeRuntime, MemberObservation, MemberSpec, PortResult,
};
use crate::cluster::wait::{Check, WaitOutcome, poll_until};
use crate::crd::StandbyMode;
use crate::resources::common::{
    POSTGRES_PORT, cluster_selector, member_host, member_labels, parse_member_label,
};
use crate::resources::secret::PASSWORD_KEY;
use crate::resources::service::ServiceRouter;

/// Mount point of the data volume
pub const DATA_MOUNT: &str = "/var/lib/postgresql/data";

/// Data directory inside the volume
pub const PGDATA: &str = "/var/lib/postgresql/data/pgdata";

/// Completed segments copied out by `archive_command`, waiting for the archiver
pub const WAL_SPOOL: &str = "/var/lib/postgresql/data/wal-spool";

/// Archived segments placed here are picked up by `restore_command`
pub const RESTORE_SPOOL: &str = "/var/lib/postgresql/data/restore-spool";

pub const BOOTSTRAP_ANNOTATION: &str = "guardian.postgres.io/bootstrap";
pub const UPSTREAM_ANNOTATION: &str = "guardian.postgres.io/upstream";
pub const STANDBY_MODE_ANNOTATION: &str = "guardian.postgres.io/standby-mode";

/// Entry point wrapping the stock image: prepares the data directory for the requested
/// bootstrap before handing over to `docker-entrypoint.sh`
const BOOTSTRAP_SCRIPT: &str = r#"set -eu
mkdir -p "$GUARDIAN_WAL_SPOOL" "$GUARDIAN_RESTORE_SPOOL"
case "$GUARDIAN_BOOTSTRAP" in
  replica)
    if [ ! -s "$PGDATA/PG_VERSION" ]; then
      PGPASSWORD="$POSTGRES_PASSWORD" pg_basebackup -h "$GUARDIAN_UPSTREAM" -U postgres -D "$PGDATA" -X stream -R
    else
      PGPASSWORD="$POSTGRES_PASSWORD" pg_rewind -D "$PGDATA" --source-server="host=$GUARDIAN_UPSTREAM user=postgres" -R || true
      touch "$PGDATA/standby.signal"
    fi
    ;;
  archive-recovery)
    if [ ! -s "$PGDATA/PG_VERSION" ]; then
      initdb -D "$PGDATA" -U postgres >/dev/null
    fi
    touch "$PGDATA/standby.signal"
    ;;
esac
exec docker-entrypoint.sh "$@"
"#;

pub fn bootstrap_value(bootstrap: Bootstrap) -> &'static str {
    match bootstrap {
        Bootstrap::InitDb => "initdb",
        Bootstrap::Replica => "replica",
        Bootstrap::Existing => "existing",
        Bootstrap::ArchiveRecovery => "archive-recovery",
    }
}

fn standby_mode_value(mode: StandbyMode) -> &'static str {
    match mode {
        StandbyMode::Warm => "Warm",
        StandbyMode::Hot => "Hot",
    }
}

fn parse_standby_mode(value: &str) -> Option<StandbyMode> {
    match value {
        "Warm" => Some(StandbyMode::Warm),
        "Hot" => Some(StandbyMode::Hot),
        _ => None,
    }
}

/// Server settings the engine depends on; user parameters cannot override these
pub fn server_settings(spec: &MemberSpec) -> BTreeMap<String, String> {
    let mut settings = spec.postgresql_params.clone();
    let hot = if spec.standby_mode == StandbyMode::Hot {
        "on"
    } else {
        "off"
    };
    settings.insert("hot_standby".to_string(), hot.to_string());
    settings.insert("wal_level".to_string(), "replica".to_string());
    settings.insert("archive_mode".to_string(), "always".to_string());
    settings.insert(
        "archive_command".to_string(),
        format!("test ! -f {spool}/%f && cp %p {spool}/%f", spool = WAL_SPOOL),
    );
    settings.insert(
        "restore_command".to_string(),
        format!("cp {}/%f %p", RESTORE_SPOOL),
    );
    settings
}

/// Generate the data volume claim of a member
pub fn generate_member_pvc(cluster: &ClusterKey, spec: &MemberSpec) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(cluster.volume_name(spec.id)),
            namespace: Some(cluster.namespace.clone()),
            labels: Some(member_labels(cluster, spec.id)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: spec.storage.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(spec.storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the pod of a member
pub fn generate_member_pod(cluster: &ClusterKey, spec: &MemberSpec) -> Pod {
    let mut env = vec![
        K8sEnvVar {
            name: "POSTGRES_PASSWORD".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: spec.credentials_secret.clone(),
                    key: PASSWORD_KEY.to_string(),
                    optional: Some(false),
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        plain_env("PGDATA", PGDATA),
        plain_env("GUARDIAN_BOOTSTRAP", bootstrap_value(spec.bootstrap)),
        plain_env("GUARDIAN_WAL_SPOOL", WAL_SPOOL),
        plain_env("GUARDIAN_RESTORE_SPOOL", RESTORE_SPOOL),
    ];
    if let Some(upstream) = spec.upstream {
        env.push(plain_env("GUARDIAN_UPSTREAM", &member_host(cluster, upstream)));
    }
    env.extend(spec.env.iter().map(|e| plain_env(&e.name, &e.value)));

    let mut args = vec!["postgres".to_string()];
    for (key, value) in server_settings(spec) {
        args.push("-c".to_string());
        args.push(format!("{}={}", key, value));
    }

    let data_source = if spec.ephemeral {
        Volume {
            name: "data".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }
    } else {
        Volume {
            name: "data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: cluster.volume_name(spec.id),
                read_only: Some(false),
            }),
            ..Default::default()
        }
    };

    let mut annotations = BTreeMap::from([
        (
            BOOTSTRAP_ANNOTATION.to_string(),
            bootstrap_value(spec.bootstrap).to_string(),
        ),
        (
            STANDBY_MODE_ANNOTATION.to_string(),
            standby_mode_value(spec.standby_mode).to_string(),
        ),
    ]);
    if let Some(upstream) = spec.upstream {
        annotations.insert(UPSTREAM_ANNOTATION.to_string(), upstream.0.to_string());
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(cluster.member_name(spec.id)),
            namespace: Some(cluster.namespace.clone()),
            labels: Some(member_labels(cluster, spec.id)),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            hostname: Some(cluster.member_name(spec.id)),
            subdomain: Some(format!("{}-members", cluster.name)),
            restart_policy: Some("Always".to_string()),
            containers: vec![Container {
                name: "postgres".to_string(),
                image: Some(format!("postgres:{}", spec.version)),
                command: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    BOOTSTRAP_SCRIPT.to_string(),
                    "guardian-bootstrap".to_string(),
                ]),
                args: Some(args),
                env: Some(env),
                ports: Some(vec![ContainerPort {
                    container_port: POSTGRES_PORT,
                    name: Some("postgresql".to_string()),
                    ..Default::default()
                }]),
                readiness_probe: Some(Probe {
                    exec: Some(ExecAction {
                        command: Some(vec![
                            "pg_isready".to_string(),
                            "-U".to_string(),
                            "postgres".to_string(),
                        ]),
                    }),
                    period_seconds: Some(5),
                    failure_threshold: Some(3),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![VolumeMount {
                    name: "data".to_string(),
                    mount_path: DATA_MOUNT.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![data_source]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn plain_env(name: &str, value: &str) -> K8sEnvVar {
    K8sEnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Health of a member as far as Kubernetes can tell
pub fn pod_health(pod: &Pod) -> MemberHealth {
    if pod.metadata.deletion_timestamp.is_some() {
        return MemberHealth::Unreachable;
    }
    let Some(status) = &pod.status else {
        return MemberHealth::NotReady;
    };
    match status.phase.as_deref() {
        Some("Failed") | Some("Unknown") | Some("Succeeded") => MemberHealth::Unreachable,
        Some("Running") => {
            let ready = status
                .conditions
                .iter()
                .flatten()
                .any(|c| c.type_ == "Ready" && c.status == "True");
            if ready {
                MemberHealth::Ready
            } else {
                MemberHealth::NotReady
            }
        }
        _ => MemberHealth::NotReady,
    }
}

fn observe_pod(pod: &Pod) -> Option<MemberObservation> {
    let id = parse_member_label(pod.labels())?;
    let standby_mode = pod
        .annotations()
        .get(STANDBY_MODE_ANNOTATION)
        .and_then(|v| parse_standby_mode(v));
    Some(MemberObservation {
        id,
        health: pod_health(pod),
        standby_mode,
    })
}

fn ignore_status<T>(result: kube::Result<T>, code: u16) -> PortResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == code => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// [`ComputeRuntime`] backed by Pods, PersistentVolumeClaims and Services
#[derive(Clone)]
pub struct KubeComputeRuntime {
    client: Client,
    router: ServiceRouter,
    /// How long a replaced pod may take to disappear
    replace_timeout: Duration,
}

impl KubeComputeRuntime {
    pub fn new(client: Client) -> Self {
        Self {
            router: ServiceRouter::new(client.clone()),
            client,
            replace_timeout: Duration::from_secs(120),
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn wait_gone(&self, cluster: &ClusterKey, name: &str) -> PortResult<()> {
        let pods = self.pods(&cluster.namespace);
        let outcome = poll_until(self.replace_timeout, Duration::from_secs(1), || {
            let pods = pods.clone();
            async move {
                match pods.get_opt(name).await {
                    Ok(None) => Check::Done(()),
                    Ok(Some(_)) => Check::NotYet,
                    Err(e) => Check::Abort(e.to_string()),
                }
            }
        })
        .await;
        match outcome {
            WaitOutcome::Satisfied(()) => Ok(()),
            WaitOutcome::TimedOut => Err(CollaboratorError::Unavailable(format!(
                "pod {} still terminating",
                name
            ))),
            WaitOutcome::Failed(reason) => Err(CollaboratorError::Unavailable(reason)),
        }
    }

    /// Delete and recreate a member's pod on the same volume
    async fn replace_pod(&self, cluster: &ClusterKey, pod: Pod) -> PortResult<()> {
        let name = pod.name_any();
        let pods = self.pods(&cluster.namespace);
        ignore_status(pods.delete(&name, &DeleteParams::default()).await, 404)?;
        self.wait_gone(cluster, &name).await?;
        ignore_status(pods.create(&PostParams::default(), &pod).await, 409)
    }
}

#[async_trait]
impl ComputeRuntime for KubeComputeRuntime {
    async fn list_members(&self, cluster: &ClusterKey) -> PortResult<Vec<MemberObservation>> {
        let pods = self
            .pods(&cluster.namespace)
            .list(&ListParams::default().labels(&cluster_selector(&cluster.name)))
            .await?;
        let mut members: Vec<_> = pods.items.iter().filter_map(observe_pod).collect();
        members.sort_by_key(|m| m.id);
        Ok(members)
    }

    async fn create_member(&self, cluster: &ClusterKey, spec: &MemberSpec) -> PortResult<()> {
        if !spec.ephemeral {
            ignore_status(
                self.claims(&cluster.namespace)
                    .create(&PostParams::default(), &generate_member_pvc(cluster, spec))
                    .await,
                409,
            )?;
        }
        let pod = generate_member_pod(cluster, spec);
        info!(
            cluster = %cluster,
            member = %spec.id,
            bootstrap = bootstrap_value(spec.bootstrap),
            "Creating member"
        );
        ignore_status(
            self.pods(&cluster.namespace)
                .create(&PostParams::default(), &pod)
                .await,
            409,
        )
    }

    async fn delete_member(&self, cluster: &ClusterKey, id: MemberId) -> PortResult<()> {
        debug!(cluster = %cluster, member = %id, "Deleting member");
        ignore_status(
            self.pods(&cluster.namespace)
                .delete(&cluster.member_name(id), &DeleteParams::default())
                .await,
            404,
        )
    }

    async fn reconfigure_member(&self, cluster: &ClusterKey, spec: &MemberSpec) -> PortResult<()> {
        info!(cluster = %cluster, member = %spec.id, "Restarting member with new configuration");
        self.replace_pod(cluster, generate_member_pod(cluster, spec))
            .await
    }

    async fn rejoin_member(
        &self,
        cluster: &ClusterKey,
        id: MemberId,
        upstream: MemberId,
    ) -> PortResult<()> {
        let name = cluster.member_name(id);
        let Some(mut pod) = self.pods(&cluster.namespace).get_opt(&name).await? else {
            return Err(CollaboratorError::NotFound(format!("pod {}", name)));
        };
        info!(cluster = %cluster, member = %id, upstream = %upstream, "Rejoining member as standby");

        pod.metadata = ObjectMeta {
            name: pod.metadata.name.take(),
            namespace: pod.metadata.namespace.take(),
            labels: pod.metadata.labels.take(),
            annotations: pod.metadata.annotations.take(),
            ..Default::default()
        };
        pod.status = None;
        let annotations = pod.annotations_mut();
        annotations.insert(
            BOOTSTRAP_ANNOTATION.to_string(),
            bootstrap_value(Bootstrap::Replica).to_string(),
        );
        annotations.insert(UPSTREAM_ANNOTATION.to_string(), upstream.0.to_string());

        let host = member_host(cluster, upstream);
        if let Some(container) = pod
            .spec
            .as_mut()
            .and_then(|s| s.containers.iter_mut().find(|c| c.name == "postgres"))
        {
            let env = container.env.get_or_insert_with(Vec::new);
            env.retain(|e| e.name != "GUARDIAN_BOOTSTRAP" && e.name != "GUARDIAN_UPSTREAM");
            env.push(plain_env(
                "GUARDIAN_BOOTSTRAP",
                bootstrap_value(Bootstrap::Replica),
            ));
            env.push(plain_env("GUARDIAN_UPSTREAM", &host));
        }
        self.replace_pod(cluster, pod).await
    }

    async fn route_writes(&self, cluster: &ClusterKey, target: Option<MemberId>) -> PortResult<()> {
        self.router.route_writes(cluster, target).await
    }

    async fn route_reads(&self, cluster: &ClusterKey, targets: &[MemberId]) -> PortResult<()> {
        self.router.route_reads(cluster, targets).await
    }

    async fn list_volumes(&self, cluster: &ClusterKey) -> PortResult<Vec<String>> {
        let claims = self
            .claims(&cluster.namespace)
            .list(&ListParams::default().labels(&cluster_selector(&cluster.name)))
            .await?;
        let mut names: Vec<String> = claims
            .items
            .iter()
            .filter(|c| c.metadata.deletion_timestamp.is_none())
            .map(|c| c.name_any())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn delete_volumes(&self, cluster: &ClusterKey) -> PortResult<()> {
        info!(cluster = %cluster, "Deleting member volumes");
        self.claims(&cluster.namespace)
            .delete_collection(
                &DeleteParams::default(),
                &ListParams::default().labels(&cluster_selector(&cluster.name)),
            )
            .await?;
        Ok(())
    }
}
