//! Service generation and endpoint routing
//!
//! Each cluster gets three services:
//!
//! - `{cluster}`: the write endpoint, selecting exactly one member by ordinal, or no
//!   member at all while writes are fenced
//! - `{cluster}-replicas`: the read endpoint, selecting members labelled as read targets
//! - `{cluster}-members`: headless, used for member-to-member DNS
//!
//! Routing only ever rewrites selectors and pod labels, so it is idempotent and safe to
//! repeat on every pass.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, Service, ServicePort, ServiceSpec as K8sServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::core::ObjectMeta;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::cluster::model::{ClusterKey, MemberId};
use crate::cluster::ports::PortResult;
use crate::crd::PostgresCluster;
use crate::resources::common::{
    CLUSTER_LABEL, FIELD_MANAGER, MEMBER_LABEL, POSTGRES_PORT, READ_TARGET_LABEL,
    cluster_selector, owner_reference, parse_member_label, standard_labels,
};

/// Selector value that matches no member
const NO_MEMBER: &str = "none";

pub fn write_service_name(cluster: &str) -> String {
    cluster.to_string()
}

pub fn read_service_name(cluster: &str) -> String {
    format!("{}-replicas", cluster)
}

pub fn members_service_name(cluster: &str) -> String {
    format!("{}-members", cluster)
}

fn postgres_port() -> ServicePort {
    ServicePort {
        port: POSTGRES_PORT,
        target_port: Some(IntOrString::Int(POSTGRES_PORT)),
        name: Some("postgresql".to_string()),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn base_service(
    cluster: &ClusterKey,
    name: String,
    selector: BTreeMap<String, String>,
    owner: Option<&PostgresCluster>,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(cluster.namespace.clone()),
            labels: Some(standard_labels(&cluster.name)),
            owner_references: owner.map(|c| vec![owner_reference(c)]),
            ..Default::default()
        },
        spec: Some(K8sServiceSpec {
            selector: Some(selector),
            ports: Some(vec![postgres_port()]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the write service pointing at `target`, or at nothing
pub fn generate_write_service(
    cluster: &ClusterKey,
    target: Option<MemberId>,
    owner: Option<&PostgresCluster>,
) -> Service {
    let member = target
        .map(|id| id.0.to_string())
        .unwrap_or_else(|| NO_MEMBER.to_string());
    let selector = BTreeMap::from([
        (CLUSTER_LABEL.to_string(), cluster.name.clone()),
        (MEMBER_LABEL.to_string(), member),
    ]);
    base_service(cluster, write_service_name(&cluster.name), selector, owner)
}

/// Generate the read service
pub fn generate_read_service(cluster: &ClusterKey, owner: Option<&PostgresCluster>) -> Service {
    let selector = BTreeMap::from([
        (CLUSTER_LABEL.to_string(), cluster.name.clone()),
        (READ_TARGET_LABEL.to_string(), "true".to_string()),
    ]);
    base_service(cluster, read_service_name(&cluster.name), selector, owner)
}

/// Generate the headless service for member discovery
///
/// Unready members are published so a standby can stream from an upstream that is
/// still starting.
pub fn generate_members_service(cluster: &ClusterKey, owner: Option<&PostgresCluster>) -> Service {
    let selector = BTreeMap::from([(CLUSTER_LABEL.to_string(), cluster.name.clone())]);
    let mut service = base_service(cluster, members_service_name(&cluster.name), selector, owner);
    if let Some(spec) = service.spec.as_mut() {
        spec.cluster_ip = Some("None".to_string());
        spec.publish_not_ready_addresses = Some(true);
    }
    service
}

/// Applies routing decisions to Services and pod labels
#[derive(Clone)]
pub struct ServiceRouter {
    client: Client,
}

impl ServiceRouter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn owner(&self, cluster: &ClusterKey) -> PortResult<Option<PostgresCluster>> {
        let api: Api<PostgresCluster> = Api::namespaced(self.client.clone(), &cluster.namespace);
        Ok(api.get_opt(&cluster.name).await?)
    }

    async fn apply(&self, cluster: &ClusterKey, service: &Service) -> PortResult<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &cluster.namespace);
        let name = service.name_any();
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(service),
        )
        .await?;
        Ok(())
    }

    pub async fn route_writes(
        &self,
        cluster: &ClusterKey,
        target: Option<MemberId>,
    ) -> PortResult<()> {
        let owner = self.owner(cluster).await?;
        self.apply(cluster, &generate_members_service(cluster, owner.as_ref()))
            .await?;
        self.apply(cluster, &generate_write_service(cluster, target, owner.as_ref()))
            .await?;
        debug!(cluster = %cluster, target = ?target, "Write endpoint routed");
        Ok(())
    }

    pub async fn route_reads(&self, cluster: &ClusterKey, targets: &[MemberId]) -> PortResult<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &cluster.namespace);
        let members = pods
            .list(&ListParams::default().labels(&cluster_selector(&cluster.name)))
            .await?;
        for pod in members.items {
            let Some(id) = parse_member_label(pod.labels()) else {
                continue;
            };
            let wanted = targets.contains(&id);
            let current = pod.labels().get(READ_TARGET_LABEL).map(String::as_str) == Some("true");
            if wanted == current {
                continue;
            }
            let value = if wanted { "true" } else { "false" };
            let patch = json!({
                "metadata": { "labels": { (READ_TARGET_LABEL): value } }
            });
            pods.patch(
                &pod.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        }

        let owner = self.owner(cluster).await?;
        self.apply(cluster, &generate_read_service(cluster, owner.as_ref()))
            .await?;
        debug!(cluster = %cluster, targets = ?targets, "Read endpoint routed");
        Ok(())
    }
}
