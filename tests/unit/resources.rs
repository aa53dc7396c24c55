//! Unit tests for Kubernetes resource generation

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};

use postgres_guardian::cluster::model::{ClusterKey, MemberHealth, MemberId, Timeline};
use postgres_guardian::cluster::ports::{Bootstrap, MemberSpec};
use postgres_guardian::crd::{
    DormantDatabase, DormantDatabaseSpec, DormantOrigin, RetentionTag, Snapshot, SnapshotPhase,
    SnapshotSpec, SnapshotStatus, StandbyMode, StorageSpec,
};
use postgres_guardian::postgres::client::member_from_host;
use postgres_guardian::postgres::exec::shell_quote;
use postgres_guardian::resources::catalog::{
    CREATED_AT_ANNOTATION, dormant_record, snapshot_record, snapshot_status,
};
use postgres_guardian::resources::common::{
    CLUSTER_LABEL, MEMBER_LABEL, READ_TARGET_LABEL, member_host, member_labels, owner_reference,
    parse_member_label, standard_labels,
};
use postgres_guardian::resources::member::{
    BOOTSTRAP_ANNOTATION, UPSTREAM_ANNOTATION, bootstrap_value, generate_member_pod,
    generate_member_pvc, pod_health, server_settings,
};
use postgres_guardian::resources::secret::{
    PASSWORD_KEY, credentials_secret_name, generate_credentials_secret, generate_password,
    secret_password,
};
use postgres_guardian::resources::service::{
    generate_members_service, generate_read_service, generate_write_service,
    members_service_name, read_service_name, write_service_name,
};

use crate::common::*;

fn key() -> ClusterKey {
    ClusterKey::new("demo", "pg")
}

fn member(id: u32, bootstrap: Bootstrap) -> MemberSpec {
    MemberSpec {
        id: MemberId(id),
        bootstrap,
        upstream: None,
        standby_mode: StandbyMode::Warm,
        version: "16".to_string(),
        storage: StorageSpec {
            storage_class: Some("fast".to_string()),
            size: "1Gi".to_string(),
        },
        ephemeral: false,
        postgresql_params: BTreeMap::new(),
        env: Vec::new(),
        credentials_secret: credentials_secret_name("pg"),
    }
}

fn container_args(pod: &Pod) -> Vec<String> {
    pod.spec.as_ref().unwrap().containers[0]
        .args
        .clone()
        .unwrap_or_default()
}

fn container_env(pod: &Pod, name: &str) -> Option<String> {
    pod.spec.as_ref().unwrap().containers[0]
        .env
        .as_ref()
        .unwrap()
        .iter()
        .find(|e| e.name == name)
        .and_then(|e| e.value.clone())
}

// =============================================================================
// Labels and naming
// =============================================================================

mod common_tests {
    use super::*;

    #[test]
    fn test_standard_labels() {
        let labels = standard_labels("pg");
        assert_eq!(labels.get(CLUSTER_LABEL), Some(&"pg".to_string()));
        assert_eq!(
            labels.get("app.kubernetes.io/managed-by"),
            Some(&"postgres-guardian".to_string())
        );
    }

    #[test]
    fn test_member_label_roundtrip() {
        let labels = member_labels(&key(), MemberId(7));
        assert_eq!(labels.get(MEMBER_LABEL), Some(&"7".to_string()));
        assert_eq!(parse_member_label(&labels), Some(MemberId(7)));
        assert_eq!(parse_member_label(&standard_labels("pg")), None);
    }

    #[test]
    fn test_member_host_resolves_back() {
        let host = member_host(&key(), MemberId(2));
        assert_eq!(host, "pg-2.pg-members.demo.svc");
        assert_eq!(member_from_host(&key(), &host), Some(MemberId(2)));
        assert_eq!(member_from_host(&key(), "other-2.other-members"), None);
        assert_eq!(member_from_host(&key(), "pg-x"), None);
    }

    #[test]
    fn test_owner_reference() {
        let cluster = PostgresClusterBuilder::new("pg", "demo").build();
        let owner = owner_reference(&cluster);
        assert_eq!(owner.kind, "PostgresCluster");
        assert_eq!(owner.api_version, "guardian.postgres.io/v1alpha1");
        assert_eq!(owner.name, "pg");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
    }
}

// =============================================================================
// Member pods and volumes
// =============================================================================

mod member_tests {
    use super::*;

    #[test]
    fn test_pvc_named_after_ordinal() {
        let pvc = generate_member_pvc(&key(), &member(3, Bootstrap::InitDb));
        assert_eq!(pvc.metadata.name.as_deref(), Some("data-pg-3"));
        let spec = pvc.spec.unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("fast"));
        let requests = spec.resources.unwrap().requests.unwrap();
        assert_eq!(requests.get("storage").unwrap().0, "1Gi");
        // Volumes outlive the cluster under Pause and Delete
        assert!(pvc.metadata.owner_references.is_none());
    }

    #[test]
    fn test_pod_identity() {
        let pod = generate_member_pod(&key(), &member(0, Bootstrap::InitDb));
        assert_eq!(pod.metadata.name.as_deref(), Some("pg-0"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("demo"));
        assert_eq!(
            parse_member_label(pod.metadata.labels.as_ref().unwrap()),
            Some(MemberId(0))
        );
        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.subdomain.as_deref(), Some("pg-members"));
        assert_eq!(spec.containers[0].image.as_deref(), Some("postgres:16"));
    }

    #[test]
    fn test_replica_pod_points_at_upstream() {
        let mut spec = member(1, Bootstrap::Replica);
        spec.upstream = Some(MemberId(0));
        let pod = generate_member_pod(&key(), &spec);

        let annotations = pod.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations.get(BOOTSTRAP_ANNOTATION).map(String::as_str), Some("replica"));
        assert_eq!(annotations.get(UPSTREAM_ANNOTATION).map(String::as_str), Some("0"));
        assert_eq!(
            container_env(&pod, "GUARDIAN_UPSTREAM").as_deref(),
            Some("pg-0.pg-members.demo.svc")
        );
    }

    #[test]
    fn test_password_comes_from_secret() {
        let pod = generate_member_pod(&key(), &member(0, Bootstrap::InitDb));
        let env = pod.spec.as_ref().unwrap().containers[0].env.clone().unwrap();
        let password = env.iter().find(|e| e.name == "POSTGRES_PASSWORD").unwrap();
        assert!(password.value.is_none());
        let selector = password
            .value_from
            .as_ref()
            .unwrap()
            .secret_key_ref
            .as_ref()
            .unwrap();
        assert_eq!(selector.name, "pg-auth");
        assert_eq!(selector.key, PASSWORD_KEY);
    }

    #[test]
    fn test_ephemeral_member_uses_empty_dir() {
        let mut spec = member(0, Bootstrap::InitDb);
        spec.ephemeral = true;
        let pod = generate_member_pod(&key(), &spec);
        let volumes = pod.spec.unwrap().volumes.unwrap();
        assert!(volumes[0].empty_dir.is_some());
        assert!(volumes[0].persistent_volume_claim.is_none());
    }

    #[test]
    fn test_durable_member_mounts_its_claim() {
        let pod = generate_member_pod(&key(), &member(2, Bootstrap::Existing));
        let volumes = pod.spec.unwrap().volumes.unwrap();
        let claim = volumes[0].persistent_volume_claim.as_ref().unwrap();
        assert_eq!(claim.claim_name, "data-pg-2");
    }

    #[test]
    fn test_engine_settings_override_user_params() {
        let mut spec = member(0, Bootstrap::InitDb);
        spec.postgresql_params
            .insert("archive_mode".to_string(), "off".to_string());
        spec.postgresql_params
            .insert("max_connections".to_string(), "200".to_string());
        spec.standby_mode = StandbyMode::Hot;

        let settings = server_settings(&spec);
        assert_eq!(settings.get("archive_mode").map(String::as_str), Some("always"));
        assert_eq!(settings.get("hot_standby").map(String::as_str), Some("on"));
        assert_eq!(settings.get("max_connections").map(String::as_str), Some("200"));

        let args = container_args(&generate_member_pod(&key(), &spec));
        assert!(args.contains(&"max_connections=200".to_string()));
        assert!(args.contains(&"hot_standby=on".to_string()));
    }

    #[test]
    fn test_warm_standby_rejects_reads() {
        let settings = server_settings(&member(1, Bootstrap::Replica));
        assert_eq!(settings.get("hot_standby").map(String::as_str), Some("off"));
    }

    #[test]
    fn test_bootstrap_values_are_distinct() {
        let values = [
            bootstrap_value(Bootstrap::InitDb),
            bootstrap_value(Bootstrap::Replica),
            bootstrap_value(Bootstrap::Existing),
            bootstrap_value(Bootstrap::ArchiveRecovery),
        ];
        for (i, a) in values.iter().enumerate() {
            for b in values.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    fn pod_with(phase: &str, ready: bool) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_health() {
        assert_eq!(pod_health(&pod_with("Running", true)), MemberHealth::Ready);
        assert_eq!(pod_health(&pod_with("Running", false)), MemberHealth::NotReady);
        assert_eq!(pod_health(&pod_with("Pending", false)), MemberHealth::NotReady);
        assert_eq!(pod_health(&pod_with("Failed", false)), MemberHealth::Unreachable);
        assert_eq!(pod_health(&Pod::default()), MemberHealth::NotReady);
    }
}

// =============================================================================
// Services
// =============================================================================

mod service_tests {
    use super::*;

    #[test]
    fn test_service_names() {
        assert_eq!(write_service_name("pg"), "pg");
        assert_eq!(read_service_name("pg"), "pg-replicas");
        assert_eq!(members_service_name("pg"), "pg-members");
    }

    #[test]
    fn test_write_service_selects_one_member() {
        let service = generate_write_service(&key(), Some(MemberId(1)), None);
        let selector = service.spec.unwrap().selector.unwrap();
        assert_eq!(selector.get(MEMBER_LABEL).map(String::as_str), Some("1"));
        assert_eq!(selector.get(CLUSTER_LABEL).map(String::as_str), Some("pg"));
    }

    #[test]
    fn test_fenced_write_service_selects_nothing() {
        let service = generate_write_service(&key(), None, None);
        let selector = service.spec.unwrap().selector.unwrap();
        let member = selector.get(MEMBER_LABEL).unwrap();
        assert!(member.parse::<u32>().is_err());
    }

    #[test]
    fn test_read_service_selects_read_targets() {
        let cluster = PostgresClusterBuilder::new("pg", "demo").build();
        let service = generate_read_service(&key(), Some(&cluster));
        assert_eq!(service.metadata.owner_references.unwrap().len(), 1);
        let selector = service.spec.unwrap().selector.unwrap();
        assert_eq!(selector.get(READ_TARGET_LABEL).map(String::as_str), Some("true"));
    }

    #[test]
    fn test_members_service_is_headless() {
        let service = generate_members_service(&key(), None);
        let spec = service.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
    }
}

// =============================================================================
// Credentials
// =============================================================================

mod secret_tests {
    use super::*;

    #[test]
    fn test_generated_secret() {
        let secret = generate_credentials_secret(&key());
        assert_eq!(secret.metadata.name.as_deref(), Some("pg-auth"));
        assert!(secret.metadata.owner_references.is_none());
        let password = secret_password(&secret).unwrap();
        assert_eq!(password.len(), 32);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_passwords_differ() {
        assert_ne!(generate_password(32), generate_password(32));
    }

    #[test]
    fn test_password_from_data() {
        let mut secret = generate_credentials_secret(&key());
        secret.string_data = None;
        secret.data = Some(BTreeMap::from([(
            PASSWORD_KEY.to_string(),
            k8s_openapi::ByteString(b"s3cret".to_vec()),
        )]));
        assert_eq!(secret_password(&secret).as_deref(), Some("s3cret"));
    }
}

// =============================================================================
// Catalog records
// =============================================================================

mod catalog_tests {
    use super::*;

    #[test]
    fn test_snapshot_record_from_resource() {
        let mut snapshot = Snapshot::new(
            "nightly",
            SnapshotSpec {
                database_name: "pg".to_string(),
                storage: bucket("snaps"),
            },
        );
        snapshot.metadata.namespace = Some("demo".to_string());
        snapshot.metadata.annotations = Some(BTreeMap::from([(
            CREATED_AT_ANNOTATION.to_string(),
            "2026-01-02T03:04:05+00:00".to_string(),
        )]));
        snapshot.status = Some(SnapshotStatus {
            phase: SnapshotPhase::Succeeded,
            retention_tag: RetentionTag::Scheduled,
            size_bytes: Some(42),
            ..Default::default()
        });

        let record = snapshot_record(&snapshot).unwrap();
        assert_eq!(record.namespace, "demo");
        assert_eq!(record.cluster, "pg");
        assert_eq!(record.name, "nightly");
        assert_eq!(record.phase, SnapshotPhase::Succeeded);
        assert_eq!(record.retention, RetentionTag::Scheduled);
        assert_eq!(record.created_at.to_rfc3339(), "2026-01-02T03:04:05+00:00");

        let status = snapshot_status(&record);
        assert_eq!(status.size_bytes, Some(42));
        assert_eq!(status.retention_tag, RetentionTag::Scheduled);
    }

    #[test]
    fn test_snapshot_without_namespace_is_rejected() {
        let snapshot = Snapshot::new(
            "nightly",
            SnapshotSpec {
                database_name: "pg".to_string(),
                storage: bucket("snaps"),
            },
        );
        assert!(snapshot_record(&snapshot).is_err());
    }

    #[test]
    fn test_dormant_record_from_resource() {
        let mut dormant = DormantDatabase::new(
            "pg",
            DormantDatabaseSpec {
                wipe_out: false,
                origin: DormantOrigin {
                    spec: create_test_spec(2),
                    volumes: vec!["data-pg-0".to_string(), "data-pg-1".to_string()],
                    credentials_secret: Some("pg-auth".to_string()),
                    last_primary: Some(MemberId(1)),
                    timeline: Timeline(3),
                    initialized: true,
                },
            },
        );
        dormant.metadata.namespace = Some("demo".to_string());

        let record = dormant_record(&dormant).unwrap();
        assert_eq!(record.cluster, key());
        assert_eq!(record.volumes.len(), 2);
        assert_eq!(record.last_primary, Some(MemberId(1)));
        assert_eq!(record.timeline, Timeline(3));
        assert!(record.initialized);
        assert!(!record.wipe_out);
        assert_eq!(record.spec.replicas, 2);
    }
}
