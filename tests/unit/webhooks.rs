//! Unit tests for admission policies

use std::collections::BTreeMap;

use chrono::Utc;

use postgres_guardian::cluster::{ClusterKey, DormantRecord, Timeline};
use postgres_guardian::crd::{DormantPhase, PostgresCluster, TerminationPolicy};
use postgres_guardian::webhooks::policies::{
    AdmissionOperation, ValidationContext, ValidationResult, validate_all,
};

use crate::common::*;

fn no_labels() -> BTreeMap<String, String> {
    BTreeMap::new()
}

fn production() -> BTreeMap<String, String> {
    BTreeMap::from([("env".to_string(), "production".to_string())])
}

fn create(cluster: &PostgresCluster, labels: BTreeMap<String, String>) -> ValidationResult {
    validate_all(&ValidationContext::new(
        AdmissionOperation::Create,
        cluster,
        None,
        labels,
    ))
}

fn dormant_for(cluster: &PostgresCluster, phase: DormantPhase) -> DormantRecord {
    DormantRecord {
        cluster: ClusterKey::new("demo", "pg"),
        spec: cluster.spec.clone(),
        volumes: vec!["data-pg-0".to_string()],
        credentials_secret: Some("pg-auth".to_string()),
        last_primary: None,
        timeline: Timeline(1),
        initialized: true,
        wipe_out: false,
        phase,
        paused_at: Utc::now(),
    }
}

mod operation_tests {
    use super::*;

    #[test]
    fn test_parse_operations() {
        assert_eq!(AdmissionOperation::parse("CREATE"), Some(AdmissionOperation::Create));
        assert_eq!(AdmissionOperation::parse("UPDATE"), Some(AdmissionOperation::Update));
        assert_eq!(AdmissionOperation::parse("DELETE"), Some(AdmissionOperation::Delete));
        assert_eq!(AdmissionOperation::parse("CONNECT"), None);
    }
}

mod create_tests {
    use super::*;

    #[test]
    fn test_valid_cluster_admitted() {
        let cluster = PostgresClusterBuilder::new("pg", "demo").build();
        assert!(create(&cluster, no_labels()).allowed);
    }

    #[test]
    fn test_invalid_spec_denied() {
        let cluster = PostgresClusterBuilder::new("pg", "demo")
            .with_replicas(0)
            .build();
        let result = create(&cluster, no_labels());
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("ValidationFailed"));
        assert!(result.message.unwrap().contains("replica count"));
    }

    #[test]
    fn test_snapshot_init_without_secret_denied() {
        let cluster = PostgresClusterBuilder::new("pg", "demo")
            .with_init_snapshot("nightly")
            .build();
        assert!(!create(&cluster, no_labels()).allowed);
    }

    #[test]
    fn test_resume_over_matching_dormant_record() {
        let cluster = PostgresClusterBuilder::new("pg", "demo").build();
        let dormant = dormant_for(&cluster, DormantPhase::Paused);
        let ctx = ValidationContext::new(AdmissionOperation::Create, &cluster, None, no_labels())
            .with_dormant(Some(&dormant));
        assert!(validate_all(&ctx).allowed);
    }

    #[test]
    fn test_dormant_record_with_other_storage_conflicts() {
        let paused = PostgresClusterBuilder::new("pg", "demo").build();
        let dormant = dormant_for(&paused, DormantPhase::Paused);
        let cluster = PostgresClusterBuilder::new("pg", "demo")
            .with_storage_size("20Gi")
            .build();
        let ctx = ValidationContext::new(AdmissionOperation::Create, &cluster, None, no_labels())
            .with_dormant(Some(&dormant));
        let result = validate_all(&ctx);
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("DormantDatabaseConflict"));
    }

    #[test]
    fn test_wiped_dormant_record_conflicts() {
        let cluster = PostgresClusterBuilder::new("pg", "demo").build();
        let dormant = dormant_for(&cluster, DormantPhase::WipedOut);
        let ctx = ValidationContext::new(AdmissionOperation::Create, &cluster, None, no_labels())
            .with_dormant(Some(&dormant));
        assert!(!validate_all(&ctx).allowed);
    }
}

mod update_tests {
    use super::*;

    #[test]
    fn test_scale_up_allowed() {
        let old = PostgresClusterBuilder::new("pg", "demo").with_replicas(2).build();
        let new = PostgresClusterBuilder::new("pg", "demo").with_replicas(4).build();
        let ctx = ValidationContext::new(AdmissionOperation::Update, &new, Some(&old), no_labels());
        assert!(validate_all(&ctx).allowed);
    }

    #[test]
    fn test_storage_change_denied() {
        let old = PostgresClusterBuilder::new("pg", "demo").build();
        let new = PostgresClusterBuilder::new("pg", "demo")
            .with_storage_size("10Gi")
            .build();
        let ctx = ValidationContext::new(AdmissionOperation::Update, &new, Some(&old), no_labels());
        let result = validate_all(&ctx);
        assert!(!result.allowed);
        assert!(result.message.unwrap().contains("storage"));
    }

    #[test]
    fn test_storage_type_change_denied() {
        let old = PostgresClusterBuilder::new("pg", "demo")
            .with_policy(TerminationPolicy::Delete)
            .build();
        let new = PostgresClusterBuilder::new("pg", "demo")
            .with_policy(TerminationPolicy::Delete)
            .ephemeral()
            .build();
        let ctx = ValidationContext::new(AdmissionOperation::Update, &new, Some(&old), no_labels());
        assert!(!validate_all(&ctx).allowed);
    }

    #[test]
    fn test_dormant_record_ignored_on_update() {
        let old = PostgresClusterBuilder::new("pg", "demo").build();
        let new = PostgresClusterBuilder::new("pg", "demo").with_replicas(2).build();
        let dormant = dormant_for(&old, DormantPhase::WipedOut);
        let ctx = ValidationContext::new(AdmissionOperation::Update, &new, Some(&old), no_labels())
            .with_dormant(Some(&dormant));
        assert!(validate_all(&ctx).allowed);
    }
}

mod delete_tests {
    use super::*;

    #[test]
    fn test_do_not_terminate_denied() {
        let cluster = PostgresClusterBuilder::new("pg", "demo")
            .with_policy(TerminationPolicy::DoNotTerminate)
            .build();
        let ctx = ValidationContext::new(AdmissionOperation::Delete, &cluster, None, no_labels());
        let result = validate_all(&ctx);
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("PolicyViolation"));
    }

    #[test]
    fn test_delete_skips_spec_checks() {
        // An invalid spec must still be deletable
        let cluster = PostgresClusterBuilder::new("pg", "demo")
            .with_replicas(0)
            .with_policy(TerminationPolicy::WipeOut)
            .build();
        let ctx = ValidationContext::new(AdmissionOperation::Delete, &cluster, None, production());
        assert!(validate_all(&ctx).allowed);
    }
}

mod production_tests {
    use super::*;

    fn compliant() -> PostgresClusterBuilder {
        PostgresClusterBuilder::ha("pg", "demo")
            .with_replicas(3)
            .with_policy(TerminationPolicy::Pause)
            .with_schedule("0 2 * * *", bucket("backups"), Some(7))
    }

    #[test]
    fn test_compliant_cluster_admitted() {
        assert!(create(&compliant().build(), production()).allowed);
    }

    #[test]
    fn test_single_member_denied() {
        let result = create(&compliant().with_replicas(1).build(), production());
        assert_eq!(result.reason.as_deref(), Some("ProductionHARequired"));
    }

    #[test]
    fn test_delete_policy_denied() {
        let result = create(
            &compliant().with_policy(TerminationPolicy::Delete).build(),
            production(),
        );
        assert_eq!(result.reason.as_deref(), Some("ProductionTerminationPolicy"));
    }

    #[test]
    fn test_ephemeral_denied() {
        let result = create(
            &compliant()
                .ephemeral()
                .with_policy(TerminationPolicy::DoNotTerminate)
                .build(),
            production(),
        );
        assert_eq!(result.reason.as_deref(), Some("ProductionDurableStorageRequired"));
    }

    #[test]
    fn test_missing_schedule_denied() {
        let cluster = PostgresClusterBuilder::new("pg", "demo")
            .with_replicas(3)
            .with_policy(TerminationPolicy::DoNotTerminate)
            .build();
        let result = create(&cluster, production());
        assert_eq!(result.reason.as_deref(), Some("ProductionBackupRequired"));
    }

    #[test]
    fn test_rules_only_apply_in_production() {
        let cluster = PostgresClusterBuilder::new("pg", "demo")
            .with_policy(TerminationPolicy::WipeOut)
            .build();
        assert!(create(&cluster, no_labels()).allowed);
        let staging = BTreeMap::from([("env".to_string(), "staging".to_string())]);
        assert!(create(&cluster, staging).allowed);
    }
}
