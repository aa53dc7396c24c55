//! Unit tests for validation logic

use postgres_guardian::controller::validation::{
    MAX_REPLICAS, MIN_REPLICAS, validate_backend, validate_deletion, validate_spec,
    validate_spec_change,
};
use postgres_guardian::controller::Error;
use postgres_guardian::crd::{EnvVar, StandbyMode, StorageBackend, TerminationPolicy};

use crate::common::*;

#[test]
fn test_valid_spec() {
    assert!(validate_spec(&create_test_spec(3)).is_ok());
}

#[test]
fn test_replica_bounds() {
    assert!(validate_spec(&create_test_spec(MIN_REPLICAS)).is_ok());
    assert!(validate_spec(&create_test_spec(MAX_REPLICAS)).is_ok());
    assert!(validate_spec(&create_test_spec(MIN_REPLICAS - 1)).is_err());
    assert!(validate_spec(&create_test_spec(MAX_REPLICAS + 1)).is_err());
}

#[test]
fn test_storage_size_format() {
    for size in ["1Gi", "512Mi", "2Ti"] {
        let spec = PostgresClusterBuilder::new("pg", "demo")
            .with_storage_size(size)
            .spec();
        assert!(validate_spec(&spec).is_ok(), "{} rejected", size);
    }
    for size in ["10GB", "Gi", "ten-Gi"] {
        let spec = PostgresClusterBuilder::new("pg", "demo")
            .with_storage_size(size)
            .spec();
        assert!(validate_spec(&spec).is_err(), "{} accepted", size);
    }
}

#[test]
fn test_reserved_env_rejected() {
    let mut spec = create_test_spec(1);
    spec.env.push(EnvVar {
        name: "POSTGRES_PASSWORD".into(),
        value: "hunter2".into(),
    });
    assert!(matches!(validate_spec(&spec), Err(Error::ValidationError(_))));
}

#[test]
fn test_ephemeral_cannot_pause() {
    let spec = PostgresClusterBuilder::new("pg", "demo").ephemeral().spec();
    assert!(validate_spec(&spec).is_err());

    let spec = PostgresClusterBuilder::new("pg", "demo")
        .ephemeral()
        .with_policy(TerminationPolicy::Delete)
        .spec();
    assert!(validate_spec(&spec).is_ok());
}

#[test]
fn test_schedule_expression_checked() {
    let good = PostgresClusterBuilder::new("pg", "demo")
        .with_schedule("@every 1m", bucket("snaps"), Some(3))
        .spec();
    assert!(validate_spec(&good).is_ok());

    let cron = PostgresClusterBuilder::new("pg", "demo")
        .with_schedule("0 3 * * *", bucket("snaps"), None)
        .spec();
    assert!(validate_spec(&cron).is_ok());

    let bad = PostgresClusterBuilder::new("pg", "demo")
        .with_schedule("every minute", bucket("snaps"), None)
        .spec();
    assert!(validate_spec(&bad).is_err());
}

#[test]
fn test_backend_must_have_one_variant() {
    assert!(validate_backend("archiver.storage", &StorageBackend::default()).is_err());
    assert!(validate_backend("archiver.storage", &bucket("")).is_err());
    assert!(validate_backend("archiver.storage", &bucket("wal")).is_ok());

    let mut two = bucket("wal");
    two.local = StorageBackend::local("/backups").local;
    let err = validate_backend("archiver.storage", &two).unwrap_err();
    assert!(err.to_string().contains("found 2"));
}

#[test]
fn test_init_sources() {
    let snapshot_without_secret = PostgresClusterBuilder::new("pg", "demo")
        .with_init_snapshot("nightly")
        .spec();
    assert!(validate_spec(&snapshot_without_secret).is_err());

    let snapshot = PostgresClusterBuilder::new("pg", "demo")
        .with_init_snapshot("nightly")
        .with_secret("shared-auth")
        .spec();
    assert!(validate_spec(&snapshot).is_ok());

    let archive = PostgresClusterBuilder::new("pg", "demo")
        .with_init_archive(bucket("wal"), Some("0/3000000"))
        .spec();
    assert!(validate_spec(&archive).is_ok());

    let bad_position = PostgresClusterBuilder::new("pg", "demo")
        .with_init_archive(bucket("wal"), Some("somewhere"))
        .spec();
    assert!(validate_spec(&bad_position).is_err());
}

#[test]
fn test_scale_change() {
    let old = create_test_spec(3);
    let new = create_test_spec(5);
    let diff = validate_spec_change(&old, &new).unwrap();
    assert!(diff.is_scale_only());
    assert_eq!(diff.replica_delta, 2);
    assert!(!diff.requires_restart());
}

#[test]
fn test_standby_mode_change_requires_restart() {
    let old = create_test_spec(3);
    let mut new = old.clone();
    new.standby_mode = StandbyMode::Hot;
    let diff = validate_spec_change(&old, &new).unwrap();
    assert!(diff.standby_mode_changed);
    assert!(diff.requires_restart());
    assert!(!diff.is_scale_only());
}

#[test]
fn test_storage_is_immutable() {
    let old = create_test_spec(1);
    let new = PostgresClusterBuilder::new("pg", "demo")
        .with_storage_size("2Gi")
        .spec();
    assert!(validate_spec_change(&old, &new).is_err());
}

#[test]
fn test_no_changes() {
    let spec = create_test_spec(2);
    assert!(!validate_spec_change(&spec, &spec).unwrap().has_changes());
}

#[test]
fn test_policy_change_is_allowed() {
    let old = create_test_spec(1);
    let mut new = old.clone();
    new.termination_policy = TerminationPolicy::DoNotTerminate;
    let diff = validate_spec_change(&old, &new).unwrap();
    assert!(diff.policy_changed);
    assert!(diff.has_changes());
}

#[test]
fn test_deletion_policy() {
    for policy in [
        TerminationPolicy::Pause,
        TerminationPolicy::Delete,
        TerminationPolicy::WipeOut,
    ] {
        let spec = PostgresClusterBuilder::new("pg", "demo")
            .with_policy(policy)
            .spec();
        assert!(validate_deletion("demo/pg", &spec).is_ok());
    }
    let spec = PostgresClusterBuilder::new("pg", "demo")
        .with_policy(TerminationPolicy::DoNotTerminate)
        .spec();
    let err = validate_deletion("demo/pg", &spec).unwrap_err();
    assert!(matches!(err, Error::PolicyViolation(_)));
    assert!(!err.is_retryable());
}

mod switchover_annotation_tests {
    use std::collections::BTreeMap;

    use postgres_guardian::cluster::MemberId;
    use postgres_guardian::controller::reconciler::{SWITCHOVER_ANNOTATION, switchover_target};

    use super::*;

    fn annotated(value: &str) -> postgres_guardian::PostgresCluster {
        let mut cluster = PostgresClusterBuilder::ha("pg", "demo").build();
        cluster.metadata.annotations = Some(BTreeMap::from([(
            SWITCHOVER_ANNOTATION.to_string(),
            value.to_string(),
        )]));
        cluster
    }

    #[test]
    fn test_no_request() {
        assert!(switchover_target(&PostgresClusterBuilder::ha("pg", "demo").build()).is_none());
    }

    #[test]
    fn test_ordinal_parsed() {
        assert_eq!(switchover_target(&annotated(" 2 ")).unwrap().unwrap(), MemberId(2));
    }

    #[test]
    fn test_pod_name_rejected() {
        assert!(matches!(
            switchover_target(&annotated("pg-2")),
            Some(Err(Error::ValidationError(_)))
        ));
    }
}
