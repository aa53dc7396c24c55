//! Unit tests for status conditions

use postgres_guardian::cluster::model::{MemberId, Timeline};
use postgres_guardian::controller::state_machine::TransitionContext;
use postgres_guardian::controller::status::{
    ConditionBuilder, cluster_conditions, condition_status, condition_types,
};
use postgres_guardian::crd::{ClusterPhase, Condition, PostgresClusterStatus};

fn find<'a>(conditions: &'a [Condition], type_: &str) -> &'a Condition {
    conditions
        .iter()
        .find(|c| c.type_ == type_)
        .unwrap_or_else(|| panic!("condition {} missing", type_))
}

mod condition_builder_tests {
    use super::*;

    #[test]
    fn test_builder_sets_generation() {
        let conditions = ConditionBuilder::new(Some(4))
            .ready(true, "ClusterReady", "all good")
            .build();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].observed_generation, Some(4));
        assert_eq!(conditions[0].status, condition_status::TRUE);
    }

    #[test]
    fn test_builder_updates_in_place() {
        let conditions = ConditionBuilder::new(Some(1))
            .degraded(false, "Healthy", "3/3")
            .degraded(true, "MembersNotReady", "2/3")
            .build();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason, "MembersNotReady");
        assert_eq!(conditions[0].status, condition_status::TRUE);
    }

    #[test]
    fn test_unchanged_status_keeps_transition_time() {
        let mut existing = ConditionBuilder::new(Some(1))
            .progressing(true, "Provisioning", "creating")
            .build();
        existing[0].last_transition_time = "2020-01-01T00:00:00+00:00".into();

        let updated = ConditionBuilder::from_existing(existing, Some(2))
            .progressing(true, "CatchingUp", "1/2 members ready")
            .build();
        assert_eq!(updated[0].last_transition_time, "2020-01-01T00:00:00+00:00");
        assert_eq!(updated[0].observed_generation, Some(2));
        assert_eq!(updated[0].reason, "CatchingUp");
    }
}

mod cluster_conditions_tests {
    use super::*;

    #[test]
    fn test_all_condition_types_present() {
        let status = PostgresClusterStatus::default();
        let conditions = cluster_conditions(&status, &TransitionContext::new(0, 1));
        for type_ in [
            condition_types::READY,
            condition_types::PROGRESSING,
            condition_types::DEGRADED,
            condition_types::PRIMARY_AVAILABLE,
            condition_types::INITIALIZED,
        ] {
            find(&conditions, type_);
        }
    }

    #[test]
    fn test_provisioning_is_progressing() {
        let status = PostgresClusterStatus {
            phase: ClusterPhase::Provisioning,
            ..Default::default()
        };
        let conditions = cluster_conditions(&status, &TransitionContext::new(0, 2));
        let progressing = find(&conditions, condition_types::PROGRESSING);
        assert_eq!(progressing.status, condition_status::TRUE);
        assert_eq!(progressing.reason, "Provisioning");
        assert_eq!(
            find(&conditions, condition_types::INITIALIZED).status,
            condition_status::FALSE
        );
    }

    #[test]
    fn test_running_with_lagging_member() {
        let status = PostgresClusterStatus {
            phase: ClusterPhase::Running,
            write_endpoint: Some(MemberId(1)),
            timeline: Timeline(2),
            ..Default::default()
        };
        let ctx = TransitionContext::new(2, 3).with_primary(true).initialized(true);
        let conditions = cluster_conditions(&status, &ctx);

        assert_eq!(find(&conditions, condition_types::READY).status, condition_status::FALSE);
        assert_eq!(find(&conditions, condition_types::PROGRESSING).reason, "CatchingUp");
        assert_eq!(find(&conditions, condition_types::DEGRADED).reason, "MembersNotReady");
        let primary = find(&conditions, condition_types::PRIMARY_AVAILABLE);
        assert_eq!(primary.status, condition_status::TRUE);
        assert!(primary.message.contains("timeline 2"));
    }

    #[test]
    fn test_init_failure_stops_progress() {
        let status = PostgresClusterStatus {
            phase: ClusterPhase::Failing,
            ..Default::default()
        };
        let ctx = TransitionContext::new(1, 1).with_error("missing WAL segment");
        let conditions = cluster_conditions(&status, &ctx);
        let progressing = find(&conditions, condition_types::PROGRESSING);
        assert_eq!(progressing.status, condition_status::FALSE);
        assert_eq!(progressing.reason, "InitializationFailed");
        assert_eq!(progressing.message, "missing WAL segment");
    }

    #[test]
    fn test_write_endpoint_without_confirmed_primary_is_fenced() {
        let status = PostgresClusterStatus {
            phase: ClusterPhase::Failing,
            write_endpoint: Some(MemberId(0)),
            ..Default::default()
        };
        let ctx = TransitionContext::new(2, 2).initialized(true);
        let conditions = cluster_conditions(&status, &ctx);
        assert_eq!(
            find(&conditions, condition_types::PRIMARY_AVAILABLE).reason,
            "WritesFenced"
        );
    }
}
