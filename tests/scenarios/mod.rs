// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! End-to-end scenarios for the orchestration engine
//!
//! Each test drives a [`ClusterRegistry`] against the in-process simulator under paused
//! tokio time, so failover grace periods and backup schedules elapse instantly.
//!
//! Run with: cargo test --test scenarios

#[path = "../common/mod.rs"]
mod common;

use std::time::Duration;

use bytes::Bytes;

use postgres_guardian::Error;
use postgres_guardian::cluster::wait::{Check, poll_until, primary_changed_from};
use postgres_guardian::cluster::{ClusterKey, MemberId, MemberRole, SnapshotRecord, Timeline};
use postgres_guardian::crd::{
    ClusterPhase, DormantPhase, RetentionTag, SnapshotPhase, StorageBackend, TerminationPolicy,
};
use postgres_guardian::storage::BlobStore;

use common::*;

/// Poll a simulator-side condition until it holds, or panic
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let outcome = poll_until(WAIT, Duration::from_millis(200), || {
        let done = condition();
        async move { if done { Check::Done(()) } else { Check::NotYet } }
    })
    .await;
    assert!(outcome.is_satisfied(), "{} not reached: {:?}", what, outcome);
}

async fn wait_archived(engine: &TestEngine, key: &ClusterKey, segments: u64) {
    let handle = engine.registry.handle(key).unwrap();
    eventually("archived segments", || {
        handle.archiver_status().archived_total >= segments
    })
    .await;
}

fn scheduled_count(records: &[SnapshotRecord]) -> usize {
    records
        .iter()
        .filter(|r| r.retention == RetentionTag::Scheduled)
        .count()
}

async fn keys_under(engine: &TestEngine, container: &str, prefix: &str) -> Vec<String> {
    engine
        .storage
        .container(container)
        .unwrap()
        .list(prefix)
        .await
        .unwrap()
}

// =============================================================================
// Termination policies
// =============================================================================

mod termination_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_keeps_data() {
        let engine = TestEngine::new();
        let builder = PostgresClusterBuilder::new("pg", "demo").with_replicas(2);
        let key = builder.key();

        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        engine.wait_operational(&key, 2).await;
        engine.sim.write(&key, "INSERT 1").unwrap();
        engine.sim.write(&key, "INSERT 2").unwrap();
        let password = engine.credentials.password("demo", "pg-auth").unwrap();

        let phase = engine.registry.delete(&key).await.unwrap();
        assert_eq!(phase, ClusterPhase::Paused);
        assert!(engine.sim.members(&key).is_empty());
        assert_eq!(engine.sim.volumes(&key).len(), 2);
        assert!(engine.dormant.contains(&key));
        assert_eq!(engine.sim.write_route(&key), None);

        let record = engine.registry.dormant(&key).await.unwrap().unwrap();
        assert_eq!(record.last_primary, Some(MemberId(0)));
        assert!(record.initialized);

        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        let status = engine.wait_operational(&key, 2).await;
        let primary = status.primary.unwrap();
        assert_eq!(engine.sim.rows(&key, primary), vec!["INSERT 1", "INSERT 2"]);
        assert_eq!(
            engine.credentials.password("demo", "pg-auth").as_deref(),
            Some(password.as_str())
        );
        assert!(!engine.dormant.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_with_other_storage_rejected() {
        let engine = TestEngine::new();
        let builder = PostgresClusterBuilder::new("pg", "demo");
        let key = builder.key();

        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        engine.wait_operational(&key, 1).await;
        engine.registry.delete(&key).await.unwrap();

        let resized = builder.with_storage_size("50Gi").spec();
        let err = engine.registry.apply(key.clone(), resized, None).await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
        assert!(engine.dormant.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_keeps_backups_and_credentials() {
        let engine = TestEngine::new();
        engine.storage.create_container("wal");
        engine.storage.create_container("backups");
        let builder = PostgresClusterBuilder::new("pg", "demo")
            .with_policy(TerminationPolicy::Delete)
            .with_archiver(bucket("wal"));
        let key = builder.key();

        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        engine.wait_operational(&key, 1).await;
        engine.sim.write(&key, "INSERT 1").unwrap();
        wait_archived(&engine, &key, 1).await;
        engine
            .registry
            .take_snapshot(&key, "before-delete", bucket("backups"))
            .await
            .unwrap();

        let phase = engine.registry.delete(&key).await.unwrap();
        assert_eq!(phase, ClusterPhase::Terminating);
        assert!(engine.sim.members(&key).is_empty());
        assert!(engine.sim.volumes(&key).is_empty());
        assert!(!engine.dormant.contains(&key));

        assert!(engine.credentials.password("demo", "pg-auth").is_some());
        assert!(!keys_under(&engine, "wal", "guardian/demo/pg/archive").await.is_empty());
        assert_eq!(engine.registry.list_snapshots(&key).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wipe_out_removes_only_its_own_data() {
        let engine = TestEngine::new();
        engine.storage.create_container("wal");
        engine.storage.create_container("backups");

        let a = PostgresClusterBuilder::new("a", "demo")
            .with_policy(TerminationPolicy::WipeOut)
            .with_archiver(bucket("wal"));
        let a2 = PostgresClusterBuilder::new("a-2", "demo")
            .with_policy(TerminationPolicy::WipeOut)
            .with_archiver(bucket("wal"));
        let (key_a, key_a2) = (a.key(), a2.key());

        for builder in [&a, &a2] {
            engine.registry.apply(builder.key(), builder.spec(), None).await.unwrap();
        }
        for key in [&key_a, &key_a2] {
            engine.wait_operational(key, 1).await;
            engine.sim.write(key, "INSERT 1").unwrap();
            wait_archived(&engine, key, 1).await;
        }
        engine.registry.take_snapshot(&key_a, "a-snap", bucket("backups")).await.unwrap();
        engine.registry.take_snapshot(&key_a2, "a-2-snap", bucket("backups")).await.unwrap();

        engine.registry.delete(&key_a).await.unwrap();

        assert!(keys_under(&engine, "wal", "guardian/demo/a").await.is_empty());
        assert!(keys_under(&engine, "backups", "guardian/demo/a").await.is_empty());
        assert!(engine.registry.list_snapshots(&key_a).await.unwrap().is_empty());
        assert!(engine.credentials.password("demo", "a-auth").is_none());
        assert!(!engine.dormant.contains(&key_a));

        // The sibling with a prefix-sharing name is untouched
        assert_eq!(keys_under(&engine, "wal", "guardian/demo/a-2/archive").await.len(), 1);
        assert_eq!(keys_under(&engine, "backups", "guardian/demo/a-2").await.len(), 2);
        assert_eq!(engine.registry.list_snapshots(&key_a2).await.unwrap().len(), 1);
        assert!(engine.credentials.password("demo", "a-2-auth").is_some());
        assert!(engine.status(&key_a2).primary.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_do_not_terminate_refuses_deletion() {
        let engine = TestEngine::new();
        let builder = PostgresClusterBuilder::new("pg", "demo")
            .with_policy(TerminationPolicy::DoNotTerminate);
        let key = builder.key();

        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        engine.wait_operational(&key, 1).await;

        let err = engine.registry.delete(&key).await.unwrap_err();
        assert!(matches!(err, Error::PolicyViolation(_)));
        assert!(engine.registry.handle(&key).unwrap().is_running());
        assert_eq!(engine.sim.members(&key).len(), 1);
        engine.sim.write(&key, "INSERT 1").unwrap();

        // Once the policy is changed the cluster can go
        let relaxed = builder.with_policy(TerminationPolicy::Delete).spec();
        engine.registry.apply(key.clone(), relaxed, None).await.unwrap();
        eventually("policy applied", || {
            engine.registry.handle(&key).unwrap().spec().spec.termination_policy
                == TerminationPolicy::Delete
        })
        .await;
        assert_eq!(
            engine.registry.delete(&key).await.unwrap(),
            ClusterPhase::Terminating
        );
        assert!(engine.sim.members(&key).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_repeatedly_keeps_data_and_timeline() {
        let engine = TestEngine::new();
        let builder = PostgresClusterBuilder::new("pg", "demo").with_replicas(2);
        let key = builder.key();

        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        engine.wait_operational(&key, 2).await;
        engine.registry.switchover(&key, MemberId(1)).unwrap();
        engine
            .wait_for(&key, "switchover", |s| {
                s.primary == Some(MemberId(1)) && s.write_endpoint == Some(MemberId(1))
            })
            .await;

        let mut written = Vec::new();
        for cycle in 1..=3 {
            let row = format!("INSERT {}", cycle);
            engine.sim.write(&key, &row).unwrap();
            written.push(row);

            assert_eq!(engine.registry.delete(&key).await.unwrap(), ClusterPhase::Paused);
            let record = engine.registry.dormant(&key).await.unwrap().unwrap();
            assert_eq!(record.timeline, Timeline(2));
            assert_eq!(record.last_primary, Some(MemberId(1)));

            engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
            let status = engine.wait_operational(&key, 2).await;
            assert_eq!(status.primary, Some(MemberId(1)), "cycle {}", cycle);
            assert_eq!(status.timeline, Timeline(2), "cycle {}", cycle);
            assert_eq!(engine.sim.rows(&key, MemberId(1)), written, "cycle {}", cycle);
            assert!(!engine.dormant.contains(&key));
        }
        assert_eq!(engine.sim.promotions(&key), vec![(MemberId(1), Timeline(2))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_during_unconfirmed_promotion_resumes() {
        let engine = TestEngine::new();
        let builder = PostgresClusterBuilder::ha("pg", "demo");
        let key = builder.key();

        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        engine.wait_operational(&key, 3).await;
        engine.sim.write(&key, "INSERT 1").unwrap();

        engine.sim.refuse_promotions(&key, true);
        engine.sim.kill(&key, MemberId(0));
        let status = engine
            .wait_for(&key, "promotion attempt", |s| s.pending_promotion.is_some())
            .await;
        assert_eq!(status.timeline, Timeline(2));
        assert!(engine.sim.promotions(&key).is_empty());

        assert_eq!(engine.registry.delete(&key).await.unwrap(), ClusterPhase::Paused);
        let record = engine.registry.dormant(&key).await.unwrap().unwrap();
        // No member ever reached timeline 2
        assert_eq!(record.timeline, Timeline(1));
        assert_eq!(record.last_primary, None);

        engine.sim.refuse_promotions(&key, false);
        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        let status = engine.wait_operational(&key, 3).await;
        assert_eq!(status.primary, Some(MemberId(0)));
        assert_eq!(status.timeline, Timeline(1));
        assert!(status.pending_promotion.is_none());
        assert_eq!(engine.sim.live_primaries(&key), vec![MemberId(0)]);
        assert_eq!(engine.sim.rows(&key, MemberId(0)), vec!["INSERT 1"]);
        assert!(!engine.dormant.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wipe_then_delete_dormant_record() {
        let engine = TestEngine::new();
        engine.storage.create_container("wal");
        engine.storage.create_container("backups");
        let builder = PostgresClusterBuilder::new("pg", "demo")
            .with_replicas(2)
            .with_archiver(bucket("wal"));
        let key = builder.key();

        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        engine.wait_operational(&key, 2).await;
        engine.sim.write(&key, "INSERT 1").unwrap();
        wait_archived(&engine, &key, 1).await;
        engine.registry.take_snapshot(&key, "kept", bucket("backups")).await.unwrap();

        assert_eq!(engine.registry.delete(&key).await.unwrap(), ClusterPhase::Paused);
        assert_eq!(engine.sim.volumes(&key).len(), 2);
        assert!(!keys_under(&engine, "wal", "guardian/demo/pg").await.is_empty());

        assert!(engine.registry.wipe_dormant(&key).await.unwrap());
        assert!(engine.sim.volumes(&key).is_empty());
        assert!(engine.credentials.password("demo", "pg-auth").is_none());
        assert!(keys_under(&engine, "wal", "guardian/demo/pg").await.is_empty());
        assert!(keys_under(&engine, "backups", "guardian/demo/pg").await.is_empty());
        assert!(engine.registry.list_snapshots(&key).await.unwrap().is_empty());

        let record = engine.registry.dormant(&key).await.unwrap().unwrap();
        assert_eq!(record.phase, DormantPhase::WipedOut);
        assert!(record.wipe_out);
        assert!(record.volumes.is_empty());
        // A second wipe finds nothing left to do
        assert!(engine.registry.wipe_dormant(&key).await.unwrap());

        // Nothing is left to resume from
        let err = engine
            .registry
            .apply(key.clone(), builder.spec(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));

        engine.registry.delete_dormant(&key, false).await.unwrap();
        assert!(!engine.dormant.contains(&key));
        assert!(!engine.registry.wipe_dormant(&key).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_unknown_cluster() {
        let engine = TestEngine::new();
        let err = engine
            .registry
            .delete(&ClusterKey::new("demo", "ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }
}

// =============================================================================
// Failover and topology
// =============================================================================

mod failover_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_primary_loss_promotes_on_new_timeline() {
        let engine = TestEngine::new();
        let builder = PostgresClusterBuilder::new("pg", "demo").with_replicas(4).hot();
        let key = builder.key();

        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        engine.wait_operational(&key, 4).await;
        engine.sim.write(&key, "INSERT 1").unwrap();
        eventually("reads on every member", || engine.sim.read_route(&key).len() == 4).await;

        engine.sim.kill(&key, MemberId(0));
        let status = engine
            .wait_for(&key, "failover", primary_changed_from(MemberId(0)))
            .await;
        assert_eq!(status.primary, Some(MemberId(1)));
        assert_eq!(status.timeline, Timeline(2));
        assert!(status.pending_promotion.is_none());
        assert_eq!(engine.sim.promotions(&key), vec![(MemberId(1), Timeline(2))]);

        // Surviving standbys move to the new primary's stream
        eventually("standbys follow member 1", || {
            [MemberId(2), MemberId(3)].iter().all(|id| {
                engine.sim.upstream(&key, *id) == Some(MemberId(1))
                    && engine.sim.timeline(&key, *id) == Some(Timeline(2))
            })
        })
        .await;

        assert_eq!(engine.sim.write(&key, "INSERT 2").unwrap(), MemberId(1));
        assert_eq!(engine.sim.rows(&key, MemberId(1)), vec!["INSERT 1", "INSERT 2"]);
        let head = engine.sim.position(&key, MemberId(1));
        for standby in [MemberId(2), MemberId(3)] {
            assert_eq!(engine.sim.position(&key, standby), head);
            assert_eq!(engine.sim.rows(&key, standby), vec!["INSERT 1", "INSERT 2"]);
        }

        // The old primary comes back on the old timeline and must not take writes
        engine.sim.revive(&key, MemberId(0));
        eventually("old primary rejoined", || {
            engine.sim.role(&key, MemberId(0)) == Some(MemberRole::Standby)
                && engine.sim.upstream(&key, MemberId(0)) == Some(MemberId(1))
        })
        .await;
        assert_eq!(engine.sim.live_primaries(&key), vec![MemberId(1)]);
        assert_eq!(engine.sim.timeline(&key, MemberId(0)), Some(Timeline(2)));
        assert_eq!(engine.sim.write_route(&key), Some(MemberId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_never_routed_to_two_members() {
        let engine = TestEngine::new();
        let builder = PostgresClusterBuilder::ha("pg", "demo");
        let key = builder.key();

        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        engine.wait_operational(&key, 3).await;
        engine.sim.kill(&key, MemberId(0));
        engine
            .wait_for(&key, "failover", primary_changed_from(MemberId(0)))
            .await;

        // Every switch of the write endpoint passes through a fenced state
        let history = engine.sim.write_history(&key);
        for pair in history.windows(2) {
            if let [Some(a), Some(b)] = pair {
                assert_eq!(a, b, "writes moved without fencing: {:?}", history);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_switchover_then_scale_down_past_primary() {
        let engine = TestEngine::new();
        let builder = PostgresClusterBuilder::ha("pg", "demo");
        let key = builder.key();

        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        engine.wait_operational(&key, 3).await;
        engine.sim.write(&key, "INSERT 1").unwrap();

        engine.registry.switchover(&key, MemberId(2)).unwrap();
        let status = engine
            .wait_for(&key, "switchover", |s| {
                s.primary == Some(MemberId(2)) && s.write_endpoint == Some(MemberId(2))
            })
            .await;
        assert_eq!(status.timeline, Timeline(2));
        assert_eq!(engine.sim.write(&key, "INSERT 2").unwrap(), MemberId(2));

        // Member 2 is removed by the shrink, so the primary role moves first
        let smaller = builder.with_replicas(2).spec();
        engine.registry.apply(key.clone(), smaller, None).await.unwrap();
        let status = engine
            .wait_for(&key, "shrink", |s| {
                s.phase == ClusterPhase::Running
                    && s.primary.is_some_and(|p| p.0 < 2)
                    && s.write_endpoint == s.primary
                    && s.desired_members == 2
                    && s.members.len() == 2
            })
            .await;
        let primary = status.primary.unwrap();
        eventually("member 2 removed", || {
            engine.sim.members(&key) == vec![MemberId(0), MemberId(1)]
        })
        .await;
        assert_eq!(engine.sim.rows(&key, primary), vec!["INSERT 1", "INSERT 2"]);
        assert_eq!(engine.sim.live_primaries(&key), vec![primary]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_promotion_on_higher_timeline_wins() {
        let engine = TestEngine::new();
        let builder = PostgresClusterBuilder::ha("pg", "demo");
        let key = builder.key();

        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        engine.wait_operational(&key, 3).await;
        engine.sim.write(&key, "INSERT 1").unwrap();

        // Member 2 is promoted outside the engine while member 0 still claims the role
        engine.sim.promote_manually(&key, MemberId(2), Timeline(2));
        let status = engine
            .wait_for(&key, "conflict resolved", |s| {
                s.primary == Some(MemberId(2))
                    && s.timeline == Timeline(2)
                    && s.write_endpoint == Some(MemberId(2))
            })
            .await;
        assert!(status.pending_promotion.is_none());
        eventually("old primary demoted", || {
            engine.sim.live_primaries(&key) == vec![MemberId(2)]
                && engine.sim.upstream(&key, MemberId(0)) == Some(MemberId(2))
                && engine.sim.upstream(&key, MemberId(1)) == Some(MemberId(2))
        })
        .await;
        assert!(engine.sim.promotions(&key).is_empty());
        assert_eq!(engine.sim.write(&key, "INSERT 2").unwrap(), MemberId(2));

        // The accepted primary sits in the range a shrink removes
        let smaller = builder.with_replicas(2).spec();
        engine.registry.apply(key.clone(), smaller, None).await.unwrap();
        let status = engine
            .wait_for(&key, "shrink", |s| {
                s.phase == ClusterPhase::Running
                    && s.primary.is_some_and(|p| p.0 < 2)
                    && s.write_endpoint == s.primary
                    && s.members.len() == 2
            })
            .await;
        let primary = status.primary.unwrap();
        assert_eq!(status.timeline, Timeline(3));
        assert_eq!(engine.sim.promotions(&key), vec![(primary, Timeline(3))]);
        eventually("member 2 removed", || {
            engine.sim.members(&key) == vec![MemberId(0), MemberId(1)]
        })
        .await;
        assert_eq!(engine.sim.rows(&key, primary), vec!["INSERT 1", "INSERT 2"]);
        assert_eq!(engine.sim.live_primaries(&key), vec![primary]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_standbys_take_no_reads() {
        let engine = TestEngine::new();
        let builder = PostgresClusterBuilder::ha("pg", "demo");
        let key = builder.key();

        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        engine.wait_operational(&key, 3).await;
        assert_eq!(engine.sim.read_route(&key), vec![MemberId(0)]);

        let hot = builder.hot().spec();
        engine.registry.apply(key.clone(), hot, None).await.unwrap();
        eventually("hot standbys serve reads", || engine.sim.read_route(&key).len() == 3).await;
    }
}

// =============================================================================
// Scheduled snapshots
// =============================================================================

mod schedule_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_interval_schedule_takes_snapshots() {
        let engine = TestEngine::new();
        engine.storage.create_container("backups");
        let builder = PostgresClusterBuilder::new("pg", "demo").with_schedule(
            "@every 1m",
            bucket("backups"),
            None,
        );
        let key = builder.key();

        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        engine.wait_operational(&key, 1).await;
        engine.sim.write(&key, "INSERT 1").unwrap();

        tokio::time::sleep(Duration::from_secs(240)).await;

        let records = engine.registry.list_snapshots(&key).await.unwrap();
        let succeeded: Vec<_> = records
            .iter()
            .filter(|r| r.retention == RetentionTag::Scheduled && r.phase == SnapshotPhase::Succeeded)
            .collect();
        assert!(succeeded.len() >= 3, "only {} snapshots: {:?}", succeeded.len(), records);
        assert!(succeeded.iter().all(|r| r.name.starts_with("pg-")));
        assert!(
            engine.registry.handle(&key).unwrap().snapshot_activity().scheduled_taken >= 3
        );

        let latest = succeeded.last().unwrap();
        let status = engine.status(&key);
        assert!(status.last_snapshot.is_some());
        assert!(latest.location.as_deref().unwrap().contains(&latest.name));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_last_prunes_oldest() {
        let engine = TestEngine::new();
        let backups = engine.storage.create_container("backups");
        let builder = PostgresClusterBuilder::new("pg", "demo").with_schedule(
            "@every 1m",
            bucket("backups"),
            Some(2),
        );
        let key = builder.key();

        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        engine.wait_operational(&key, 1).await;
        engine
            .registry
            .take_snapshot(&key, "manual", bucket("backups"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(300)).await;

        let handle = engine.registry.handle(&key).unwrap();
        assert!(handle.snapshot_activity().scheduled_taken >= 4);

        let records = engine.registry.list_snapshots(&key).await.unwrap();
        let scheduled: Vec<_> = records
            .iter()
            .filter(|r| r.retention == RetentionTag::Scheduled)
            .collect();
        assert_eq!(scheduled.len(), 2, "{:?}", records);
        // Manual snapshots are never pruned
        assert!(records.iter().any(|r| r.name == "manual"));
        // Two files per snapshot directory
        assert_eq!(backups.len(), 6);
        let last = handle.snapshot_activity().last_succeeded.unwrap();
        assert!(scheduled.iter().any(|r| r.name == last));
    }
}

mod snapshot_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_update_applies_at_next_firing() {
        let engine = TestEngine::new();
        engine.storage.create_container("backups");
        let every = |interval: &str| {
            PostgresClusterBuilder::new("pg", "demo")
                .with_schedule(interval, bucket("backups"), None)
                .spec()
        };
        let key = PostgresClusterBuilder::new("pg", "demo").key();

        engine.registry.apply(key.clone(), every("@every 1m"), None).await.unwrap();
        engine.wait_operational(&key, 1).await;
        tokio::time::sleep(Duration::from_secs(150)).await;
        let before = scheduled_count(&engine.registry.list_snapshots(&key).await.unwrap());
        assert!(before >= 2, "only {} scheduled snapshots", before);

        engine.registry.apply(key.clone(), every("@every 5m"), None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let at_change = scheduled_count(&engine.registry.list_snapshots(&key).await.unwrap());

        // The old one-minute cadence no longer fires
        tokio::time::sleep(Duration::from_secs(240)).await;
        assert_eq!(
            scheduled_count(&engine.registry.list_snapshots(&key).await.unwrap()),
            at_change
        );
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(
            scheduled_count(&engine.registry.list_snapshots(&key).await.unwrap()),
            at_change + 1
        );

        // Dropping the schedule stops it
        let unscheduled = PostgresClusterBuilder::new("pg", "demo").spec();
        engine.registry.apply(key.clone(), unscheduled, None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let stopped = scheduled_count(&engine.registry.list_snapshots(&key).await.unwrap());
        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(
            scheduled_count(&engine.registry.list_snapshots(&key).await.unwrap()),
            stopped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_to_missing_bucket_fails_for_good() {
        let engine = TestEngine::new();
        let builder = PostgresClusterBuilder::new("pg", "demo");
        let key = builder.key();

        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        engine.wait_operational(&key, 1).await;
        engine.sim.write(&key, "INSERT 1").unwrap();

        let record = engine
            .registry
            .take_snapshot(&key, "lost", bucket("nowhere"))
            .await
            .unwrap();
        assert_eq!(record.phase, SnapshotPhase::Failed);
        assert!(record.reason.is_some());
        assert!(record.completed_at.is_some());
        assert!(record.location.is_none());

        // Failed is terminal, even once the bucket exists
        let nowhere = engine.storage.create_container("nowhere");
        let again = engine
            .registry
            .take_snapshot(&key, "lost", bucket("nowhere"))
            .await
            .unwrap();
        assert_eq!(again, record);
        assert!(nowhere.is_empty());
        assert_eq!(engine.registry.list_snapshots(&key).await.unwrap(), vec![record]);
    }
}

// =============================================================================
// Initialization sources
// =============================================================================

mod init_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_init_script_runs_once() {
        let engine = TestEngine::new();
        let builder = PostgresClusterBuilder::new("pg", "demo")
            .with_replicas(2)
            .with_init_script("CREATE TABLE t");
        let key = builder.key();

        engine.registry.apply(key.clone(), builder.spec(), None).await.unwrap();
        let status = engine.wait_operational(&key, 2).await;
        assert!(status.initialized);
        assert_eq!(engine.sim.rows(&key, MemberId(0)), vec!["CREATE TABLE t"]);

        // Later passes leave the data alone
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(engine.sim.rows(&key, MemberId(0)), vec!["CREATE TABLE t"]);
    }

    async fn archived_source(engine: &TestEngine) -> ClusterKey {
        engine.storage.create_container("wal");
        let source = PostgresClusterBuilder::new("a", "demo").with_archiver(bucket("wal"));
        let key = source.key();
        engine.registry.apply(key.clone(), source.spec(), None).await.unwrap();
        engine.wait_operational(&key, 1).await;
        for i in 1..=4 {
            engine.sim.write(&key, &format!("INSERT {}", i)).unwrap();
        }
        wait_archived(engine, &key, 4).await;
        key
    }

    fn archive_of_a() -> StorageBackend {
        StorageBackend::s3("wal", Some("guardian/demo/a/archive"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_from_wal_archive() {
        let engine = TestEngine::new();
        archived_source(&engine).await;
        assert_eq!(keys_under(&engine, "wal", "guardian/demo/a/archive").await.len(), 4);

        let restored = PostgresClusterBuilder::new("b", "demo")
            .with_init_archive(archive_of_a(), None);
        let key = restored.key();
        engine.registry.apply(key.clone(), restored.spec(), None).await.unwrap();

        let status = engine.wait_operational(&key, 1).await;
        let primary = status.primary.unwrap();
        assert_eq!(
            engine.sim.rows(&key, primary),
            vec!["INSERT 1", "INSERT 2", "INSERT 3", "INSERT 4"]
        );
        assert!(status.timeline > Timeline::INITIAL);
        assert_eq!(engine.sim.write(&key, "INSERT 5").unwrap(), primary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_up_to_position() {
        let engine = TestEngine::new();
        archived_source(&engine).await;

        // Second segment starts at 16 MiB
        let restored = PostgresClusterBuilder::new("b", "demo")
            .with_init_archive(archive_of_a(), Some("0/1000000"));
        let key = restored.key();
        engine.registry.apply(key.clone(), restored.spec(), None).await.unwrap();

        let status = engine.wait_operational(&key, 1).await;
        assert_eq!(
            engine.sim.rows(&key, status.primary.unwrap()),
            vec!["INSERT 1", "INSERT 2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_archive_gap_fails_initialization() {
        let engine = TestEngine::new();
        archived_source(&engine).await;
        engine
            .storage
            .container("wal")
            .unwrap()
            .delete("guardian/demo/a/archive", "000000010000000000000002")
            .await
            .unwrap();

        let restored = PostgresClusterBuilder::new("b", "demo")
            .with_init_archive(archive_of_a(), None);
        let key = restored.key();
        engine.registry.apply(key.clone(), restored.spec(), None).await.unwrap();

        let status = engine
            .wait_for(&key, "initialization failure", |s| s.phase == ClusterPhase::Failing)
            .await;
        assert!(status.last_error.unwrap().contains("missing WAL"));
        assert!(!status.initialized);
        assert!(status.write_endpoint.is_none());
        assert_eq!(engine.sim.write_route(&key), None);
    }

    async fn snapshotted_source(engine: &TestEngine) {
        engine.storage.create_container("backups");
        let source = PostgresClusterBuilder::new("a", "demo");
        let key = source.key();
        engine.registry.apply(key.clone(), source.spec(), None).await.unwrap();
        engine.wait_operational(&key, 1).await;
        engine.sim.write(&key, "INSERT 1").unwrap();
        engine.sim.write(&key, "INSERT 2").unwrap();

        let record = engine
            .registry
            .take_snapshot(&key, "nightly", bucket("backups"))
            .await
            .unwrap();
        assert_eq!(record.phase, SnapshotPhase::Succeeded);
        assert_eq!(record.retention, RetentionTag::Manual);
        engine.credentials.insert("demo", "b-secret", "s3cret");
    }

    fn from_nightly() -> PostgresClusterBuilder {
        PostgresClusterBuilder::new("b", "demo")
            .with_secret("b-secret")
            .with_init_snapshot("nightly")
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_from_snapshot() {
        let engine = TestEngine::new();
        snapshotted_source(&engine).await;

        let restored = from_nightly();
        let key = restored.key();
        engine.registry.apply(key.clone(), restored.spec(), None).await.unwrap();

        let status = engine.wait_operational(&key, 1).await;
        assert_eq!(
            engine.sim.rows(&key, status.primary.unwrap()),
            vec!["INSERT 1", "INSERT 2"]
        );
        // The supplied secret is used as is
        assert_eq!(engine.credentials.password("demo", "b-secret").as_deref(), Some("s3cret"));
        assert!(engine.credentials.password("demo", "b-auth").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tampered_snapshot_fails_initialization() {
        let engine = TestEngine::new();
        snapshotted_source(&engine).await;
        let backups = engine.storage.container("backups").unwrap();
        assert!(backups.tamper(
            "guardian/demo/a/snapshots/nightly/dump.sql",
            Bytes::from("DROP EVERYTHING")
        ));

        let restored = from_nightly();
        let key = restored.key();
        engine.registry.apply(key.clone(), restored.spec(), None).await.unwrap();

        let status = engine
            .wait_for(&key, "initialization failure", |s| s.phase == ClusterPhase::Failing)
            .await;
        assert!(status.last_error.unwrap().contains("checksum"));
        assert!(engine.sim.rows(&key, MemberId(0)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_snapshot_fails_initialization() {
        let engine = TestEngine::new();
        engine.credentials.insert("demo", "b-secret", "s3cret");
        let restored = from_nightly();
        let key = restored.key();
        engine.registry.apply(key.clone(), restored.spec(), None).await.unwrap();

        let status = engine
            .wait_for(&key, "initialization failure", |s| s.phase == ClusterPhase::Failing)
            .await;
        assert!(status.last_error.unwrap().contains("does not exist"));
    }
}
