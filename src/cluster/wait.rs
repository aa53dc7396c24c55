//! Poll-with-timeout helpers with a typed outcome instead of unbounded waits

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::cluster::model::MemberId;
use crate::crd::{ClusterPhase, PostgresClusterStatus};

/// Outcome of a bounded wait
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome<T> {
    Satisfied(T),
    TimedOut,
    Failed(String),
}

impl<T> WaitOutcome<T> {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, WaitOutcome::Satisfied(_))
    }

    pub fn satisfied(self) -> Option<T> {
        match self {
            WaitOutcome::Satisfied(v) => Some(v),
            _ => None,
        }
    }
}

/// Result of one check inside [`poll_until`]
#[derive(Debug, Clone, PartialEq)]
pub enum Check<T> {
    Done(T),
    NotYet,
    Abort(String),
}

/// Run `check` every `interval` until it is done, aborts, or `timeout` elapses.
/// The check always runs at least once.
pub async fn poll_until<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> WaitOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Check<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match check().await {
            Check::Done(v) => return WaitOutcome::Satisfied(v),
            Check::Abort(reason) => return WaitOutcome::Failed(reason),
            Check::NotYet => {}
        }
        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

/// Wait until a published cluster status satisfies `condition`
pub async fn wait_for_status<C>(
    rx: &mut watch::Receiver<PostgresClusterStatus>,
    condition: C,
    timeout: Duration,
) -> WaitOutcome<PostgresClusterStatus>
where
    C: Fn(&PostgresClusterStatus) -> bool,
{
    let wait = rx.wait_for(|s| condition(s));
    match tokio::time::timeout(timeout, wait).await {
        Ok(Ok(status)) => WaitOutcome::Satisfied(status.clone()),
        Ok(Err(_)) => WaitOutcome::Failed("cluster control loop stopped".to_string()),
        Err(_) => WaitOutcome::TimedOut,
    }
}

/// Condition: status is in `expected` phase
pub fn is_phase(expected: ClusterPhase) -> impl Fn(&PostgresClusterStatus) -> bool {
    move |status| status.phase == expected
}

/// Condition: running with a primary and at least `members` ready members
pub fn cluster_operational(members: i32) -> impl Fn(&PostgresClusterStatus) -> bool {
    move |status| {
        status.phase == ClusterPhase::Running
            && status.ready_members >= members
            && status.primary.is_some()
            && status.write_endpoint.is_some()
    }
}

/// Condition: a primary other than `old` is serving writes
pub fn primary_changed_from(old: MemberId) -> impl Fn(&PostgresClusterStatus) -> bool {
    move |status| {
        status.phase == ClusterPhase::Running
            && status.primary.is_some_and(|p| p != old)
            && status.write_endpoint == status.primary
    }
}
