//! [`DatabaseClient`] for members running in pods
//!
//! Short queries (probe, promote, scripts) use a direct tokio-postgres connection to the
//! member's stable DNS name. Bulk transfers use [`PodExec`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::{Api, Client};
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

use crate::cluster::model::{ClusterKey, MemberId, MemberRole, Timeline, WalPosition};
use crate::cluster::ports::{CollaboratorError, DatabaseClient, PortResult, ProbeReport};
use crate::postgres::exec::{PodExec, shell_quote};
use crate::resources::common::{POSTGRES_PORT, member_host};
use crate::resources::member::{RESTORE_SPOOL, WAL_SPOOL};
use crate::resources::secret::{PASSWORD_KEY, SUPERUSER, secret_password};

/// Connect timeout for probes; a slow member counts as unreachable
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `pg_promote` waits for the server to leave recovery
const PROMOTE_WAIT_SECS: i32 = 60;

impl From<tokio_postgres::Error> for CollaboratorError {
    fn from(e: tokio_postgres::Error) -> Self {
        CollaboratorError::Unavailable(e.to_string())
    }
}

/// Parse a member ordinal out of a `{cluster}-{ordinal}[.…]` host name
pub fn member_from_host(cluster: &ClusterKey, host: &str) -> Option<MemberId> {
    let short = host.split('.').next()?;
    let ordinal = short.strip_prefix(&cluster.name)?.strip_prefix('-')?;
    ordinal.parse().ok().map(MemberId)
}

/// Whether a name from the WAL spool is a complete segment file
fn is_segment_file(name: &str) -> bool {
    name.len() == 24 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

#[derive(Clone)]
pub struct KubeDatabaseClient {
    client: Client,
    exec: PodExec,
}

impl KubeDatabaseClient {
    pub fn new(client: Client) -> Self {
        Self {
            exec: PodExec::new(client.clone()),
            client,
        }
    }

    /// Superuser password of a member, read from the secret its pod references
    async fn password(&self, cluster: &ClusterKey, id: MemberId) -> PortResult<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &cluster.namespace);
        let pod = pods
            .get_opt(&cluster.member_name(id))
            .await?
            .ok_or_else(|| CollaboratorError::NotFound(format!("member {}", cluster.member_name(id))))?;
        let secret_name = pod
            .spec
            .iter()
            .flat_map(|s| s.containers.iter())
            .flat_map(|c| c.env.iter().flatten())
            .find(|e| e.name == PASSWORD_KEY)
            .and_then(|e| e.value_from.as_ref())
            .and_then(|v| v.secret_key_ref.as_ref())
            .map(|r| r.name.clone())
            .ok_or_else(|| {
                CollaboratorError::Rejected(format!("member {} has no credentials", id))
            })?;

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &cluster.namespace);
        let secret = secrets
            .get_opt(&secret_name)
            .await?
            .ok_or_else(|| CollaboratorError::NotFound(format!("secret {}", secret_name)))?;
        secret_password(&secret)
            .ok_or_else(|| CollaboratorError::Rejected(format!("secret {} has no password", secret_name)))
    }

    async fn connect(&self, cluster: &ClusterKey, id: MemberId) -> PortResult<tokio_postgres::Client> {
        let password = self.password(cluster, id).await?;
        let mut config = tokio_postgres::Config::new();
        config
            .host(member_host(cluster, id))
            .port(POSTGRES_PORT as u16)
            .user(SUPERUSER)
            .password(password)
            .dbname("postgres")
            .application_name("postgres-guardian")
            .connect_timeout(CONNECT_TIMEOUT);

        let (client, connection) = config.connect(NoTls).await?;
        let member = cluster.member_name(id);
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(member = %member, error = %e, "Connection closed with error");
            }
        });
        Ok(client)
    }

    fn spool_path(dir: &str, segment: &str) -> PortResult<String> {
        if !is_segment_file(segment) {
            return Err(CollaboratorError::Rejected(format!(
                "{} is not a WAL segment name",
                segment
            )));
        }
        Ok(shell_quote(&format!("{}/{}", dir, segment)))
    }
}

fn parse_position(raw: &str) -> PortResult<WalPosition> {
    raw.parse()
        .map_err(|e| CollaboratorError::Corrupt(format!("WAL position {}: {}", raw, e)))
}

#[async_trait]
impl DatabaseClient for KubeDatabaseClient {
    async fn probe(&self, cluster: &ClusterKey, id: MemberId) -> PortResult<ProbeReport> {
        let client = self.connect(cluster, id).await?;
        let row = client
            .query_one(
                "SELECT pg_is_in_recovery(), \
                        (SELECT timeline_id FROM pg_control_checkpoint())::bigint",
                &[],
            )
            .await?;
        let in_recovery: bool = row.get(0);
        let checkpoint_timeline: i64 = row.get(1);

        if !in_recovery {
            let row = client
                .query_one("SELECT pg_current_wal_lsn()::text", &[])
                .await?;
            let position: String = row.get(0);
            return Ok(ProbeReport {
                role: MemberRole::Primary,
                timeline: Timeline(u32::try_from(checkpoint_timeline).unwrap_or(0)),
                position: parse_position(&position)?,
                upstream: None,
            });
        }

        let row = client
            .query_one(
                "SELECT COALESCE(pg_last_wal_replay_lsn(), '0/0')::text, \
                        (SELECT received_tli::bigint FROM pg_stat_wal_receiver), \
                        (SELECT sender_host FROM pg_stat_wal_receiver)",
                &[],
            )
            .await?;
        let position: String = row.get(0);
        let received: Option<i64> = row.get(1);
        let sender: Option<String> = row.get(2);
        let timeline = received.unwrap_or(checkpoint_timeline);

        Ok(ProbeReport {
            role: MemberRole::Standby,
            timeline: Timeline(u32::try_from(timeline).unwrap_or(0)),
            position: parse_position(&position)?,
            upstream: sender.and_then(|h| member_from_host(cluster, &h)),
        })
    }

    async fn promote(&self, cluster: &ClusterKey, id: MemberId, timeline: Timeline) -> PortResult<()> {
        let client = self.connect(cluster, id).await?;
        let row = client
            .query_one("SELECT pg_promote(true, $1)", &[&PROMOTE_WAIT_SECS])
            .await?;
        let promoted: bool = row.get(0);
        if !promoted {
            return Err(CollaboratorError::Unavailable(format!(
                "member {} did not leave recovery within {}s",
                id, PROMOTE_WAIT_SECS
            )));
        }
        info!(cluster = %cluster, member = %id, timeline = timeline.0, "Member promoted");
        Ok(())
    }

    async fn execute_script(&self, cluster: &ClusterKey, id: MemberId, sql: &str) -> PortResult<()> {
        let client = self.connect(cluster, id).await?;
        client
            .batch_execute(sql)
            .await
            .map_err(|e| CollaboratorError::Rejected(format!("init script failed: {}", e)))
    }

    async fn dump(&self, cluster: &ClusterKey, id: MemberId) -> PortResult<Bytes> {
        self.exec
            .run(
                &cluster.namespace,
                &cluster.member_name(id),
                &["pg_dumpall", "-U", SUPERUSER, "--clean", "--if-exists"],
                None,
            )
            .await
    }

    async fn restore_dump(&self, cluster: &ClusterKey, id: MemberId, dump: Bytes) -> PortResult<()> {
        self.exec
            .run(
                &cluster.namespace,
                &cluster.member_name(id),
                &["psql", "-U", SUPERUSER, "-v", "ON_ERROR_STOP=0", "-q", "-d", "postgres"],
                Some(dump),
            )
            .await?;
        Ok(())
    }

    async fn ready_segments(&self, cluster: &ClusterKey, id: MemberId) -> PortResult<Vec<String>> {
        let listing = self
            .exec
            .shell(
                &cluster.namespace,
                &cluster.member_name(id),
                &format!("ls -1 {} 2>/dev/null || true", shell_quote(WAL_SPOOL)),
                None,
            )
            .await?;
        let listing = String::from_utf8_lossy(&listing);
        let mut segments: Vec<String> = listing
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        segments.sort();
        Ok(segments)
    }

    async fn read_segment(&self, cluster: &ClusterKey, id: MemberId, segment: &str) -> PortResult<Bytes> {
        let path = Self::spool_path(WAL_SPOOL, segment)?;
        self.exec
            .shell(
                &cluster.namespace,
                &cluster.member_name(id),
                &format!("cat {}", path),
                None,
            )
            .await
    }

    async fn mark_archived(&self, cluster: &ClusterKey, id: MemberId, segment: &str) -> PortResult<()> {
        // Anything else in the spool (history files, partials) is removed by name as-is
        let path = shell_quote(&format!("{}/{}", WAL_SPOOL, segment));
        if segment.contains('/') {
            warn!(cluster = %cluster, segment, "Refusing to remove spool entry with a path");
            return Err(CollaboratorError::Rejected(format!("bad spool entry {}", segment)));
        }
        self.exec
            .shell(
                &cluster.namespace,
                &cluster.member_name(id),
                &format!("rm -f {}", path),
                None,
            )
            .await?;
        Ok(())
    }

    async fn replay_segment(
        &self,
        cluster: &ClusterKey,
        id: MemberId,
        segment: &str,
        data: Bytes,
    ) -> PortResult<()> {
        let path = Self::spool_path(RESTORE_SPOOL, segment)?;
        self.exec
            .shell(
                &cluster.namespace,
                &cluster.member_name(id),
                &format!(
                    "mkdir -p {dir} && cat > {path}.tmp && mv {path}.tmp {path}",
                    dir = shell_quote(RESTORE_SPOOL),
                    path = path
                ),
                Some(data),
            )
            .await?;
        Ok(())
    }
}
