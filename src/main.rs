use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use postgres_guardian::health::{HealthState, run_health_server};
use postgres_guardian::{EngineConfig, run_controller};
use postgres_guardian::{WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, run_webhook_server};

const LEASE_NAME: &str = "postgres-guardian-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Time given to in-flight passes after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type BoxError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    install_crypto_provider()?;
    init_tracing()?;
    info!("Starting postgres-guardian");

    let config = EngineConfig::from_env();
    info!(
        reconcile_interval = ?config.reconcile_interval,
        failover_grace = ?config.failover_grace,
        archive_interval = ?config.archive_interval,
        archive_attempts = config.archive_attempts,
        "Loaded engine configuration"
    );

    let client = Client::try_default().await?;
    let (holder, namespace) = pod_identity();
    info!(%holder, %namespace, lease = LEASE_NAME, "Connected to Kubernetes");

    // Probes and admission are served by every replica, leader or not
    let health_state = Arc::new(HealthState::new());
    let health_task = {
        let state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(state).await {
                error!(error = %e, "Health server failed");
            }
        })
    };
    let webhook_task = spawn_webhook(&client);

    let lease = lease_lock(&client, &namespace, &holder);
    acquire_leadership(&lease).await;
    let renewal_task = spawn_lease_renewal(lease_lock(&client, &namespace, &holder));

    info!("Leader elected; starting PostgresCluster, Snapshot and DormantDatabase controllers");
    let controller_task = {
        let state = health_state.clone();
        let client = client.clone();
        tokio::spawn(async move { run_controller(client, config, Some(state)).await })
    };

    let webhook_done = async {
        match webhook_task {
            Some(task) => {
                if let Err(e) = task.await {
                    error!(error = %e, "Webhook server task panicked");
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = controller_task => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
        result = health_task => {
            if let Err(e) = result {
                error!(error = %e, "Health server task panicked");
            }
        }
        _ = webhook_done => {}
        // Renewal only ends by exiting the process, so a join error is a panic
        Err(e) = renewal_task => {
            error!(error = %e, "Lease renewal task panicked");
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            health_state.set_ready(false).await;
            info!(grace = ?SHUTDOWN_GRACE, "Not ready; letting in-flight passes finish");
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
    }

    info!("postgres-guardian stopped");
    Ok(())
}

/// Install the process-wide rustls provider. A provider installed earlier is fine.
fn install_crypto_provider() -> Result<(), BoxError> {
    let installed = rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_ok();
    if !installed && rustls::crypto::CryptoProvider::get_default().is_none() {
        return Err("no rustls crypto provider could be installed".into());
    }
    Ok(())
}

fn init_tracing() -> Result<(), BoxError> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("postgres_guardian=info".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("kube_leader_election=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Lease holder id and namespace, from the downward API when present
fn pod_identity() -> (String, String) {
    let holder = std::env::var("POD_NAME").unwrap_or_else(|_| {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        warn!(%host, "POD_NAME not set, using hostname");
        host
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using default");
        "default".to_string()
    });
    (holder, namespace)
}

fn lease_lock(client: &Client, namespace: &str, holder: &str) -> LeaseLock {
    LeaseLock::new(
        client.clone(),
        namespace,
        LeaseLockParams {
            holder_id: holder.to_string(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: LEASE_TTL,
        },
    )
}

/// Block until this replica holds the lease
async fn acquire_leadership(lease: &LeaseLock) {
    info!("Waiting for leadership");
    loop {
        match lease.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                return;
            }
            Ok(_) => info!("Another replica holds the lease"),
            Err(e) => warn!(error = %e, "Lease acquisition failed, retrying"),
        }
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
    }
}

/// Keep renewing the lease. Losing it exits the process: two leaders would run two
/// control loops for the same clusters.
fn spawn_lease_renewal(lease: LeaseLock) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
            match lease.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("Lost leadership, exiting");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "Lease renewal failed, exiting");
                    std::process::exit(1);
                }
            }
        }
    })
}

/// Start the admission server when its certificate is mounted
fn spawn_webhook(client: &Client) -> Option<JoinHandle<()>> {
    if !(Path::new(WEBHOOK_CERT_PATH).exists() && Path::new(WEBHOOK_KEY_PATH).exists()) {
        info!(
            cert = WEBHOOK_CERT_PATH,
            key = WEBHOOK_KEY_PATH,
            "Webhook certificate not mounted, admission server disabled"
        );
        return None;
    }
    let client = client.clone();
    Some(tokio::spawn(async move {
        if let Err(e) = run_webhook_server(client, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH).await {
            error!(error = %e, "Webhook server failed");
        }
    }))
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
