//! clickhouse-operator entry point.
//!
//! Sets up JSON logging, serves the probe endpoints, waits for the leader
//! lease, then runs the KeeperCluster and ClickHouseCluster controllers until
//! SIGTERM or loss of leadership.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use clickhouse_operator::health::{DEFAULT_BIND_ADDRESS, HealthState, run_health_server};
use clickhouse_operator::run_controllers_scoped;

const LEASE_NAME: &str = "clickhouse-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// How long in-flight passes get to finish after SIGTERM.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Process settings read from the pod environment.
struct OperatorConfig {
    /// Lease holder identity.
    pod_name: String,
    /// Namespace holding the leader lease.
    lease_namespace: String,
    /// Restricts both controllers to one namespace when set.
    watch_namespace: Option<String>,
    health_addr: SocketAddr,
}

impl OperatorConfig {
    fn from_env() -> Self {
        let pod_name = env("POD_NAME").unwrap_or_else(|| {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string());
            warn!(%host, "POD_NAME not set, using hostname as lease holder");
            host
        });
        let lease_namespace = env("POD_NAMESPACE").unwrap_or_else(|| {
            warn!("POD_NAMESPACE not set, using 'default' for the lease");
            "default".to_string()
        });
        let health_addr = env("HEALTH_BIND_ADDRESS")
            .and_then(|raw| match raw.parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!(value = %raw, error = %e, "Ignoring invalid HEALTH_BIND_ADDRESS");
                    None
                }
            })
            .unwrap_or_else(|| SocketAddr::from(DEFAULT_BIND_ADDRESS));

        Self {
            pod_name,
            lease_namespace,
            watch_namespace: env("WATCH_NAMESPACE"),
            health_addr,
        }
    }
}

/// A set, non-empty environment variable.
fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("clickhouse_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();

    let config = OperatorConfig::from_env();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        holder_id = %config.pod_name,
        lease_namespace = %config.lease_namespace,
        scope = config.watch_namespace.as_deref().unwrap_or("cluster-wide"),
        "Starting clickhouse-operator"
    );

    let client = Client::try_default().await?;
    let health_state = Arc::new(HealthState::new());

    // Probes answer before leadership so a standby pod stays alive.
    let health_handle = tokio::spawn(run_health_server(
        health_state.clone(),
        config.health_addr,
    ));

    let lease = |client: Client| {
        LeaseLock::new(
            client,
            &config.lease_namespace,
            LeaseLockParams {
                holder_id: config.pod_name.clone(),
                lease_name: LEASE_NAME.to_string(),
                lease_ttl: LEASE_TTL,
            },
        )
    };

    let election = lease(client.clone());
    loop {
        match election.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => break,
            Ok(_) => info!("Another instance holds the lease, waiting"),
            Err(e) => warn!(error = %e, "Lease acquisition failed, retrying"),
        }
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
    }
    info!(lease = LEASE_NAME, "Acquired leadership");

    let renewal = lease(client.clone());
    #[allow(clippy::exit)]
    let renewal_handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
            match renewal.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("Leadership lost, exiting");
                    // A restart puts this pod back into the election
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "Lease renewal failed, exiting");
                    std::process::exit(1);
                }
            }
        }
    });

    // Stops both controllers and any in-flight command fan-out.
    let shutdown = CancellationToken::new();
    let mut controllers = {
        let health_state = health_state.clone();
        let shutdown = shutdown.clone();
        let watch_namespace = config.watch_namespace.clone();
        tokio::spawn(async move {
            run_controllers_scoped(
                client,
                Some(health_state),
                shutdown,
                watch_namespace.as_deref(),
            )
            .await;
        })
    };

    tokio::select! {
        result = &mut controllers => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
        result = health_handle => {
            match result {
                Ok(Err(e)) => error!(error = %e, "Health server failed"),
                Err(e) => error!(error = %e, "Health server task panicked"),
                Ok(Ok(())) => warn!("Health server stopped"),
            }
        }
        // Only reachable on panic; the task otherwise exits the process.
        Err(e) = renewal_handle => {
            error!(error = %e, "Lease renewal task panicked");
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            health_state.set_ready(false);
            shutdown.cancel();
            if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, &mut controllers).await.is_err() {
                warn!(
                    grace_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
                    "Controllers did not stop within the grace period"
                );
            }
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
///
/// Failing to install a handler is fatal: without it the process cannot
/// shut down cleanly.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
