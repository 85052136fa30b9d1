//! Shared context for the controllers.
//!
//! The Context struct holds shared state passed to every reconciliation:
//! the Kubernetes client, the event recorder identity, and the factories for
//! the management-plane clients. [`Backends`] is the per-pass slice of it
//! that the reconciliation logic actually touches, so tests can assemble one
//! without a cluster.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tokio_util::sync::CancellationToken;

use crate::client::{ConnectorFactory, HttpConnectorFactory, KeeperProbe, TcpKeeperProbe};
use crate::controller::retry::RetryConfig;
use crate::controller::store::Stores;
use crate::health::HealthState;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "clickhouse-operator";

/// Everything one reconciliation pass reads from or writes to.
#[derive(Clone)]
pub struct Backends {
    pub stores: Stores,
    pub keeper_probe: Arc<dyn KeeperProbe>,
    pub connectors: Arc<dyn ConnectorFactory>,
    pub retry: RetryConfig,
}

/// Whether an event reports routine progress or a problem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

/// An event produced during a pass, published once the pass is over.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassEvent {
    pub severity: Severity,
    pub reason: &'static str,
    pub action: &'static str,
    pub note: String,
}

impl PassEvent {
    pub fn normal(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            severity: Severity::Normal,
            reason,
            action,
            note: note.into(),
        }
    }

    pub fn warning(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            reason,
            action,
            note: note.into(),
        }
    }
}

/// Shared context for the controllers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Keeper server mode probe
    pub keeper_probe: Arc<dyn KeeperProbe>,
    /// Builds management connections for ClickHouse clusters
    pub connectors: Arc<dyn ConnectorFactory>,
    /// Conflict retry policy for writes
    pub retry: RetryConfig,
    /// Cancelled on shutdown; every pass runs under a child token
    pub shutdown: CancellationToken,
}

impl Context {
    /// Create a new context with the network-backed management clients
    pub fn new(client: Client, health_state: Option<Arc<HealthState>>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            health_state,
            keeper_probe: Arc::new(TcpKeeperProbe::default()),
            connectors: Arc::new(HttpConnectorFactory::default()),
            retry: RetryConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Backends scoped to one namespace
    pub fn backends(&self, namespace: &str) -> Backends {
        Backends {
            stores: Stores::namespaced(self.client.clone(), namespace),
            keeper_probe: self.keeper_probe.clone(),
            connectors: self.connectors.clone(),
            retry: self.retry.clone(),
        }
    }

    /// Create an event recorder for publishing Kubernetes events
    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    /// Publish an event for a resource. Failures are logged, never returned.
    pub async fn publish<K>(&self, resource: &K, event: &PassEvent)
    where
        K: Resource<DynamicType = ()>,
    {
        let type_ = match event.severity {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        };
        let object_ref = resource.object_ref(&());
        if let Err(e) = self
            .recorder()
            .publish(
                &Event {
                    type_,
                    reason: event.reason.into(),
                    note: Some(event.note.clone()),
                    action: event.action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %event.reason, error = %e, "Failed to publish event");
        }
    }
}
