//! clickhouse-operator library crate
//!
//! This module exports the controllers, CRD definitions, resource generators
//! and management-plane clients.

pub mod client;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use health::HealthState;

use std::fmt::Debug;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, metadata_watcher, predicates, reflector, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use controller::context::Context;
use controller::error::Error;
use controller::reconciler::error_policy;
use crd::{ClickHouseCluster, KeeperCluster};

/// `Api` over one namespace, or over all of them when `namespace` is `None`.
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Watch configuration shared by every stream of both controllers.
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Cached watch of the primary kind with backoff.
///
/// Only generation changes pass the filter, so the status written at the
/// end of a pass does not schedule another one. The store is what the
/// controller reads from; the ClickHouse controller also uses it to map
/// Keeper changes back to dependent clusters.
fn create_filtered_stream<K>(
    api: Api<K>,
    watcher_config: WatcherConfig,
) -> (
    reflector::Store<K>,
    impl Stream<Item = Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation);
    (reader, stream)
}

type ReconcileResult<K> = Result<(ObjectRef<K>, Action), kube::runtime::controller::Error<Error, watcher::Error>>;

fn log_result<K: Resource>(result: ReconcileResult<K>) {
    use kube::runtime::controller::Error as RunError;

    match result {
        Ok((obj, action)) => {
            debug!(object = %obj, ?action, "Reconciled");
        }
        // Owned-object events can still arrive for a cluster that was just deleted.
        Err(RunError::ObjectNotFound(obj)) => {
            debug!(object = %obj, "Cluster no longer exists");
        }
        Err(RunError::ReconcilerFailed(e, obj)) if e.is_not_found() => {
            debug!(object = %obj, error = %e, "Cluster no longer exists");
        }
        Err(e) => {
            error!(error = ?e, "Reconciliation failed");
        }
    }
}

/// Run the KeeperCluster controller until the context's shutdown token fires.
pub async fn run_keeper_controller(ctx: Arc<Context>, namespace: Option<&str>) {
    let client = ctx.client.clone();
    let watcher_config = default_watcher_config();
    let (reader, stream) = create_filtered_stream(
        scoped_api::<KeeperCluster>(client.clone(), namespace),
        watcher_config.clone(),
    );

    // StatefulSets are watched in full since readiness lives in their
    // status. The other owned kinds only need to be noticed.
    Controller::for_stream(stream, reader)
        .owns(
            scoped_api::<StatefulSet>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns_stream(
            metadata_watcher(scoped_api::<ConfigMap>(client.clone(), namespace), watcher_config.clone())
                .touched_objects(),
        )
        .owns_stream(
            metadata_watcher(scoped_api::<Service>(client.clone(), namespace), watcher_config.clone())
                .touched_objects(),
        )
        .owns_stream(
            metadata_watcher(scoped_api::<PodDisruptionBudget>(client, namespace), watcher_config)
                .touched_objects(),
        )
        .graceful_shutdown_on(ctx.shutdown.clone().cancelled_owned())
        .run(controller::keeper::reconcile, error_policy::<KeeperCluster>, ctx)
        .for_each(|result| async move { log_result(result) })
        .await;
}

/// Run the ClickHouseCluster controller until the context's shutdown token fires.
///
/// Besides owned objects, changes to a KeeperCluster trigger every
/// ClickHouseCluster that references it, since the Keeper nodes are part of
/// the server configuration.
pub async fn run_clickhouse_controller(ctx: Arc<Context>, namespace: Option<&str>) {
    let client = ctx.client.clone();
    let watcher_config = default_watcher_config();
    let (reader, stream) = create_filtered_stream(
        scoped_api::<ClickHouseCluster>(client.clone(), namespace),
        watcher_config.clone(),
    );

    let clusters = reader.clone();
    let keeper_mapper = move |keeper: KeeperCluster| {
        let keeper_name = keeper.name_any();
        let keeper_namespace = keeper.namespace();
        clusters
            .state()
            .into_iter()
            .filter(|cluster| {
                cluster.spec.keeper_cluster_ref.name == keeper_name
                    && cluster.namespace() == keeper_namespace
            })
            .map(|cluster| ObjectRef::from_obj(cluster.as_ref()))
            .collect::<Vec<_>>()
    };

    Controller::for_stream(stream, reader)
        .owns(
            scoped_api::<StatefulSet>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns_stream(
            metadata_watcher(scoped_api::<ConfigMap>(client.clone(), namespace), watcher_config.clone())
                .touched_objects(),
        )
        .owns_stream(
            metadata_watcher(scoped_api::<Service>(client.clone(), namespace), watcher_config.clone())
                .touched_objects(),
        )
        .owns_stream(
            metadata_watcher(
                scoped_api::<PodDisruptionBudget>(client.clone(), namespace),
                watcher_config.clone(),
            )
            .touched_objects(),
        )
        .owns_stream(
            metadata_watcher(scoped_api::<Secret>(client.clone(), namespace), watcher_config.clone())
                .touched_objects(),
        )
        .watches(
            scoped_api::<KeeperCluster>(client, namespace),
            watcher_config,
            keeper_mapper,
        )
        .graceful_shutdown_on(ctx.shutdown.clone().cancelled_owned())
        .run(
            controller::clickhouse::reconcile,
            error_policy::<ClickHouseCluster>,
            ctx,
        )
        .for_each(|result| async move { log_result(result) })
        .await;
}

/// Run both controllers (cluster-wide).
pub async fn run_controllers(
    client: Client,
    health_state: Option<Arc<HealthState>>,
    shutdown: CancellationToken,
) {
    run_controllers_scoped(client, health_state, shutdown, None).await
}

/// Run both controllers with optional namespace scoping.
///
/// When `namespace` is `Some(ns)`, only watches resources in that namespace.
/// When `namespace` is `None`, watches resources cluster-wide.
pub async fn run_controllers_scoped(
    client: Client,
    health_state: Option<Arc<HealthState>>,
    shutdown: CancellationToken,
    namespace: Option<&str>,
) {
    info!(
        scope = namespace.unwrap_or("cluster-wide"),
        "Starting KeeperCluster and ClickHouseCluster controllers"
    );

    if let Some(state) = &health_state {
        state.set_ready(true);
    }

    let mut ctx = Context::new(client, health_state);
    ctx.shutdown = shutdown.clone();
    let ctx = Arc::new(ctx);

    futures::join!(
        run_keeper_controller(ctx.clone(), namespace),
        run_clickhouse_controller(ctx, namespace),
    );

    if shutdown.is_cancelled() {
        info!("Controllers stopped");
    } else {
        error!("Controller streams ended without a shutdown request");
    }
}
