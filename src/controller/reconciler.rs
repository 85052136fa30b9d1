//! Pass plumbing shared by both cluster kinds.
//!
//! A kind-specific `sync` runs one pass against [`Backends`] and fills a
//! [`Pass`]. The pass is folded into a [`PassOutcome`], and [`finish`] writes
//! the status, publishes the events and picks the next requeue. Only
//! [`finish`] and [`error_policy`] talk to the API server directly.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::client::CommandError;
use crate::controller::context::{Backends, Context, FIELD_MANAGER, PassEvent};
use crate::controller::error::{
    Error, REQUEUE_ON_REFRESH, REQUEUE_RESYNC, ReplicaFailure, Result,
};
use crate::controller::fanout::{FanoutError, TaskError};
use crate::controller::replica::{ReplicaState, ReplicaTracker};
use crate::controller::resource::{self, ManagedResource};
use crate::controller::retry::RetryConfig;
use crate::controller::store::ObjectStore;
use crate::controller::revision::Revisions;
use crate::controller::rollout::RolloutPlan;
use crate::controller::status::{ClusterFacts, HealthVerdict, aggregate};
use crate::crd::{
    ClusterObject, ClusterStatus, Condition, ConditionType, ReplicaId, reason,
};
use crate::health::ClusterLabels;
use crate::resources::common::{ANNOTATION_RESTARTED_AT, replica_object_name};

/// What a pass learned about the replicas once they could be observed.
#[derive(Clone, Debug)]
pub struct Observed<Id: ReplicaId> {
    pub revisions: Revisions,
    pub tracker: ReplicaTracker<Id>,
    pub health: HealthVerdict,
    /// Replica updates the sequencer held back.
    pub held: usize,
}

/// Accumulates the results of one pass.
#[derive(Debug)]
pub struct Pass<Id: ReplicaId> {
    pub events: Vec<PassEvent>,
    pub observed: Option<Observed<Id>>,
}

impl<Id: ReplicaId> Default for Pass<Id> {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            observed: None,
        }
    }
}

/// Everything [`finish`] needs once the pass is over.
#[derive(Debug)]
pub struct PassOutcome {
    pub status: ClusterStatus,
    pub events: Vec<PassEvent>,
    pub desired_replicas: usize,
    pub held: usize,
    pub result: Result<()>,
}

impl PassOutcome {
    pub fn is_ready(&self) -> bool {
        self.status.conditions.is_true(ConditionType::Ready)
    }
}

impl<Id: ReplicaId> Pass<Id> {
    pub fn event(&mut self, event: PassEvent) {
        self.events.push(event);
    }

    /// Fold the pass into the status to record.
    ///
    /// When the pass failed before the replicas could be observed, the
    /// previous status is kept apart from the reconcile and ready conditions.
    pub fn into_outcome<C: ClusterObject>(self, cluster: &C, result: Result<()>) -> PassOutcome {
        let generation = cluster.meta().generation;
        let previous = cluster.cluster_status();
        let mut events = self.events;

        if let Err(e) = &result
            && !matches!(e, Error::Replicas(_) | Error::Steps(_))
        {
            events.push(PassEvent::warning(e.event_reason(), "Reconcile", e.to_string()));
        }

        let Some(observed) = self.observed else {
            return PassOutcome {
                status: failed_status(previous, generation, &result),
                events,
                desired_replicas: 0,
                held: 0,
                result,
            };
        };

        let tracker = &observed.tracker;
        let revisions = &observed.revisions;
        let pod_errors: Vec<(String, String)> = tracker
            .iter()
            .filter_map(|(id, state)| Some((id.to_string(), state.pod_error.clone()?)))
            .collect();
        let out_of_sync: Vec<String> = tracker
            .iter()
            .filter(|(_, state)| state.updated || state.has_diff(revisions))
            .map(|(id, _)| id.to_string())
            .collect();
        let desired = tracker.ids().count();

        let facts = ClusterFacts {
            desired,
            existing: tracker.existing(),
            ready: tracker.ready(),
            pod_errors,
            out_of_sync,
            health: observed.health.clone(),
            reconcile_error: result.as_ref().err().map(ToString::to_string),
        };

        let mut status = previous.cloned().unwrap_or_default();
        let changed = aggregate(&mut status.conditions, &facts, generation);
        if changed.contains(&ConditionType::ReplicaStartupSucceeded) && !facts.pod_errors.is_empty()
        {
            let listed: Vec<String> = facts
                .pod_errors
                .iter()
                .map(|(replica, why)| format!("{replica} ({why})"))
                .collect();
            events.push(PassEvent::warning(
                reason::REPLICA_ERROR,
                "Observe",
                format!("Replicas failed to start: {}", listed.join(", ")),
            ));
        }

        status.observed_generation = generation;
        status.configuration_revision = revisions.configuration.clone();
        status.stateful_set_revision = revisions.statefulset.clone();
        status.update_revision = revisions.statefulset.clone();
        if facts.out_of_sync.is_empty() {
            status.current_revision = revisions.statefulset.clone();
        }
        status.ready_replicas = i32::try_from(facts.ready).unwrap_or(i32::MAX);

        PassOutcome {
            status,
            events,
            desired_replicas: desired,
            held: observed.held,
            result,
        }
    }
}

fn failed_status(
    previous: Option<&ClusterStatus>,
    generation: Option<i64>,
    result: &Result<()>,
) -> ClusterStatus {
    let mut status = previous.cloned().unwrap_or_default();
    if let Err(e) = result {
        status.conditions.set(Condition::new(
            ConditionType::ReconcileSucceeded,
            false,
            reason::STEP_FAILED,
            e.to_string(),
            generation,
        ));
        status.conditions.set(Condition::new(
            ConditionType::Ready,
            false,
            reason::REPLICAS_NOT_READY,
            "Cluster is not ready",
            generation,
        ));
    }
    status
}

/// Record the revisions on a rendered workload and carry the restart marker.
///
/// A configuration change stamps a fresh marker so the pod restarts.
/// Otherwise the marker already on the live workload is kept, so an
/// unchanged replica renders to the same spec.
pub fn stamp_revisions(sts: &mut StatefulSet, state: &ReplicaState, revisions: &Revisions) {
    sts.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .extend(revisions.annotations());

    let restarted_at = if state.needs_restart(revisions) {
        Some(jiff::Timestamp::now().to_string())
    } else {
        state.restarted_at().map(str::to_string)
    };

    if let Some(restarted_at) = restarted_at
        && let Some(spec) = sts.spec.as_mut()
    {
        spec.template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_RESTARTED_AT.to_string(), restarted_at);
    }
}

/// Apply objects shared by every replica, such as Services and budgets.
///
/// Each object is applied even when an earlier one failed. Every failure is
/// published as an event and returned.
pub async fn apply_shared<K: ManagedResource>(
    store: &dyn ObjectStore<K>,
    owner: &OwnerReference,
    objects: impl IntoIterator<Item = K>,
    retry: &RetryConfig,
    events: &mut Vec<PassEvent>,
) -> Vec<Error> {
    let mut failures = Vec::new();
    for object in objects {
        let name = object.name_any();
        if let Err(error) = resource::apply(store, owner, object, &[], retry).await {
            warn!(kind = K::KIND, name = %name, error = %error, "Failed to apply shared object");
            events.push(PassEvent::warning(
                error.event_reason(),
                "ApplyShared",
                error.to_string(),
            ));
            failures.push(error);
        }
    }
    failures
}

/// Apply the ConfigMap and StatefulSet of every replica the plan allows.
///
/// Replicas are independent: a failing replica is recorded and the next
/// one is still applied. Replicas whose workload was written are marked
/// updated.
pub async fn apply_replicas<Id, F>(
    backends: &Backends,
    owner: &OwnerReference,
    tracker: &mut ReplicaTracker<Id>,
    plan: &RolloutPlan<Id>,
    revisions: &Revisions,
    events: &mut Vec<PassEvent>,
    render: F,
) -> Vec<ReplicaFailure>
where
    Id: ReplicaId,
    F: Fn(Id) -> Result<(ConfigMap, StatefulSet)>,
{
    let mut failures = Vec::new();
    let ids: Vec<Id> = tracker.ids().filter(|id| plan.allows(id)).collect();

    for id in ids {
        let Some(state) = tracker.get(&id) else {
            continue;
        };
        match apply_replica(backends, owner, state, revisions, render(id)).await {
            Ok(updated) => {
                if updated {
                    info!(replica = %id, "Replica workload updated");
                }
                if let Some(state) = tracker.get_mut(&id) {
                    state.updated = updated;
                }
            }
            Err(error) => {
                warn!(replica = %id, error = %error, "Failed to apply replica");
                events.push(PassEvent::warning(
                    error.event_reason(),
                    "ApplyReplica",
                    format!("Replica {id}: {error}"),
                ));
                failures.push(ReplicaFailure {
                    replica: id.to_string(),
                    error,
                });
            }
        }
    }

    failures
}

async fn apply_replica(
    backends: &Backends,
    owner: &OwnerReference,
    state: &ReplicaState,
    revisions: &Revisions,
    rendered: Result<(ConfigMap, StatefulSet)>,
) -> Result<bool> {
    let (config_map, mut statefulset) = rendered?;
    resource::apply(
        backends.stores.config_maps.as_ref(),
        owner,
        config_map,
        &[],
        &backends.retry,
    )
    .await?;

    stamp_revisions(&mut statefulset, state, revisions);
    resource::apply(
        backends.stores.statefulsets.as_ref(),
        owner,
        statefulset,
        &[],
        &backends.retry,
    )
    .await
}

/// Delete the workload and ConfigMap of a replica outside the topology.
pub async fn remove_replica<C: ClusterObject, Id: ReplicaId>(
    cluster: &C,
    backends: &Backends,
    id: Id,
    events: &mut Vec<PassEvent>,
) -> Result<()> {
    let name = replica_object_name(cluster, &id);
    info!(replica = %id, name = %name, "Removing replica outside the desired topology");

    let result = async {
        resource::delete(backends.stores.statefulsets.as_ref(), &name).await?;
        resource::delete(backends.stores.config_maps.as_ref(), &name).await
    }
    .await;

    match &result {
        Ok(()) => events.push(PassEvent::normal(
            "SuccessfulDelete",
            "ScaleDown",
            format!("Removed replica {id}"),
        )),
        Err(e) => events.push(PassEvent::warning(
            "FailedDelete",
            "ScaleDown",
            format!("Replica {id}: {e}"),
        )),
    }
    result
}

/// Turn fan-out failures into per-replica controller failures.
pub fn fanout_failures<Id, E>(error: FanoutError<Id, E>) -> Vec<ReplicaFailure>
where
    Id: ReplicaId,
    E: Into<Error> + std::fmt::Display,
{
    error
        .failures
        .into_iter()
        .map(|(id, failure)| ReplicaFailure {
            replica: id.to_string(),
            error: match failure {
                TaskError::Cancelled => Error::Command(CommandError::Cancelled),
                TaskError::Failed(e) => e.into(),
            },
        })
        .collect()
}

/// `Ok` when nothing failed, otherwise every failure of the pass.
pub fn into_result(failures: Vec<ReplicaFailure>) -> Result<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Replicas(failures))
    }
}

/// Fold shared-object and replica failures into the pass result.
pub fn into_pass_result(mut shared: Vec<Error>, replicas: Vec<ReplicaFailure>) -> Result<()> {
    if shared.is_empty() {
        return into_result(replicas);
    }
    if !replicas.is_empty() {
        shared.push(Error::Replicas(replicas));
    }
    Err(Error::Steps(shared))
}

/// Write the status, publish events, record metrics and choose the requeue.
pub async fn finish<K>(
    cluster: &K,
    ctx: &Context,
    outcome: PassOutcome,
    started: Instant,
) -> Result<Action>
where
    K: ClusterObject
        + Resource<Scope = NamespaceResourceScope>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug,
{
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());

    if cluster.cluster_status() != Some(&outcome.status) {
        debug!(name = %name, namespace = %namespace, "Updating status");
        let api: Api<K> = Api::namespaced(ctx.client.clone(), &namespace);
        let patch = serde_json::json!({ "status": outcome.status });
        if let Err(e) = api
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            // The pass error, if any, matters more than the status write.
            if outcome.result.is_ok() {
                return Err(e.into());
            }
            warn!(name = %name, error = %e, "Failed to update status");
        }
    }

    for event in &outcome.events {
        ctx.publish(cluster, event).await;
    }

    let ready = outcome.is_ready();
    if let Some(health_state) = &ctx.health_state {
        let labels = ClusterLabels::new(K::KIND_LABEL, &namespace, &name);
        health_state
            .metrics
            .record_reconcile(&labels, started.elapsed().as_secs_f64());
        health_state.metrics.set_cluster_state(
            &labels,
            ready,
            i64::try_from(outcome.desired_replicas).unwrap_or(i64::MAX),
            i64::from(outcome.status.ready_replicas),
            i64::try_from(outcome.held).unwrap_or(i64::MAX),
        );
    }

    outcome.result?;
    if ready {
        debug!(name = %name, namespace = %namespace, "Cluster converged");
        Ok(Action::requeue(REQUEUE_RESYNC))
    } else {
        debug!(name = %name, namespace = %namespace, "Cluster not converged yet");
        Ok(Action::requeue(REQUEUE_ON_REFRESH))
    }
}

/// Error policy for both controllers.
pub fn error_policy<K: ClusterObject>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    if let Some(health_state) = &ctx.health_state {
        health_state
            .metrics
            .record_error(&ClusterLabels::new(K::KIND_LABEL, &namespace, &name));
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, namespace = %namespace, error = %error, "Retryable error, will retry");
    } else {
        error!(name = %name, namespace = %namespace, error = %error, "Non-retryable error");
    }
    Action::requeue(error.requeue_after())
}
