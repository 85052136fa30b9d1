//! Reconciliation of KeeperCluster ensembles.
//!
//! Every pass applies the ensemble-wide objects, observes the replicas,
//! probes each server for its Raft role and rolls pending changes one
//! member at a time so the ensemble never drops below a majority.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::KeeperMode;
use crate::controller::context::{Backends, Context};
use crate::controller::error::{Result, ReplicaFailure};
use crate::controller::fanout::execute_parallel;
use crate::controller::reconciler::{
    Observed, Pass, PassOutcome, apply_replicas, apply_shared, finish, into_pass_result,
    remove_replica,
};
use crate::controller::replica::{ReplicaTracker, RolloutStage};
use crate::controller::revision::{Revisions, configuration_revision, statefulset_revision};
use crate::controller::rollout::{AvailabilityGroup, ReplicaView, plan};
use crate::controller::status::HealthVerdict;
use crate::crd::{KeeperCluster, KeeperReplicaId, reason};
use crate::resources::keeper::{
    canonical, generate_keeper_config_map, generate_keeper_pdb, generate_keeper_services,
    generate_keeper_statefulset, render_config,
};
use crate::resources::owner_reference;

/// Reconcile a KeeperCluster.
pub async fn reconcile(cluster: Arc<KeeperCluster>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    debug!(name = %name, namespace = %namespace, "Reconciling KeeperCluster");

    let backends = ctx.backends(&namespace);
    let cancel = ctx.shutdown.child_token();
    let outcome = sync(&cluster, &backends, &cancel).await;
    finish(cluster.as_ref(), &ctx, outcome, started).await
}

/// Run one pass without touching the status.
pub async fn sync(
    cluster: &KeeperCluster,
    backends: &Backends,
    cancel: &CancellationToken,
) -> PassOutcome {
    let mut pass = Pass::default();
    let result = run(cluster, backends, cancel, &mut pass).await;
    pass.into_outcome(cluster, result)
}

/// Revisions every member should run, rendered from a one-member copy.
pub fn desired_revisions(cluster: &KeeperCluster) -> Result<Revisions> {
    let canonical = canonical(cluster);
    let id = KeeperReplicaId(0);
    Ok(Revisions {
        configuration: configuration_revision(&render_config(&canonical, id)?)?,
        statefulset: statefulset_revision(&generate_keeper_statefulset(&canonical, id))?,
    })
}

async fn run(
    cluster: &KeeperCluster,
    backends: &Backends,
    cancel: &CancellationToken,
    pass: &mut Pass<KeeperReplicaId>,
) -> Result<()> {
    let owner = owner_reference(cluster);
    let mut shared = apply_shared(
        backends.stores.services.as_ref(),
        &owner,
        generate_keeper_services(cluster),
        &backends.retry,
        &mut pass.events,
    )
    .await;
    shared.extend(
        apply_shared(
            backends.stores.pod_disruption_budgets.as_ref(),
            &owner,
            [generate_keeper_pdb(cluster)],
            &backends.retry,
            &mut pass.events,
        )
        .await,
    );

    let revisions = desired_revisions(cluster)?;
    let mut tracker =
        ReplicaTracker::observe(&backends.stores, cluster, cluster.replica_ids()).await?;

    let modes = probe_modes(cluster, backends, cancel, &mut tracker).await;
    let health = ensemble_health(cluster.replica_ids().len(), &modes);
    debug!(reason = health.reason, message = %health.message, "Ensemble health");

    let stages = tracker.stages(&revisions);
    let views: BTreeMap<_, _> = tracker
        .iter()
        .map(|(id, state)| {
            let stage = stages.get(id).copied().unwrap_or(RolloutStage::NotExists);
            (*id, ReplicaView::new(stage, state.is_ready()))
        })
        .collect();
    let groups = [AvailabilityGroup {
        members: cluster.replica_ids(),
        min_available: cluster.quorum(),
    }];
    let plan = plan(&views, &groups);

    let mut failures = apply_replicas(
        backends,
        &owner,
        &mut tracker,
        &plan,
        &revisions,
        &mut pass.events,
        |id| {
            Ok((
                generate_keeper_config_map(cluster, id)?,
                generate_keeper_statefulset(cluster, id),
            ))
        },
    )
    .await;

    // Members leave one at a time, and only from a settled ensemble.
    let settled = shared.is_empty()
        && failures.is_empty()
        && plan.held.is_empty()
        && tracker
            .stages(&revisions)
            .values()
            .all(|stage| *stage == RolloutStage::UpToDate);
    if let Some(id) = tracker.orphans().keys().next_back().copied() {
        if settled {
            match remove_replica(cluster, backends, id, &mut pass.events).await {
                Ok(()) => tracker.forget_orphan(&id),
                Err(error) => failures.push(ReplicaFailure {
                    replica: id.to_string(),
                    error,
                }),
            }
        } else {
            info!(replica = %id, "Deferring scale-down until the ensemble settles");
        }
    }

    pass.observed = Some(Observed {
        revisions,
        tracker,
        health,
        held: plan.held.len(),
    });
    into_pass_result(shared, failures)
}

/// Ask every existing member for its server mode.
///
/// Members that do not answer are left unhealthy; probe failures never fail
/// the pass.
async fn probe_modes(
    cluster: &KeeperCluster,
    backends: &Backends,
    cancel: &CancellationToken,
    tracker: &mut ReplicaTracker<KeeperReplicaId>,
) -> Vec<KeeperMode> {
    let existing: Vec<KeeperReplicaId> = tracker
        .iter()
        .filter(|(_, state)| state.exists())
        .map(|(id, _)| *id)
        .collect();

    let probe = &backends.keeper_probe;
    let (results, error) = execute_parallel(existing, cancel, |id| {
        let hostname = cluster.hostname(id);
        async move { probe.server_mode(&hostname).await }
    })
    .await;
    if let Some(error) = error {
        debug!(error = %error, "Some Keeper members did not answer");
    }

    let mut modes = Vec::new();
    for (id, mode) in results {
        let Some(mode) = mode else {
            continue;
        };
        if let Some(state) = tracker.get_mut(&id) {
            state.healthy = true;
            state.mode = Some(mode.to_string());
        }
        modes.push(mode);
    }
    modes
}

/// Classify the ensemble from the modes reported by its members.
pub fn ensemble_health(replicas: usize, modes: &[KeeperMode]) -> HealthVerdict {
    if replicas == 1 && modes == [KeeperMode::Standalone] {
        return HealthVerdict::healthy(reason::STANDALONE_READY, "Standalone member is serving");
    }

    let leaders = modes.iter().filter(|m| **m == KeeperMode::Leader).count();
    let followers = modes.iter().filter(|m| **m == KeeperMode::Follower).count();
    let others = modes.len() - leaders - followers;
    let wanted_followers = replicas.saturating_sub(1);

    if leaders == 0 {
        HealthVerdict::unhealthy(reason::NO_LEADER, "No member reports the leader role")
    } else if leaders > 1 || others > 0 {
        HealthVerdict::unhealthy(
            reason::INCONSISTENT_STATE,
            format!("{leaders} leaders, {followers} followers, {others} in other modes"),
        )
    } else if followers < wanted_followers {
        HealthVerdict::unhealthy(
            reason::NOT_ENOUGH_FOLLOWERS,
            format!("{followers}/{wanted_followers} followers"),
        )
    } else {
        HealthVerdict::healthy(
            reason::CLUSTER_READY,
            format!("Leader and {followers} followers"),
        )
    }
}
