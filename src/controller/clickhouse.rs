//! Reconciliation of ClickHouseCluster servers.
//!
//! Shards roll independently, each under its own disruption budget. The
//! operator talks to the servers through a [`Commander`] opened for the
//! pass: every replica is pinged for health, and once the cluster is
//! healthy and in sync, databases found on some replicas are created on the
//! others.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{Commander, CommandError, Credentials, DatabaseDescriptor};
use crate::controller::context::{Backends, Context, PassEvent};
use crate::controller::error::{Error, ReplicaFailure, Result};
use crate::controller::fanout::execute_parallel;
use crate::controller::reconciler::{
    Observed, Pass, PassOutcome, apply_replicas, apply_shared, fanout_failures, finish,
    into_pass_result, into_result, remove_replica,
};
use crate::controller::replica::{ReplicaTracker, RolloutStage};
use crate::controller::resource;
use crate::controller::revision::{
    Revisions, configuration_revision, sha256_hex, statefulset_revision,
};
use crate::controller::rollout::{AvailabilityGroup, ReplicaView, min_available, plan};
use crate::controller::status::HealthVerdict;
use crate::crd::{ClickHouseCluster, ClickHouseReplicaId, KeeperCluster, reason};
use crate::resources::clickhouse::{
    canonical, generate_clickhouse_config_map, generate_clickhouse_services,
    generate_clickhouse_statefulset, generate_shard_pdb, render_config, shard_pdb_name,
};
use crate::resources::owner_reference;
use crate::resources::pdb::shard_budget;
use crate::resources::secret::{
    OPERATOR_USER, PASSWORD_KEY, credentials_secret_name, generate_credentials_secret,
    generate_password, password_from_secret,
};

type DatabaseSet = BTreeMap<String, DatabaseDescriptor>;

/// Reconcile a ClickHouseCluster.
pub async fn reconcile(cluster: Arc<ClickHouseCluster>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    debug!(name = %name, namespace = %namespace, "Reconciling ClickHouseCluster");

    let backends = ctx.backends(&namespace);
    let cancel = ctx.shutdown.child_token();
    let outcome = sync(&cluster, &backends, &cancel).await;
    finish(cluster.as_ref(), &ctx, outcome, started).await
}

/// Run one pass without touching the status.
pub async fn sync(
    cluster: &ClickHouseCluster,
    backends: &Backends,
    cancel: &CancellationToken,
) -> PassOutcome {
    let mut pass = Pass::default();
    let result = run(cluster, backends, cancel, &mut pass).await;
    pass.into_outcome(cluster, result)
}

/// Revisions every replica should run, rendered from a one-replica copy.
///
/// The Keeper node list and the operator password hash are part of the
/// configuration, so either changing restarts the servers.
pub fn desired_revisions(
    cluster: &ClickHouseCluster,
    keeper: &KeeperCluster,
    password_sha256: &str,
) -> Result<Revisions> {
    let canonical = canonical(cluster);
    let id = ClickHouseReplicaId::new(0, 0);
    Ok(Revisions {
        configuration: configuration_revision(&render_config(
            &canonical,
            keeper,
            id,
            password_sha256,
        )?)?,
        statefulset: statefulset_revision(&generate_clickhouse_statefulset(&canonical, id))?,
    })
}

async fn run(
    cluster: &ClickHouseCluster,
    backends: &Backends,
    cancel: &CancellationToken,
    pass: &mut Pass<ClickHouseReplicaId>,
) -> Result<()> {
    let owner = owner_reference(cluster);
    let mut shared = apply_shared(
        backends.stores.services.as_ref(),
        &owner,
        generate_clickhouse_services(cluster),
        &backends.retry,
        &mut pass.events,
    )
    .await;
    shared.extend(
        apply_shared(
            backends.stores.pod_disruption_budgets.as_ref(),
            &owner,
            (0..cluster.shards()).map(|shard| generate_shard_pdb(cluster, shard)),
            &backends.retry,
            &mut pass.events,
        )
        .await,
    );

    let password = operator_password(cluster, backends, &owner).await?;
    let password_sha256 = sha256_hex(password.as_bytes());
    let keeper = keeper_cluster(cluster, backends).await?;

    let revisions = desired_revisions(cluster, &keeper, &password_sha256)?;
    let mut tracker =
        ReplicaTracker::observe(&backends.stores, cluster, cluster.replica_ids()).await?;

    let connector = backends.connectors.connector(
        cluster,
        Credentials {
            user: OPERATOR_USER.to_string(),
            password,
        },
    );
    let commander = Commander::new(connector, cancel.clone());

    ping_replicas(&commander, cancel, &mut tracker).await;
    let health = cluster_health(cluster, &tracker);
    debug!(reason = health.reason, message = %health.message, "Cluster health");

    let stages = tracker.stages(&revisions);
    let views: BTreeMap<_, _> = tracker
        .iter()
        .map(|(id, state)| {
            let stage = stages.get(id).copied().unwrap_or(RolloutStage::NotExists);
            (*id, ReplicaView::new(stage, state.is_ready()))
        })
        .collect();
    let plan = plan(&views, &shard_groups(cluster));

    let mut failures = apply_replicas(
        backends,
        &owner,
        &mut tracker,
        &plan,
        &revisions,
        &mut pass.events,
        |id| {
            Ok((
                generate_clickhouse_config_map(cluster, &keeper, id, &password_sha256)?,
                generate_clickhouse_statefulset(cluster, id),
            ))
        },
    )
    .await;

    if shared.is_empty() && failures.is_empty() {
        failures.extend(scale_down(cluster, backends, &mut tracker, &mut pass.events).await);
    }

    let in_sync = tracker
        .stages(&revisions)
        .values()
        .all(|stage| *stage == RolloutStage::UpToDate);
    let propagated = if shared.is_empty() && failures.is_empty() && health.healthy && in_sync {
        propagate_databases(cluster, &commander, cancel, &mut pass.events).await
    } else {
        Ok(())
    };
    commander.close().await;

    pass.observed = Some(Observed {
        revisions,
        tracker,
        health,
        held: plan.held.len(),
    });
    into_pass_result(shared, failures).and(propagated)
}

/// Read the operator password, creating the credentials Secret on first use.
///
/// An existing Secret is never rewritten.
async fn operator_password(
    cluster: &ClickHouseCluster,
    backends: &Backends,
    owner: &OwnerReference,
) -> Result<String> {
    let name = credentials_secret_name(cluster);
    let existing = backends
        .stores
        .secrets
        .get(&name)
        .await
        .map_err(|source| Error::Store {
            action: "get",
            kind: "Secret",
            name: name.clone(),
            source,
        })?;

    if let Some(secret) = existing {
        return password_from_secret(&secret)
            .ok_or_else(|| Error::MissingField(format!("{name}: {PASSWORD_KEY}")));
    }

    info!(secret = %name, "Creating operator credentials");
    let password = generate_password();
    resource::apply(
        backends.stores.secrets.as_ref(),
        owner,
        generate_credentials_secret(cluster, &password),
        &[],
        &backends.retry,
    )
    .await?;
    Ok(password)
}

async fn keeper_cluster(cluster: &ClickHouseCluster, backends: &Backends) -> Result<KeeperCluster> {
    let name = &cluster.spec.keeper_cluster_ref.name;
    if name.is_empty() {
        return Err(Error::Validation("keeperClusterRef.name must be set".to_string()));
    }
    backends
        .stores
        .keeper_clusters
        .get(name)
        .await
        .map_err(|source| Error::Store {
            action: "get",
            kind: "KeeperCluster",
            name: name.clone(),
            source,
        })?
        .ok_or_else(|| Error::KeeperNotFound(name.clone()))
}

/// Ping every existing replica and record which ones answered.
async fn ping_replicas(
    commander: &Commander,
    cancel: &CancellationToken,
    tracker: &mut ReplicaTracker<ClickHouseReplicaId>,
) {
    let existing: Vec<ClickHouseReplicaId> = tracker
        .iter()
        .filter(|(_, state)| state.exists())
        .map(|(id, _)| *id)
        .collect();

    let (results, error) = execute_parallel(existing, cancel, |id| commander.ping(id)).await;
    if let Some(error) = error {
        debug!(error = %error, "Some replicas did not answer ping");
    }
    for (id, answered) in results {
        if let Some(state) = tracker.get_mut(&id) {
            state.healthy = answered.is_some();
        }
    }
}

/// Healthy when every desired replica answered; otherwise names the shards
/// with a silent replica.
pub fn cluster_health(
    cluster: &ClickHouseCluster,
    tracker: &ReplicaTracker<ClickHouseReplicaId>,
) -> HealthVerdict {
    let lagging: BTreeSet<i32> = tracker
        .iter()
        .filter(|(_, state)| !state.healthy)
        .map(|(id, _)| id.shard_id)
        .collect();

    if lagging.is_empty() {
        HealthVerdict::healthy(
            reason::ALL_SHARDS_READY,
            format!("All {} shards are ready", cluster.shards()),
        )
    } else {
        let listed: Vec<String> = lagging.iter().map(ToString::to_string).collect();
        HealthVerdict::unhealthy(
            reason::SOME_SHARDS_NOT_READY,
            format!("Shards not ready: {}", listed.join(", ")),
        )
    }
}

/// One availability group per shard, sized by the shard budget.
pub fn shard_groups(cluster: &ClickHouseCluster) -> Vec<AvailabilityGroup<ClickHouseReplicaId>> {
    let replicas = cluster.replicas();
    let budget = shard_budget(&cluster.spec.pod_disruption_budget, replicas);
    (0..cluster.shards())
        .map(|shard| AvailabilityGroup {
            members: cluster.shard_replica_ids(shard),
            min_available: min_available(&budget, replicas),
        })
        .collect()
}

/// Remove replicas outside the topology and the budgets of removed shards.
async fn scale_down(
    cluster: &ClickHouseCluster,
    backends: &Backends,
    tracker: &mut ReplicaTracker<ClickHouseReplicaId>,
    events: &mut Vec<PassEvent>,
) -> Vec<ReplicaFailure> {
    let orphans: Vec<ClickHouseReplicaId> = tracker.orphans().keys().copied().collect();
    let mut failures = Vec::new();
    let mut removed_shards = BTreeSet::new();

    for id in orphans {
        match remove_replica(cluster, backends, id, events).await {
            Ok(()) => {
                tracker.forget_orphan(&id);
                if id.shard_id >= cluster.shards() {
                    removed_shards.insert(id.shard_id);
                }
            }
            Err(error) => failures.push(ReplicaFailure {
                replica: id.to_string(),
                error,
            }),
        }
    }

    for shard in removed_shards {
        let name = shard_pdb_name(cluster, shard);
        if tracker.orphans().keys().any(|id| id.shard_id == shard) {
            continue;
        }
        info!(shard, name = %name, "Removing budget of removed shard");
        if let Err(error) =
            resource::delete(backends.stores.pod_disruption_budgets.as_ref(), &name).await
        {
            failures.push(ReplicaFailure {
                replica: format!("shard {shard}"),
                error,
            });
        }
    }

    failures
}

/// Union of the databases found on any replica.
pub fn database_union<'a>(listed: impl IntoIterator<Item = &'a DatabaseSet>) -> DatabaseSet {
    let mut union = DatabaseSet::new();
    for databases in listed {
        for (name, descriptor) in databases {
            union
                .entry(name.clone())
                .or_insert_with(|| descriptor.clone());
        }
    }
    union
}

/// Create every database some replica has on the replicas missing it, then
/// sync the shards that received new databases.
///
/// A replica that fails to list or create is reported with a warning event;
/// the others still get their databases and shard sync.
async fn propagate_databases(
    cluster: &ClickHouseCluster,
    commander: &Commander,
    cancel: &CancellationToken,
    events: &mut Vec<PassEvent>,
) -> Result<()> {
    let (listed, error) =
        execute_parallel(cluster.replica_ids(), cancel, |id| commander.databases(id)).await;
    if let Some(error) = error {
        let failures = fanout_failures(error);
        warn_failures(events, "ListDatabases", &failures);
        return into_result(failures);
    }

    let union = database_union(listed.values().flatten());
    let missing: BTreeMap<ClickHouseReplicaId, DatabaseSet> = listed
        .iter()
        .filter_map(|(id, databases)| {
            let databases = databases.as_ref()?;
            let absent: DatabaseSet = union
                .iter()
                .filter(|(name, _)| !databases.contains_key(*name))
                .map(|(name, descriptor)| (name.clone(), descriptor.clone()))
                .collect();
            (!absent.is_empty()).then_some((*id, absent))
        })
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let missing_ref = &missing;
    let (created, error) = execute_parallel(missing.keys().copied(), cancel, |id| async move {
        match missing_ref.get(&id) {
            Some(databases) => commander.create_databases(id, databases).await,
            None => Ok(()),
        }
    })
    .await;
    let failures = error.map(fanout_failures).unwrap_or_default();
    warn_failures(events, "CreateDatabases", &failures);

    let mut shards = BTreeSet::new();
    for (id, databases) in &missing {
        if !matches!(created.get(id), Some(Some(()))) {
            continue;
        }
        let names: Vec<&str> = databases.keys().map(String::as_str).collect();
        info!(replica = %id, databases = ?names, "Created missing databases");
        events.push(PassEvent::normal(
            "DatabasesCreated",
            "PropagateDatabases",
            format!("Replica {id}: created {}", names.join(", ")),
        ));
        shards.insert(id.shard_id);
    }

    let mut sync_failures = Vec::new();
    for shard in shards {
        if let Err(e) = commander.sync_shard(&cluster.shard_replica_ids(shard)).await {
            warn!(shard, error = %e, "Shard sync failed");
            sync_failures.push(e);
        }
    }

    into_result(failures)?;
    CommandError::combine(sync_failures).map_or(Ok(()), |e| Err(e.into()))
}

fn warn_failures(events: &mut Vec<PassEvent>, action: &'static str, failures: &[ReplicaFailure]) {
    for failure in failures {
        warn!(
            replica = %failure.replica,
            error = %failure.error,
            action,
            "Database propagation failed"
        );
        events.push(PassEvent::warning(
            "DatabasePropagationFailed",
            action,
            format!("Replica {}: {}", failure.replica, failure.error),
        ));
    }
}
