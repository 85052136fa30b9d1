//! KeeperCluster passes: creation, convergence, quorum-safe rollouts and
//! scale-down.

use clickhouse_operator::client::KeeperMode;
use clickhouse_operator::controller::error::Error;
use clickhouse_operator::controller::keeper::{self, desired_revisions};
use clickhouse_operator::controller::reconciler::PassOutcome;
use clickhouse_operator::controller::revision::Revisions;
use clickhouse_operator::crd::{ConditionType, KeeperCluster, KeeperReplicaId, reason};

use crate::{
    World, bump_generation, container_image, event_reasons, keeper_cluster, restart_marker,
    restart_markers,
};

async fn pass(world: &World, cluster: &mut KeeperCluster) -> PassOutcome {
    let outcome = keeper::sync(cluster, &world.backends(), &world.cancel).await;
    cluster.status = Some(outcome.status.clone());
    outcome
}

/// Create the ensemble and bring it to Ready.
async fn converged(world: &World, replicas: i32) -> KeeperCluster {
    let mut cluster = keeper_cluster("keeper", replicas);
    pass(world, &mut cluster).await;
    world.mark_all_ready();
    world.elect_leader(&cluster);
    let outcome = pass(world, &mut cluster).await;
    assert!(outcome.is_ready(), "{:?}", outcome.status.conditions);
    cluster
}

#[tokio::test]
async fn test_creation_pass() {
    let world = World::new();
    let mut cluster = keeper_cluster("keeper", 3);

    let outcome = pass(&world, &mut cluster).await;

    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    assert_eq!(world.statefulsets.len(), 3);
    assert_eq!(world.config_maps.len(), 3);
    assert_eq!(world.services.len(), 2);
    assert_eq!(world.pdbs.len(), 1);
    assert_eq!(outcome.desired_replicas, 3);

    let revisions = desired_revisions(&cluster).unwrap();
    for id in cluster.replica_ids() {
        let sts = world
            .statefulsets
            .fetch(&format!("keeper-keeper-{id}"))
            .unwrap();
        assert_eq!(Revisions::recorded_on(&sts), Some(revisions.clone()));
        assert_eq!(restart_marker(&sts), None);
    }

    let conditions = &outcome.status.conditions;
    assert!(conditions.is_true(ConditionType::ReconcileSucceeded));
    assert_eq!(
        conditions.reason(ConditionType::ClusterSizeAligned),
        Some(reason::SCALING_UP)
    );
    assert_eq!(conditions.reason(ConditionType::Healthy), Some(reason::NO_LEADER));
    assert!(!outcome.is_ready());
    assert_eq!(outcome.status.configuration_revision, revisions.configuration);
    assert_eq!(outcome.status.observed_generation, Some(1));
}

#[tokio::test]
async fn test_failed_service_does_not_block_replicas() {
    let world = World::new();
    world.services.fail_writes("keeper-keeper-headless");
    let mut cluster = keeper_cluster("keeper", 3);

    let outcome = pass(&world, &mut cluster).await;

    assert!(
        matches!(&outcome.result, Err(Error::Steps(errors)) if errors.len() == 1),
        "{:?}",
        outcome.result
    );
    assert!(outcome.result.as_ref().unwrap_err().is_retryable());
    assert_eq!(world.services.names(), vec!["keeper-keeper"]);
    assert_eq!(world.pdbs.len(), 1);
    assert_eq!(world.statefulsets.len(), 3);
    assert!(event_reasons(&outcome).contains(&"FailedCreate"));
    assert!(
        !outcome
            .status
            .conditions
            .is_true(ConditionType::ReconcileSucceeded)
    );

    world.services.restore("keeper-keeper-headless");
    let outcome = pass(&world, &mut cluster).await;
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    assert_eq!(world.services.len(), 2);
}

#[tokio::test]
async fn test_converged_pass_writes_nothing() {
    let world = World::new();
    let mut cluster = converged(&world, 3).await;
    let writes = (
        world.statefulsets.writes(),
        world.config_maps.writes(),
        world.services.writes(),
        world.pdbs.writes(),
    );

    let outcome = pass(&world, &mut cluster).await;

    assert!(outcome.is_ready());
    assert_eq!(
        writes,
        (
            world.statefulsets.writes(),
            world.config_maps.writes(),
            world.services.writes(),
            world.pdbs.writes(),
        )
    );
    assert_eq!(
        outcome.status.conditions.reason(ConditionType::Healthy),
        Some(reason::CLUSTER_READY)
    );
    assert_eq!(
        outcome.status.current_revision,
        outcome.status.update_revision
    );
    assert_eq!(outcome.status.ready_replicas, 3);
}

#[tokio::test]
async fn test_standalone_member() {
    let world = World::new();
    let cluster = converged(&world, 1).await;
    assert_eq!(
        cluster
            .status
            .as_ref()
            .unwrap()
            .conditions
            .reason(ConditionType::Healthy),
        Some(reason::STANDALONE_READY)
    );
}

#[tokio::test]
async fn test_configuration_change_rolls_one_member_at_a_time() {
    let world = World::new();
    let mut cluster = converged(&world, 3).await;

    cluster.spec.logger.level = "debug".to_string();
    bump_generation(&mut cluster);

    let outcome = pass(&world, &mut cluster).await;
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    assert_eq!(outcome.held, 2);
    let markers = restart_markers(&world);
    assert!(markers["keeper-keeper-0"].is_some());
    assert!(markers["keeper-keeper-1"].is_none());
    assert!(markers["keeper-keeper-2"].is_none());
    assert_eq!(
        outcome
            .status
            .conditions
            .reason(ConditionType::ConfigurationInSync),
        Some(reason::CONFIGURATION_CHANGED)
    );

    // The restarted member has not come back: nothing else may go down.
    let writes = world.statefulsets.writes();
    let outcome = pass(&world, &mut cluster).await;
    assert_eq!(outcome.held, 2);
    assert_eq!(world.statefulsets.writes(), writes);
    assert_eq!(restart_markers(&world), markers);

    world.mark_all_ready();
    let outcome = pass(&world, &mut cluster).await;
    assert_eq!(outcome.held, 1);
    assert!(restart_markers(&world)["keeper-keeper-1"].is_some());

    world.mark_all_ready();
    let outcome = pass(&world, &mut cluster).await;
    assert_eq!(outcome.held, 0);

    world.mark_all_ready();
    let outcome = pass(&world, &mut cluster).await;
    assert!(outcome.is_ready(), "{:?}", outcome.status.conditions);
    assert!(restart_markers(&world).values().all(Option::is_some));
}

#[tokio::test]
async fn test_image_change_does_not_stamp_restart() {
    let world = World::new();
    let mut cluster = converged(&world, 3).await;

    cluster.spec.image.tag = "25.8".to_string();
    bump_generation(&mut cluster);
    let outcome = pass(&world, &mut cluster).await;

    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    let sts = world.statefulsets.fetch("keeper-keeper-0").unwrap();
    assert_eq!(
        container_image(&sts).as_deref(),
        Some("clickhouse/clickhouse-keeper:25.8")
    );
    assert_eq!(restart_marker(&sts), None);
    let untouched = world.statefulsets.fetch("keeper-keeper-1").unwrap();
    assert_eq!(
        container_image(&untouched).as_deref(),
        Some("clickhouse/clickhouse-keeper:25.3")
    );
}

#[tokio::test]
async fn test_restart_marker_survives_later_passes() {
    let world = World::new();
    let mut cluster = converged(&world, 1).await;

    cluster.spec.logger.level = "trace".to_string();
    bump_generation(&mut cluster);
    pass(&world, &mut cluster).await;
    let marker = restart_markers(&world)["keeper-keeper-0"].clone();
    assert!(marker.is_some());

    world.mark_all_ready();
    pass(&world, &mut cluster).await;
    pass(&world, &mut cluster).await;
    assert_eq!(restart_markers(&world)["keeper-keeper-0"], marker);
}

#[tokio::test]
async fn test_write_conflicts_are_retried() {
    let world = World::new();
    let mut cluster = converged(&world, 1).await;

    cluster.spec.image.tag = "25.8".to_string();
    bump_generation(&mut cluster);
    world.statefulsets.fail_next_replaces(2);
    let outcome = pass(&world, &mut cluster).await;

    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    let sts = world.statefulsets.fetch("keeper-keeper-0").unwrap();
    assert_eq!(
        container_image(&sts).as_deref(),
        Some("clickhouse/clickhouse-keeper:25.8")
    );
}

#[tokio::test]
async fn test_replica_failure_is_reported_per_replica() {
    let world = World::new();
    let mut cluster = converged(&world, 1).await;

    cluster.spec.image.tag = "25.8".to_string();
    bump_generation(&mut cluster);
    world.statefulsets.fail_next_replaces(10);
    let outcome = pass(&world, &mut cluster).await;

    let error = outcome.result.as_ref().unwrap_err().to_string();
    assert!(error.contains("replica 0"), "{error}");
    assert!(event_reasons(&outcome).contains(&"FailedUpdate"));
    assert!(
        !outcome
            .status
            .conditions
            .is_true(ConditionType::ReconcileSucceeded)
    );
    // The failure did not hide what was observed.
    assert_eq!(outcome.desired_replicas, 1);
}

#[tokio::test]
async fn test_failure_before_observation_keeps_previous_conditions() {
    let world = World::new();
    let mut cluster = converged(&world, 3).await;

    cluster
        .spec
        .labels
        .insert("team".to_string(), "storage".to_string());
    bump_generation(&mut cluster);
    world.services.fail_next_replaces(10);
    let outcome = pass(&world, &mut cluster).await;

    assert!(outcome.result.is_err());
    let conditions = &outcome.status.conditions;
    assert_eq!(
        conditions.reason(ConditionType::ReconcileSucceeded),
        Some(reason::STEP_FAILED)
    );
    assert!(!conditions.is_true(ConditionType::Ready));
    assert!(conditions.is_true(ConditionType::Healthy));
    assert!(conditions.is_true(ConditionType::ConfigurationInSync));
    assert_eq!(outcome.status.observed_generation, Some(1));
    assert!(event_reasons(&outcome).contains(&"FailedUpdate"));
}

#[tokio::test]
async fn test_pod_error_is_surfaced() {
    let world = World::new();
    let mut cluster = converged(&world, 3).await;

    world.fail_pod(&cluster, KeeperReplicaId(1), "CrashLoopBackOff");
    let outcome = pass(&world, &mut cluster).await;

    let conditions = &outcome.status.conditions;
    assert_eq!(
        conditions.reason(ConditionType::ReplicaStartupSucceeded),
        Some(reason::REPLICA_ERROR)
    );
    assert!(
        conditions
            .get(ConditionType::ReplicaStartupSucceeded)
            .unwrap()
            .message
            .contains("1 (CrashLoopBackOff)")
    );
    assert!(!outcome.is_ready());
    assert!(event_reasons(&outcome).contains(&reason::REPLICA_ERROR));

    // The event fires on the transition only.
    let outcome = pass(&world, &mut cluster).await;
    assert!(!event_reasons(&outcome).contains(&reason::REPLICA_ERROR));
}

#[tokio::test]
async fn test_split_brain_is_unhealthy() {
    let world = World::new();
    let mut cluster = converged(&world, 3).await;

    world.set_keeper_modes(
        &cluster,
        &[KeeperMode::Leader, KeeperMode::Leader, KeeperMode::Follower],
    );
    let outcome = pass(&world, &mut cluster).await;

    assert_eq!(
        outcome.status.conditions.reason(ConditionType::Healthy),
        Some(reason::INCONSISTENT_STATE)
    );
    assert!(!outcome.is_ready());
}

#[tokio::test]
async fn test_scale_down_removes_one_member_per_pass() {
    let world = World::new();
    let mut cluster = converged(&world, 5).await;

    cluster.spec.replicas = 3;
    bump_generation(&mut cluster);
    world.elect_leader(&cluster);

    let outcome = pass(&world, &mut cluster).await;
    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    assert!(world.statefulsets.fetch("keeper-keeper-4").is_none());
    assert!(world.config_maps.fetch("keeper-keeper-4").is_none());
    assert!(world.statefulsets.fetch("keeper-keeper-3").is_some());
    assert!(event_reasons(&outcome).contains(&"SuccessfulDelete"));
    assert_eq!(
        outcome
            .status
            .conditions
            .reason(ConditionType::ClusterSizeAligned),
        Some(reason::SCALING_DOWN)
    );

    let outcome = pass(&world, &mut cluster).await;
    assert!(event_reasons(&outcome).contains(&"SuccessfulDelete"));
    assert!(world.statefulsets.fetch("keeper-keeper-3").is_none());
    assert_eq!(world.statefulsets.len(), 3);

    let outcome = pass(&world, &mut cluster).await;
    assert!(outcome.is_ready(), "{:?}", outcome.status.conditions);
}

#[tokio::test]
async fn test_scale_down_waits_for_rollout() {
    let world = World::new();
    let mut cluster = converged(&world, 3).await;

    cluster.spec.replicas = 2;
    cluster.spec.logger.level = "debug".to_string();
    bump_generation(&mut cluster);
    world.elect_leader(&cluster);

    let outcome = pass(&world, &mut cluster).await;
    assert_eq!(outcome.held, 1);
    assert!(world.statefulsets.fetch("keeper-keeper-2").is_some());
    assert!(!event_reasons(&outcome).contains(&"SuccessfulDelete"));
}
