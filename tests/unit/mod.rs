// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for clickhouse-operator.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components in isolation through the public API.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use clickhouse_operator::crd::{
    ClickHouseCluster, ClickHouseClusterSpec, KeeperCluster, KeeperClusterRef, KeeperClusterSpec,
};

fn metadata(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some("test-ns".to_string()),
        uid: Some(format!("{name}-uid")),
        generation: Some(1),
        ..Default::default()
    }
}

fn keeper(replicas: i32) -> KeeperCluster {
    KeeperCluster {
        metadata: metadata("test"),
        spec: KeeperClusterSpec {
            replicas,
            ..Default::default()
        },
        status: None,
    }
}

fn clickhouse(shards: i32, replicas: i32) -> ClickHouseCluster {
    ClickHouseCluster {
        metadata: metadata("test"),
        spec: ClickHouseClusterSpec {
            shards,
            replicas,
            keeper_cluster_ref: KeeperClusterRef {
                name: "test".to_string(),
            },
            ..Default::default()
        },
        status: None,
    }
}

mod crd_tests {
    use super::*;
    use clickhouse_operator::crd::{
        ClickHouseReplicaId, Condition, ConditionList, ConditionType, KeeperReplicaId, ReplicaId,
        STATUS_FALSE, STATUS_TRUE, STATUS_UNKNOWN,
    };

    #[test]
    fn test_keeper_hostname() {
        let cluster = keeper(3);
        assert_eq!(
            cluster.hostname(KeeperReplicaId(0)),
            "test-keeper-0-0.test-keeper-headless.test-ns.svc.cluster.local"
        );
    }

    #[test]
    fn test_clickhouse_hostname_with_custom_domain() {
        let mut cluster = clickhouse(2, 3);
        cluster.spec.cluster_domain = "k8s.example.com".to_string();
        assert_eq!(
            cluster.hostname(ClickHouseReplicaId::new(1, 2)),
            "test-clickhouse-1-2-0.test-clickhouse-headless.test-ns.svc.k8s.example.com"
        );
    }

    #[test]
    fn test_spec_defaults() {
        let keeper = KeeperClusterSpec::default();
        assert_eq!(keeper.replicas, 3);
        assert_eq!(keeper.image.reference(), "clickhouse/clickhouse-keeper:25.3");

        let clickhouse = ClickHouseClusterSpec::default();
        assert_eq!(clickhouse.shards, 1);
        assert_eq!(
            clickhouse.image.reference(),
            "clickhouse/clickhouse-server:25.3"
        );
    }

    #[test]
    fn test_keeper_quorum() {
        for (replicas, quorum) in [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3)] {
            assert_eq!(keeper(replicas).quorum(), quorum, "replicas={replicas}");
        }
    }

    #[test]
    fn test_replica_ids_are_ordered_by_shard() {
        let ids = clickhouse(2, 2).replica_ids();
        assert_eq!(
            ids,
            vec![
                ClickHouseReplicaId::new(0, 0),
                ClickHouseReplicaId::new(0, 1),
                ClickHouseReplicaId::new(1, 0),
                ClickHouseReplicaId::new(1, 1),
            ]
        );
    }

    #[test]
    fn test_replica_id_recovered_from_labels() {
        let id = ClickHouseReplicaId::new(3, 1);
        assert_eq!(ClickHouseReplicaId::from_labels(&id.labels()), Some(id));

        let member = KeeperReplicaId(4);
        assert_eq!(KeeperReplicaId::from_labels(&member.labels()), Some(member));
        assert_eq!(member.server_id(), 5);

        assert_eq!(KeeperReplicaId::from_labels(&Default::default()), None);
    }

    #[test]
    fn test_condition_type_display() {
        let names: Vec<String> = ConditionType::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            vec![
                "ReconcileSucceeded",
                "ReplicaStartupSucceeded",
                "Healthy",
                "ClusterSizeAligned",
                "ConfigurationInSync",
                "Ready",
            ]
        );
    }

    #[test]
    fn test_condition_status_strings() {
        let healthy = Condition::new(ConditionType::Healthy, true, "ClusterReady", "ok", Some(2));
        assert_eq!(healthy.r#type, "Healthy");
        assert_eq!(healthy.status, STATUS_TRUE);
        assert_eq!(healthy.observed_generation, Some(2));

        let not_ready = Condition::new(ConditionType::Ready, false, "ReplicasNotReady", "", None);
        assert_eq!(not_ready.status, STATUS_FALSE);

        let unknown = Condition::unknown(ConditionType::Healthy, "Probing", "", None);
        assert_eq!(unknown.status, STATUS_UNKNOWN);
        assert!(!unknown.is_true());
    }

    #[test]
    fn test_condition_list_keeps_transition_time_on_same_status() {
        let mut conditions = ConditionList::default();
        let mut first = Condition::new(ConditionType::Healthy, false, "NoLeader", "a", Some(1));
        first.last_transition_time = "2026-01-01T00:00:00Z".to_string();
        assert!(conditions.set(first));

        // Same state, newer generation: nothing visible changes.
        let again = Condition::new(ConditionType::Healthy, false, "NoLeader", "a", Some(2));
        assert!(!conditions.set(again));
        let stored = conditions.get(ConditionType::Healthy).unwrap();
        assert_eq!(stored.observed_generation, Some(2));

        // New reason, same status: the transition time stays.
        let reworded =
            Condition::new(ConditionType::Healthy, false, "InconsistentState", "b", Some(2));
        assert!(conditions.set(reworded));
        let stored = conditions.get(ConditionType::Healthy).unwrap();
        assert_eq!(stored.reason, "InconsistentState");
        assert_eq!(stored.last_transition_time, "2026-01-01T00:00:00Z");

        // Status flip: the transition time moves.
        let healthy = Condition::new(ConditionType::Healthy, true, "ClusterReady", "c", Some(2));
        assert!(conditions.set(healthy));
        let stored = conditions.get(ConditionType::Healthy).unwrap();
        assert_ne!(stored.last_transition_time, "2026-01-01T00:00:00Z");
        assert_eq!(conditions.len(), 1);
    }
}

mod resources_tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    use clickhouse_operator::crd::{
        ClickHouseReplicaId, IntOrPercent, KeeperReplicaId, PodDisruptionBudgetSpec,
    };
    use clickhouse_operator::resources::clickhouse::{generate_shard_pdb, shard_pdb_name};
    use clickhouse_operator::resources::common::{
        LABEL_APP, LABEL_KIND, LABEL_SHARD_ID, resource_prefix, selector_labels,
    };
    use clickhouse_operator::resources::configmap::apply_overlay;
    use clickhouse_operator::resources::keeper::{
        generate_keeper_pdb, generate_keeper_services, generate_keeper_statefulset,
    };
    use clickhouse_operator::resources::pdb::{ensemble_budget, shard_budget};

    #[test]
    fn test_resource_prefix() {
        assert_eq!(resource_prefix(&keeper(3)), "test-keeper");
        assert_eq!(resource_prefix(&clickhouse(1, 1)), "test-clickhouse");
    }

    #[test]
    fn test_selector_labels() {
        let labels = selector_labels(&keeper(3));
        assert_eq!(labels[LABEL_APP], "test-keeper");
        assert_eq!(labels[LABEL_KIND], "clickhouse-keeper");
        assert_eq!(labels.len(), 2);
    }

    #[test]
    fn test_replica_statefulset_has_one_pod() {
        let cluster = keeper(3);
        let sts = generate_keeper_statefulset(&cluster, KeeperReplicaId(2));
        assert_eq!(sts.metadata.name.as_deref(), Some("test-keeper-2"));

        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.service_name.as_deref(), Some("test-keeper-headless"));
        let selector = spec.selector.match_labels.unwrap();
        assert_eq!(selector[LABEL_APP], "test-keeper");
    }

    #[test]
    fn test_headless_service_publishes_unready_addresses() {
        let [headless, client] = generate_keeper_services(&keeper(3));

        assert_eq!(headless.metadata.name.as_deref(), Some("test-keeper-headless"));
        let spec = headless.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));

        assert_eq!(client.metadata.name.as_deref(), Some("test-keeper"));
        assert_ne!(client.spec.unwrap().cluster_ip.as_deref(), Some("None"));
    }

    #[test]
    fn test_budget_defaults() {
        assert_eq!(
            ensemble_budget(&PodDisruptionBudgetSpec::default(), 5).max_unavailable,
            Some(IntOrPercent::Int(2))
        );
        assert_eq!(
            shard_budget(&PodDisruptionBudgetSpec::default(), 2).min_available,
            Some(IntOrPercent::Int(1))
        );
        assert_eq!(
            shard_budget(&PodDisruptionBudgetSpec::default(), 1).max_unavailable,
            Some(IntOrPercent::Int(1))
        );
    }

    #[test]
    fn test_keeper_pdb_spans_the_ensemble() {
        let pdb = generate_keeper_pdb(&keeper(3));
        assert_eq!(pdb.metadata.name.as_deref(), Some("test-keeper"));
        let spec = pdb.spec.unwrap();
        assert_eq!(spec.max_unavailable, Some(IntOrString::Int(1)));
        assert_eq!(spec.min_available, None);
    }

    #[test]
    fn test_shard_pdb_selects_one_shard() {
        let mut cluster = clickhouse(2, 3);
        cluster.spec.pod_disruption_budget = PodDisruptionBudgetSpec {
            min_available: None,
            max_unavailable: Some(IntOrPercent::Percent("50%".to_string())),
        };

        let pdb = generate_shard_pdb(&cluster, 1);
        assert_eq!(pdb.metadata.name, Some(shard_pdb_name(&cluster, 1)));
        assert_eq!(shard_pdb_name(&cluster, 1), "test-clickhouse-1");

        let spec = pdb.spec.unwrap();
        assert_eq!(
            spec.max_unavailable,
            Some(IntOrString::String("50%".to_string()))
        );
        let selector = spec.selector.unwrap().match_labels.unwrap();
        assert_eq!(selector[LABEL_SHARD_ID], "1");
    }

    #[test]
    fn test_overlay_wins_and_parses_values() {
        let mut config = serde_json::json!({
            "logger": { "level": "information", "console": true },
            "max_connections": 4096,
        });
        let overlay = BTreeMap::from([
            ("logger.level".to_string(), "debug".to_string()),
            ("max_connections".to_string(), "8192".to_string()),
            ("merge_tree.parts_to_throw_insert".to_string(), "600".to_string()),
        ]);

        apply_overlay(&mut config, &overlay);

        assert_eq!(config["logger"]["level"], "debug");
        assert_eq!(config["logger"]["console"], true);
        assert_eq!(config["max_connections"], 8192);
        assert_eq!(config["merge_tree"]["parts_to_throw_insert"], 600);
    }

    #[test]
    fn test_replica_names_are_stable_per_shard() {
        use clickhouse_operator::resources::common::replica_object_name;

        let cluster = clickhouse(3, 2);
        assert_eq!(
            replica_object_name(&cluster, &ClickHouseReplicaId::new(2, 1)),
            "test-clickhouse-2-1"
        );
    }
}

mod revision_tests {
    use super::*;
    use clickhouse_operator::controller::{clickhouse as clickhouse_controller, keeper as keeper_controller};
    use clickhouse_operator::controller::revision::{configuration_revision, sha256_hex};
    use std::collections::BTreeMap;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_configuration_revision_is_order_independent() {
        let a = BTreeMap::from([
            ("config.yaml".to_string(), "a: 1\n".to_string()),
            ("users.yaml".to_string(), "b: 2\n".to_string()),
        ]);
        let mut b = BTreeMap::new();
        b.insert("users.yaml".to_string(), "b: 2\n".to_string());
        b.insert("config.yaml".to_string(), "a: 1\n".to_string());
        assert_eq!(
            configuration_revision(&a).unwrap(),
            configuration_revision(&b).unwrap()
        );
    }

    #[test]
    fn test_keeper_revisions_ignore_scaling() {
        let three = keeper_controller::desired_revisions(&keeper(3)).unwrap();
        let five = keeper_controller::desired_revisions(&keeper(5)).unwrap();
        assert_eq!(three, five);
    }

    #[test]
    fn test_keeper_overlay_moves_configuration_revision() {
        let before = keeper_controller::desired_revisions(&keeper(3)).unwrap();
        let mut changed = keeper(3);
        changed
            .spec
            .extra_config
            .insert("keeper_server.coordination_settings.raft_logs_level".to_string(), "trace".to_string());
        let after = keeper_controller::desired_revisions(&changed).unwrap();

        assert_ne!(before.configuration, after.configuration);
        assert_eq!(before.statefulset, after.statefulset);
    }

    #[test]
    fn test_clickhouse_revisions_ignore_topology() {
        let ensemble = keeper(3);
        let small = clickhouse_controller::desired_revisions(&clickhouse(1, 1), &ensemble, "hash")
            .unwrap();
        let large = clickhouse_controller::desired_revisions(&clickhouse(4, 3), &ensemble, "hash")
            .unwrap();
        assert_eq!(small, large);
    }
}

mod rollout_tests {
    use std::collections::BTreeMap;

    use clickhouse_operator::controller::replica::RolloutStage;
    use clickhouse_operator::controller::rollout::{
        AvailabilityGroup, ReplicaView, min_available, plan,
    };
    use clickhouse_operator::crd::{IntOrPercent, PodDisruptionBudgetSpec};

    fn group(members: &[i32], min_available: i32) -> AvailabilityGroup<i32> {
        AvailabilityGroup {
            members: members.to_vec(),
            min_available,
        }
    }

    #[test]
    fn test_quorum_held_while_a_member_is_updating() {
        let views = BTreeMap::from([
            (0, ReplicaView::new(RolloutStage::Updating, false)),
            (1, ReplicaView::new(RolloutStage::HasDiff, true)),
            (2, ReplicaView::new(RolloutStage::HasDiff, true)),
        ]);

        let plan = plan(&views, &[group(&[0, 1, 2], 2)]);

        assert!(plan.allows(&0));
        assert!(!plan.allows(&1));
        assert!(!plan.allows(&2));
        assert_eq!(plan.held.len(), 2);
    }

    #[test]
    fn test_one_update_started_per_group() {
        let views = BTreeMap::from([
            (0, ReplicaView::new(RolloutStage::HasDiff, true)),
            (1, ReplicaView::new(RolloutStage::HasDiff, true)),
            (2, ReplicaView::new(RolloutStage::HasDiff, true)),
        ]);

        let plan = plan(&views, &[group(&[0, 1, 2], 2)]);

        assert_eq!(plan.apply.len(), 1);
        assert_eq!(plan.held.len(), 2);
    }

    #[test]
    fn test_groups_roll_independently() {
        let views = BTreeMap::from([
            (0, ReplicaView::new(RolloutStage::HasDiff, true)),
            (1, ReplicaView::new(RolloutStage::HasDiff, true)),
            (10, ReplicaView::new(RolloutStage::HasDiff, true)),
            (11, ReplicaView::new(RolloutStage::HasDiff, true)),
        ]);

        let plan = plan(&views, &[group(&[0, 1], 1), group(&[10, 11], 1)]);

        assert!(plan.allows(&0));
        assert!(plan.allows(&10));
        assert!(plan.held.contains(&1));
        assert!(plan.held.contains(&11));
    }

    #[test]
    fn test_creation_and_broken_replicas_are_never_gated() {
        let views = BTreeMap::from([
            (0, ReplicaView::new(RolloutStage::NotExists, false)),
            (1, ReplicaView::new(RolloutStage::Error, false)),
            (2, ReplicaView::new(RolloutStage::HasDiff, false)),
        ]);

        let plan = plan(&views, &[group(&[0, 1, 2], 3)]);

        assert_eq!(plan.apply.len(), 3);
        assert!(plan.held.is_empty());
    }

    #[test]
    fn test_min_available_from_budget() {
        let max_one = PodDisruptionBudgetSpec {
            min_available: None,
            max_unavailable: Some(IntOrPercent::Int(1)),
        };
        assert_eq!(min_available(&max_one, 3), 2);

        let half = PodDisruptionBudgetSpec {
            min_available: Some(IntOrPercent::Percent("50%".to_string())),
            max_unavailable: None,
        };
        assert_eq!(min_available(&half, 3), 2);
    }
}

mod fanout_tests {
    use clickhouse_operator::controller::fanout::{TaskError, execute_parallel};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_failures_are_reported_per_identity() {
        let (results, error) = execute_parallel(
            ["a", "b", "c"],
            &CancellationToken::new(),
            |id| async move {
                if id == "a" {
                    Ok(1)
                } else {
                    Err(format!("{id} refused"))
                }
            },
        )
        .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results["a"], Some(1));
        let error = error.unwrap();
        assert_eq!(error.len(), 2);
        assert!(matches!(&error.failures["b"], TaskError::Failed(e) if e == "b refused"));
        assert_eq!(
            error.to_string(),
            "2 task(s) failed: [b: b refused] [c: c refused]"
        );
    }

    #[tokio::test]
    async fn test_all_success_has_no_error() {
        let (results, error) = execute_parallel(0..4, &CancellationToken::new(), |id| async move {
            Ok::<_, String>(id * 2)
        })
        .await;

        assert!(error.is_none());
        assert_eq!(results.values().flatten().sum::<i32>(), 12);
    }
}

mod parsing_tests {
    use clickhouse_operator::client::KeeperMode;
    use clickhouse_operator::client::parsing::{
        parse_databases, parse_mntr, parse_tables, quote_identifier,
    };

    #[test]
    fn test_keeper_mode_parse() {
        assert_eq!(KeeperMode::parse("leader"), KeeperMode::Leader);
        assert_eq!(KeeperMode::parse("follower"), KeeperMode::Follower);
        assert_eq!(KeeperMode::parse("standalone"), KeeperMode::Standalone);
        assert_eq!(
            KeeperMode::parse("observer"),
            KeeperMode::Other("observer".to_string())
        );
        assert_eq!(KeeperMode::Leader.to_string(), "leader");
    }

    #[test]
    fn test_parse_mntr() {
        let output = "zk_version\tv25.3.1.1-lts\nzk_avg_latency\t0\n\nzk_server_state\tfollower\n";
        let parsed = parse_mntr(output);
        assert_eq!(parsed["zk_server_state"], "follower");
        assert_eq!(parsed["zk_version"], "v25.3.1.1-lts");
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn test_parse_databases() {
        let body = concat!(
            r#"{"name":"analytics","engine_full":"Replicated('/clickhouse/databases/analytics', '{shard}', '{replica}')","is_replicated":1}"#,
            "\n",
            r#"{"name":"scratch","engine_full":"Memory","is_replicated":0}"#,
            "\n",
        );
        let databases = parse_databases(body).unwrap();
        assert_eq!(databases.len(), 2);
        assert!(databases["analytics"].is_replicated);
        assert!(!databases["scratch"].is_replicated);
        assert_eq!(databases["scratch"].engine_full, "Memory");
    }

    #[test]
    fn test_parse_databases_rejects_missing_fields() {
        assert!(parse_databases(r#"{"name":"x"}"#).is_err());
        assert!(parse_databases("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_tables() {
        let body = r#"{"database":"analytics","name":"events"}"#;
        assert_eq!(parse_tables(body).unwrap(), vec!["`analytics`.`events`"]);
    }

    #[test]
    fn test_quote_identifier_escapes_backquotes() {
        assert_eq!(quote_identifier("we`ird"), "`we\\`ird`");
    }
}

mod health_verdict_tests {
    use clickhouse_operator::client::KeeperMode::{self, *};
    use clickhouse_operator::controller::keeper::ensemble_health;
    use clickhouse_operator::crd::reason;

    fn verdict(replicas: usize, modes: &[KeeperMode]) -> &'static str {
        ensemble_health(replicas, modes).reason
    }

    #[test]
    fn test_ensemble_verdicts() {
        assert_eq!(verdict(1, &[Standalone]), reason::STANDALONE_READY);
        assert_eq!(verdict(3, &[Leader, Follower, Follower]), reason::CLUSTER_READY);
        assert_eq!(verdict(3, &[Follower, Follower, Follower]), reason::NO_LEADER);
        assert_eq!(verdict(3, &[Leader, Leader, Follower]), reason::INCONSISTENT_STATE);
        assert_eq!(verdict(3, &[Leader, Follower]), reason::NOT_ENOUGH_FOLLOWERS);
    }

    #[test]
    fn test_standalone_in_an_ensemble_is_inconsistent() {
        let verdict = ensemble_health(3, &[Leader, Follower, Standalone]);
        assert!(!verdict.healthy);
        assert_eq!(verdict.reason, reason::INCONSISTENT_STATE);
    }
}

mod status_tests {
    use clickhouse_operator::controller::status::{ClusterFacts, HealthVerdict, aggregate};
    use clickhouse_operator::crd::{ConditionList, ConditionType, reason};

    fn facts() -> ClusterFacts {
        ClusterFacts {
            desired: 3,
            existing: 3,
            ready: 3,
            pod_errors: Vec::new(),
            out_of_sync: Vec::new(),
            health: HealthVerdict::healthy(reason::CLUSTER_READY, "ok"),
            reconcile_error: None,
        }
    }

    #[test]
    fn test_all_conditions_true_when_converged() {
        let mut conditions = ConditionList::default();
        let changed = aggregate(&mut conditions, &facts(), Some(4));

        assert_eq!(changed.len(), ConditionType::ALL.len());
        for condition_type in ConditionType::ALL {
            assert!(conditions.is_true(condition_type), "{condition_type}");
        }
        assert!(aggregate(&mut conditions, &facts(), Some(4)).is_empty());
    }

    #[test]
    fn test_scaling_down_takes_precedence() {
        let mut conditions = ConditionList::default();
        let facts = ClusterFacts {
            existing: 5,
            ..facts()
        };
        aggregate(&mut conditions, &facts, None);

        assert_eq!(
            conditions.reason(ConditionType::ClusterSizeAligned),
            Some(reason::SCALING_DOWN)
        );
        assert!(!conditions.is_true(ConditionType::Ready));
    }

    #[test]
    fn test_pod_errors_mark_cluster_unhealthy() {
        let mut conditions = ConditionList::default();
        let facts = ClusterFacts {
            pod_errors: vec![("1".to_string(), "CrashLoopBackOff".to_string())],
            ..facts()
        };
        aggregate(&mut conditions, &facts, None);

        let startup = conditions
            .get(ConditionType::ReplicaStartupSucceeded)
            .unwrap();
        assert_eq!(startup.reason, reason::REPLICA_ERROR);
        assert!(startup.message.contains("1 (CrashLoopBackOff)"));
        assert_eq!(conditions.reason(ConditionType::Healthy), Some(reason::REPLICA_ERROR));
        assert!(!conditions.is_true(ConditionType::Ready));
    }

    #[test]
    fn test_pending_updates_are_listed() {
        let mut conditions = ConditionList::default();
        let facts = ClusterFacts {
            out_of_sync: vec!["0-1".to_string(), "1-1".to_string()],
            ..facts()
        };
        aggregate(&mut conditions, &facts, None);

        let in_sync = conditions.get(ConditionType::ConfigurationInSync).unwrap();
        assert_eq!(in_sync.reason, reason::CONFIGURATION_CHANGED);
        assert_eq!(in_sync.message, "Replicas pending update: 0-1, 1-1");
    }
}

mod error_tests {
    use std::time::Duration;

    use clickhouse_operator::controller::error::{
        Error, REQUEUE_ON_ERROR, ReplicaFailure, is_conflict,
    };

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_conflict_classification() {
        assert!(is_conflict(&api_error(409, "Conflict")));
        assert!(!is_conflict(&api_error(409, "AlreadyExists")));
        assert!(!is_conflict(&api_error(404, "NotFound")));
    }

    #[test]
    fn test_requeue_durations() {
        let transient = Error::KeeperNotFound("keeper".to_string());
        assert!(transient.is_retryable());
        assert_eq!(transient.requeue_after(), REQUEUE_ON_ERROR);

        let defect = Error::InvalidSpecField {
            kind: "StatefulSet",
            field: "replicas".to_string(),
        };
        assert!(!defect.is_retryable());
        assert_eq!(defect.requeue_after(), Duration::from_secs(3600));
    }

    #[test]
    fn test_not_found() {
        assert!(Error::Kube(api_error(404, "NotFound")).is_not_found());
        assert!(!Error::Kube(api_error(500, "InternalError")).is_not_found());
    }

    #[test]
    fn test_event_reasons() {
        let create = Error::Store {
            action: "create",
            kind: "StatefulSet",
            name: "a".to_string(),
            source: api_error(500, "InternalError"),
        };
        assert_eq!(create.event_reason(), "FailedCreate");

        let exhausted = Error::ConflictRetriesExhausted {
            kind: "ConfigMap",
            name: "a".to_string(),
            attempts: 5,
        };
        assert_eq!(exhausted.event_reason(), "FailedUpdate");
    }

    #[test]
    fn test_replica_failures_message() {
        let error = Error::Replicas(vec![
            ReplicaFailure {
                replica: "0".to_string(),
                error: Error::KeeperNotFound("k".to_string()),
            },
            ReplicaFailure {
                replica: "2".to_string(),
                error: Error::Kube(api_error(500, "InternalError")),
            },
        ]);
        let message = error.to_string();
        assert!(message.starts_with("2 replica(s) failed:"));
        assert!(message.contains("[replica 0: KeeperCluster k not found]"));
        assert!(error.is_retryable());
    }
}

mod health_tests {
    use clickhouse_operator::health::{ClusterLabels, HealthState};

    #[test]
    fn test_health_state_starts_not_ready() {
        let state = HealthState::new();
        assert!(!state.is_ready());
        state.set_ready(true);
        assert!(state.is_ready());
    }

    #[test]
    fn test_metrics_are_labelled_per_cluster() {
        let state = HealthState::new();
        let labels = ClusterLabels::new("ClickHouseCluster", "test-ns", "test");
        state.metrics.record_reconcile(&labels, 0.25);

        let encoded = state.metrics.encode().unwrap();
        assert!(encoded.contains("clickhouse_operator_reconciliations_total"));
        assert!(encoded.contains(r#"kind="ClickHouseCluster""#));
        assert!(encoded.contains(r#"name="test""#));
    }
}
