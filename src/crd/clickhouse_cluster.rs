//! ClickHouseCluster Custom Resource Definition.
//!
//! A ClickHouseCluster is a sharded, replicated ClickHouse deployment that
//! coordinates through a KeeperCluster in the same namespace.

use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{
    ClusterObject, ClusterStatus, ImageSpec, LoggerSpec, PodDisruptionBudgetSpec, ReplicaId,
    ResourceRequirementsSpec, StorageSpec, TlsSpec,
};
use crate::resources::common::{
    CLICKHOUSE_KIND_LABEL, LABEL_REPLICA_ID, LABEL_SHARD_ID, replica_hostname,
};

/// ClickHouseCluster is a custom resource for deploying ClickHouse clusters.
///
/// Example:
/// ```yaml
/// apiVersion: clickhouse.com/v1alpha1
/// kind: ClickHouseCluster
/// metadata:
///   name: analytics
/// spec:
///   shards: 2
///   replicas: 2
///   keeperClusterRef:
///     name: keeper
/// ```
#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "clickhouse.com",
    version = "v1alpha1",
    kind = "ClickHouseCluster",
    plural = "clickhouseclusters",
    shortname = "chc",
    status = "ClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Shards", "type":"integer", "jsonPath":".spec.shards"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClickHouseClusterSpec {
    /// Number of shards (default 1).
    #[serde(default = "default_shards")]
    pub shards: i32,

    /// Number of replicas in every shard (default 3).
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// KeeperCluster used for coordination.
    pub keeper_cluster_ref: KeeperClusterRef,

    /// ClickHouse server container image.
    #[serde(default = "default_clickhouse_image")]
    pub image: ImageSpec,

    /// Resource requests and limits for server pods.
    #[serde(default)]
    pub resources: ResourceRequirementsSpec,

    /// Volume claim template for server data.
    #[serde(default)]
    pub storage: StorageSpec,

    /// Secure native and HTTP listeners.
    #[serde(default)]
    pub tls: TlsSpec,

    /// Server logger settings.
    #[serde(default)]
    pub logger: LoggerSpec,

    /// Dotted configuration paths merged over the generated configuration.
    #[serde(default)]
    pub extra_config: BTreeMap<String, String>,

    /// PodDisruptionBudget overrides, applied to every shard.
    #[serde(default)]
    pub pod_disruption_budget: PodDisruptionBudgetSpec,

    /// Cluster DNS domain (default: cluster.local).
    #[serde(default)]
    pub cluster_domain: String,

    /// Additional labels to apply to all managed resources.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Additional annotations to apply to all managed resources.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Reference to a KeeperCluster in the same namespace.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeeperClusterRef {
    pub name: String,
}

impl Default for ClickHouseClusterSpec {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            replicas: default_replicas(),
            keeper_cluster_ref: KeeperClusterRef::default(),
            image: default_clickhouse_image(),
            resources: ResourceRequirementsSpec::default(),
            storage: StorageSpec::default(),
            tls: TlsSpec::default(),
            logger: LoggerSpec::default(),
            extra_config: BTreeMap::new(),
            pod_disruption_budget: PodDisruptionBudgetSpec::default(),
            cluster_domain: String::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }
}

fn default_shards() -> i32 {
    1
}

fn default_replicas() -> i32 {
    3
}

fn default_clickhouse_image() -> ImageSpec {
    ImageSpec::new("clickhouse/clickhouse-server", "25.3")
}

/// Identity of one server: its shard and its index within the shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClickHouseReplicaId {
    pub shard_id: i32,
    pub index: i32,
}

impl ClickHouseReplicaId {
    pub fn new(shard_id: i32, index: i32) -> Self {
        Self { shard_id, index }
    }
}

impl fmt::Display for ClickHouseReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.shard_id, self.index)
    }
}

impl ReplicaId for ClickHouseReplicaId {
    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_SHARD_ID.to_string(), self.shard_id.to_string()),
            (LABEL_REPLICA_ID.to_string(), self.index.to_string()),
        ])
    }

    fn from_labels(labels: &BTreeMap<String, String>) -> Option<Self> {
        let shard_id = labels.get(LABEL_SHARD_ID)?.parse().ok()?;
        let index = labels.get(LABEL_REPLICA_ID)?.parse().ok()?;
        Some(Self { shard_id, index })
    }
}

impl ClusterObject for ClickHouseCluster {
    const ROLE: &'static str = "clickhouse";
    const KIND_LABEL: &'static str = CLICKHOUSE_KIND_LABEL;

    fn cluster_status(&self) -> Option<&ClusterStatus> {
        self.status.as_ref()
    }

    fn extra_labels(&self) -> &BTreeMap<String, String> {
        &self.spec.labels
    }

    fn extra_annotations(&self) -> &BTreeMap<String, String> {
        &self.spec.annotations
    }

    fn raw_cluster_domain(&self) -> &str {
        &self.spec.cluster_domain
    }
}

impl ClickHouseCluster {
    pub fn shards(&self) -> i32 {
        self.spec.shards.max(1)
    }

    /// Replicas per shard.
    pub fn replicas(&self) -> i32 {
        self.spec.replicas.max(1)
    }

    pub fn total_replicas(&self) -> i32 {
        self.shards() * self.replicas()
    }

    /// Desired servers, ordered by shard then index.
    pub fn replica_ids(&self) -> Vec<ClickHouseReplicaId> {
        (0..self.shards())
            .flat_map(|shard| {
                (0..self.replicas()).map(move |index| ClickHouseReplicaId::new(shard, index))
            })
            .collect()
    }

    pub fn shard_replica_ids(&self, shard_id: i32) -> Vec<ClickHouseReplicaId> {
        (0..self.replicas())
            .map(|index| ClickHouseReplicaId::new(shard_id, index))
            .collect()
    }

    pub fn hostname(&self, id: ClickHouseReplicaId) -> String {
        replica_hostname(self, &id)
    }
}
