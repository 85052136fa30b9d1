//! KeeperCluster Custom Resource Definition.
//!
//! A KeeperCluster is a quorum-based ClickHouse Keeper ensemble. Every member
//! runs in its own single-pod StatefulSet so members can be rolled one by one.

use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{
    ClusterObject, ClusterStatus, ImageSpec, LoggerSpec, PodDisruptionBudgetSpec, ReplicaId,
    ResourceRequirementsSpec, StorageSpec, TlsSpec,
};
use crate::resources::common::{KEEPER_KIND_LABEL, LABEL_KEEPER_REPLICA_ID, replica_hostname};

/// KeeperCluster is a custom resource for deploying ClickHouse Keeper ensembles.
///
/// Example:
/// ```yaml
/// apiVersion: clickhouse.com/v1alpha1
/// kind: KeeperCluster
/// metadata:
///   name: keeper
/// spec:
///   replicas: 3
///   extraConfig:
///     keeper_server.coordination_settings.session_timeout_ms: "30000"
/// ```
#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "clickhouse.com",
    version = "v1alpha1",
    kind = "KeeperCluster",
    plural = "keeperclusters",
    shortname = "chk",
    status = "ClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KeeperClusterSpec {
    /// Number of ensemble members (default 3).
    #[serde(default = "default_keeper_replicas")]
    pub replicas: i32,

    /// Keeper container image.
    #[serde(default = "default_keeper_image")]
    pub image: ImageSpec,

    /// Resource requests and limits for Keeper pods.
    #[serde(default)]
    pub resources: ResourceRequirementsSpec,

    /// Volume claim template for the Raft log and snapshots.
    #[serde(default)]
    pub storage: StorageSpec,

    /// Secure client and Raft listeners.
    #[serde(default)]
    pub tls: TlsSpec,

    /// Server logger settings.
    #[serde(default)]
    pub logger: LoggerSpec,

    /// Dotted configuration paths merged over the generated configuration.
    #[serde(default)]
    pub extra_config: BTreeMap<String, String>,

    /// PodDisruptionBudget overrides.
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

impl Default for KeeperClusterSpec {
    fn default() -> Self {
        Self {
            replicas: default_keeper_replicas(),
            image: default_keeper_image(),
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

fn default_keeper_replicas() -> i32 {
    3
}

fn default_keeper_image() -> ImageSpec {
    ImageSpec::new("clickhouse/clickhouse-keeper", "25.3")
}

/// Identity of one ensemble member: its index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeeperReplicaId(pub i32);

impl fmt::Display for KeeperReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ReplicaId for KeeperReplicaId {
    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(LABEL_KEEPER_REPLICA_ID.to_string(), self.0.to_string())])
    }

    fn from_labels(labels: &BTreeMap<String, String>) -> Option<Self> {
        labels
            .get(LABEL_KEEPER_REPLICA_ID)
            .and_then(|id| id.parse().ok())
            .map(KeeperReplicaId)
    }
}

impl KeeperReplicaId {
    /// Raft server id. Keeper requires ids to start at 1.
    pub fn server_id(&self) -> i32 {
        self.0 + 1
    }
}

impl ClusterObject for KeeperCluster {
    const ROLE: &'static str = "keeper";
    const KIND_LABEL: &'static str = KEEPER_KIND_LABEL;

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

impl KeeperCluster {
    /// Desired ensemble members, in id order.
    pub fn replica_ids(&self) -> Vec<KeeperReplicaId> {
        (0..self.spec.replicas.max(1)).map(KeeperReplicaId).collect()
    }

    pub fn replicas(&self) -> i32 {
        self.spec.replicas.max(1)
    }

    /// Smallest number of members that still forms a majority.
    pub fn quorum(&self) -> i32 {
        self.replicas() / 2 + 1
    }

    pub fn hostname(&self, id: KeeperReplicaId) -> String {
        replica_hostname(self, &id)
    }
}
