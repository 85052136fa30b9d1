//! Types shared by the KeeperCluster and ClickHouseCluster resources.
//!
//! Both kinds carry the same observed-state shape ([`ClusterStatus`]) and
//! the same condition vocabulary, and both identify their members through a
//! [`ReplicaId`] that determines object names and network hostnames.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

use kube::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster DNS domain used when the spec leaves it empty.
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Container image specification.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Container image repository.
    pub repository: String,

    /// Image tag.
    pub tag: String,

    /// Image pull policy (default: IfNotPresent).
    #[serde(default = "default_image_pull_policy")]
    pub pull_policy: String,

    /// Image pull secrets.
    #[serde(default)]
    pub pull_secrets: Vec<String>,
}

impl ImageSpec {
    pub fn new(repository: &str, tag: &str) -> Self {
        Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            pull_policy: default_image_pull_policy(),
            pull_secrets: Vec::new(),
        }
    }

    /// Full image reference (`repository:tag`).
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

/// Resource requests and limits for server pods.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirementsSpec {
    /// CPU and memory requests.
    #[serde(default = "default_requests")]
    pub requests: ResourceSpec,

    /// CPU and memory limits. Unset limits are not rendered.
    #[serde(default)]
    pub limits: Option<ResourceSpec>,
}

/// CPU and memory quantities.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    pub cpu: String,
    pub memory: String,
}

fn default_requests() -> ResourceSpec {
    ResourceSpec {
        cpu: "250m".to_string(),
        memory: "512Mi".to_string(),
    }
}

impl Default for ResourceRequirementsSpec {
    fn default() -> Self {
        Self {
            requests: default_requests(),
            limits: None,
        }
    }
}

/// Volume claim template for server data.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Size of the PersistentVolumeClaim (default: 10Gi).
    #[serde(default = "default_storage_size")]
    pub size: String,

    /// Storage class name. If not set, uses the cluster default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size: default_storage_size(),
            storage_class_name: None,
        }
    }
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}

/// TLS settings. Certificates are issued elsewhere and consumed from a Secret
/// holding `tls.crt`, `tls.key` and `ca.crt`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Enable secure listeners.
    #[serde(default)]
    pub enabled: bool,

    /// Name of the Secret with the server certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_cert_secret: Option<String>,
}

impl TlsSpec {
    /// Secret to mount, present only when TLS is enabled and a secret is named.
    pub fn secret(&self) -> Option<&str> {
        if self.enabled {
            self.server_cert_secret.as_deref()
        } else {
            None
        }
    }
}

/// Server logger settings.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoggerSpec {
    /// Log level (default: information).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON formatted logs.
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for LoggerSpec {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "information".to_string()
}

/// Integer or percentage value, for PodDisruptionBudget overrides.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(untagged)]
pub enum IntOrPercent {
    Int(i32),
    Percent(String),
}

impl IntOrPercent {
    /// Resolves the value against a member count, rounding percentages up.
    ///
    /// Returns `None` for malformed percentage strings.
    pub fn resolve(&self, total: i32) -> Option<i32> {
        match self {
            IntOrPercent::Int(value) => Some(*value),
            IntOrPercent::Percent(raw) => {
                let percent: i64 = raw.trim().strip_suffix('%')?.trim().parse().ok()?;
                let scaled = (percent * i64::from(total) + 99) / 100;
                i32::try_from(scaled).ok()
            }
        }
    }
}

/// PodDisruptionBudget overrides. When both are unset, per-kind defaults apply.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodDisruptionBudgetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<IntOrPercent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrPercent>,
}

impl PodDisruptionBudgetSpec {
    pub fn is_empty(&self) -> bool {
        self.min_available.is_none() && self.max_unavailable.is_none()
    }
}

/// Observed state written by the controller for both cluster kinds.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// The generation most recently observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions describing the current state, unique by type.
    #[serde(default)]
    pub conditions: ConditionList,

    /// Fingerprint of the rendered server configuration.
    #[serde(default)]
    pub configuration_revision: String,

    /// Fingerprint of the workload template.
    #[serde(default)]
    pub stateful_set_revision: String,

    /// Number of replicas whose workload reports ready.
    #[serde(default)]
    pub ready_replicas: i32,

    /// Workload revision every replica was last observed running.
    #[serde(default)]
    pub current_revision: String,

    /// Workload revision the rollout is converging to.
    #[serde(default)]
    pub update_revision: String,
}

/// Condition describes the state of a cluster at a certain point.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";
pub const STATUS_UNKNOWN: &str = "Unknown";

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: ConditionType,
        status: bool,
        reason: &str,
        message: impl Into<String>,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status { STATUS_TRUE } else { STATUS_FALSE }.to_string(),
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a condition whose status could not be determined.
    pub fn unknown(
        condition_type: ConditionType,
        reason: &str,
        message: impl Into<String>,
        generation: Option<i64>,
    ) -> Self {
        Self {
            status: STATUS_UNKNOWN.to_string(),
            ..Self::new(condition_type, false, reason, message, generation)
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == STATUS_TRUE
    }

    fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

/// Ordered list of conditions, holding at most one entry per type.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct ConditionList(Vec<Condition>);

impl ConditionList {
    pub fn get(&self, condition_type: ConditionType) -> Option<&Condition> {
        let name = condition_type.to_string();
        self.0.iter().find(|c| c.r#type == name)
    }

    pub fn is_true(&self, condition_type: ConditionType) -> bool {
        self.get(condition_type).is_some_and(Condition::is_true)
    }

    pub fn reason(&self, condition_type: ConditionType) -> Option<&str> {
        self.get(condition_type).map(|c| c.reason.as_str())
    }

    /// Records a condition and reports whether anything visible changed.
    ///
    /// A condition matching the stored one on status, reason and message is a
    /// no-op. The transition time only moves when the status flips.
    pub fn set(&mut self, condition: Condition) -> bool {
        let Some(existing) = self.0.iter_mut().find(|c| c.r#type == condition.r#type) else {
            self.0.push(condition);
            return true;
        };

        if existing.same_state(&condition) {
            existing.observed_generation = condition.observed_generation;
            return false;
        }

        let transition_time = if existing.status == condition.status {
            std::mem::take(&mut existing.last_transition_time)
        } else {
            condition.last_transition_time
        };
        *existing = Condition {
            last_transition_time: transition_time,
            ..condition
        };
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Condition types written on both cluster kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConditionType {
    /// The latest reconciliation pass completed without error.
    ReconcileSucceeded,
    /// No replica reports a terminal pod error.
    ReplicaStartupSucceeded,
    /// Every replica reports a healthy server.
    Healthy,
    /// Ready replica count matches the requested count.
    ClusterSizeAligned,
    /// Every replica runs the desired revisions.
    ConfigurationInSync,
    /// All of the above hold.
    Ready,
}

impl ConditionType {
    pub const ALL: [ConditionType; 6] = [
        ConditionType::ReconcileSucceeded,
        ConditionType::ReplicaStartupSucceeded,
        ConditionType::Healthy,
        ConditionType::ClusterSizeAligned,
        ConditionType::ConfigurationInSync,
        ConditionType::Ready,
    ];
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionType::ReconcileSucceeded => write!(f, "ReconcileSucceeded"),
            ConditionType::ReplicaStartupSucceeded => write!(f, "ReplicaStartupSucceeded"),
            ConditionType::Healthy => write!(f, "Healthy"),
            ConditionType::ClusterSizeAligned => write!(f, "ClusterSizeAligned"),
            ConditionType::ConfigurationInSync => write!(f, "ConfigurationInSync"),
            ConditionType::Ready => write!(f, "Ready"),
        }
    }
}

/// Condition reasons.
pub mod reason {
    pub const STEP_FAILED: &str = "ReconcileStepFailed";
    pub const RECONCILE_FINISHED: &str = "ReconcileFinished";

    pub const REPLICAS_RUNNING: &str = "ReplicasRunning";
    pub const REPLICA_ERROR: &str = "ReplicaError";

    pub const REPLICAS_READY: &str = "ReplicasReady";
    pub const REPLICAS_NOT_READY: &str = "ReplicasNotReady";

    pub const UP_TO_DATE: &str = "UpToDate";
    pub const SCALING_DOWN: &str = "ScalingDown";
    pub const SCALING_UP: &str = "ScalingUp";
    pub const CONFIGURATION_CHANGED: &str = "ConfigurationChanged";

    // Keeper ensemble health
    pub const STANDALONE_READY: &str = "StandaloneReady";
    pub const CLUSTER_READY: &str = "ClusterReady";
    pub const NO_LEADER: &str = "NoLeader";
    pub const INCONSISTENT_STATE: &str = "InconsistentState";
    pub const NOT_ENOUGH_FOLLOWERS: &str = "NotEnoughFollowers";

    // ClickHouse shard health
    pub const ALL_SHARDS_READY: &str = "AllShardsReady";
    pub const SOME_SHARDS_NOT_READY: &str = "SomeShardsNotReady";
}

/// Stable, comparable identity of one cluster member.
///
/// `Display` renders the replica path used in object names and hostnames.
pub trait ReplicaId:
    Copy + Ord + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Labels that select this replica's objects.
    fn labels(&self) -> BTreeMap<String, String>;

    /// Recovers the identity from the labels of a managed object.
    fn from_labels(labels: &BTreeMap<String, String>) -> Option<Self>;
}

/// Capabilities shared by both cluster kinds.
pub trait ClusterObject: Resource<DynamicType = ()> {
    /// Role segment in object names (`<cluster>-<role>-...`).
    const ROLE: &'static str;

    /// Value of the `kind` label on managed objects.
    const KIND_LABEL: &'static str;

    fn generation(&self) -> i64 {
        self.meta().generation.unwrap_or_default()
    }

    fn cluster_status(&self) -> Option<&ClusterStatus>;

    /// User labels propagated onto every managed object.
    fn extra_labels(&self) -> &BTreeMap<String, String>;

    /// User annotations propagated onto every managed object.
    fn extra_annotations(&self) -> &BTreeMap<String, String>;

    /// Configured DNS domain, possibly empty.
    fn raw_cluster_domain(&self) -> &str;

    fn cluster_domain(&self) -> &str {
        match self.raw_cluster_domain() {
            "" => DEFAULT_CLUSTER_DOMAIN,
            domain => domain,
        }
    }
}
