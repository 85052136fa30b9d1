//! Per-pass observed state of every replica.
//!
//! A [`ReplicaTracker`] is built fresh at the start of each pass from the
//! StatefulSets and pods found by label, and dropped when the pass ends.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::controller::revision::Revisions;
use crate::controller::store::Stores;
use crate::crd::{ClusterObject, ReplicaId};
use crate::resources::common::{ANNOTATION_RESTARTED_AT, selector_labels, selector_string};

/// Container waiting reasons that mark a replica as failed.
pub const POD_ERROR_REASONS: [&str; 3] = ["ImagePullBackOff", "ErrImagePull", "CrashLoopBackOff"];

/// Where a replica stands in the rollout state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RolloutStage {
    UpToDate,
    HasDiff,
    NotReadyUpToDate,
    Updating,
    Error,
    NotExists,
}

impl fmt::Display for RolloutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RolloutStage::UpToDate => "UpToDate",
            RolloutStage::HasDiff => "HasDiff",
            RolloutStage::NotReadyUpToDate => "NotReadyUpToDate",
            RolloutStage::Updating => "Updating",
            RolloutStage::Error => "Error",
            RolloutStage::NotExists => "NotExists",
        };
        f.write_str(text)
    }
}

/// Observed state of one replica.
#[derive(Clone, Debug, Default)]
pub struct ReplicaState {
    /// Live workload, if any.
    pub statefulset: Option<StatefulSet>,
    /// Waiting reason of the replica pod when it is one of [`POD_ERROR_REASONS`].
    pub pod_error: Option<String>,
    /// Whether the server answered its health probe.
    pub healthy: bool,
    /// Server mode reported by the probe, when the kind has one.
    pub mode: Option<String>,
    /// Set when this pass wrote the workload.
    pub updated: bool,
}

impl ReplicaState {
    pub fn exists(&self) -> bool {
        self.statefulset.is_some()
    }

    /// The workload has observed its latest generation and its pod is ready.
    pub fn is_ready(&self) -> bool {
        let Some(sts) = &self.statefulset else {
            return false;
        };
        let generation = sts.metadata.generation.unwrap_or_default();
        sts.status.as_ref().is_some_and(|status| {
            status.observed_generation.unwrap_or_default() >= generation
                && status.ready_replicas.unwrap_or_default() >= 1
        })
    }

    /// Revisions the live workload was rendered with.
    pub fn recorded_revisions(&self) -> Option<Revisions> {
        self.statefulset.as_ref().and_then(Revisions::recorded_on)
    }

    /// Whether the live workload was rendered from different revisions.
    pub fn has_diff(&self, desired: &Revisions) -> bool {
        self.recorded_revisions().as_ref() != Some(desired)
    }

    /// Whether the recorded configuration revision differs, requiring a restart.
    pub fn needs_restart(&self, desired: &Revisions) -> bool {
        self.exists()
            && self
                .recorded_revisions()
                .is_none_or(|recorded| recorded.configuration != desired.configuration)
    }

    /// Restart marker currently on the live pod template.
    pub fn restarted_at(&self) -> Option<&str> {
        self.statefulset
            .as_ref()?
            .spec
            .as_ref()?
            .template
            .metadata
            .as_ref()?
            .annotations
            .as_ref()?
            .get(ANNOTATION_RESTARTED_AT)
            .map(String::as_str)
    }

    /// Classify the replica against the desired revisions.
    ///
    /// A spec difference wins over a pod error so that fixing the spec is
    /// what gets the replica out of the error.
    pub fn stage(&self, desired: &Revisions) -> RolloutStage {
        if self.updated {
            return RolloutStage::Updating;
        }
        if !self.exists() {
            return RolloutStage::NotExists;
        }
        if self.has_diff(desired) {
            return RolloutStage::HasDiff;
        }
        if self.pod_error.is_some() {
            return RolloutStage::Error;
        }
        if !self.is_ready() {
            return RolloutStage::NotReadyUpToDate;
        }
        RolloutStage::UpToDate
    }
}

/// Observed state of every desired replica, plus workloads outside the
/// desired topology.
#[derive(Clone, Debug)]
pub struct ReplicaTracker<Id: ReplicaId> {
    replicas: BTreeMap<Id, ReplicaState>,
    orphans: BTreeMap<Id, StatefulSet>,
}

impl<Id: ReplicaId> ReplicaTracker<Id> {
    /// Tracker with an empty state for every desired replica.
    pub fn new(desired: impl IntoIterator<Item = Id>) -> Self {
        Self {
            replicas: desired
                .into_iter()
                .map(|id| (id, ReplicaState::default()))
                .collect(),
            orphans: BTreeMap::new(),
        }
    }

    /// Read workloads and pods of `cluster` and sort them by replica identity.
    pub async fn observe<C: ClusterObject>(
        stores: &Stores,
        cluster: &C,
        desired: impl IntoIterator<Item = Id>,
    ) -> Result<Self> {
        let mut tracker = Self::new(desired);
        let selector = selector_string(&selector_labels(cluster));

        let statefulsets = stores
            .statefulsets
            .list(&selector)
            .await
            .map_err(|source| Error::Store {
                action: "list",
                kind: "StatefulSet",
                name: selector.clone(),
                source,
            })?;
        for sts in statefulsets {
            tracker.record_statefulset(sts);
        }

        let pods = stores
            .pods
            .list(&selector)
            .await
            .map_err(|source| Error::Store {
                action: "list",
                kind: "Pod",
                name: selector.clone(),
                source,
            })?;
        for pod in &pods {
            tracker.record_pod(pod);
        }

        debug!(
            replicas = tracker.replicas.len(),
            existing = tracker.existing(),
            orphans = tracker.orphans.len(),
            "Observed replicas"
        );
        Ok(tracker)
    }

    /// File a live workload under its replica identity.
    pub fn record_statefulset(&mut self, sts: StatefulSet) {
        let Some(id) = Id::from_labels(sts.labels()) else {
            debug!(name = %sts.name_any(), "Skipping workload without replica labels");
            return;
        };
        match self.replicas.get_mut(&id) {
            Some(state) => state.statefulset = Some(sts),
            None => {
                self.orphans.insert(id, sts);
            }
        }
    }

    /// Flag the replica if the pod's containers wait on an error reason.
    pub fn record_pod(&mut self, pod: &Pod) {
        let Some(id) = Id::from_labels(pod.labels()) else {
            return;
        };
        let Some(state) = self.replicas.get_mut(&id) else {
            return;
        };
        if let Some(reason) = pod_error_reason(pod) {
            info!(pod = %pod.name_any(), reason = %reason, "Pod in error state");
            state.pod_error = Some(reason);
        }
    }

    pub fn get(&self, id: &Id) -> Option<&ReplicaState> {
        self.replicas.get(id)
    }

    pub fn get_mut(&mut self, id: &Id) -> Option<&mut ReplicaState> {
        self.replicas.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Id, &ReplicaState)> {
        self.replicas.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = Id> + '_ {
        self.replicas.keys().copied()
    }

    /// Workloads whose identity falls outside the desired topology.
    pub fn orphans(&self) -> &BTreeMap<Id, StatefulSet> {
        &self.orphans
    }

    pub fn forget_orphan(&mut self, id: &Id) {
        self.orphans.remove(id);
    }

    /// Workloads that exist, desired or not.
    pub fn existing(&self) -> usize {
        self.replicas.values().filter(|s| s.exists()).count() + self.orphans.len()
    }

    /// Desired replicas whose workload is ready.
    pub fn ready(&self) -> usize {
        self.replicas.values().filter(|s| s.is_ready()).count()
    }

    pub fn stages(&self, desired: &Revisions) -> BTreeMap<Id, RolloutStage> {
        self.replicas
            .iter()
            .map(|(id, state)| (*id, state.stage(desired)))
            .collect()
    }
}

/// First container waiting reason that marks the pod as failed.
pub fn pod_error_reason(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .filter_map(|status| status.state.as_ref()?.waiting.as_ref()?.reason.clone())
        .find(|reason| POD_ERROR_REASONS.contains(&reason.as_str()))
}
