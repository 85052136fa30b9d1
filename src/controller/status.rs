//! Condition aggregation.
//!
//! Folds the facts gathered during a pass into the fixed condition
//! vocabulary. Conditions are written through [`ConditionList::set`], so a
//! condition equal to the recorded one leaves the status untouched.

use tracing::debug;

use crate::crd::{Condition, ConditionList, ConditionType, reason};

/// Health verdict computed by the kind-specific reconciler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthVerdict {
    pub healthy: bool,
    pub reason: &'static str,
    pub message: String,
}

impl HealthVerdict {
    pub fn healthy(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            reason,
            message: message.into(),
        }
    }

    pub fn unhealthy(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            reason,
            message: message.into(),
        }
    }
}

/// Cluster-level facts of one pass.
#[derive(Clone, Debug)]
pub struct ClusterFacts {
    /// Replicas requested by the spec.
    pub desired: usize,
    /// Workloads that exist, including ones being scaled away.
    pub existing: usize,
    /// Desired replicas whose workload is ready.
    pub ready: usize,
    /// Replicas with a terminal pod error, with the waiting reason.
    pub pod_errors: Vec<(String, String)>,
    /// Replicas not running the desired revisions.
    pub out_of_sync: Vec<String>,
    pub health: HealthVerdict,
    /// Error that ended the pass, if any.
    pub reconcile_error: Option<String>,
}

/// Write every condition from `facts` and return the types that changed.
pub fn aggregate(
    conditions: &mut ConditionList,
    facts: &ClusterFacts,
    generation: Option<i64>,
) -> Vec<ConditionType> {
    let mut builder = ConditionBuilder::new(conditions, generation);

    match &facts.reconcile_error {
        None => builder.set(
            ConditionType::ReconcileSucceeded,
            true,
            reason::RECONCILE_FINISHED,
            "Reconciliation finished",
        ),
        Some(error) => builder.set(
            ConditionType::ReconcileSucceeded,
            false,
            reason::STEP_FAILED,
            error.clone(),
        ),
    };

    let startup_ok = facts.pod_errors.is_empty();
    if startup_ok {
        builder.set(
            ConditionType::ReplicaStartupSucceeded,
            true,
            reason::REPLICAS_RUNNING,
            "All replicas started",
        );
    } else {
        let listed: Vec<String> = facts
            .pod_errors
            .iter()
            .map(|(replica, why)| format!("{replica} ({why})"))
            .collect();
        builder.set(
            ConditionType::ReplicaStartupSucceeded,
            false,
            reason::REPLICA_ERROR,
            format!("Replicas failed to start: {}", listed.join(", ")),
        );
    }

    let healthy = facts.health.healthy && startup_ok;
    if facts.health.healthy && !startup_ok {
        builder.set(
            ConditionType::Healthy,
            false,
            reason::REPLICA_ERROR,
            "Some replicas report pod errors",
        );
    } else {
        builder.set(
            ConditionType::Healthy,
            facts.health.healthy,
            facts.health.reason,
            facts.health.message.clone(),
        );
    }

    let aligned = if facts.existing > facts.desired {
        builder.set(
            ConditionType::ClusterSizeAligned,
            false,
            reason::SCALING_DOWN,
            format!(
                "{} workloads exist, {} requested",
                facts.existing, facts.desired
            ),
        );
        false
    } else if facts.ready < facts.desired {
        builder.set(
            ConditionType::ClusterSizeAligned,
            false,
            reason::SCALING_UP,
            format!("{}/{} replicas ready", facts.ready, facts.desired),
        );
        false
    } else {
        builder.set(
            ConditionType::ClusterSizeAligned,
            true,
            reason::UP_TO_DATE,
            format!("{}/{} replicas ready", facts.ready, facts.desired),
        );
        true
    };

    let in_sync = facts.out_of_sync.is_empty();
    if in_sync {
        builder.set(
            ConditionType::ConfigurationInSync,
            true,
            reason::UP_TO_DATE,
            "All replicas run the desired revision",
        );
    } else {
        builder.set(
            ConditionType::ConfigurationInSync,
            false,
            reason::CONFIGURATION_CHANGED,
            format!("Replicas pending update: {}", facts.out_of_sync.join(", ")),
        );
    }

    let ready =
        facts.reconcile_error.is_none() && startup_ok && healthy && aligned && in_sync;
    if ready {
        builder.set(ConditionType::Ready, true, reason::REPLICAS_READY, "Cluster is ready");
    } else {
        builder.set(
            ConditionType::Ready,
            false,
            reason::REPLICAS_NOT_READY,
            "Cluster is not ready",
        );
    }

    builder.changed
}

/// Writes conditions stamped with one generation and remembers which changed.
struct ConditionBuilder<'a> {
    conditions: &'a mut ConditionList,
    generation: Option<i64>,
    changed: Vec<ConditionType>,
}

impl<'a> ConditionBuilder<'a> {
    fn new(conditions: &'a mut ConditionList, generation: Option<i64>) -> Self {
        Self {
            conditions,
            generation,
            changed: Vec::new(),
        }
    }

    fn set(
        &mut self,
        condition_type: ConditionType,
        status: bool,
        reason: &str,
        message: impl Into<String>,
    ) -> &mut Self {
        let condition = Condition::new(condition_type, status, reason, message, self.generation);
        if self.conditions.set(condition) {
            debug!(condition = %condition_type, status, reason, "Condition changed");
            self.changed.push(condition_type);
        }
        self
    }
}
