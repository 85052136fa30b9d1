//! PodDisruptionBudget generation.
//!
//! Keeper gets one budget for the whole ensemble so voluntary disruptions
//! never take the ensemble below a majority. ClickHouse gets one budget per
//! shard so shards are drained independently.

use std::collections::BTreeMap;

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec as PdbSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::{ClusterObject, IntOrPercent, PodDisruptionBudgetSpec};
use crate::resources::common::object_meta;

fn int_or_string(value: &IntOrPercent) -> IntOrString {
    match value {
        IntOrPercent::Int(value) => IntOrString::Int(*value),
        IntOrPercent::Percent(value) => IntOrString::String(value.clone()),
    }
}

/// Default budget for a quorum ensemble: `maxUnavailable = replicas / 2`.
pub fn ensemble_budget(overrides: &PodDisruptionBudgetSpec, replicas: i32) -> PodDisruptionBudgetSpec {
    if !overrides.is_empty() {
        return overrides.clone();
    }
    PodDisruptionBudgetSpec {
        min_available: None,
        max_unavailable: Some(IntOrPercent::Int(replicas / 2)),
    }
}

/// Budget for one availability group: the overrides when given, otherwise
/// `minAvailable = 1` for groups of several members and
/// `maxUnavailable = 1` for a single member.
pub fn shard_budget(overrides: &PodDisruptionBudgetSpec, size: i32) -> PodDisruptionBudgetSpec {
    if !overrides.is_empty() {
        return overrides.clone();
    }
    if size > 1 {
        PodDisruptionBudgetSpec {
            min_available: Some(IntOrPercent::Int(1)),
            max_unavailable: None,
        }
    } else {
        PodDisruptionBudgetSpec {
            min_available: None,
            max_unavailable: Some(IntOrPercent::Int(1)),
        }
    }
}

/// Generate a PodDisruptionBudget selecting pods by `selector`.
///
/// `labels` become the object labels, `budget` must already have the
/// per-kind defaults applied.
pub fn generate_pod_disruption_budget<C: ClusterObject>(
    cluster: &C,
    name: String,
    labels: BTreeMap<String, String>,
    selector: BTreeMap<String, String>,
    budget: &PodDisruptionBudgetSpec,
) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: object_meta(cluster, name, labels),
        spec: Some(PdbSpec {
            min_available: budget.min_available.as_ref().map(int_or_string),
            max_unavailable: budget.max_unavailable.as_ref().map(int_or_string),
            selector: Some(LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
