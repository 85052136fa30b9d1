//! Rollout sequencing.
//!
//! Decides, from each replica's stage and readiness, which replicas may be
//! written this pass. Replicas are grouped by availability domain: the whole
//! ensemble for Keeper, one group per shard for ClickHouse. Within a group
//! a ready replica is only taken down when nothing else in the group is in
//! flight and the group keeps its minimum availability.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::controller::replica::RolloutStage;
use crate::crd::PodDisruptionBudgetSpec;

/// What the sequencer needs to know about one replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplicaView {
    pub stage: RolloutStage,
    pub ready: bool,
}

impl ReplicaView {
    pub fn new(stage: RolloutStage, ready: bool) -> Self {
        Self { stage, ready }
    }

    /// Serving and not about to stop serving.
    fn available(&self) -> bool {
        self.ready
            && matches!(
                self.stage,
                RolloutStage::UpToDate | RolloutStage::HasDiff
            )
    }

    /// Written recently and not yet settled.
    fn in_flight(&self) -> bool {
        matches!(
            self.stage,
            RolloutStage::Updating | RolloutStage::NotReadyUpToDate
        )
    }
}

/// Replicas that must keep `min_available` members serving.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvailabilityGroup<Id> {
    pub members: Vec<Id>,
    pub min_available: i32,
}

/// Outcome of sequencing: which replicas to write and which to hold back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RolloutPlan<Id: Ord> {
    pub apply: BTreeSet<Id>,
    pub held: BTreeSet<Id>,
}

impl<Id: Ord> RolloutPlan<Id> {
    pub fn allows(&self, id: &Id) -> bool {
        self.apply.contains(id)
    }
}

/// Sequence one pass.
///
/// Creation is never gated, and neither is updating a replica that is
/// already down. A ready replica with a pending change is updated only when
/// the group has nothing in flight and either stays at or above its minimum
/// without it, or is fully available. At most one such replica per group is
/// started per pass. Replicas without a pending change are always applied
/// so their owned objects stay in place.
pub fn plan<Id: Ord + Copy + std::fmt::Debug>(
    views: &BTreeMap<Id, ReplicaView>,
    groups: &[AvailabilityGroup<Id>],
) -> RolloutPlan<Id> {
    let mut apply = BTreeSet::new();
    let mut held = BTreeSet::new();

    for group in groups {
        let members: Vec<(Id, ReplicaView)> = group
            .members
            .iter()
            .filter_map(|id| views.get(id).map(|view| (*id, *view)))
            .collect();

        let available = members.iter().filter(|(_, v)| v.available()).count();
        let in_flight = members.iter().filter(|(_, v)| v.in_flight()).count();
        let fully_available = available == members.len();
        let min_available = usize::try_from(group.min_available.max(0)).unwrap_or_default();
        let mut started = false;

        for (id, view) in &members {
            if view.stage != RolloutStage::HasDiff || !view.ready {
                apply.insert(*id);
                continue;
            }

            let keeps_minimum = available > min_available || fully_available;
            if !started && in_flight == 0 && keeps_minimum {
                started = true;
                apply.insert(*id);
            } else {
                debug!(
                    replica = ?id,
                    available,
                    in_flight,
                    min_available,
                    "Holding replica update"
                );
                held.insert(*id);
            }
        }
    }

    RolloutPlan { apply, held }
}

/// Members that must stay available under `budget` for a group of `size`.
///
/// A malformed percentage falls back to keeping every member available.
pub fn min_available(budget: &PodDisruptionBudgetSpec, size: i32) -> i32 {
    let resolved = if let Some(min) = &budget.min_available {
        min.resolve(size)
    } else if let Some(max) = &budget.max_unavailable {
        max.resolve(size).map(|max| size - max)
    } else {
        Some(0)
    };
    resolved.unwrap_or(size).clamp(0, size.max(0))
}
