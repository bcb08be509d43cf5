//! Desired-state computation for an active policy
//!
//! Pure diffing: given the policy, its validated selector, a fresh node list
//! and the enactments currently referencing the policy, decide which
//! enactments to create, update in place, or delete. No I/O happens here.

use std::collections::{BTreeMap, BTreeSet};

use kube::ResourceExt;

use crate::crd::{Enactment, EnactmentKey, NodeSelector, Policy};
use crate::liveness::NodeInfo;

/// Operations needed to converge a policy's enactments
#[derive(Clone, Debug, Default)]
pub struct EnactmentPlan {
    /// Nodes currently selected by the policy, sorted
    pub matched: Vec<String>,
    /// Enactments to create
    pub create: Vec<Enactment>,
    /// Enactments to rewrite with the current policy generation
    pub update: Vec<Enactment>,
    /// Enactments to delete (node no longer selected, or gone)
    pub delete: Vec<EnactmentKey>,
    /// Selected nodes whose previous enactment is still terminating
    pub awaiting_removal: Vec<EnactmentKey>,
    /// Unselected enactments already waiting for their node to release them
    pub pending_delete: Vec<EnactmentKey>,
    /// Enactments built from a newer policy generation than the one we hold
    pub stale: Vec<EnactmentKey>,
    /// Enactments already matching the policy generation
    pub up_to_date: Vec<Enactment>,
}

impl EnactmentPlan {
    /// True when no write is needed and nothing is waiting
    pub fn is_converged(&self) -> bool {
        !self.has_writes()
            && self.awaiting_removal.is_empty()
            && self.pending_delete.is_empty()
            && self.stale.is_empty()
    }

    /// True if applying the plan issues any store write
    pub fn has_writes(&self) -> bool {
        !self.create.is_empty() || !self.update.is_empty() || !self.delete.is_empty()
    }
}

/// Compute the plan for an active (non-terminating) policy
pub fn plan(
    policy: &Policy,
    selector: &NodeSelector,
    nodes: &[NodeInfo],
    current: &[Enactment],
) -> EnactmentPlan {
    let policy_name = policy.name_any();
    let generation = policy.metadata.generation.unwrap_or_default();

    let desired: BTreeSet<&str> = nodes
        .iter()
        .filter(|n| selector.matches(&n.labels))
        .map(|n| n.name.as_str())
        .collect();

    let mut existing: BTreeMap<&str, &Enactment> = BTreeMap::new();
    for enactment in current.iter().filter(|e| e.spec.policy_name == policy_name) {
        existing.insert(enactment.spec.node_name.as_str(), enactment);
    }

    let mut plan = EnactmentPlan {
        matched: desired.iter().map(|n| n.to_string()).collect(),
        ..Default::default()
    };

    for node in &desired {
        match existing.get(node) {
            None => plan.create.push(Enactment::for_policy(policy, node)),
            Some(enactment) if enactment.is_terminating() => {
                plan.awaiting_removal.push(enactment.key());
            }
            Some(enactment) => match enactment.spec.policy_generation.cmp(&generation) {
                std::cmp::Ordering::Less => {
                    let mut updated = (*enactment).clone();
                    updated.spec.policy_generation = generation;
                    updated.spec.desired_state = policy.spec.desired_state.clone();
                    plan.update.push(updated);
                }
                std::cmp::Ordering::Greater => plan.stale.push(enactment.key()),
                std::cmp::Ordering::Equal => plan.up_to_date.push((*enactment).clone()),
            },
        }
    }

    for (node, enactment) in &existing {
        if desired.contains(node) {
            continue;
        }
        if enactment.is_terminating() {
            plan.pending_delete.push(enactment.key());
        } else {
            plan.delete.push(enactment.key());
        }
    }

    plan
}
