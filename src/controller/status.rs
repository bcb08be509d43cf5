//! Policy status aggregation
//!
//! The policy status is derived from the plan and the enactments it read on
//! the same pass. Conditions keep their transition time while their status
//! is unchanged so repeated passes do not produce status churn.

use super::desired::EnactmentPlan;
use kube::ResourceExt;

use crate::crd::{
    merge_conditions, Condition, ConditionStatus, Enactment, EnactmentConditionType,
    EnactmentCounts, EnactmentKey, NodeNetworkConfigurationPolicyStatus, Policy,
    MAX_ENACTMENT_NAME_LEN,
};
use crate::liveness::NodeLiveness;
use crate::Error;

/// Condition type: every selected node applied the current generation
pub const CONDITION_AVAILABLE: &str = "Available";
/// Condition type: enactments are still being created, applied or removed
pub const CONDITION_PROGRESSING: &str = "Progressing";
/// Condition type: at least one node failed, or the policy is invalid
pub const CONDITION_DEGRADED: &str = "Degraded";

const REASON_CONFIGURED: &str = "SuccessfullyConfigured";
const REASON_NO_MATCHING_NODE: &str = "NoMatchingNode";
const REASON_PROGRESSING: &str = "ConfigurationProgressing";
const REASON_FAILED: &str = "FailedToConfigure";
const REASON_TERMINATING: &str = "Terminating";
const REASON_INVALID_SELECTOR: &str = "InvalidNodeSelector";
const REASON_INVALID_NAME: &str = "InvalidPolicyName";
const REASON_REJECTED: &str = "RejectedByApiServer";

fn previous_conditions(policy: &Policy) -> &[Condition] {
    policy
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default()
}

fn build(
    policy: &Policy,
    conditions: Vec<Condition>,
    enactments: EnactmentCounts,
    message: Option<String>,
) -> NodeNetworkConfigurationPolicyStatus {
    NodeNetworkConfigurationPolicyStatus {
        conditions: merge_conditions(previous_conditions(policy), conditions),
        observed_generation: policy.metadata.generation,
        enactments,
        message,
    }
}

fn count(plan: &EnactmentPlan) -> EnactmentCounts {
    let mut counts = EnactmentCounts {
        matched: plan.matched.len() as u32,
        pending: (plan.create.len() + plan.update.len() + plan.stale.len()) as u32,
        terminating: (plan.delete.len() + plan.pending_delete.len() + plan.awaiting_removal.len())
            as u32,
        ..Default::default()
    };
    for enactment in &plan.up_to_date {
        match applied_condition(enactment) {
            EnactmentConditionType::Available => counts.available += 1,
            EnactmentConditionType::Progressing => counts.progressing += 1,
            EnactmentConditionType::Failing => counts.failing += 1,
            _ => counts.pending += 1,
        }
    }
    counts
}

/// Condition of an enactment, as Pending if the agent has not acted on its
/// current generation yet
fn applied_condition(enactment: &Enactment) -> EnactmentConditionType {
    let observed = enactment
        .status
        .as_ref()
        .and_then(|s| s.observed_generation);
    match observed {
        Some(generation) if generation < enactment.spec.policy_generation => {
            EnactmentConditionType::Pending
        }
        _ => enactment.condition(),
    }
}

/// Status for an active policy after applying `plan`
pub fn aggregate(policy: &Policy, plan: &EnactmentPlan) -> NodeNetworkConfigurationPolicyStatus {
    let counts = count(plan);
    let failing: Vec<&str> = plan
        .up_to_date
        .iter()
        .filter(|e| applied_condition(e) == EnactmentConditionType::Failing)
        .map(|e| e.spec.node_name.as_str())
        .collect();

    let available = plan.is_converged() && counts.available == counts.matched;

    let (available_reason, message) = if counts.matched == 0 && plan.is_converged() {
        (REASON_NO_MATCHING_NODE, "policy does not match any node".to_string())
    } else if available {
        (
            REASON_CONFIGURED,
            format!("{}/{} nodes successfully configured", counts.available, counts.matched),
        )
    } else {
        (
            REASON_PROGRESSING,
            format!(
                "{}/{} nodes configured, {} pending, {} progressing, {} failing",
                counts.available, counts.matched, counts.pending, counts.progressing, counts.failing
            ),
        )
    };

    let degraded = if failing.is_empty() {
        Condition::new(CONDITION_DEGRADED, ConditionStatus::False, REASON_CONFIGURED, "")
    } else {
        Condition::new(
            CONDITION_DEGRADED,
            ConditionStatus::True,
            REASON_FAILED,
            format!("failed on nodes: {}", failing.join(", ")),
        )
    };

    let conditions = vec![
        Condition::new(
            CONDITION_AVAILABLE,
            available.into(),
            available_reason,
            message.clone(),
        ),
        Condition::new(
            CONDITION_PROGRESSING,
            (!available && failing.is_empty()).into(),
            if available { available_reason } else { REASON_PROGRESSING },
            "",
        ),
        degraded,
    ];

    build(policy, conditions, counts, Some(message))
}

/// Status for a terminating policy that still has enactments
///
/// The message lists every node still holding an enactment, and which of
/// them are currently unreachable.
pub fn terminating(
    policy: &Policy,
    remaining: &[Enactment],
    liveness: &dyn NodeLiveness,
) -> NodeNetworkConfigurationPolicyStatus {
    let mut nodes: Vec<&str> = remaining.iter().map(|e| e.spec.node_name.as_str()).collect();
    nodes.sort_unstable();
    nodes.dedup();
    let unreachable: Vec<&str> = nodes
        .iter()
        .copied()
        .filter(|n| !liveness.is_reachable(n))
        .collect();

    let mut message = format!("waiting for release by nodes: {}", nodes.join(", "));
    if !unreachable.is_empty() {
        message.push_str(&format!(" (unreachable: {})", unreachable.join(", ")));
    }

    let conditions = vec![
        Condition::new(
            CONDITION_AVAILABLE,
            ConditionStatus::False,
            REASON_TERMINATING,
            "",
        ),
        Condition::new(
            CONDITION_PROGRESSING,
            ConditionStatus::True,
            REASON_TERMINATING,
            message.clone(),
        ),
        Condition::new(
            CONDITION_DEGRADED,
            ConditionStatus::False,
            REASON_TERMINATING,
            "",
        ),
    ];
    let counts = EnactmentCounts {
        terminating: remaining.len() as u32,
        ..Default::default()
    };
    build(policy, conditions, counts, Some(message))
}

fn degraded(
    policy: &Policy,
    reason: &str,
    message: String,
    counts: EnactmentCounts,
) -> NodeNetworkConfigurationPolicyStatus {
    let conditions = vec![
        Condition::new(CONDITION_AVAILABLE, ConditionStatus::False, reason, ""),
        Condition::new(CONDITION_PROGRESSING, ConditionStatus::False, reason, ""),
        Condition::new(CONDITION_DEGRADED, ConditionStatus::True, reason, message.clone()),
    ];
    build(policy, conditions, counts, Some(message))
}

/// Status for a policy whose node selector cannot be evaluated
pub fn invalid_selector(policy: &Policy, err: &Error) -> NodeNetworkConfigurationPolicyStatus {
    degraded(
        policy,
        REASON_INVALID_SELECTOR,
        err.to_string(),
        EnactmentCounts::default(),
    )
}

/// Status for a policy whose name is too long to form enactment names on
/// some selected nodes
pub fn invalid_name(
    policy: &Policy,
    plan: &EnactmentPlan,
    unnamable: &[EnactmentKey],
) -> NodeNetworkConfigurationPolicyStatus {
    let nodes: Vec<&str> = unnamable.iter().map(|k| k.node.as_str()).collect();
    let message = format!(
        "enactment names '<node>.{}' exceed {MAX_ENACTMENT_NAME_LEN} characters on nodes: {}",
        policy.name_any(),
        nodes.join(", ")
    );
    degraded(policy, REASON_INVALID_NAME, message, count(plan))
}

/// Status for a pass whose writes the API server refused outright
pub fn rejected(
    policy: &Policy,
    plan: &EnactmentPlan,
    err: &Error,
) -> NodeNetworkConfigurationPolicyStatus {
    degraded(policy, REASON_REJECTED, err.to_string(), count(plan))
}

/// True if `new` differs from the stored status beyond timestamps
pub fn needs_update(policy: &Policy, new: &NodeNetworkConfigurationPolicyStatus) -> bool {
    let Some(current) = policy.status.as_ref() else {
        return true;
    };
    current.observed_generation != new.observed_generation
        || current.enactments != new.enactments
        || current.message != new.message
        || current.conditions.len() != new.conditions.len()
        || current
            .conditions
            .iter()
            .zip(&new.conditions)
            .any(|(a, b)| !a.same_state(b))
}
