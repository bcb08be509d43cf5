//! Custom Resource Definitions for nodenet
//!
//! This module contains the policy and enactment CRDs plus their shared types.

mod enactment;
mod policy;
mod types;

pub use enactment::{
    EnactmentKey, NodeNetworkConfigurationEnactment, NodeNetworkConfigurationEnactmentSpec,
    NodeNetworkConfigurationEnactmentStatus, MAX_ENACTMENT_NAME_LEN,
};
pub use policy::{
    is_label_value, EnactmentCounts, NodeNetworkConfigurationPolicy,
    NodeNetworkConfigurationPolicySpec, NodeNetworkConfigurationPolicyStatus, NodeSelector,
};
pub use types::{merge_conditions, Condition, ConditionStatus, EnactmentConditionType};

/// Short alias used throughout the controller
pub type Policy = NodeNetworkConfigurationPolicy;

/// Short alias used throughout the controller
pub type Enactment = NodeNetworkConfigurationEnactment;
