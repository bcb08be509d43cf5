//! nodenet - lifecycle operator for node network configuration policies
//!
//! A `NodeNetworkConfigurationPolicy` describes a desired network state and the
//! nodes it applies to. For every selected node the operator keeps exactly one
//! `NodeNetworkConfigurationEnactment`, the per-node status record that the
//! node agent updates as it applies the state.
//!
//! # Deletion guarantee
//!
//! Deleting a policy never orphans per-node state. The policy carries the
//! [`POLICY_FINALIZER`] until every enactment referencing it is gone, and every
//! enactment carries the [`NODE_FINALIZER`] until its node agent has released
//! local resources. A node that is down when the policy is deleted keeps its
//! enactment (visibly terminating) until it comes back; nothing is force-deleted.
//!
//! # Modules
//!
//! - [`crd`] - Policy and enactment Custom Resource Definitions
//! - [`controller`] - Policy reconciler, deletion state machine, orphan sweeper
//! - [`store`] - Store traits and their Kubernetes implementation
//! - [`liveness`] - Node reachability derived from Node objects
//! - [`agent`] - Node agent side of the deletion handshake
//! - [`leader_election`] - Lease-based leader election for HA controllers
//! - [`retry`] - Backoff helpers
//! - [`config`] - Controller configuration
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod agent;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod leader_election;
pub mod liveness;
pub mod retry;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Finalizer the controller keeps on a policy while enactments reference it
pub const POLICY_FINALIZER: &str = "nmstate.io/enactments";

/// Finalizer held by the node agent on each enactment
pub const NODE_FINALIZER: &str = "nmstate.io/node-release";

/// Label on enactments naming the owning policy
pub const POLICY_LABEL: &str = "nmstate.io/policy";

/// Label on enactments naming the target node
pub const NODE_LABEL: &str = "nmstate.io/node";

/// Field manager used for server-side writes
pub const FIELD_MANAGER: &str = "nodenet-controller";
