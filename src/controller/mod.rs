//! Policy controller
//!
//! Reconciles NodeNetworkConfigurationPolicy resources into one
//! NodeNetworkConfigurationEnactment per selected node, and drives deletion
//! of those enactments when a policy goes away. Controllers follow the
//! Kubernetes observe-diff-act loop: every pass re-reads the store and is
//! safe to repeat.

mod cleanup;
mod context;
mod desired;
mod orphans;
mod policy;
mod runner;
mod status;


pub use cleanup::{handle_deletion, DeletionState};
pub use context::{Context, ContextBuilder};
pub use desired::{plan, EnactmentPlan};
pub use orphans::{run_orphan_sweeper, sweep_orphans};
pub use policy::{error_policy, has_finalizer, reconcile};
pub use runner::build_controllers;
pub use status::{CONDITION_AVAILABLE, CONDITION_DEGRADED, CONDITION_PROGRESSING};
