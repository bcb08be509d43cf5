//! Integration tests for the nodenet operator
//!
//! These tests run the policy controller and one node agent per worker
//! in-process against a real kind cluster, and tell the story of how a
//! policy is rolled out and torn down.
//!
//! # Test Organization
//!
//! - `rollout`: Stories about a new policy reaching every selected node and
//!   the controller keeping enactments in step with the spec
//!
//! - `cleanup`: Stories about deleting a policy, including a node that is
//!   down while the deletion is requested
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored --nocapture
//!
//! # Only the node restart story (~5min)
//! cargo test --test kind story_deletion_waits_for_restarted_node -- --ignored --nocapture
//! ```

mod helpers;
mod rollout;
