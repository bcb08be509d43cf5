//! Integration tests for policy rollout
//!
//! These tests tell the story of a network administrator publishing a policy
//! and the controller keeping one enactment per selected node.

use std::time::Duration;

use kube::api::PostParams;

use nodenet::agent::{LoggingRelease, NodeAgent};
use nodenet::config::ControllerConfig;
use nodenet::controller::CONDITION_AVAILABLE;
use nodenet::crd::EnactmentConditionType;
use nodenet::store::KubeStore;
use nodenet::{NODE_FINALIZER, POLICY_FINALIZER};

use super::helpers::{
    cleanup_policy, label_workers, sample_policy, set_node_label, wait_for, Harness, TEST_LABEL,
    WORKERS,
};

/// Story: a new policy is enacted on every selected worker
///
/// The administrator creates a bridge policy selecting the labelled workers.
/// The controller adds its finalizer, creates one enactment per worker, and
/// once every agent reports success the policy turns Available.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_policy_is_enacted_on_every_selected_worker() {
    let harness = Harness::start().await;
    let name = "test-rollout-br";
    cleanup_policy(&harness.client, name).await;
    label_workers(&harness.client).await;

    harness
        .policies()
        .create(
            &PostParams::default(),
            &sample_policy(name, Some((TEST_LABEL, "true"))),
        )
        .await
        .expect("failed to create policy");

    let created = wait_for(Duration::from_secs(30), Duration::from_secs(1), || async {
        harness.enactments_of(name).await.len() == WORKERS.len()
    })
    .await;
    assert!(created, "expected one enactment per worker");

    for enactment in harness.enactments_of(name).await {
        assert!(WORKERS.contains(&enactment.spec.node_name.as_str()));
        assert_eq!(enactment.spec.policy_generation, 1);
        assert!(enactment
            .metadata
            .finalizers
            .unwrap_or_default()
            .contains(&NODE_FINALIZER.to_string()));
    }
    let policy = harness.policies().get(name).await.expect("policy");
    assert!(policy
        .metadata
        .finalizers
        .unwrap_or_default()
        .contains(&POLICY_FINALIZER.to_string()));

    for node in WORKERS {
        let store = std::sync::Arc::new(KubeStore::new(
            harness.client.clone(),
            &ControllerConfig::default(),
        ));
        NodeAgent::new(node, store, std::sync::Arc::new(LoggingRelease))
            .report(name, EnactmentConditionType::Available, None)
            .await
            .expect("failed to report status");
    }

    let available = wait_for(Duration::from_secs(30), Duration::from_secs(1), || async {
        harness
            .policies()
            .get(name)
            .await
            .ok()
            .and_then(|p| p.status)
            .is_some_and(|s| s.is_true(CONDITION_AVAILABLE) && s.enactments.available == 3)
    })
    .await;
    assert!(available, "policy should turn Available once every node reports");

    cleanup_policy(&harness.client, name).await;
}

/// Story: a worker that stops matching the selector gives up its enactment
///
/// Removing the label from one worker makes the controller delete that
/// worker's enactment; the agent on the worker releases it and the other
/// enactments stay untouched.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_deselected_worker_releases_its_enactment() {
    let harness = Harness::start().await;
    let name = "test-deselect-br";
    cleanup_policy(&harness.client, name).await;
    label_workers(&harness.client).await;

    harness
        .policies()
        .create(
            &PostParams::default(),
            &sample_policy(name, Some((TEST_LABEL, "true"))),
        )
        .await
        .expect("failed to create policy");
    assert!(
        wait_for(Duration::from_secs(30), Duration::from_secs(1), || async {
            harness.enactments_of(name).await.len() == WORKERS.len()
        })
        .await
    );

    set_node_label(&harness.client, WORKERS[1], TEST_LABEL, None).await;

    let released = wait_for(Duration::from_secs(30), Duration::from_secs(1), || async {
        let nodes: Vec<String> = harness
            .enactments_of(name)
            .await
            .into_iter()
            .map(|e| e.spec.node_name)
            .collect();
        nodes.len() == 2 && !nodes.contains(&WORKERS[1].to_string())
    })
    .await;
    assert!(released, "deselected worker's enactment should be gone");

    set_node_label(&harness.client, WORKERS[1], TEST_LABEL, Some("true")).await;
    cleanup_policy(&harness.client, name).await;
}
