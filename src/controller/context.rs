//! Shared state handed to every reconcile pass

use std::sync::Arc;

use kube::Client;

use crate::config::ControllerConfig;
use crate::retry::RequeueBackoff;
use crate::store::{EnactmentStore, KubeStore, NodeInventory, PolicyClient};

/// Controller context
///
/// Holds the store handles as trait objects so tests can substitute mocks or
/// the in-memory fake cluster. Use [`ContextBuilder`] to construct one:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .config(ControllerConfig::default())
///     .build();
/// ```
pub struct Context {
    /// Enactment records
    pub enactments: Arc<dyn EnactmentStore>,
    /// Policy finalizer and status writes
    pub policies: Arc<dyn PolicyClient>,
    /// Cluster membership and liveness
    pub nodes: Arc<dyn NodeInventory>,
    /// Tunables
    pub config: ControllerConfig,
    /// Per-policy error backoff
    pub backoff: RequeueBackoff,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom store implementations
    #[cfg(test)]
    pub fn for_testing(
        enactments: Arc<dyn EnactmentStore>,
        policies: Arc<dyn PolicyClient>,
        nodes: Arc<dyn NodeInventory>,
    ) -> Self {
        let config = ControllerConfig::default();
        Self {
            enactments,
            policies,
            nodes,
            backoff: RequeueBackoff::new(config.error_backoff.clone()),
            config,
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            config: ControllerConfig::default(),
        }
    }

    /// Override the controller tunables
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the context with every store backed by one [`KubeStore`]
    pub fn build(self) -> Context {
        let store = Arc::new(KubeStore::new(self.client, &self.config));
        Context {
            enactments: store.clone(),
            policies: store.clone(),
            nodes: store,
            backoff: RequeueBackoff::new(self.config.error_backoff.clone()),
            config: self.config,
        }
    }
}
