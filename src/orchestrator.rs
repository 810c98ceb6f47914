//! Main orchestrator - wires the delegation services together

use std::sync::Arc;

use tracing::{info, instrument};

use crate::cache::CapabilityTreeCache;
use crate::circuit_breaker::CircuitBreaker;
use crate::collaborators::{
    CapabilityClassifier, CompletionClassifier, CompletionService, StructureChange, StructureLookup,
};
use crate::config::DelegationConfig;
use crate::delegator::{DelegationRun, RecursiveDelegator};
use crate::discovery::CapabilityDiscovery;
use crate::error::{DelegationError, Result};
use crate::ids::{NodeId, SessionId};

/// Entry point for running tasks against a node hierarchy
///
/// Owns one instance of every service (breaker, cache, discovery, delegator)
/// so independent orchestrators never share state.
pub struct Orchestrator {
    config: DelegationConfig,
    structure: Arc<dyn StructureLookup>,
    cache: Arc<CapabilityTreeCache>,
    delegator: Arc<RecursiveDelegator>,
}

impl Orchestrator {
    /// Build with a classifier backed by `completion`
    pub fn new(
        config: DelegationConfig,
        structure: Arc<dyn StructureLookup>,
        completion: Arc<dyn CompletionService>,
    ) -> Self {
        let classifier = Arc::new(CompletionClassifier::new(
            Arc::clone(&completion),
            config.description_excerpt_chars,
        ));
        Self::with_classifier(config, structure, completion, classifier)
    }

    /// Build with an explicit capability classifier
    pub fn with_classifier(
        config: DelegationConfig,
        structure: Arc<dyn StructureLookup>,
        completion: Arc<dyn CompletionService>,
        classifier: Arc<dyn CapabilityClassifier>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(&config.circuit_breaker));
        let discovery = Arc::new(CapabilityDiscovery::new(
            Arc::clone(&completion),
            Arc::clone(&structure),
            config.default_capability_confidence,
        ));
        let cache = Arc::new(CapabilityTreeCache::new(discovery, Arc::clone(&structure)));
        let delegator = Arc::new(RecursiveDelegator::new(
            config.clone(),
            breaker,
            Arc::clone(&structure),
            classifier,
            completion,
        ));

        Self {
            config,
            structure,
            cache,
            delegator,
        }
    }

    /// Run `task` starting at `root`
    ///
    /// Fails only when the session or root node does not exist; everything
    /// that goes wrong further down arrives as the run's terminal response.
    #[instrument(skip(self, task))]
    pub async fn run(
        &self,
        session: &SessionId,
        root: &NodeId,
        task: impl Into<String>,
    ) -> Result<DelegationRun> {
        let root_node = self
            .structure
            .node(session, root)
            .await?
            .ok_or_else(|| DelegationError::NodeNotFound(root.clone()))?;

        let snapshot = self.cache.get_or_build(session, root, false).await?;
        info!(
            session_id = %session,
            root_id = %root,
            nodes = snapshot.node_count,
            "Starting run"
        );

        Ok(self.delegator.delegate(
            root_node,
            task,
            snapshot,
            self.config.max_hops,
            self.config.timeout(),
        ))
    }

    /// Forward a structure change to the cache
    pub fn handle_change(&self, change: &StructureChange) {
        self.cache.apply_change(change);
    }

    pub fn config(&self) -> &DelegationConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CapabilityTreeCache> {
        &self.cache
    }

    pub fn delegator(&self) -> &Arc<RecursiveDelegator> {
        &self.delegator
    }
}
