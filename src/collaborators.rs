//! Contracts of the services the delegation core consumes

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

use crate::error::{Result, ServiceError};
use crate::ids::{NodeId, SessionId};
use crate::node::NodeDescriptor;

/// Incremental text fragments from a completion
pub type TextStream = BoxStream<'static, std::result::Result<String, ServiceError>>;

/// Read access to the node hierarchy
#[async_trait]
pub trait StructureLookup: Send + Sync {
    /// Look up a single node. `Ok(None)` means the session exists but the
    /// node does not.
    async fn node(&self, session: &SessionId, id: &NodeId) -> Result<Option<NodeDescriptor>>;

    /// Direct children of `id`, in their stored order
    async fn children_of(&self, session: &SessionId, id: &NodeId) -> Result<Vec<NodeDescriptor>>;
}

/// Text generation
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Generate a full answer for `task` under `system_role`
    async fn complete(&self, system_role: &str, task: &str) -> std::result::Result<String, ServiceError>;

    /// Generate an answer as a stream of fragments
    ///
    /// The default yields the whole `complete` answer as one fragment.
    async fn complete_streaming(
        &self,
        system_role: &str,
        task: &str,
    ) -> std::result::Result<TextStream, ServiceError> {
        let text = self.complete(system_role, task).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }
}

/// Decides whether a node should attempt a task itself
#[async_trait]
pub trait CapabilityClassifier: Send + Sync {
    async fn can_handle(
        &self,
        node: &NodeDescriptor,
        task: &str,
    ) -> std::result::Result<bool, ServiceError>;
}

/// Signal emitted by whoever mutates the node hierarchy
#[derive(Debug, Clone, PartialEq)]
pub enum StructureChange {
    NodeCreated {
        session: SessionId,
        node: NodeId,
        /// Every node whose subtree now differs (the node and its ancestors)
        affected: Vec<NodeId>,
    },
    NodeUpdated {
        session: SessionId,
        node: NodeId,
        affected: Vec<NodeId>,
    },
    NodeDeleted {
        session: SessionId,
        node: NodeId,
        /// Ancestors plus every removed node
        affected: Vec<NodeId>,
    },
    SessionDeleted {
        session: SessionId,
    },
}

impl StructureChange {
    pub fn session(&self) -> &SessionId {
        match self {
            StructureChange::NodeCreated { session, .. }
            | StructureChange::NodeUpdated { session, .. }
            | StructureChange::NodeDeleted { session, .. }
            | StructureChange::SessionDeleted { session } => session,
        }
    }

    /// Roots of every cached tree this change may have altered
    pub fn affected(&self) -> &[NodeId] {
        match self {
            StructureChange::NodeCreated { affected, .. }
            | StructureChange::NodeUpdated { affected, .. }
            | StructureChange::NodeDeleted { affected, .. } => affected,
            StructureChange::SessionDeleted { .. } => &[],
        }
    }
}

/// Receives structure change signals
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, change: &StructureChange);
}

const CLASSIFIER_ROLE: &str =
    "You determine if an agent can handle a request. Respond ONLY with YES or NO.";

/// Classifier backed by a completion service
pub struct CompletionClassifier {
    completion: Arc<dyn CompletionService>,
    excerpt_chars: usize,
}

impl CompletionClassifier {
    pub fn new(completion: Arc<dyn CompletionService>, excerpt_chars: usize) -> Self {
        Self {
            completion,
            excerpt_chars,
        }
    }

    fn prompt(&self, node: &NodeDescriptor, task: &str) -> String {
        format!(
            "Can this agent handle the following request directly?\n\n\
             Agent: {}\nRole: {}\nCapabilities: {}\n\nRequest: {}\n\n\
             Respond with ONLY \"YES\" or \"NO\".\n\
             - YES if the agent can handle this directly\n\
             - NO if they need to delegate to specialists",
            node.name,
            node.role,
            node.excerpt(self.excerpt_chars),
            task,
        )
    }
}

#[async_trait]
impl CapabilityClassifier for CompletionClassifier {
    async fn can_handle(
        &self,
        node: &NodeDescriptor,
        task: &str,
    ) -> std::result::Result<bool, ServiceError> {
        let answer = self
            .completion
            .complete(CLASSIFIER_ROLE, &self.prompt(node, task))
            .await?;
        let capable = answer.to_uppercase().contains("YES");
        debug!(node_id = %node.id, capable, answer = %answer.trim(), "Capability check");
        Ok(capable)
    }
}
