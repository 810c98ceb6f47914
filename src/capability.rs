//! Capability trees and cached snapshots of them

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::ids::{NodeId, SessionId};

/// One node of a capability tree
///
/// Mirrors the structure hierarchy, annotated with what the node can handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityNode {
    pub node_id: NodeId,
    pub name: String,
    /// Keywords in the order discovery produced them
    pub capabilities: Vec<String>,
    /// How well the node handles its keywords, 0.0 - 1.0
    pub confidence: f64,
    /// Distance from the root (root = 0)
    pub depth: usize,
    pub children: Vec<CapabilityNode>,
}

impl CapabilityNode {
    /// Create a leaf node
    pub fn leaf(
        node_id: impl Into<NodeId>,
        name: impl Into<String>,
        capabilities: Vec<String>,
        confidence: f64,
        depth: usize,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            name: name.into(),
            capabilities,
            confidence: confidence.clamp(0.0, 1.0),
            depth,
            children: Vec::new(),
        }
    }

    /// Attach children
    pub fn with_children(mut self, children: Vec<CapabilityNode>) -> Self {
        self.children = children;
        self
    }

    /// Every keyword in this subtree, deduplicated and sorted
    pub fn all_capabilities(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.visit(&mut |node| {
            seen.extend(node.capabilities.iter().cloned());
        });
        seen.into_iter().collect()
    }

    /// Find a node anywhere in this subtree
    pub fn find(&self, node_id: &NodeId) -> Option<&CapabilityNode> {
        if &self.node_id == node_id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(node_id))
    }

    /// Deepest absolute depth reached in this subtree
    pub fn max_depth(&self) -> usize {
        self.children
            .iter()
            .map(CapabilityNode::max_depth)
            .max()
            .unwrap_or(self.depth)
    }

    /// Number of nodes in this subtree, including self
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(CapabilityNode::node_count).sum::<usize>()
    }

    /// Pre-order walk
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a CapabilityNode)) {
        f(self);
        for child in &self.children {
            child.visit(f);
        }
    }
}

/// Complete capability tree for one (session, root) pair
///
/// Immutable once built; only the access timestamp moves.
#[derive(Debug)]
pub struct CapabilityTreeSnapshot {
    pub session_id: SessionId,
    pub root_id: NodeId,
    pub tree: CapabilityNode,
    pub node_count: usize,
    /// Levels below the root (a lone root has max depth 0)
    pub max_depth: usize,
    pub created_at: DateTime<Utc>,
    last_accessed: Mutex<DateTime<Utc>>,
}

impl CapabilityTreeSnapshot {
    /// Wrap a discovered tree, stamping it with `created_at`
    pub fn new(session_id: SessionId, tree: CapabilityNode, created_at: DateTime<Utc>) -> Self {
        let node_count = tree.node_count();
        let max_depth = tree.max_depth() - tree.depth;
        Self {
            session_id,
            root_id: tree.node_id.clone(),
            tree,
            node_count,
            max_depth,
            created_at,
            last_accessed: Mutex::new(created_at),
        }
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        *self.last_accessed.lock()
    }

    pub(crate) fn touch(&self) {
        *self.last_accessed.lock() = Utc::now();
    }

    /// Flat list of every node id, pre-order
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids = Vec::with_capacity(self.node_count);
        self.tree.visit(&mut |node| ids.push(node.node_id.clone()));
        ids
    }

    pub fn find_node(&self, node_id: &NodeId) -> Option<&CapabilityNode> {
        self.tree.find(node_id)
    }
}
