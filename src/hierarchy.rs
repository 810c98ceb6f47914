//! Node hierarchy - an arena of nodes addressed by id

use std::collections::HashMap;

use crate::error::{DelegationError, Result};
use crate::ids::NodeId;
use crate::node::NodeDescriptor;

/// Entry in the hierarchy arena
#[derive(Debug, Clone)]
struct HierarchyNode {
    descriptor: NodeDescriptor,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Parent/child structure of one session's nodes
///
/// Parent links are plain ids; each entry owns its ordered child list. Every
/// mutation keeps the structure acyclic.
#[derive(Debug, Default, Clone)]
pub struct NodeHierarchy {
    nodes: HashMap<NodeId, HierarchyNode>,
    /// Parentless nodes in insertion order
    roots: Vec<NodeId>,
}

impl NodeHierarchy {
    /// Create a new empty hierarchy
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node under `parent_id`, or as a root when `None`
    pub fn add_node(&mut self, descriptor: NodeDescriptor, parent_id: Option<NodeId>) -> Result<()> {
        let id = descriptor.id.clone();
        if self.nodes.contains_key(&id) {
            return Err(DelegationError::InvalidStructure(format!("Node already exists: {id}")));
        }

        match &parent_id {
            Some(pid) => self
                .nodes
                .get_mut(pid)
                .ok_or_else(|| DelegationError::NodeNotFound(pid.clone()))?
                .children
                .push(id.clone()),
            None => self.roots.push(id.clone()),
        }

        self.nodes.insert(
            id,
            HierarchyNode {
                descriptor,
                parent: parent_id,
                children: Vec::new(),
            },
        );
        Ok(())
    }

    /// Replace a node's descriptor, keeping its position
    pub fn update_node(&mut self, descriptor: NodeDescriptor) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&descriptor.id)
            .ok_or_else(|| DelegationError::NodeNotFound(descriptor.id.clone()))?;
        node.descriptor = descriptor;
        Ok(())
    }

    /// Move a node (with its subtree) under a new parent, or make it a root
    pub fn set_parent(&mut self, id: &NodeId, new_parent: Option<NodeId>) -> Result<()> {
        if !self.nodes.contains_key(id) {
            return Err(DelegationError::NodeNotFound(id.clone()));
        }
        if let Some(pid) = &new_parent {
            if !self.nodes.contains_key(pid) {
                return Err(DelegationError::NodeNotFound(pid.clone()));
            }
            if pid == id || self.ancestors(pid).contains(id) {
                return Err(DelegationError::InvalidStructure(format!(
                    "Moving {id} under {pid} would create a cycle"
                )));
            }
        }

        self.detach(id);
        match &new_parent {
            Some(pid) => {
                if let Some(parent) = self.nodes.get_mut(pid) {
                    parent.children.push(id.clone());
                }
            }
            None => self.roots.push(id.clone()),
        }
        if let Some(node) = self.nodes.get_mut(id) {
            node.parent = new_parent;
        }
        Ok(())
    }

    /// Remove a node and its whole subtree, returning the removed ids
    pub fn remove_node(&mut self, id: &NodeId) -> Vec<NodeId> {
        if !self.nodes.contains_key(id) {
            return Vec::new();
        }
        self.detach(id);

        let mut removed = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children.into_iter().rev());
                removed.push(current);
            }
        }
        removed
    }

    /// Unlink a node from its parent's child list (or the root list)
    fn detach(&mut self, id: &NodeId) {
        let parent = self.nodes.get(id).and_then(|n| n.parent.clone());
        match parent {
            Some(pid) => {
                if let Some(parent) = self.nodes.get_mut(&pid) {
                    parent.children.retain(|c| c != id);
                }
            }
            None => self.roots.retain(|r| r != id),
        }
    }

    /// Get a node's descriptor
    pub fn get(&self, id: &NodeId) -> Option<&NodeDescriptor> {
        self.nodes.get(id).map(|n| &n.descriptor)
    }

    /// Root node ids in insertion order
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Get parent of a node
    pub fn parent(&self, id: &NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|n| n.parent.clone())
    }

    /// Ordered child descriptors of a node
    pub fn children(&self, id: &NodeId) -> Vec<NodeDescriptor> {
        self.nodes
            .get(id)
            .map(|n| {
                n.children
                    .iter()
                    .filter_map(|c| self.get(c).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ancestors from the direct parent up to the root
    pub fn ancestors(&self, id: &NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.parent(id);
        while let Some(pid) = current {
            current = self.parent(&pid);
            out.push(pid);
        }
        out
    }

    /// Distance from the node's root (roots are 0)
    pub fn depth(&self, id: &NodeId) -> usize {
        self.ancestors(id).len()
    }

    /// Get all nodes at a specific depth
    pub fn nodes_at_depth(&self, depth: usize) -> Vec<NodeId> {
        self.nodes
            .keys()
            .filter(|id| self.depth(id) == depth)
            .cloned()
            .collect()
    }

    /// Get total node count
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if hierarchy is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
