//! Node descriptors - what the structure store knows about a worker

use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

/// A single worker node as seen by the delegation core
///
/// `description` doubles as the node's system role when it executes a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique identifier
    pub id: NodeId,
    /// Display name
    pub name: String,
    /// Declared role ("travel planner", "coordinator", ...)
    pub role: String,
    /// Free-text description of what the node does
    #[serde(default)]
    pub description: String,
}

impl NodeDescriptor {
    /// Create a descriptor with a fresh id and an empty description
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self::with_id(NodeId::new(), name, role)
    }

    /// Create a descriptor with a caller-chosen id
    pub fn with_id(id: impl Into<NodeId>, name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: role.into(),
            description: String::new(),
        }
    }

    /// Set the description
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// The description cut to at most `max_chars` characters
    pub fn excerpt(&self, max_chars: usize) -> &str {
        match self.description.char_indices().nth(max_chars) {
            Some((idx, _)) => &self.description[..idx],
            None => &self.description,
        }
    }

    /// System role used when this node executes a task itself
    pub fn system_role(&self) -> String {
        if self.description.trim().is_empty() {
            format!("You are {}, a {}.", self.name, self.role)
        } else {
            self.description.clone()
        }
    }

    /// Capability keyword used when discovery cannot classify the node
    pub fn fallback_capability(&self) -> String {
        self.role.to_lowercase()
    }
}
