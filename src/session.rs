//! In-memory multi-session structure store

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::collaborators::{ChangeListener, StructureChange, StructureLookup};
use crate::error::{DelegationError, Result};
use crate::hierarchy::NodeHierarchy;
use crate::ids::{NodeId, SessionId};
use crate::node::NodeDescriptor;

/// Node hierarchies keyed by session
///
/// Every mutation is announced to the registered listeners after the write
/// lock is released, so a listener may read back from the store.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, NodeHierarchy>>,
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for structure changes
    pub fn subscribe(&self, listener: Arc<dyn ChangeListener>) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, change: StructureChange) {
        debug!(?change, "Structure changed");
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_change(&change);
        }
    }

    /// Create an empty session
    pub fn create_session(&self) -> SessionId {
        let id = SessionId::new();
        self.sessions.write().insert(id.clone(), NodeHierarchy::new());
        info!(session_id = %id, "Created session");
        id
    }

    /// Create an empty session with a caller-chosen id
    pub fn insert_session(&self, id: SessionId) -> Result<()> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) {
            return Err(DelegationError::InvalidStructure(format!("Session already exists: {id}")));
        }
        sessions.insert(id.clone(), NodeHierarchy::new());
        info!(session_id = %id, "Created session");
        Ok(())
    }

    pub fn delete_session(&self, session: &SessionId) -> Result<()> {
        self.sessions
            .write()
            .remove(session)
            .ok_or_else(|| DelegationError::SessionNotFound(session.clone()))?;
        info!(session_id = %session, "Deleted session");
        self.notify(StructureChange::SessionDeleted {
            session: session.clone(),
        });
        Ok(())
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Run `f` against one session's hierarchy under the write lock
    fn with_hierarchy<T>(
        &self,
        session: &SessionId,
        f: impl FnOnce(&mut NodeHierarchy) -> Result<T>,
    ) -> Result<T> {
        let mut sessions = self.sessions.write();
        let hierarchy = sessions
            .get_mut(session)
            .ok_or_else(|| DelegationError::SessionNotFound(session.clone()))?;
        f(hierarchy)
    }

    /// Add a node, under `parent` or as a root
    pub fn add_node(
        &self,
        session: &SessionId,
        descriptor: NodeDescriptor,
        parent: Option<NodeId>,
    ) -> Result<NodeId> {
        let id = descriptor.id.clone();
        let affected = self.with_hierarchy(session, |h| {
            h.add_node(descriptor, parent)?;
            Ok(self_and_ancestors(h, &id))
        })?;
        info!(session_id = %session, node_id = %id, "Added node");
        self.notify(StructureChange::NodeCreated {
            session: session.clone(),
            node: id.clone(),
            affected,
        });
        Ok(id)
    }

    /// Replace a node's descriptor
    pub fn update_node(&self, session: &SessionId, descriptor: NodeDescriptor) -> Result<()> {
        let id = descriptor.id.clone();
        let affected = self.with_hierarchy(session, |h| {
            h.update_node(descriptor)?;
            Ok(self_and_ancestors(h, &id))
        })?;
        debug!(session_id = %session, node_id = %id, "Updated node");
        self.notify(StructureChange::NodeUpdated {
            session: session.clone(),
            node: id,
            affected,
        });
        Ok(())
    }

    /// Move a node under a new parent
    ///
    /// Both the old and the new ancestor chains are reported as affected.
    pub fn set_parent(&self, session: &SessionId, id: &NodeId, parent: Option<NodeId>) -> Result<()> {
        let affected = self.with_hierarchy(session, |h| {
            let mut affected = self_and_ancestors(h, id);
            h.set_parent(id, parent)?;
            for ancestor in h.ancestors(id) {
                if !affected.contains(&ancestor) {
                    affected.push(ancestor);
                }
            }
            Ok(affected)
        })?;
        info!(session_id = %session, node_id = %id, "Moved node");
        self.notify(StructureChange::NodeUpdated {
            session: session.clone(),
            node: id.clone(),
            affected,
        });
        Ok(())
    }

    /// Remove a node and its subtree, returning the removed ids
    pub fn remove_node(&self, session: &SessionId, id: &NodeId) -> Result<Vec<NodeId>> {
        let (removed, mut affected) = self.with_hierarchy(session, |h| {
            if h.get(id).is_none() {
                return Err(DelegationError::NodeNotFound(id.clone()));
            }
            let ancestors = h.ancestors(id);
            Ok((h.remove_node(id), ancestors))
        })?;
        affected.extend(removed.iter().cloned());
        info!(session_id = %session, node_id = %id, removed = removed.len(), "Removed node");
        self.notify(StructureChange::NodeDeleted {
            session: session.clone(),
            node: id.clone(),
            affected,
        });
        Ok(removed)
    }

    /// Root ids of a session
    pub fn roots(&self, session: &SessionId) -> Result<Vec<NodeId>> {
        let sessions = self.sessions.read();
        let hierarchy = sessions
            .get(session)
            .ok_or_else(|| DelegationError::SessionNotFound(session.clone()))?;
        Ok(hierarchy.roots().to_vec())
    }

    pub fn node_count(&self, session: &SessionId) -> Result<usize> {
        let sessions = self.sessions.read();
        sessions
            .get(session)
            .map(NodeHierarchy::len)
            .ok_or_else(|| DelegationError::SessionNotFound(session.clone()))
    }
}

fn self_and_ancestors(hierarchy: &NodeHierarchy, id: &NodeId) -> Vec<NodeId> {
    let mut ids = vec![id.clone()];
    ids.extend(hierarchy.ancestors(id));
    ids
}

#[async_trait]
impl StructureLookup for SessionStore {
    async fn node(&self, session: &SessionId, id: &NodeId) -> Result<Option<NodeDescriptor>> {
        let sessions = self.sessions.read();
        let hierarchy = sessions
            .get(session)
            .ok_or_else(|| DelegationError::SessionNotFound(session.clone()))?;
        Ok(hierarchy.get(id).cloned())
    }

    async fn children_of(&self, session: &SessionId, id: &NodeId) -> Result<Vec<NodeDescriptor>> {
        let sessions = self.sessions.read();
        let hierarchy = sessions
            .get(session)
            .ok_or_else(|| DelegationError::SessionNotFound(session.clone()))?;
        Ok(hierarchy.children(id))
    }
}
