//! Per-session cache of capability trees

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::capability::CapabilityTreeSnapshot;
use crate::collaborators::{ChangeListener, StructureChange, StructureLookup};
use crate::discovery::CapabilityDiscovery;
use crate::error::{DelegationError, Result};
use crate::ids::{NodeId, SessionId};

type CacheKey = (SessionId, NodeId);

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, Arc<CapabilityTreeSnapshot>>,
    invalidations: HashMap<CacheKey, DateTime<Utc>>,
    /// Held for the whole check-build-store sequence of one key
    build_gates: HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub cached_trees: usize,
    pub invalidation_pending: usize,
    pub sessions: usize,
    pub total_nodes: usize,
}

/// Memoizes one capability tree per (session, root)
///
/// Trees are built lazily and rebuilt after an invalidation mark newer than
/// their creation time. At most one build per key runs at a time; concurrent
/// callers for the same key wait and then reuse the fresh result.
pub struct CapabilityTreeCache {
    discovery: Arc<CapabilityDiscovery>,
    structure: Arc<dyn StructureLookup>,
    state: Mutex<CacheState>,
}

impl CapabilityTreeCache {
    pub fn new(discovery: Arc<CapabilityDiscovery>, structure: Arc<dyn StructureLookup>) -> Self {
        Self {
            discovery,
            structure,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Cached snapshot for (session, root), building it when missing or stale
    #[instrument(skip(self))]
    pub async fn get_or_build(
        &self,
        session: &SessionId,
        root: &NodeId,
        force_rebuild: bool,
    ) -> Result<Arc<CapabilityTreeSnapshot>> {
        let key = (session.clone(), root.clone());

        if !force_rebuild {
            if let Some(snapshot) = self.fresh(&key) {
                return Ok(snapshot);
            }
        }

        let gate = self.build_gate(&key);
        let building = gate.lock().await;

        // Another caller may have finished a build while we waited
        let fresh = if force_rebuild { None } else { self.fresh(&key) };
        let outcome = match fresh {
            Some(snapshot) => Ok(snapshot),
            None => self.build(&key).await,
        };

        drop(building);
        self.release_gate(&key, &gate);
        outcome
    }

    async fn build(&self, key: &CacheKey) -> Result<Arc<CapabilityTreeSnapshot>> {
        let (session, root) = key;
        info!(session_id = %session, root_id = %root, "Building capability tree");
        let started = Utc::now();
        let root_node = self
            .structure
            .node(session, root)
            .await?
            .ok_or_else(|| DelegationError::NodeNotFound(root.clone()))?;
        let tree = self.discovery.discover(session, &root_node).await;
        let snapshot = Arc::new(CapabilityTreeSnapshot::new(session.clone(), tree, started));

        let mut state = self.state.lock();
        if state
            .invalidations
            .get(key)
            .is_some_and(|mark| *mark <= snapshot.created_at)
        {
            state.invalidations.remove(key);
        }
        state.entries.insert(key.clone(), Arc::clone(&snapshot));
        info!(
            session_id = %session,
            root_id = %root,
            nodes = snapshot.node_count,
            max_depth = snapshot.max_depth,
            "Capability tree cached"
        );

        Ok(snapshot)
    }

    /// Fresh cached entry, evicting it when an invalidation superseded it
    fn fresh(&self, key: &CacheKey) -> Option<Arc<CapabilityTreeSnapshot>> {
        let mut state = self.state.lock();
        let snapshot = state.entries.get(key).cloned()?;

        let stale = state
            .invalidations
            .get(key)
            .is_some_and(|mark| *mark > snapshot.created_at);
        if stale {
            debug!(session_id = %key.0, root_id = %key.1, "Cached tree invalidated");
            state.entries.remove(key);
            return None;
        }

        snapshot.touch();
        debug!(
            session_id = %key.0,
            root_id = %key.1,
            nodes = snapshot.node_count,
            "Capability tree cache hit"
        );
        Some(snapshot)
    }

    fn build_gate(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut state = self.state.lock();
        Arc::clone(state.build_gates.entry(key.clone()).or_default())
    }

    /// Forget the gate once nobody else holds or waits on it
    fn release_gate(&self, key: &CacheKey, gate: &Arc<tokio::sync::Mutex<()>>) {
        let mut state = self.state.lock();
        let idle = state
            .build_gates
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, gate) && Arc::strong_count(gate) == 2);
        if idle {
            state.build_gates.remove(key);
        }
    }

    /// Mark one tree, or every tree of the session, as stale
    ///
    /// Session-wide marks cover cached trees and builds still in flight.
    /// Entries stay in place until their next access.
    pub fn invalidate(&self, session: &SessionId, root: Option<&NodeId>) {
        let now = Utc::now();
        let mut state = self.state.lock();

        match root {
            Some(root) => {
                state
                    .invalidations
                    .insert((session.clone(), root.clone()), now);
                debug!(session_id = %session, root_id = %root, "Invalidated capability tree");
            }
            None => {
                let keys: Vec<CacheKey> = state
                    .entries
                    .keys()
                    .chain(state.build_gates.keys())
                    .filter(|(s, _)| s == session)
                    .cloned()
                    .collect();
                let count = keys.len();
                for key in keys {
                    state.invalidations.insert(key, now);
                }
                debug!(session_id = %session, trees = count, "Invalidated session capability trees");
            }
        }
    }

    /// Drop every entry of a session
    pub fn clear_session(&self, session: &SessionId) {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|(s, _), _| s != session);
        state.invalidations.retain(|(s, _), _| s != session);
        state.build_gates.retain(|(s, _), _| s != session);
        info!(
            session_id = %session,
            removed = before - state.entries.len(),
            "Cleared session capability trees"
        );
    }

    /// Drop everything
    pub fn clear_all(&self) {
        let mut state = self.state.lock();
        let removed = state.entries.len();
        *state = CacheState::default();
        info!(removed, "Cleared all capability trees");
    }

    /// Translate a structure change into invalidations
    pub fn apply_change(&self, change: &StructureChange) {
        match change {
            StructureChange::SessionDeleted { session } => self.clear_session(session),
            other => {
                for root in other.affected() {
                    self.invalidate(other.session(), Some(root));
                }
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let mut sessions: Vec<&SessionId> = state.entries.keys().map(|(s, _)| s).collect();
        sessions.sort();
        sessions.dedup();
        CacheStats {
            cached_trees: state.entries.len(),
            invalidation_pending: state.invalidations.len(),
            sessions: sessions.len(),
            total_nodes: state.entries.values().map(|s| s.node_count).sum(),
        }
    }
}

impl ChangeListener for CapabilityTreeCache {
    fn on_change(&self, change: &StructureChange) {
        self.apply_change(change);
    }
}
