//! Delegation requests and responses

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{NodeId, RequestId};

/// Default hop limit for a fresh request
pub const DEFAULT_MAX_HOPS: u32 = 10;

/// Default advisory timeout for a fresh request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A task travelling through the hierarchy
///
/// Immutable: forwarding produces a new value. The path always includes the
/// current node, so `path.len() == attempts + 1`.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    pub request_id: RequestId,
    pub origin_id: NodeId,
    pub current_id: NodeId,
    pub task: String,
    pub context: HashMap<String, serde_json::Value>,
    pub path: Vec<NodeId>,
    pub attempts: u32,
    pub max_hops: u32,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
}

impl DelegationRequest {
    /// Start a new request at `origin`
    pub fn new(origin: impl Into<NodeId>, task: impl Into<String>) -> Self {
        let origin = origin.into();
        Self {
            request_id: RequestId::new(),
            current_id: origin.clone(),
            path: vec![origin.clone()],
            origin_id: origin,
            task: task.into(),
            context: HashMap::new(),
            attempts: 0,
            max_hops: DEFAULT_MAX_HOPS,
            timeout: DEFAULT_TIMEOUT,
            created_at: Utc::now(),
        }
    }

    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Override the creation time (used to replay or test expiry)
    pub fn created(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// A copy of this request, one hop further down to `node`
    pub fn forward_to(&self, node: &NodeId) -> Self {
        let mut path = self.path.clone();
        path.push(node.clone());
        Self {
            request_id: self.request_id,
            origin_id: self.origin_id.clone(),
            current_id: node.clone(),
            task: self.task.clone(),
            context: self.context.clone(),
            path,
            attempts: self.attempts + 1,
            max_hops: self.max_hops,
            timeout: self.timeout,
            created_at: self.created_at,
        }
    }

    /// True when some node occurs twice in the path
    pub fn has_cycle(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.path.len());
        !self.path.iter().all(|id| seen.insert(id))
    }

    pub fn exceeds_depth(&self) -> bool {
        self.attempts >= self.max_hops
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Expiry relative to an explicit clock reading
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match (now - self.created_at).to_std() {
            Ok(elapsed) => elapsed > self.timeout,
            // now is before created_at
            Err(_) => false,
        }
    }
}

/// Outcome status of a delegation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Fulfilled,
    Partial,
    Unable,
    Timeout,
    Error,
    NeedsUserInput,
}

impl std::fmt::Display for DelegationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DelegationStatus::Fulfilled => "fulfilled",
            DelegationStatus::Partial => "partial",
            DelegationStatus::Unable => "unable",
            DelegationStatus::Timeout => "timeout",
            DelegationStatus::Error => "error",
            DelegationStatus::NeedsUserInput => "needs_user_input",
        };
        f.write_str(s)
    }
}

/// Terminal answer of one node to a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationResponse {
    pub request_id: RequestId,
    pub responding_id: NodeId,
    pub status: DelegationStatus,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub path: Vec<NodeId>,
    /// Responses this one was derived from, kept for audit
    #[serde(default)]
    pub child_responses: Vec<DelegationResponse>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl DelegationResponse {
    pub fn new(request_id: RequestId, responding_id: impl Into<NodeId>, status: DelegationStatus) -> Self {
        Self {
            request_id,
            responding_id: responding_id.into(),
            status,
            result: String::new(),
            confidence: 0.0,
            path: Vec::new(),
            child_responses: Vec::new(),
            error_message: None,
            metadata: HashMap::new(),
        }
    }

    /// A failed response carrying `message`
    pub fn error(request_id: RequestId, responding_id: impl Into<NodeId>, message: impl Into<String>) -> Self {
        Self::new(request_id, responding_id, DelegationStatus::Error).with_error(message)
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = result.into();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_path(mut self, path: Vec<NodeId>) -> Self {
        self.path = path;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_children(mut self, children: Vec<DelegationResponse>) -> Self {
        self.child_responses = children;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_successful(&self) -> bool {
        self.status == DelegationStatus::Fulfilled
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.status,
            DelegationStatus::Unable | DelegationStatus::Error | DelegationStatus::Timeout
        )
    }

    /// Error text, or the result when no error is set
    pub fn failure_text(&self) -> Option<&str> {
        self.error_message
            .as_deref()
            .or(Some(self.result.as_str()))
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_request_path_holds_origin() {
        let req = DelegationRequest::new("root", "book a flight");
        assert_eq!(req.path, vec![NodeId::from("root")]);
        assert_eq!(req.current_id, NodeId::from("root"));
        assert_eq!(req.attempts, 0);
        assert_eq!(req.path.len() as u32, req.attempts + 1);
    }

    #[test]
    fn test_forward_extends_path_and_attempts() {
        let req = DelegationRequest::new("root", "book a flight")
            .with_max_hops(4)
            .with_timeout(Duration::from_secs(5))
            .with_context("session_id", serde_json::json!("s1"));
        let child = req.forward_to(&NodeId::from("flights"));

        assert_eq!(child.request_id, req.request_id);
        assert_eq!(child.origin_id, req.origin_id);
        assert_eq!(child.current_id, NodeId::from("flights"));
        assert_eq!(child.path, vec![NodeId::from("root"), NodeId::from("flights")]);
        assert_eq!(child.attempts, 1);
        assert_eq!(child.max_hops, 4);
        assert_eq!(child.timeout, Duration::from_secs(5));
        assert_eq!(child.created_at, req.created_at);
        assert_eq!(child.context, req.context);
        assert_eq!(child.path.len() as u32, child.attempts + 1);
        // original untouched
        assert_eq!(req.path.len(), 1);
    }

    #[test]
    fn test_cycle_detection() {
        let req = DelegationRequest::new("a", "t");
        let req = req.forward_to(&NodeId::from("b"));
        assert!(!req.has_cycle());
        let req = req.forward_to(&NodeId::from("a"));
        assert!(req.has_cycle());
    }

    #[test]
    fn test_depth_limit() {
        let req = DelegationRequest::new("a", "t").with_max_hops(2);
        assert!(!req.exceeds_depth());
        let req = req.forward_to(&NodeId::from("b"));
        assert!(!req.exceeds_depth());
        let req = req.forward_to(&NodeId::from("c"));
        assert!(req.exceeds_depth());
    }

    #[test]
    fn test_expiry_is_strict() {
        let created = Utc::now();
        let req = DelegationRequest::new("a", "t")
            .with_timeout(Duration::from_secs(10))
            .created(created);

        assert!(!req.is_expired_at(created));
        assert!(!req.is_expired_at(created + chrono::Duration::seconds(10)));
        assert!(req.is_expired_at(created + chrono::Duration::milliseconds(10_001)));
        assert!(!req.is_expired_at(created - chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_response_status_helpers() {
        let id = RequestId::new();
        assert!(DelegationResponse::new(id, "a", DelegationStatus::Fulfilled).is_successful());
        assert!(DelegationResponse::new(id, "a", DelegationStatus::Timeout).is_failure());
        let partial = DelegationResponse::new(id, "a", DelegationStatus::Partial);
        assert!(!partial.is_successful());
        assert!(!partial.is_failure());
    }

    #[test]
    fn test_failure_text_prefers_error() {
        let id = RequestId::new();
        let resp = DelegationResponse::new(id, "a", DelegationStatus::Unable).with_result("no children");
        assert_eq!(resp.failure_text(), Some("no children"));

        let resp = resp.with_error("boom");
        assert_eq!(resp.failure_text(), Some("boom"));

        let empty = DelegationResponse::new(id, "a", DelegationStatus::Error);
        assert_eq!(empty.failure_text(), None);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&DelegationStatus::NeedsUserInput).unwrap();
        assert_eq!(json, "\"needs_user_input\"");
    }
}
