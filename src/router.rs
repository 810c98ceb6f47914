//! Capability-based scoring of nodes against a task

use serde::Serialize;

use crate::capability::CapabilityNode;
use crate::ids::NodeId;
use crate::request::DelegationRequest;

/// Per-level penalty applied to deeper nodes
const DEPTH_PENALTY: f64 = 0.2;

/// A scored routing candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteCandidate {
    pub node_id: NodeId,
    pub name: String,
    pub score: f64,
}

/// Ranks nodes of a capability tree for a task
///
/// Stateless; every method is a pure function of its inputs.
pub struct DelegationRouter;

impl DelegationRouter {
    /// Score in 0.0..=1.0; zero when no keyword occurs in the task
    pub fn score(task: &str, node: &CapabilityNode) -> f64 {
        let task = task.to_lowercase();
        let matches = node
            .capabilities
            .iter()
            .filter(|kw| task.contains(&kw.to_lowercase()))
            .count();
        if matches == 0 {
            return 0.0;
        }

        let keyword_score = matches as f64 / node.capabilities.len() as f64;
        let depth_penalty = 1.0 / (1.0 + DEPTH_PENALTY * node.depth as f64);
        keyword_score * node.confidence * depth_penalty
    }

    /// Top `top_n` nodes with a positive score, best first
    ///
    /// Equal scores keep pre-order traversal order.
    pub fn find_best(task: &str, tree: &CapabilityNode, top_n: usize) -> Vec<RouteCandidate> {
        let mut scored = Vec::new();
        tree.visit(&mut |node| {
            let score = Self::score(task, node);
            if score > 0.0 {
                scored.push(RouteCandidate {
                    node_id: node.node_id.clone(),
                    name: node.name.clone(),
                    score,
                });
            }
        });

        // sort_by is stable
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_n);
        scored
    }

    /// The single best node for a request, if any scores above zero
    pub fn route(request: &DelegationRequest, tree: &CapabilityNode) -> Option<NodeId> {
        Self::find_best(&request.task, tree, 1)
            .into_iter()
            .next()
            .map(|c| c.node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_no_match_scores_zero() {
        let node = CapabilityNode::leaf("a", "A", kw(&["flight booking"]), 0.9, 0);
        assert_eq!(DelegationRouter::score("find me a hotel", &node), 0.0);
    }

    #[test]
    fn test_empty_keyword_list_scores_zero() {
        let node = CapabilityNode::leaf("a", "A", vec![], 0.9, 0);
        assert_eq!(DelegationRouter::score("anything", &node), 0.0);
    }

    #[test]
    fn test_match_is_case_insensitive() {
        let node = CapabilityNode::leaf("a", "A", kw(&["Flight Booking", "seats"]), 1.0, 0);
        let score = DelegationRouter::score("I need FLIGHT BOOKING for Tuesday", &node);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_score_formula_with_depth() {
        let node = CapabilityNode::leaf("a", "A", kw(&["flights", "hotels", "cars"]), 0.6, 2);
        // 2/3 * 0.6 / 1.4
        let expected = (2.0 / 3.0) * 0.6 / 1.4;
        let score = DelegationRouter::score("flights and hotels please", &node);
        assert!((score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_shallower_node_wins_at_equal_match() {
        let shallow = CapabilityNode::leaf("s", "S", kw(&["flights"]), 0.7, 1);
        let deep = CapabilityNode::leaf("d", "D", kw(&["flights"]), 0.7, 3);
        assert!(DelegationRouter::score("flights", &shallow) > DelegationRouter::score("flights", &deep));
    }

    #[test]
    fn test_find_best_orders_and_truncates() {
        let a = CapabilityNode::leaf("a", "A", kw(&["flights"]), 0.7, 1);
        let b = CapabilityNode::leaf("b", "B", kw(&["flights", "visa"]), 0.7, 1);
        let c = CapabilityNode::leaf("c", "C", kw(&["flights"]), 0.7, 1);
        let root = CapabilityNode::leaf("root", "Root", kw(&["coordination"]), 0.7, 0)
            .with_children(vec![a, b, c]);

        let best = DelegationRouter::find_best("book flights", &root, 2);
        assert_eq!(best.len(), 2);
        // a and c tie; traversal order keeps a first
        assert_eq!(best[0].node_id, NodeId::from("a"));
        assert_eq!(best[1].node_id, NodeId::from("c"));
    }

    #[test]
    fn test_route_returns_best_or_none() {
        let root = CapabilityNode::leaf("root", "Root", kw(&["coordination"]), 0.7, 0)
            .with_children(vec![CapabilityNode::leaf("f", "F", kw(&["flights"]), 0.7, 1)]);

        let req = DelegationRequest::new("root", "cheap flights to Lisbon");
        assert_eq!(DelegationRouter::route(&req, &root), Some(NodeId::from("f")));

        let req = DelegationRequest::new("root", "write a poem");
        assert_eq!(DelegationRouter::route(&req, &root), None);
    }
}
