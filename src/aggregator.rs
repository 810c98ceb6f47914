//! Combining several child outcomes into one

use tracing::debug;

use crate::ids::{NodeId, RequestId};
use crate::request::{DelegationResponse, DelegationStatus};

/// Responding id used on synthesized responses
pub const AGGREGATED_RESPONDER: &str = "aggregated";

/// Per-hop penalty applied when several children fulfil the same request
const PATH_PENALTY: f64 = 0.05;

/// Fixed-priority merge of child responses
pub struct ResponseAggregator;

impl ResponseAggregator {
    /// Merge `responses` by priority: Fulfilled, then Partial, then failure
    pub fn aggregate(responses: &[DelegationResponse]) -> DelegationResponse {
        if responses.is_empty() {
            return DelegationResponse::error(
                RequestId::nil(),
                AGGREGATED_RESPONDER,
                "No responses received",
            );
        }

        let mut best: Option<&DelegationResponse> = None;
        for resp in responses.iter().filter(|r| r.is_successful()) {
            // strict comparison keeps the first of equals
            if best.map_or(true, |b| resp.confidence > b.confidence) {
                best = Some(resp);
            }
        }
        if let Some(best) = best {
            return best.clone();
        }

        let partials: Vec<&DelegationResponse> = responses
            .iter()
            .filter(|r| r.status == DelegationStatus::Partial)
            .collect();
        if !partials.is_empty() {
            let result = partials
                .iter()
                .map(|r| r.result.as_str())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n");
            let confidence =
                partials.iter().map(|r| r.confidence).sum::<f64>() / partials.len() as f64;
            debug!(partials = partials.len(), confidence, "Combining partial responses");

            return DelegationResponse::new(
                partials[0].request_id,
                AGGREGATED_RESPONDER,
                DelegationStatus::Partial,
            )
            .with_result(result)
            .with_confidence(confidence)
            .with_children(partials.into_iter().cloned().collect());
        }

        let messages = responses
            .iter()
            .filter_map(DelegationResponse::failure_text)
            .collect::<Vec<_>>()
            .join("; ");

        DelegationResponse::new(
            responses[0].request_id,
            AGGREGATED_RESPONDER,
            DelegationStatus::Unable,
        )
        .with_result("All agents unable to fulfill request")
        .with_error(messages)
        .with_children(responses.to_vec())
    }

    /// Pick one winner when several children fulfilled the request
    ///
    /// Prefers confidence, then shorter paths. Ties go to the first response
    /// encountered, which makes the choice stable but not globally unique.
    pub fn resolve_conflicts(responses: &[DelegationResponse]) -> DelegationResponse {
        let fulfilled: Vec<&DelegationResponse> =
            responses.iter().filter(|r| r.is_successful()).collect();

        match fulfilled.as_slice() {
            [] => Self::aggregate(responses),
            [only] => (*only).clone(),
            many => {
                let mut best = many[0];
                let mut best_score = Self::conflict_score(best);
                for resp in &many[1..] {
                    let score = Self::conflict_score(resp);
                    if score > best_score {
                        best = resp;
                        best_score = score;
                    }
                }
                debug!(
                    candidates = many.len(),
                    winner = %best.responding_id,
                    score = best_score,
                    "Resolved conflicting responses"
                );
                best.clone()
            }
        }
    }

    fn conflict_score(resp: &DelegationResponse) -> f64 {
        // round away float noise so equal intents compare equal
        let raw = resp.confidence - PATH_PENALTY * resp.path.len() as f64;
        (raw * 1e9).round() / 1e9
    }

    /// Whether a response was synthesized rather than produced by a node
    pub fn is_synthesized(resp: &DelegationResponse) -> bool {
        resp.responding_id == NodeId::from(AGGREGATED_RESPONDER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(node: &str, status: DelegationStatus, confidence: f64, path_len: usize) -> DelegationResponse {
        let path = (0..path_len).map(|i| NodeId::from(format!("n{i}"))).collect();
        DelegationResponse::new(RequestId::nil(), node, status)
            .with_confidence(confidence)
            .with_path(path)
    }

    #[test]
    fn test_empty_is_error() {
        let out = ResponseAggregator::aggregate(&[]);
        assert_eq!(out.status, DelegationStatus::Error);
        assert_eq!(out.error_message.as_deref(), Some("No responses received"));
    }

    #[test]
    fn test_fulfilled_highest_confidence_wins() {
        let responses = vec![
            resp("a", DelegationStatus::Partial, 0.99, 1),
            resp("b", DelegationStatus::Fulfilled, 0.6, 1),
            resp("c", DelegationStatus::Fulfilled, 0.9, 1),
            resp("d", DelegationStatus::Fulfilled, 0.9, 1),
        ];
        let out = ResponseAggregator::aggregate(&responses);
        assert_eq!(out.responding_id, NodeId::from("c"));
    }

    #[test]
    fn test_partials_are_combined() {
        let responses = vec![
            resp("a", DelegationStatus::Partial, 0.4, 1).with_result("half"),
            resp("b", DelegationStatus::Unable, 0.0, 1).with_result("nope"),
            resp("c", DelegationStatus::Partial, 0.8, 1).with_result("other half"),
        ];
        let out = ResponseAggregator::aggregate(&responses);
        assert_eq!(out.status, DelegationStatus::Partial);
        assert_eq!(out.result, "half\n\nother half");
        assert!((out.confidence - 0.6).abs() < 1e-9);
        assert_eq!(out.child_responses.len(), 2);
        assert!(ResponseAggregator::is_synthesized(&out));
    }

    #[test]
    fn test_failures_are_joined() {
        let responses = vec![
            resp("a", DelegationStatus::Error, 0.0, 1).with_error("boom"),
            resp("b", DelegationStatus::Unable, 0.0, 1).with_result("no children"),
            resp("c", DelegationStatus::Timeout, 0.0, 1),
        ];
        let out = ResponseAggregator::aggregate(&responses);
        assert_eq!(out.status, DelegationStatus::Unable);
        assert_eq!(out.error_message.as_deref(), Some("boom; no children"));
        assert_eq!(out.child_responses.len(), 3);
    }

    #[test]
    fn test_resolve_single_fulfilled_is_verbatim() {
        let winner = resp("flights", DelegationStatus::Fulfilled, 0.8, 2).with_result("booked");
        let responses = vec![resp("hotels", DelegationStatus::Unable, 0.0, 2), winner.clone()];
        assert_eq!(ResponseAggregator::resolve_conflicts(&responses), winner);
    }

    #[test]
    fn test_resolve_prefers_shorter_path() {
        let responses = vec![
            resp("deep", DelegationStatus::Fulfilled, 0.8, 4),
            resp("near", DelegationStatus::Fulfilled, 0.8, 2),
        ];
        let out = ResponseAggregator::resolve_conflicts(&responses);
        assert_eq!(out.responding_id, NodeId::from("near"));
    }

    #[test]
    fn test_resolve_tie_goes_to_first_encountered() {
        // 0.90 - 0.10 == 0.95 - 0.15
        let responses = vec![
            resp("first", DelegationStatus::Fulfilled, 0.90, 2),
            resp("second", DelegationStatus::Fulfilled, 0.95, 3),
        ];
        let out = ResponseAggregator::resolve_conflicts(&responses);
        assert_eq!(out.responding_id, NodeId::from("first"));
    }

    #[test]
    fn test_resolve_without_fulfilled_aggregates() {
        let responses = vec![resp("a", DelegationStatus::Unable, 0.0, 1).with_result("leaf")];
        let out = ResponseAggregator::resolve_conflicts(&responses);
        assert_eq!(out.status, DelegationStatus::Unable);
        assert_eq!(out.error_message.as_deref(), Some("leaf"));
    }
}
