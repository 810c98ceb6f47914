//! Per-node circuit breaker

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ids::NodeId;

/// Breaker tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long an open circuit stays open, in seconds
    pub open_duration_secs: f64,
}

/// Cap on how far ahead an open circuit's deadline is placed
const MAX_OPEN_WINDOW: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

impl CircuitBreakerConfig {
    /// Open window; out-of-range values saturate instead of panicking
    pub fn open_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.open_duration_secs.max(0.0)).unwrap_or(Duration::MAX)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_duration_secs: 60.0,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct BreakerState {
    failures: u32,
    open_until: Option<Instant>,
}

/// Skips nodes that keep failing
///
/// There is no half-open probe: once the open window passes, the failure
/// count resets and the next attempt is an ordinary one.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    open_duration: Duration,
    states: Mutex<HashMap<NodeId, BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self::with_params(config.failure_threshold, config.open_duration())
    }

    pub fn with_params(threshold: u32, open_duration: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            open_duration,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn should_try(&self, node: &NodeId) -> bool {
        self.should_try_at(node, Instant::now())
    }

    /// Whether `node` may be attempted at `now`
    pub fn should_try_at(&self, node: &NodeId, now: Instant) -> bool {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(node) else {
            return true;
        };
        match state.open_until {
            Some(until) if now < until => false,
            Some(_) => {
                debug!(node_id = %node, "Circuit window elapsed, resetting");
                state.open_until = None;
                state.failures = 0;
                true
            }
            None => true,
        }
    }

    /// Walk the failure count back by one; an open circuit stays open
    pub fn record_success(&self, node: &NodeId) {
        if let Some(state) = self.states.lock().get_mut(node) {
            state.failures = state.failures.saturating_sub(1);
        }
    }

    pub fn record_failure(&self, node: &NodeId) {
        self.record_failure_at(node, Instant::now());
    }

    pub fn record_failure_at(&self, node: &NodeId, now: Instant) {
        let mut states = self.states.lock();
        let state = states.entry(node.clone()).or_default();
        state.failures += 1;

        let already_open = matches!(state.open_until, Some(until) if now < until);
        if state.failures >= self.threshold && !already_open {
            state.open_until = Some(open_deadline(now, self.open_duration));
            warn!(
                node_id = %node,
                failures = state.failures,
                open_secs = self.open_duration.as_secs_f64(),
                "Circuit opened"
            );
        }
    }

    /// Current consecutive-failure count
    pub fn failure_count(&self, node: &NodeId) -> u32 {
        self.states.lock().get(node).map(|s| s.failures).unwrap_or(0)
    }

    /// When the circuit for `node` closes again, if open
    pub fn open_until(&self, node: &NodeId) -> Option<Instant> {
        self.states.lock().get(node).and_then(|s| s.open_until)
    }

    /// Forget everything about `node`
    pub fn reset(&self, node: &NodeId) {
        self.states.lock().remove(node);
    }
}

fn open_deadline(now: Instant, window: Duration) -> Instant {
    now.checked_add(window)
        .or_else(|| now.checked_add(MAX_OPEN_WINDOW))
        .unwrap_or(now)
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(&CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::with_params(3, Duration::from_secs(60))
    }

    #[test]
    fn test_unknown_node_is_tried() {
        assert!(breaker().should_try(&NodeId::from("fresh")));
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = breaker();
        let node = NodeId::from("flaky");
        let now = Instant::now();

        cb.record_failure_at(&node, now);
        cb.record_failure_at(&node, now);
        assert!(cb.should_try_at(&node, now));

        cb.record_failure_at(&node, now);
        assert!(!cb.should_try_at(&node, now));
        assert_eq!(cb.open_until(&node), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_open_window_is_half_open_interval() {
        let cb = breaker();
        let node = NodeId::from("flaky");
        let trip = Instant::now();
        for _ in 0..3 {
            cb.record_failure_at(&node, trip);
        }

        assert!(!cb.should_try_at(&node, trip));
        assert!(!cb.should_try_at(&node, trip + Duration::from_millis(59_999)));
        assert!(cb.should_try_at(&node, trip + Duration::from_secs(60)));
        assert_eq!(cb.failure_count(&node), 0);
        assert!(cb.open_until(&node).is_none());
    }

    #[test]
    fn test_repeated_failures_do_not_extend_deadline() {
        let cb = breaker();
        let node = NodeId::from("flaky");
        let trip = Instant::now();
        for _ in 0..3 {
            cb.record_failure_at(&node, trip);
        }
        cb.record_failure_at(&node, trip + Duration::from_secs(30));
        assert_eq!(cb.open_until(&node), Some(trip + Duration::from_secs(60)));
        assert_eq!(cb.failure_count(&node), 4);
    }

    #[test]
    fn test_success_decrements_but_does_not_close() {
        let cb = breaker();
        let node = NodeId::from("flaky");
        let now = Instant::now();

        cb.record_failure_at(&node, now);
        cb.record_failure_at(&node, now);
        cb.record_success(&node);
        assert_eq!(cb.failure_count(&node), 1);
        cb.record_success(&node);
        cb.record_success(&node);
        assert_eq!(cb.failure_count(&node), 0);

        for _ in 0..3 {
            cb.record_failure_at(&node, now);
        }
        cb.record_success(&node);
        assert!(!cb.should_try_at(&node, now));
    }

    #[test]
    fn test_success_on_unknown_node_is_noop() {
        let cb = breaker();
        let node = NodeId::from("ghost");
        cb.record_success(&node);
        assert_eq!(cb.failure_count(&node), 0);
    }

    #[test]
    fn test_reset_forgets_node() {
        let cb = CircuitBreaker::with_params(1, Duration::from_secs(60));
        let node = NodeId::from("flaky");
        cb.record_failure(&node);
        assert!(!cb.should_try(&node));
        cb.reset(&node);
        assert!(cb.should_try(&node));
    }

    #[test]
    fn test_huge_open_window_does_not_overflow() {
        let cb = CircuitBreaker::with_params(1, Duration::MAX);
        let node = NodeId::from("flaky");
        let now = Instant::now();
        cb.record_failure_at(&node, now);
        assert!(!cb.should_try_at(&node, now + Duration::from_secs(365 * 24 * 60 * 60)));
        assert!(cb.open_until(&node).is_some_and(|until| until > now));
    }

    #[test]
    fn test_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.open_duration(), Duration::from_secs(60));
    }
}
