//! Recursive delegation through the node hierarchy
//!
//! Each visited node first asks whether it can handle the task itself. If it
//! can, it executes; otherwise the request fans out to every child and the
//! outcomes fold back up through [`ResponseAggregator::resolve_conflicts`].
//! All branches of one run share a single event channel and a single
//! cancellation token.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture, FutureExt};
use futures::StreamExt;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::aggregator::ResponseAggregator;
use crate::capability::CapabilityTreeSnapshot;
use crate::channel::{event_channel, DelegationEvent, EventSink, EventStream, NodeStatus};
use crate::circuit_breaker::CircuitBreaker;
use crate::collaborators::{CapabilityClassifier, CompletionService, StructureLookup};
use crate::config::DelegationConfig;
use crate::error::{Result, ServiceError};
use crate::node::NodeDescriptor;
use crate::request::{DelegationRequest, DelegationResponse, DelegationStatus};
use crate::router::DelegationRouter;

const CANCELLED: &str = "Delegation cancelled";

/// Drives one task through the hierarchy
pub struct RecursiveDelegator {
    config: DelegationConfig,
    breaker: Arc<CircuitBreaker>,
    structure: Arc<dyn StructureLookup>,
    classifier: Arc<dyn CapabilityClassifier>,
    completion: Arc<dyn CompletionService>,
    /// Bounds concurrent completion-service calls, never held across recursion
    permits: Semaphore,
    active: AtomicUsize,
}

/// Handle to a running delegation
pub struct DelegationRun {
    events: EventStream,
    handle: JoinHandle<DelegationResponse>,
    cancel: CancellationToken,
}

impl DelegationRun {
    /// Next progress event, `None` once the run has finished
    pub async fn next_event(&mut self) -> Option<DelegationEvent> {
        self.events.recv().await
    }

    /// Stop every branch at its next checkpoint
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the root's terminal response, discarding unread events
    pub async fn response(self) -> Result<DelegationResponse> {
        // the stream must outlive the run, dropping it cancels
        let DelegationRun { events, handle, .. } = self;
        let response = handle.await?;
        drop(events);
        Ok(response)
    }

    /// Drain every event, then return them with the root's response
    pub async fn collect(mut self) -> Result<(Vec<DelegationEvent>, DelegationResponse)> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let response = self.handle.await?;
        Ok((events, response))
    }
}

/// Counts a node visit for as long as it lives
struct VisitGuard<'a>(&'a AtomicUsize);

impl<'a> VisitGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for VisitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RecursiveDelegator {
    pub fn new(
        config: DelegationConfig,
        breaker: Arc<CircuitBreaker>,
        structure: Arc<dyn StructureLookup>,
        classifier: Arc<dyn CapabilityClassifier>,
        completion: Arc<dyn CompletionService>,
    ) -> Self {
        let permits = Semaphore::new(config.max_in_flight.max(1));
        Self {
            config,
            breaker,
            structure,
            classifier,
            completion,
            permits,
            active: AtomicUsize::new(0),
        }
    }

    /// Node visits currently in flight across all runs
    pub fn active_visits(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Start delegating `task` at `root`
    ///
    /// The run proceeds on its own tokio task. Dropping the returned handle's
    /// event stream cancels the run.
    #[instrument(skip(self, root, task, snapshot), fields(root_id = %root.id, session_id = %snapshot.session_id))]
    pub fn delegate(
        self: &Arc<Self>,
        root: NodeDescriptor,
        task: impl Into<String>,
        snapshot: Arc<CapabilityTreeSnapshot>,
        max_hops: u32,
        timeout: Duration,
    ) -> DelegationRun {
        let cancel = CancellationToken::new();
        let (sink, events) = event_channel(cancel.clone());

        let request = DelegationRequest::new(root.id.clone(), task)
            .with_max_hops(max_hops)
            .with_timeout(timeout)
            .with_context("session_id", serde_json::json!(snapshot.session_id.as_str()));
        info!(request_id = %request.request_id, max_hops, "Starting delegation");

        let this = Arc::clone(self);
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            this.announce(&root, &request, &snapshot, &sink);

            let observer = sink.clone();
            let mut visit = Arc::clone(&this).visit(root, request, snapshot, sink);
            let response = tokio::select! {
                response = &mut visit => response,
                _ = observer.closed() => {
                    debug!("Event observer dropped, cancelling delegation");
                    run_cancel.cancel();
                    visit.await
                }
            };
            drop(observer);
            info!(
                request_id = %response.request_id,
                status = %response.status,
                responder = %response.responding_id,
                "Delegation finished"
            );
            response
        });

        DelegationRun {
            events,
            handle,
            cancel,
        }
    }

    /// Run-start progress: tree size and the best-scoring candidates
    fn announce(
        &self,
        root: &NodeDescriptor,
        request: &DelegationRequest,
        snapshot: &CapabilityTreeSnapshot,
        sink: &EventSink,
    ) {
        sink.log(
            &root.id,
            format!(
                "Mapped {} nodes across {} levels",
                snapshot.node_count,
                snapshot.max_depth + 1
            ),
        );

        let candidates =
            DelegationRouter::find_best(&request.task, &snapshot.tree, self.config.top_candidates);
        if candidates.is_empty() {
            sink.log(&root.id, "No capability keywords match the task");
            return;
        }
        let listing = candidates
            .iter()
            .map(|c| format!("{} ({:.2})", c.name, c.score))
            .collect::<Vec<_>>()
            .join(", ");
        sink.log(&root.id, format!("Top candidates: {listing}"));
    }

    fn visit(
        self: Arc<Self>,
        node: NodeDescriptor,
        request: DelegationRequest,
        snapshot: Arc<CapabilityTreeSnapshot>,
        sink: EventSink,
    ) -> BoxFuture<'static, DelegationResponse> {
        async move {
            let _visit = VisitGuard::enter(&self.active);

            sink.log(&node.id, format!("[{}] Received delegation request", node.name));
            let response = match self.check_guards(&node, &request, &sink) {
                Some(rejected) => rejected,
                None => self.handle(&node, &request, &snapshot, &sink).await,
            };

            let status = if response.is_successful() || response.status == DelegationStatus::Partial {
                NodeStatus::Completed
            } else {
                NodeStatus::Failed
            };
            sink.status(&node.id, status);
            sink.response(&node.id, &response);
            response
        }
        .boxed()
    }

    /// Checks that end a visit before any collaborator is called
    fn check_guards(
        &self,
        node: &NodeDescriptor,
        request: &DelegationRequest,
        sink: &EventSink,
    ) -> Option<DelegationResponse> {
        let reject = |status: DelegationStatus, log: String, message: String| {
            sink.log(&node.id, log);
            Some(
                DelegationResponse::new(request.request_id, node.id.clone(), status)
                    .with_error(message)
                    .with_path(request.path.clone()),
            )
        };

        if sink.cancellation().is_cancelled() {
            return reject(
                DelegationStatus::Error,
                format!("[{}] Delegation cancelled", node.name),
                CANCELLED.to_string(),
            );
        }

        if request.has_cycle() {
            let path = request.path.iter().map(|id| id.as_str()).collect::<Vec<_>>();
            warn!(node_id = %node.id, ?path, "Delegation cycle detected");
            return reject(
                DelegationStatus::Error,
                format!("[{}] Cycle detected in path: {:?}", node.name, path),
                format!("Cycle detected: {path:?}"),
            );
        }

        if request.exceeds_depth() {
            debug!(node_id = %node.id, max_hops = request.max_hops, "Hop limit reached");
            return reject(
                DelegationStatus::Error,
                format!("[{}] Max depth exceeded ({} hops)", node.name, request.max_hops),
                format!("Max depth exceeded: {} hops", request.max_hops),
            );
        }

        if request.is_expired() {
            let secs = request.timeout.as_secs_f64();
            warn!(node_id = %node.id, timeout_secs = secs, "Delegation request expired");
            return reject(
                DelegationStatus::Timeout,
                format!("[{}] Request timeout ({secs}s)", node.name),
                format!("Timeout after {secs}s"),
            );
        }

        if !self.breaker.should_try(&node.id) {
            debug!(node_id = %node.id, "Circuit open, skipping node");
            return reject(
                DelegationStatus::Error,
                format!("[{}] Circuit breaker open, skipping", node.name),
                "Circuit breaker open".to_string(),
            );
        }

        None
    }

    async fn handle(
        self: &Arc<Self>,
        node: &NodeDescriptor,
        request: &DelegationRequest,
        snapshot: &Arc<CapabilityTreeSnapshot>,
        sink: &EventSink,
    ) -> DelegationResponse {
        sink.status(&node.id, NodeStatus::Analyzing);
        sink.log(&node.id, format!("[{}] Analyzing if I can handle this...", node.name));

        let capable = match self.check_capable(node, request, sink.cancellation()).await {
            Some(capable) => capable,
            None => return self.cancelled(node, request),
        };

        if capable {
            sink.log(&node.id, format!("[{}] I can handle this directly", node.name));
            return self.execute(node, request, snapshot, sink).await;
        }

        sink.log(&node.id, format!("[{}] Can't handle directly, checking children...", node.name));
        let children = match self.structure.children_of(&snapshot.session_id, &node.id).await {
            Ok(children) => children,
            Err(e) => {
                warn!(node_id = %node.id, error = %e, "Could not load children");
                sink.log(&node.id, format!("[{}] Error: {e}", node.name));
                self.breaker.record_failure(&node.id);
                return DelegationResponse::error(request.request_id, node.id.clone(), e.to_string())
                    .with_path(request.path.clone());
            }
        };

        if children.is_empty() {
            sink.log(&node.id, format!("[{}] No children available, cannot fulfill", node.name));
            self.breaker.record_failure(&node.id);
            return DelegationResponse::new(request.request_id, node.id.clone(), DelegationStatus::Unable)
                .with_result(format!(
                    "{} cannot handle this request and has no children to delegate to",
                    node.name
                ))
                .with_path(request.path.clone());
        }

        self.fan_out(node, request, snapshot, sink, children).await
    }

    /// Ask the classifier, defaulting to "capable" when it fails
    ///
    /// `None` when the run was cancelled first.
    async fn check_capable(
        &self,
        node: &NodeDescriptor,
        request: &DelegationRequest,
        cancel: &CancellationToken,
    ) -> Option<bool> {
        let _permit = self.permit(cancel).await?;
        let verdict = tokio::select! {
            _ = cancel.cancelled() => return None,
            verdict = self.classifier.can_handle(node, &request.task) => verdict,
        };
        Some(match verdict {
            Ok(capable) => capable,
            Err(e) => {
                warn!(node_id = %node.id, error = %e, "Capability check failed, trying node anyway");
                true
            }
        })
    }

    async fn execute(
        &self,
        node: &NodeDescriptor,
        request: &DelegationRequest,
        snapshot: &CapabilityTreeSnapshot,
        sink: &EventSink,
    ) -> DelegationResponse {
        sink.status(&node.id, NodeStatus::Executing);

        match self.stream_completion(node, request, sink).await {
            Ok(Some(output)) => {
                self.breaker.record_success(&node.id);
                info!(node_id = %node.id, chars = output.len(), "Node fulfilled request");
                let mut response =
                    DelegationResponse::new(request.request_id, node.id.clone(), DelegationStatus::Fulfilled)
                        .with_result(output)
                        .with_confidence(self.config.direct_confidence)
                        .with_path(request.path.clone());
                if let Some(capability) = snapshot.find_node(&node.id) {
                    let score = DelegationRouter::score(&request.task, capability);
                    response = response.with_metadata("capability_score", serde_json::json!(score));
                }
                response
            }
            Ok(None) => self.cancelled(node, request),
            Err(e) => {
                warn!(node_id = %node.id, error = %e, "Node execution failed");
                sink.error(&node.id, e.to_string());
                self.breaker.record_failure(&node.id);
                DelegationResponse::error(request.request_id, node.id.clone(), e.to_string())
                    .with_path(request.path.clone())
            }
        }
    }

    /// Stream the node's answer into the sink; `Ok(None)` on cancellation
    async fn stream_completion(
        &self,
        node: &NodeDescriptor,
        request: &DelegationRequest,
        sink: &EventSink,
    ) -> std::result::Result<Option<String>, ServiceError> {
        let cancel = sink.cancellation();
        let Some(_permit) = self.permit(cancel).await else {
            return Ok(None);
        };

        let role = node.system_role();
        let prompt = execution_prompt(request);
        let mut fragments = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            stream = self.completion.complete_streaming(&role, &prompt) => stream?,
        };

        let mut output = String::new();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                next = fragments.next() => next,
            };
            match next {
                Some(Ok(fragment)) => {
                    output.push_str(&fragment);
                    sink.output_chunk(&node.id, fragment);
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        sink.output(&node.id, output.clone());
        Ok(Some(output))
    }

    async fn fan_out(
        self: &Arc<Self>,
        node: &NodeDescriptor,
        request: &DelegationRequest,
        snapshot: &Arc<CapabilityTreeSnapshot>,
        sink: &EventSink,
        children: Vec<NodeDescriptor>,
    ) -> DelegationResponse {
        sink.status(&node.id, NodeStatus::Delegating);
        sink.log(
            &node.id,
            format!("[{}] Delegating to {} children in parallel...", node.name, children.len()),
        );
        debug!(node_id = %node.id, children = children.len(), "Fanning out");

        let branches = children.into_iter().map(|child| {
            let forwarded = request.forward_to(&child.id);
            Arc::clone(self).visit(child, forwarded, Arc::clone(snapshot), sink.clone())
        });
        let responses = join_all(branches).await;

        sink.log(
            &node.id,
            format!("[{}] Received {} responses from children", node.name, responses.len()),
        );

        if sink.cancellation().is_cancelled() {
            return self.cancelled(node, request).with_children(responses);
        }

        let resolved = ResponseAggregator::resolve_conflicts(&responses);
        if resolved.is_successful() {
            let fulfilled = responses.iter().filter(|r| r.is_successful()).count();
            sink.log(
                &node.id,
                format!("[{}] {fulfilled} child(ren) fulfilled the request", node.name),
            );
            self.breaker.record_success(&node.id);
            return resolved;
        }

        sink.log(&node.id, format!("[{}] No children could fulfill the request", node.name));
        self.breaker.record_failure(&node.id);

        let attributed = if resolved.status == DelegationStatus::Partial {
            DelegationResponse::new(request.request_id, node.id.clone(), DelegationStatus::Partial)
                .with_result(resolved.result)
                .with_confidence(resolved.confidence)
        } else {
            let response =
                DelegationResponse::new(request.request_id, node.id.clone(), DelegationStatus::Unable)
                    .with_result(format!("{} and all children unable to fulfill request", node.name));
            match resolved.error_message {
                Some(message) if !message.is_empty() => response.with_error(message),
                _ => response,
            }
        };
        attributed
            .with_path(request.path.clone())
            .with_children(responses)
    }

    async fn permit(&self, cancel: &CancellationToken) -> Option<SemaphorePermit<'_>> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            permit = self.permits.acquire() => permit.ok(),
        }
    }

    fn cancelled(&self, node: &NodeDescriptor, request: &DelegationRequest) -> DelegationResponse {
        debug!(node_id = %node.id, "Visit cancelled");
        DelegationResponse::error(request.request_id, node.id.clone(), CANCELLED)
            .with_path(request.path.clone())
    }
}

/// User prompt for a node executing the task itself
fn execution_prompt(request: &DelegationRequest) -> String {
    let context: BTreeMap<&String, &serde_json::Value> = request.context.iter().collect();
    let context = serde_json::to_string(&context).unwrap_or_default();
    format!(
        "Task: {}\n\nContext: {}\n\nProvide a complete, detailed response.",
        request.task, context
    )
}
