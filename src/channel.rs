//! Progress event channel between delegation branches and the observer

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ids::NodeId;
use crate::request::DelegationResponse;

/// One progress event
///
/// Serializes as `{"type": ..., "agent_id": ..., "data" | "response": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DelegationEvent {
    Log { agent_id: NodeId, data: String },
    Status { agent_id: NodeId, data: String },
    OutputChunk { agent_id: NodeId, data: String },
    Output { agent_id: NodeId, data: String },
    Error { agent_id: NodeId, data: String },
    /// Terminal event of one node visit
    DelegationResponse {
        agent_id: NodeId,
        response: Box<DelegationResponse>,
    },
}

impl DelegationEvent {
    pub fn agent_id(&self) -> &NodeId {
        match self {
            DelegationEvent::Log { agent_id, .. }
            | DelegationEvent::Status { agent_id, .. }
            | DelegationEvent::OutputChunk { agent_id, .. }
            | DelegationEvent::Output { agent_id, .. }
            | DelegationEvent::Error { agent_id, .. }
            | DelegationEvent::DelegationResponse { agent_id, .. } => agent_id,
        }
    }

    /// The carried response, for terminal events
    pub fn response(&self) -> Option<&DelegationResponse> {
        match self {
            DelegationEvent::DelegationResponse { response, .. } => Some(response.as_ref()),
            _ => None,
        }
    }
}

/// Node lifecycle labels carried by `status` events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Analyzing,
    Executing,
    Delegating,
    Completed,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Analyzing => "analyzing",
            NodeStatus::Executing => "executing",
            NodeStatus::Delegating => "delegating",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
        }
    }
}

/// Producer side, cloned into every branch
///
/// When the observer goes away the shared cancellation token fires so that
/// running branches stop at their next checkpoint.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<DelegationEvent>,
    cancel: CancellationToken,
}

impl EventSink {
    pub fn send(&self, event: DelegationEvent) {
        if self.tx.send(event).is_err() && !self.cancel.is_cancelled() {
            debug!("Event observer disconnected, cancelling delegation");
            self.cancel.cancel();
        }
    }

    pub fn log(&self, agent_id: &NodeId, data: impl Into<String>) {
        self.send(DelegationEvent::Log {
            agent_id: agent_id.clone(),
            data: data.into(),
        });
    }

    pub fn status(&self, agent_id: &NodeId, status: NodeStatus) {
        self.send(DelegationEvent::Status {
            agent_id: agent_id.clone(),
            data: status.as_str().to_string(),
        });
    }

    pub fn output_chunk(&self, agent_id: &NodeId, data: impl Into<String>) {
        self.send(DelegationEvent::OutputChunk {
            agent_id: agent_id.clone(),
            data: data.into(),
        });
    }

    pub fn output(&self, agent_id: &NodeId, data: impl Into<String>) {
        self.send(DelegationEvent::Output {
            agent_id: agent_id.clone(),
            data: data.into(),
        });
    }

    pub fn error(&self, agent_id: &NodeId, data: impl Into<String>) {
        self.send(DelegationEvent::Error {
            agent_id: agent_id.clone(),
            data: data.into(),
        });
    }

    pub fn response(&self, agent_id: &NodeId, response: &DelegationResponse) {
        self.send(DelegationEvent::DelegationResponse {
            agent_id: agent_id.clone(),
            response: Box::new(response.clone()),
        });
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the observer has dropped its stream
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Consumer side
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<DelegationEvent>,
}

impl EventStream {
    /// Next event; `None` once every branch has finished and dropped its sink
    pub async fn recv(&mut self) -> Option<DelegationEvent> {
        self.rx.recv().await
    }

    /// Next event without waiting
    pub fn try_recv(&mut self) -> Option<DelegationEvent> {
        self.rx.try_recv().ok()
    }
}

/// Create a connected sink/stream pair sharing `cancel`
pub fn event_channel(cancel: CancellationToken) -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx, cancel }, EventStream { rx })
}
