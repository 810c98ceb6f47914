//! Scripted collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use conclave::{
    CapabilityClassifier, CompletionService, DelegationConfig, DelegationEvent, NodeDescriptor,
    NodeId, Orchestrator, ServiceError, SessionId, SessionStore, TextStream,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What a scripted node does when asked to execute
#[derive(Clone)]
pub enum Execution {
    Fragments(Vec<String>),
    Fail(String),
    /// Never yields a fragment
    Hang,
}

/// Completion service keyed by system role (the node description)
#[derive(Default)]
pub struct ScriptedCompletion {
    /// Raw capability-analysis answers keyed by agent name
    analyses: Mutex<HashMap<String, String>>,
    executions: Mutex<HashMap<String, Execution>>,
    pub executed: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn analysis(&self, agent_name: &str, raw: &str) {
        self.analyses.lock().insert(agent_name.to_string(), raw.to_string());
    }

    pub fn execution(&self, system_role: &str, execution: Execution) {
        self.executions.lock().insert(system_role.to_string(), execution);
    }

    pub fn executions_of(&self, system_role: &str) -> usize {
        self.executed.lock().iter().filter(|r| *r == system_role).count()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, _system_role: &str, task: &str) -> Result<String, ServiceError> {
        let name = task
            .lines()
            .find_map(|line| line.strip_prefix("Agent Name: "))
            .unwrap_or_default()
            .to_string();
        match self.analyses.lock().get(&name) {
            Some(raw) if raw == "<unavailable>" => Err(ServiceError::unavailable("analysis offline")),
            Some(raw) => Ok(raw.clone()),
            None => Ok(format!("[\"{}\"]", name.to_lowercase())),
        }
    }

    async fn complete_streaming(&self, system_role: &str, _task: &str) -> Result<TextStream, ServiceError> {
        self.executed.lock().push(system_role.to_string());
        let execution = self
            .executions
            .lock()
            .get(system_role)
            .cloned()
            .unwrap_or_else(|| Execution::Fragments(vec!["Done".to_string()]));

        match execution {
            Execution::Fragments(parts) => {
                Ok(stream::iter(parts.into_iter().map(Ok::<String, ServiceError>)).boxed())
            }
            Execution::Fail(message) => Err(ServiceError::unavailable(message)),
            Execution::Hang => Ok(stream::pending().boxed()),
        }
    }
}

/// Classifier answering from a fixed table; unknown nodes are not capable
#[derive(Default)]
pub struct ScriptedClassifier {
    verdicts: Mutex<HashMap<NodeId, Result<bool, String>>>,
    delay: Mutex<Option<Duration>>,
    pub asked: Mutex<Vec<NodeId>>,
}

impl ScriptedClassifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn capable(&self, node: &str) {
        self.verdicts.lock().insert(NodeId::from(node), Ok(true));
    }

    pub fn broken(&self, node: &str) {
        self.verdicts
            .lock()
            .insert(NodeId::from(node), Err("classifier offline".to_string()));
    }

    /// Delay every verdict by `delay`
    pub fn slow(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn was_asked(&self, node: &str) -> bool {
        self.asked.lock().contains(&NodeId::from(node))
    }

    pub fn times_asked(&self, node: &str) -> usize {
        let id = NodeId::from(node);
        self.asked.lock().iter().filter(|n| **n == id).count()
    }
}

#[async_trait]
impl CapabilityClassifier for ScriptedClassifier {
    async fn can_handle(&self, node: &NodeDescriptor, _task: &str) -> Result<bool, ServiceError> {
        self.asked.lock().push(node.id.clone());
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.verdicts.lock().get(&node.id) {
            Some(Ok(capable)) => Ok(*capable),
            Some(Err(message)) => Err(ServiceError::unavailable(message.clone())),
            None => Ok(false),
        }
    }
}

pub fn node(id: &str, name: &str, role: &str, description: &str) -> NodeDescriptor {
    NodeDescriptor::with_id(id, name, role).describe(description)
}

/// Coordinator with two children, Flights and Hotels
pub fn travel_agency() -> (Arc<SessionStore>, SessionId) {
    let store = Arc::new(SessionStore::new());
    let session = store.create_session();
    let root = store
        .add_node(&session, node("root", "Coordinator", "Coordinator", "You coordinate travel."), None)
        .unwrap();
    store
        .add_node(
            &session,
            node("flights", "Flights", "Flight Agent", "You book flights."),
            Some(root.clone()),
        )
        .unwrap();
    store
        .add_node(
            &session,
            node("hotels", "Hotels", "Hotel Agent", "You book hotels."),
            Some(root),
        )
        .unwrap();
    (store, session)
}

pub struct Harness {
    pub store: Arc<SessionStore>,
    pub session: SessionId,
    pub completion: Arc<ScriptedCompletion>,
    pub classifier: Arc<ScriptedClassifier>,
    pub orchestrator: Orchestrator,
}

pub fn harness(config: DelegationConfig) -> Harness {
    init_tracing();
    let (store, session) = travel_agency();
    harness_with(store, session, config)
}

pub fn harness_with(store: Arc<SessionStore>, session: SessionId, config: DelegationConfig) -> Harness {
    let completion = ScriptedCompletion::new();
    let classifier = ScriptedClassifier::new();
    let orchestrator = Orchestrator::with_classifier(
        config,
        store.clone(),
        completion.clone(),
        classifier.clone(),
    );
    Harness {
        store,
        session,
        completion,
        classifier,
        orchestrator,
    }
}

/// Terminal responses in emission order, by agent
pub fn responses(events: &[DelegationEvent]) -> Vec<(NodeId, conclave::DelegationResponse)> {
    events
        .iter()
        .filter_map(|e| e.response().map(|r| (e.agent_id().clone(), r.clone())))
        .collect()
}

pub fn response_of(events: &[DelegationEvent], agent: &str) -> conclave::DelegationResponse {
    let id = NodeId::from(agent);
    responses(events)
        .into_iter()
        .find(|(a, _)| *a == id)
        .map(|(_, r)| r)
        .unwrap_or_else(|| panic!("no response from {agent}"))
}

pub fn logs(events: &[DelegationEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            DelegationEvent::Log { data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect()
}
