//! # Conclave
//!
//! Recursive, capability-aware task delegation through a hierarchy of
//! worker nodes.
//!
//! A task enters at a root node. Each node decides whether it can handle the
//! task itself; if not, the task fans out to all of its children in parallel
//! and their outcomes are folded back up into one answer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           ORCHESTRATOR                            │
//! │  ┌──────────────┐  ┌───────────────────┐  ┌────────────────────┐ │
//! │  │ Tree Cache   │──│ Capability        │  │ Recursive          │ │
//! │  │ (per session)│  │ Discovery         │  │ Delegator          │ │
//! │  └──────────────┘  └───────────────────┘  └─────────┬──────────┘ │
//! └─────────────────────────────────────────────────────┼────────────┘
//!                                                       │ events
//!            ┌──────────────────────┬───────────────────┤
//!            ▼                      ▼                   ▼
//!     ┌─────────────┐        ┌─────────────┐     ┌─────────────┐
//!     │ Coordinator │ ─────▶ │  Flights    │     │  Hotels     │
//!     │  (depth 0)  │        │  (depth 1)  │     │  (depth 1)  │
//!     └─────────────┘        └─────────────┘     └──────┬──────┘
//!                                                  ┌────┴────┐
//!                                                  ▼         ▼
//!                                                ┌───┐     ┌───┐
//!                                                │W1 │     │W2 │
//!                                                └───┘     └───┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Node**: a worker that can attempt a task or delegate it to children
//! - **Capability tree**: snapshot of the hierarchy annotated with keywords
//! - **Delegation request/response**: the task as it travels down, and each
//!   node's terminal outcome on the way back up
//! - **Circuit breaker**: per-node failure counter that skips flaky nodes

pub mod aggregator;
pub mod cache;
pub mod capability;
pub mod channel;
pub mod circuit_breaker;
pub mod collaborators;
pub mod config;
pub mod delegator;
pub mod discovery;
pub mod error;
pub mod hierarchy;
pub mod ids;
pub mod node;
pub mod orchestrator;
pub mod request;
pub mod router;
pub mod session;

pub use aggregator::ResponseAggregator;
pub use cache::{CacheStats, CapabilityTreeCache};
pub use capability::{CapabilityNode, CapabilityTreeSnapshot};
pub use channel::{event_channel, DelegationEvent, EventSink, EventStream, NodeStatus};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use collaborators::{
    CapabilityClassifier, ChangeListener, CompletionClassifier, CompletionService,
    StructureChange, StructureLookup, TextStream,
};
pub use config::DelegationConfig;
pub use delegator::{DelegationRun, RecursiveDelegator};
pub use discovery::CapabilityDiscovery;
pub use error::{DelegationError, Result, ServiceError};
pub use hierarchy::NodeHierarchy;
pub use ids::{NodeId, RequestId, SessionId};
pub use node::NodeDescriptor;
pub use orchestrator::Orchestrator;
pub use request::{DelegationRequest, DelegationResponse, DelegationStatus};
pub use router::{DelegationRouter, RouteCandidate};
pub use session::SessionStore;
