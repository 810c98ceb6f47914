//! Capability discovery - classify every node of a hierarchy

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::capability::CapabilityNode;
use crate::collaborators::{CompletionService, StructureLookup};
use crate::ids::{NodeId, SessionId};
use crate::node::NodeDescriptor;

/// Upper bound on keywords kept per node
pub const MAX_KEYWORDS: usize = 7;

const ANALYST_ROLE: &str =
    "You extract capability keywords from agent descriptions. Respond ONLY with a JSON array.";

/// Builds capability trees by asking the completion service about each node
pub struct CapabilityDiscovery {
    completion: Arc<dyn CompletionService>,
    structure: Arc<dyn StructureLookup>,
    default_confidence: f64,
}

impl CapabilityDiscovery {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        structure: Arc<dyn StructureLookup>,
        default_confidence: f64,
    ) -> Self {
        Self {
            completion,
            structure,
            default_confidence: default_confidence.clamp(0.0, 1.0),
        }
    }

    /// Discover the full capability tree below `root`
    ///
    /// Never fails: nodes that cannot be classified fall back to their role
    /// and children that cannot be listed are treated as absent.
    #[instrument(skip(self, root), fields(root_id = %root.id))]
    pub async fn discover(&self, session: &SessionId, root: &NodeDescriptor) -> CapabilityNode {
        let run = DiscoveryRun {
            discovery: self,
            session,
            memo: Mutex::new(HashMap::new()),
        };
        let tree = run.discover_node(root.clone(), 0, Vec::new()).await;
        info!(
            session_id = %session,
            nodes = tree.node_count(),
            max_depth = tree.max_depth(),
            "Capability discovery complete"
        );
        tree
    }

    /// Keywords for a single node
    pub async fn analyze(&self, node: &NodeDescriptor) -> Vec<String> {
        let prompt = format!(
            "Analyze this agent's capabilities and extract keywords for what they can handle.\n\n\
             Agent Name: {}\nAgent Role: {}\nDescription:\n{}\n\n\
             Instructions:\n\
             1. Extract 3-7 specific keywords/topics this agent can handle\n\
             2. Be specific (e.g., \"flight booking\", \"hotel recommendations\", not just \"travel\")\n\
             3. Focus on actionable capabilities\n\
             4. Return ONLY a JSON array of keywords\n\n\
             Example: [\"flight booking\", \"airline recommendations\", \"seat selection\"]\n\n\
             Your response (JSON array only):",
            node.name, node.role, node.description,
        );

        match self.completion.complete(ANALYST_ROLE, &prompt).await {
            Ok(raw) => match parse_capabilities(&raw) {
                Some(keywords) => {
                    debug!(node_id = %node.id, ?keywords, "Capabilities analyzed");
                    keywords
                }
                None => {
                    warn!(node_id = %node.id, response = %raw, "Unparseable capability list, using role");
                    vec![node.fallback_capability()]
                }
            },
            Err(e) => {
                warn!(node_id = %node.id, error = %e, "Capability analysis failed, using role");
                vec![node.fallback_capability()]
            }
        }
    }
}

/// State of one discovery pass
struct DiscoveryRun<'a> {
    discovery: &'a CapabilityDiscovery,
    session: &'a SessionId,
    memo: Mutex<HashMap<(NodeId, usize), CapabilityNode>>,
}

impl DiscoveryRun<'_> {
    fn discover_node<'s>(
        &'s self,
        node: NodeDescriptor,
        depth: usize,
        mut ancestors: Vec<NodeId>,
    ) -> BoxFuture<'s, CapabilityNode> {
        async move {
            let key = (node.id.clone(), depth);
            let cached = self.memo.lock().get(&key).cloned();
            if let Some(hit) = cached {
                debug!(node_id = %node.id, depth, "Capability memo hit");
                return hit;
            }

            let capabilities = self.discovery.analyze(&node).await;

            let children = match self
                .discovery
                .structure
                .children_of(self.session, &node.id)
                .await
            {
                Ok(children) => children,
                Err(e) => {
                    warn!(node_id = %node.id, error = %e, "Could not list children during discovery");
                    Vec::new()
                }
            };

            ancestors.push(node.id.clone());
            let branches = children
                .into_iter()
                .filter(|child| {
                    let looped = ancestors.contains(&child.id);
                    if looped {
                        warn!(node_id = %node.id, child_id = %child.id, "Structure loops back, skipping child");
                    }
                    !looped
                })
                .map(|child| self.discover_node(child, depth + 1, ancestors.clone()));
            let child_nodes = join_all(branches).await;

            let capability = CapabilityNode::leaf(
                node.id.clone(),
                node.name.clone(),
                capabilities,
                self.discovery.default_confidence,
                depth,
            )
            .with_children(child_nodes);

            self.memo.lock().insert(key, capability.clone());
            capability
        }
        .boxed()
    }
}

/// Parse a keyword list out of a completion answer
///
/// Accepts a bare JSON array of strings, optionally wrapped in a code fence.
/// Returns `None` for anything else, or when no usable keyword remains.
pub fn parse_capabilities(raw: &str) -> Option<Vec<String>> {
    let list: Vec<String> = serde_json::from_str(strip_fences(raw)).ok()?;

    let mut keywords: Vec<String> = Vec::with_capacity(list.len().min(MAX_KEYWORDS));
    for kw in list {
        let kw = kw.trim();
        if kw.is_empty() || keywords.iter().any(|k| k == kw) {
            continue;
        }
        keywords.push(kw.to_string());
        if keywords.len() == MAX_KEYWORDS {
            break;
        }
    }

    (!keywords.is_empty()).then_some(keywords)
}

fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    match trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
    {
        Some(rest) => rest.split("```").next().unwrap_or(rest).trim(),
        None => trimmed,
    }
}

/// Indented text rendering of a capability tree
pub fn render_tree(node: &CapabilityNode) -> String {
    let mut out = String::new();
    render_into(&mut out, node, 0);
    out
}

fn render_into(out: &mut String, node: &CapabilityNode, indent: usize) {
    let _ = writeln!(
        out,
        "{}├─ {} (depth={}): [{}]",
        "  ".repeat(indent),
        node.name,
        node.depth,
        node.capabilities.join(", ")
    );
    for child in &node.children {
        render_into(out, child, indent + 1);
    }
}
