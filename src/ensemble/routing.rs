//! Handoff routing graph.
//!
//! A [`RoutingGraph`] declares which agent may hand control to which. Nodes
//! are agent ids; edges carry an optional guard label the handing-off agent
//! can name instead of the target itself (e.g. `"refund"` → `refund-agent`).
//! Cycles are expected: specialists routinely hand back to triage.
//!
//! The graph is validated once when the orchestration is built: the start
//! node and every edge endpoint must be registered, and every registered
//! agent must be reachable from the start node.
//!
//! # Example
//!
//! ```rust
//! use ensemble::routing::RoutingGraph;
//!
//! let graph = RoutingGraph::start_with("triage")
//!     .add("triage", ["status", "returns", "refunds"])
//!     .add("status", ["triage"])
//!     .add_with_guard("returns", "refunds", "refund");
//! assert_eq!(graph.start(), "triage");
//! assert_eq!(graph.edges_from("triage").len(), 3);
//! ```

use crate::ensemble::agent::AgentSet;
use crate::ensemble::error::OrchestrationError;
use crate::ensemble::message::{Message, Signal};
use std::collections::{HashMap, HashSet, VecDeque};

/// A directed edge from one agent to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffEdge {
    pub target: String,
    /// Alternative label an agent may use to request this edge.
    pub guard: Option<String>,
}

/// Outcome of routing after an agent's turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    HandoffTo(String),
    Stay,
}

/// Directed multigraph of allowed handoffs.
#[derive(Debug, Clone)]
pub struct RoutingGraph {
    start: String,
    edges: HashMap<String, Vec<HandoffEdge>>,
}

impl RoutingGraph {
    /// New graph whose runs begin at `start`.
    pub fn start_with(start: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            edges: HashMap::new(),
        }
    }

    /// Add unguarded edges from `source` to each target.
    pub fn add<I, S>(mut self, source: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.edges.entry(source.into()).or_default();
        for target in targets {
            entry.push(HandoffEdge {
                target: target.into(),
                guard: None,
            });
        }
        self
    }

    /// Add one edge that can also be requested by its guard label.
    pub fn add_with_guard(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        guard: impl Into<String>,
    ) -> Self {
        self.edges
            .entry(source.into())
            .or_default()
            .push(HandoffEdge {
                target: target.into(),
                guard: Some(guard.into()),
            });
        self
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn edges_from(&self, source: &str) -> &[HandoffEdge] {
        self.edges.get(source).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn validate(&self, agents: &AgentSet) -> Result<(), OrchestrationError> {
        if !agents.contains(&self.start) {
            return Err(OrchestrationError::InvalidTopology(format!(
                "routing start node '{}' is not a registered agent",
                self.start
            )));
        }

        for (source, edges) in &self.edges {
            if !agents.contains(source) {
                return Err(OrchestrationError::InvalidTopology(format!(
                    "routing edge source '{}' is not a registered agent",
                    source
                )));
            }
            if let Some(edge) = edges.iter().find(|e| !agents.contains(&e.target)) {
                return Err(OrchestrationError::InvalidTopology(format!(
                    "routing edge '{}' -> '{}' targets an unregistered agent",
                    source, edge.target
                )));
            }
        }

        let reachable = self.reachable_from_start();
        if let Some(orphan) = agents.iter().find(|a| !reachable.contains(a.id.as_str())) {
            return Err(OrchestrationError::InvalidTopology(format!(
                "agent '{}' is not reachable from start node '{}'",
                orphan.id, self.start
            )));
        }

        Ok(())
    }

    fn reachable_from_start(&self) -> HashSet<&str> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        seen.insert(&self.start);
        queue.push_back(&self.start);

        while let Some(node) = queue.pop_front() {
            for edge in self.edges_from(node) {
                if seen.insert(&edge.target) {
                    queue.push_back(&edge.target);
                }
            }
        }
        seen
    }

    /// Decide where control goes after `current` produced `message`.
    ///
    /// A handoff request matches an outgoing edge by target id, target display
    /// name, or guard label, ignoring case. Requests with no matching edge are
    /// logged and treated as [`Transition::Stay`].
    pub fn resolve(&self, current: &str, message: &Message, agents: &AgentSet) -> Transition {
        let requested = match message.signal() {
            Some(Signal::Handoff(target)) => target,
            _ => return Transition::Stay,
        };

        let matched = self.edges_from(current).iter().find(|edge| {
            edge.target.eq_ignore_ascii_case(&requested)
                || agents
                    .get(&edge.target)
                    .map(|a| a.name.eq_ignore_ascii_case(&requested))
                    .unwrap_or(false)
                || edge
                    .guard
                    .as_deref()
                    .map(|g| g.eq_ignore_ascii_case(&requested))
                    .unwrap_or(false)
        });

        match matched {
            Some(edge) if edge.target == current => Transition::Stay,
            Some(edge) => Transition::HandoffTo(edge.target.clone()),
            None => {
                log::warn!(
                    "agent '{}' requested handoff to '{}' but no such edge exists; staying",
                    current,
                    requested
                );
                Transition::Stay
            }
        }
    }
}
