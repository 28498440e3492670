//! Agent System
//!
//! An [`Agent`] is identity plus immutable configuration (description,
//! instructions, tools) bound to an [`AgentBackend`], the opaque capability
//! that actually produces replies. The orchestration engine only ever calls
//! [`Agent::invoke`] with a context slice and receives whole messages back;
//! whatever the backend remembers between calls is invisible to the core.
//!
//! Agents are shared as `Arc<Agent>` and never mutated after construction, so
//! the same instances can serve many sessions and concurrent rounds.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use ensemble::agent::{Agent, AgentBackend, AgentReply, InvocationRequest};
//! use ensemble::error::BackendError;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl AgentBackend for Echo {
//!     async fn invoke(
//!         &self,
//!         request: InvocationRequest<'_>,
//!     ) -> Result<Vec<AgentReply>, BackendError> {
//!         let last = request.context.last().map(|m| m.content.to_string()).unwrap_or_default();
//!         Ok(vec![AgentReply::text(last)])
//!     }
//! }
//!
//! let agent = Agent::new("echo", "Echo", Arc::new(Echo))
//!     .with_description("Repeats the last message");
//! assert_eq!(agent.id, "echo");
//! ```

use crate::ensemble::error::{BackendError, OrchestrationError};
use crate::ensemble::message::{Message, Role, Signal};
use crate::ensemble::tool_protocol::ToolRegistry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a backend needs to produce an agent's turn.
pub struct InvocationRequest<'a> {
    pub agent_id: &'a str,
    pub agent_name: &'a str,
    pub instructions: Option<&'a str>,
    /// The history view chosen by the orchestration (possibly truncated).
    pub context: &'a [Message],
    /// Tools granted to this agent. Tool failures are the backend's to handle.
    pub tools: Option<&'a ToolRegistry>,
}

/// One reply produced by a backend, before attribution to an agent.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub role: Role,
    pub content: String,
    pub signal: Option<Signal>,
    pub metadata: HashMap<String, String>,
}

impl AgentReply {
    /// Plain assistant text.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            signal: None,
            metadata: HashMap::new(),
        }
    }

    /// Output of a tool call the backend wants recorded in the transcript.
    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            ..Self::text(content)
        }
    }

    /// Assistant text that hands control to another agent.
    pub fn handoff(content: impl Into<String>, target: impl Into<String>) -> Self {
        Self::text(content).with_signal(Signal::Handoff(target.into()))
    }

    /// Assistant text that marks the task as resolved.
    pub fn resolved(content: impl Into<String>) -> Self {
        Self::text(content).with_signal(Signal::Resolved)
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// The opaque "invoke agent with context" capability.
///
/// Implementations typically wrap an LLM client. Retries, if any, belong here:
/// the engine reports a failure as soon as `invoke` returns `Err`.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn invoke(&self, request: InvocationRequest<'_>)
        -> Result<Vec<AgentReply>, BackendError>;

    /// Identifier for logging.
    fn backend_name(&self) -> &str {
        "backend"
    }
}

/// An agent with identity, description, optional instructions and tools.
pub struct Agent {
    /// Stable identifier referenced by routing rules and selection policies.
    pub id: String,
    /// Human-readable display name; also accepted when delegates name an agent.
    pub name: String,
    pub description: String,
    /// Construction-time instructions handed to the backend on every call.
    pub instructions: Option<String>,
    /// Arbitrary metadata associated with the agent (e.g. department).
    pub metadata: HashMap<String, String>,

    backend: Arc<dyn AgentBackend>,
    tools: Option<Arc<ToolRegistry>>,
}

impl Agent {
    /// Create a new agent with the mandatory identity information.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        backend: Arc<dyn AgentBackend>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            instructions: None,
            metadata: HashMap::new(),
            backend,
            tools: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Grant this agent its own tool registry.
    pub fn with_tools(self, registry: ToolRegistry) -> Self {
        self.with_shared_tools(Arc::new(registry))
    }

    /// Grant a registry shared with other agents.
    pub fn with_shared_tools(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.tools = Some(registry);
        self
    }

    pub fn tools(&self) -> Option<&Arc<ToolRegistry>> {
        self.tools.as_ref()
    }

    /// Invoke the backend with `context` and attribute its replies to this agent.
    pub async fn invoke(&self, context: &[Message]) -> Result<Vec<Message>, BackendError> {
        log::debug!(
            "invoking agent '{}' via {} with {} context messages",
            self.id,
            self.backend.backend_name(),
            context.len()
        );

        let request = InvocationRequest {
            agent_id: &self.id,
            agent_name: &self.name,
            instructions: self.instructions.as_deref(),
            context,
            tools: self.tools.as_deref(),
        };
        let replies = self.backend.invoke(request).await?;

        Ok(replies
            .into_iter()
            .map(|reply| {
                let mut message = Message::from_agent(&self.id, &self.name, reply.content);
                message.role = reply.role;
                message.explicit_signal = reply.signal;
                message.metadata = reply.metadata;
                message
            })
            .collect())
    }
}

/// Agents keyed by unique id, kept in declaration order.
///
/// Declaration order drives round-robin alternation and sequential pipelines.
#[derive(Clone, Default)]
pub struct AgentSet {
    agents: Vec<Arc<Agent>>,
    index: HashMap<String, usize>,
}

impl AgentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. Duplicate ids are rejected.
    pub fn insert(&mut self, agent: Arc<Agent>) -> Result<(), OrchestrationError> {
        if self.index.contains_key(&agent.id) {
            return Err(OrchestrationError::InvalidTopology(format!(
                "Agent with id '{}' already exists",
                agent.id
            )));
        }
        self.index.insert(agent.id.clone(), self.agents.len());
        self.agents.push(agent);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Agent>> {
        self.index.get(id).map(|&i| &self.agents[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Declaration-order position of an agent.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Agent at a declaration-order position.
    pub fn at(&self, position: usize) -> Option<&Arc<Agent>> {
        self.agents.get(position)
    }

    /// Find an agent by id or display name, ignoring case and surrounding
    /// whitespace.
    pub fn resolve(&self, id_or_name: &str) -> Option<&Arc<Agent>> {
        let wanted = id_or_name.trim();
        self.get(wanted).or_else(|| {
            self.agents.iter().find(|a| {
                a.id.eq_ignore_ascii_case(wanted) || a.name.eq_ignore_ascii_case(wanted)
            })
        })
    }

    pub fn ids(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.id.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Agent>> {
        self.agents.iter()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
