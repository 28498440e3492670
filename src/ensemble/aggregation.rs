//! Final result assembly.
//!
//! Serialized topologies (Sequential, GroupChat, Handoff) produce a single
//! value: the content of the last agent message of the run, or a summary when
//! a [`Summarizer`] is configured. The Concurrent topology produces a set with
//! exactly one [`AgentOutput`] per registered agent.

use crate::ensemble::agent::AgentSet;
use crate::ensemble::delegate::{default_summary_template, DelegateEvaluator, PromptTemplate};
use crate::ensemble::message::Message;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One agent's contribution to a concurrent round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent_id: String,
    pub agent_name: String,
    pub content: String,
}

impl AgentOutput {
    pub fn from_message(message: &Message) -> Self {
        Self {
            agent_id: message.author().to_string(),
            agent_name: message
                .agent_name
                .clone()
                .unwrap_or_else(|| message.author().to_string()),
            content: message.content.to_string(),
        }
    }
}

/// The value a completed run hands back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrchestrationResult {
    /// Final (or summarized) content. `None` when no agent spoke.
    Single(Option<String>),
    /// One entry per agent, in declaration order.
    Set(Vec<AgentOutput>),
}

impl OrchestrationResult {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            OrchestrationResult::Single(text) => text.as_deref(),
            OrchestrationResult::Set(_) => None,
        }
    }

    pub fn outputs(&self) -> &[AgentOutput] {
        match self {
            OrchestrationResult::Single(_) => &[],
            OrchestrationResult::Set(outputs) => outputs,
        }
    }
}

/// Condenses a run's transcript into its final result.
#[derive(Clone)]
pub struct Summarizer {
    evaluator: Arc<dyn DelegateEvaluator>,
    template: PromptTemplate,
}

impl Summarizer {
    pub fn new(evaluator: Arc<dyn DelegateEvaluator>) -> Self {
        Self {
            evaluator,
            template: default_summary_template(),
        }
    }

    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.template = template;
        self
    }
}

/// Builds the [`OrchestrationResult`] once a run reaches a terminal state.
#[derive(Clone, Default)]
pub struct ResultAggregator {
    summarizer: Option<Summarizer>,
}

impl ResultAggregator {
    pub fn new(summarizer: Option<Summarizer>) -> Self {
        Self { summarizer }
    }

    /// Single-value result for serialized topologies.
    ///
    /// A failing summarizer is logged and the last agent message is used
    /// instead.
    pub async fn single(&self, run_messages: &[Message]) -> OrchestrationResult {
        let last = run_messages
            .iter()
            .rev()
            .find(|m| m.agent_id.is_some())
            .map(|m| m.content.to_string());

        let summarizer = match &self.summarizer {
            Some(s) if last.is_some() => s,
            _ => return OrchestrationResult::Single(last),
        };

        let prompt = summarizer.template.render(run_messages, "");
        match summarizer.evaluator.evaluate(&prompt).await {
            Ok(summary) => OrchestrationResult::Single(Some(summary.trim().to_string())),
            Err(e) => {
                log::warn!("summarizer failed ({}); using the final message", e);
                OrchestrationResult::Single(last)
            }
        }
    }

    /// One entry per agent: its latest message in `run_messages`, or empty
    /// content when it produced nothing.
    pub fn per_agent(agents: &AgentSet, run_messages: &[Message]) -> OrchestrationResult {
        let outputs = agents
            .iter()
            .map(|agent| {
                let content = run_messages
                    .iter()
                    .rev()
                    .find(|m| m.is_from(&agent.id))
                    .map(|m| m.content.to_string())
                    .unwrap_or_default();
                AgentOutput {
                    agent_id: agent.id.clone(),
                    agent_name: agent.name.clone(),
                    content,
                }
            })
            .collect();
        OrchestrationResult::Set(outputs)
    }
}
