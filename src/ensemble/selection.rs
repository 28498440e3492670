//! Selection policies: who speaks next.
//!
//! A [`SelectionPolicy`] is a strategy value handed to the orchestration at
//! construction time. Given the history and the agent set it yields the next
//! actor(s) as a [`Selection`].
//!
//! | Policy | Decision | Fails with |
//! |--------|----------|------------|
//! | `RoundRobin` | next agent after the last actor, in declaration order | `InvalidTopology` with < 2 agents |
//! | `RuleBased` | lookup table keyed by last author (`"user"` for input) | `UnroutableState` on a gap |
//! | `Delegate` | external evaluator names the next agent | never; falls back to the default agent |
//! | `ConcurrentAll` | every agent at once | `InvalidTopology` outside the Concurrent topology |

use crate::ensemble::agent::AgentSet;
use crate::ensemble::delegate::{
    default_selection_template, normalize_answer, render_participants, DelegateEvaluator,
    PromptTemplate,
};
use crate::ensemble::error::OrchestrationError;
use crate::ensemble::history::{ContextWindow, ConversationHistory};
use crate::ensemble::message::USER_AUTHOR;
use std::collections::HashMap;
use std::sync::Arc;

/// The actor(s) chosen for the next turn and why.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub agents: Vec<String>,
    pub reason: String,
}

impl Selection {
    fn single(agent: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            agents: vec![agent.into()],
            reason: reason.into(),
        }
    }
}

/// Delegate-driven selection settings.
#[derive(Clone)]
pub struct DelegateSelection {
    evaluator: Arc<dyn DelegateEvaluator>,
    template: PromptTemplate,
    window: ContextWindow,
    default_agent: String,
    initial_agent: Option<String>,
}

impl DelegateSelection {
    /// `default_agent` is used whenever the evaluator's answer does not name a
    /// registered agent.
    pub fn new(evaluator: Arc<dyn DelegateEvaluator>, default_agent: impl Into<String>) -> Self {
        Self {
            evaluator,
            template: default_selection_template(),
            window: ContextWindow::Recent(1),
            default_agent: default_agent.into(),
            initial_agent: None,
        }
    }

    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.template = template;
        self
    }

    /// How much recent history the evaluator sees. Defaults to the last message.
    pub fn with_window(mut self, window: ContextWindow) -> Self {
        self.window = window;
        self
    }

    /// Agent that answers user input without consulting the evaluator.
    pub fn with_initial_agent(mut self, agent: impl Into<String>) -> Self {
        self.initial_agent = Some(agent.into());
        self
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    async fn select(
        &self,
        history: &ConversationHistory,
        agents: &AgentSet,
    ) -> Selection {
        if history.last_actor().is_none() {
            if let Some(initial) = &self.initial_agent {
                return Selection::single(initial, "initial agent for user input");
            }
        }

        let prompt = self
            .template
            .render(history.view(self.window), &render_participants(agents));

        let answer = match self.evaluator.evaluate(&prompt).await {
            Ok(answer) => answer,
            Err(e) => {
                log::warn!(
                    "selection delegate failed ({}); falling back to '{}'",
                    e,
                    self.default_agent
                );
                return Selection::single(&self.default_agent, "delegate failed; default agent");
            }
        };

        match match_agent(&answer, agents) {
            Some(id) => Selection::single(id, format!("delegate chose '{}'", normalize_answer(&answer))),
            None => {
                log::warn!(
                    "selection delegate answered {:?}, which names no registered agent; falling back to '{}'",
                    answer,
                    self.default_agent
                );
                Selection::single(&self.default_agent, "unrecognised delegate answer; default agent")
            }
        }
    }
}

/// Resolve a free-text answer to a registered agent id.
///
/// An exact id/name match wins; otherwise the answer must mention exactly one
/// agent by id or name.
fn match_agent(answer: &str, agents: &AgentSet) -> Option<String> {
    let normalized = normalize_answer(answer);
    if let Some(agent) = agents.resolve(&normalized) {
        return Some(agent.id.clone());
    }

    let lowered = normalized.to_lowercase();
    let mentioned: Vec<&str> = agents
        .iter()
        .filter(|a| {
            lowered.contains(&a.id.to_lowercase()) || lowered.contains(&a.name.to_lowercase())
        })
        .map(|a| a.id.as_str())
        .collect();

    match mentioned.as_slice() {
        [only] => Some(only.to_string()),
        _ => None,
    }
}

/// Strategy deciding the next actor(s).
#[derive(Clone)]
pub enum SelectionPolicy {
    /// Deterministic alternation in declaration order.
    RoundRobin {
        /// Agent answering user input; defaults to the first declared agent.
        initial_agent: Option<String>,
    },

    /// Fixed table: last author → next agent. The `"user"` key covers input.
    RuleBased { rules: HashMap<String, String> },

    Delegate(DelegateSelection),

    /// Every agent, concurrently. Only valid for the Concurrent topology.
    ConcurrentAll,
}

impl SelectionPolicy {
    pub fn round_robin() -> Self {
        SelectionPolicy::RoundRobin {
            initial_agent: None,
        }
    }

    /// Build a rule table from `(last_author, next_agent)` pairs.
    pub fn rule_based<I, K, V>(rules: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        SelectionPolicy::RuleBased {
            rules: rules
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SelectionPolicy::RoundRobin { .. } => "RoundRobin",
            SelectionPolicy::RuleBased { .. } => "RuleBased",
            SelectionPolicy::Delegate(_) => "Delegate",
            SelectionPolicy::ConcurrentAll => "ConcurrentAll",
        }
    }

    /// Check the policy against the agent set before any run starts.
    pub fn validate(&self, agents: &AgentSet) -> Result<(), OrchestrationError> {
        match self {
            SelectionPolicy::RoundRobin { initial_agent } => {
                if agents.len() < 2 {
                    return Err(OrchestrationError::InvalidTopology(format!(
                        "round-robin selection needs at least 2 agents, found {}",
                        agents.len()
                    )));
                }
                require_agent(agents, initial_agent.as_deref())
            }
            SelectionPolicy::RuleBased { rules } => {
                for target in rules.values() {
                    require_agent(agents, Some(target))?;
                }
                for key in rules.keys() {
                    if key != USER_AUTHOR && !agents.contains(key) {
                        return Err(OrchestrationError::AgentNotFound(key.clone()));
                    }
                }
                let uncovered = std::iter::once(USER_AUTHOR)
                    .chain(agents.iter().map(|a| a.id.as_str()))
                    .find(|author| !rules.contains_key(*author));
                match uncovered {
                    Some(author) => Err(OrchestrationError::UnroutableState {
                        after: author.to_string(),
                        reason: "no selection rule covers this author".to_string(),
                    }),
                    None => Ok(()),
                }
            }
            SelectionPolicy::Delegate(delegate) => {
                require_agent(agents, Some(&delegate.default_agent))?;
                require_agent(agents, delegate.initial_agent.as_deref())
            }
            SelectionPolicy::ConcurrentAll => Ok(()),
        }
    }

    /// Choose the next actor(s) given the history so far.
    pub async fn select(
        &self,
        history: &ConversationHistory,
        agents: &AgentSet,
    ) -> Result<Selection, OrchestrationError> {
        let last_actor = history.last_actor();

        match self {
            SelectionPolicy::RoundRobin { initial_agent } => {
                let position = last_actor.and_then(|id| agents.position(id));
                let next = match position {
                    Some(p) => agents.at((p + 1) % agents.len()),
                    None => match initial_agent {
                        Some(id) => agents.get(id),
                        None => agents.at(0),
                    },
                };
                let next = next.ok_or_else(|| OrchestrationError::UnroutableState {
                    after: last_actor.unwrap_or(USER_AUTHOR).to_string(),
                    reason: "round-robin has no agents".to_string(),
                })?;
                Ok(Selection::single(&next.id, "round-robin turn"))
            }
            SelectionPolicy::RuleBased { rules } => {
                let author = last_actor.unwrap_or(USER_AUTHOR);
                match rules.get(author) {
                    Some(next) => Ok(Selection::single(
                        next,
                        format!("rule: after '{}' comes '{}'", author, next),
                    )),
                    None => Err(OrchestrationError::UnroutableState {
                        after: author.to_string(),
                        reason: "no selection rule covers this author".to_string(),
                    }),
                }
            }
            SelectionPolicy::Delegate(delegate) => Ok(delegate.select(history, agents).await),
            SelectionPolicy::ConcurrentAll => Ok(Selection {
                agents: agents.ids().into_iter().map(String::from).collect(),
                reason: "concurrent fan-out".to_string(),
            }),
        }
    }
}

fn require_agent(agents: &AgentSet, id: Option<&str>) -> Result<(), OrchestrationError> {
    match id {
        Some(id) if !agents.contains(id) => Err(OrchestrationError::AgentNotFound(id.to_string())),
        _ => Ok(()),
    }
}
