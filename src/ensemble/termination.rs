//! Termination policies: when is the task finished?
//!
//! Every turn the engine asks the [`TerminationPolicy`] for a
//! [`TerminationDecision`]. Checks run in a fixed order:
//!
//! 1. the iteration ceiling (`BudgetExhausted`), always first;
//! 2. a `Resolved` signal on the latest message of the run;
//! 3. the configured [`TerminationCondition`].
//!
//! Running out of budget is a normal terminal state, not an error.
//!
//! # Example
//!
//! ```rust
//! use ensemble::termination::{TerminationCondition, TerminationPolicy};
//!
//! // Stop once the reviewer says "yes", or after ten turns at the latest.
//! let policy = TerminationPolicy::max_iterations(10)
//!     .with_condition(TerminationCondition::contains_token("yes", ["reviewer"]));
//! assert_eq!(policy.max_iterations, 10);
//! ```

use crate::ensemble::agent::AgentSet;
use crate::ensemble::delegate::{
    default_termination_template, normalize_answer, render_participants, DelegateEvaluator,
    PromptTemplate,
};
use crate::ensemble::error::OrchestrationError;
use crate::ensemble::history::{ContextWindow, ConversationHistory};
use crate::ensemble::message::{Message, Signal};
use std::fmt;
use std::sync::Arc;

/// Default hard ceiling on agent turns.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Why a termination check came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The iteration ceiling was reached.
    BudgetExhausted,
    /// A data rule matched.
    RuleSatisfied,
    /// The termination delegate answered with the completion token.
    DelegateApproved,
    /// A fixed-round topology finished its pass.
    RoundsCompleted,
    /// An agent marked the task as resolved.
    Resolved,
    NotComplete,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TerminationReason::BudgetExhausted => "budget exhausted",
            TerminationReason::RuleSatisfied => "rule satisfied",
            TerminationReason::DelegateApproved => "delegate approved",
            TerminationReason::RoundsCompleted => "rounds completed",
            TerminationReason::Resolved => "resolved",
            TerminationReason::NotComplete => "not complete",
        };
        write!(f, "{}", text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationDecision {
    pub complete: bool,
    pub reason: TerminationReason,
}

impl TerminationDecision {
    pub fn complete(reason: TerminationReason) -> Self {
        Self {
            complete: true,
            reason,
        }
    }

    pub fn not_complete() -> Self {
        Self {
            complete: false,
            reason: TerminationReason::NotComplete,
        }
    }
}

/// What the policy sees when deciding.
pub struct TerminationContext<'a> {
    pub history: &'a ConversationHistory,
    /// Messages appended during the current run, seed included.
    pub run_messages: &'a [Message],
    /// Agent turns (or concurrent rounds) taken so far in this run.
    pub iteration: usize,
    /// Full passes over the agent set completed so far.
    pub passes_completed: usize,
    pub agents: &'a AgentSet,
}

/// Data rules evaluated against the latest message or the history size.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationRule {
    /// Latest message contains `token` (case-insensitive) and was authored by
    /// one of `agents`. An empty agent list accepts any agent, never the user.
    ContainsToken { token: String, agents: Vec<String> },
    /// History holds more than this many messages.
    MaxMessages(usize),
}

impl TerminationRule {
    fn is_satisfied(&self, ctx: &TerminationContext<'_>) -> bool {
        match self {
            TerminationRule::ContainsToken { token, agents } => {
                match ctx.run_messages.last() {
                    Some(last) if authored_by_any(last, agents) => last
                        .content
                        .to_lowercase()
                        .contains(&token.to_lowercase()),
                    _ => false,
                }
            }
            TerminationRule::MaxMessages(limit) => ctx.history.len() > *limit,
        }
    }
}

fn authored_by_any(message: &Message, agents: &[String]) -> bool {
    match &message.agent_id {
        Some(id) => agents.is_empty() || agents.iter().any(|a| a == id),
        None => false,
    }
}

/// Delegate-driven termination settings.
#[derive(Clone)]
pub struct TerminationDelegate {
    evaluator: Arc<dyn DelegateEvaluator>,
    token: String,
    template: Option<PromptTemplate>,
    agents: Vec<String>,
    window: ContextWindow,
}

impl TerminationDelegate {
    /// The run completes when the evaluator's answer contains `token`.
    pub fn new(evaluator: Arc<dyn DelegateEvaluator>, token: impl Into<String>) -> Self {
        Self {
            evaluator,
            token: token.into(),
            template: None,
            agents: Vec::new(),
            window: ContextWindow::Recent(1),
        }
    }

    /// Only consult the delegate after one of these agents has spoken, and
    /// only show it what they said.
    pub fn with_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agents = agents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn with_window(mut self, window: ContextWindow) -> Self {
        self.window = window;
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    async fn is_satisfied(&self, ctx: &TerminationContext<'_>) -> bool {
        match ctx.run_messages.last() {
            Some(last) if authored_by_any(last, &self.agents) => {}
            _ => return false,
        }

        let template = self
            .template
            .clone()
            .unwrap_or_else(|| default_termination_template(&self.token));
        let participants = render_participants(ctx.agents);
        let prompt = if self.agents.is_empty() {
            template.render(ctx.history.view(self.window), &participants)
        } else {
            let observed: Vec<Message> = ctx
                .history
                .messages()
                .iter()
                .filter(|m| authored_by_any(m, &self.agents))
                .cloned()
                .collect();
            template.render(self.window.apply(&observed), &participants)
        };

        match self.evaluator.evaluate(&prompt).await {
            Ok(answer) => {
                let answer = normalize_answer(&answer).to_lowercase();
                let approved = answer.contains(&self.token.to_lowercase());
                log::debug!(
                    "termination delegate answered {:?} (approved: {})",
                    answer,
                    approved
                );
                approved
            }
            Err(e) => {
                log::warn!("termination delegate failed ({}); continuing", e);
                false
            }
        }
    }
}

/// The completion check applied after the budget and `Resolved` checks.
#[derive(Clone)]
pub enum TerminationCondition {
    /// Only the budget (or a `Resolved` signal) ends the run.
    Never,
    Rule(TerminationRule),
    Delegate(TerminationDelegate),
    /// Stop after exactly one pass over every agent.
    FixedRounds,
}

impl TerminationCondition {
    pub fn contains_token<I, S>(token: impl Into<String>, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TerminationCondition::Rule(TerminationRule::ContainsToken {
            token: token.into(),
            agents: agents.into_iter().map(Into::into).collect(),
        })
    }

    pub fn max_messages(limit: usize) -> Self {
        TerminationCondition::Rule(TerminationRule::MaxMessages(limit))
    }

    fn referenced_agents(&self) -> &[String] {
        match self {
            TerminationCondition::Rule(TerminationRule::ContainsToken { agents, .. }) => agents,
            TerminationCondition::Delegate(delegate) => &delegate.agents,
            _ => &[],
        }
    }
}

/// Iteration ceiling plus a completion condition.
#[derive(Clone)]
pub struct TerminationPolicy {
    pub max_iterations: usize,
    pub condition: TerminationCondition,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            condition: TerminationCondition::Never,
        }
    }
}

impl TerminationPolicy {
    pub fn max_iterations(max_iterations: usize) -> Self {
        Self {
            max_iterations,
            condition: TerminationCondition::Never,
        }
    }

    pub fn with_condition(mut self, condition: TerminationCondition) -> Self {
        self.condition = condition;
        self
    }

    /// Every agent a rule or delegate restricts itself to must be registered.
    pub fn validate(&self, agents: &AgentSet) -> Result<(), OrchestrationError> {
        match self
            .condition
            .referenced_agents()
            .iter()
            .find(|id| !agents.contains(id))
        {
            Some(missing) => Err(OrchestrationError::AgentNotFound(missing.clone())),
            None => Ok(()),
        }
    }

    pub async fn evaluate(&self, ctx: &TerminationContext<'_>) -> TerminationDecision {
        if ctx.iteration >= self.max_iterations {
            return TerminationDecision::complete(TerminationReason::BudgetExhausted);
        }

        let resolved = ctx
            .run_messages
            .last()
            .filter(|m| m.agent_id.is_some())
            .and_then(Message::signal)
            == Some(Signal::Resolved);
        if resolved {
            return TerminationDecision::complete(TerminationReason::Resolved);
        }

        let (satisfied, reason) = match &self.condition {
            TerminationCondition::Never => (false, TerminationReason::NotComplete),
            TerminationCondition::Rule(rule) => {
                (rule.is_satisfied(ctx), TerminationReason::RuleSatisfied)
            }
            TerminationCondition::Delegate(delegate) => (
                delegate.is_satisfied(ctx).await,
                TerminationReason::DelegateApproved,
            ),
            TerminationCondition::FixedRounds => {
                (ctx.passes_completed >= 1, TerminationReason::RoundsCompleted)
            }
        };

        if satisfied {
            TerminationDecision::complete(reason)
        } else {
            TerminationDecision::not_complete()
        }
    }
}
