//! External text-in/text-out evaluators used by delegate policies.
//!
//! Selection and termination delegates do not see the history directly. The
//! engine renders a bounded window of recent messages into an instruction
//! template and hands the resulting prompt to a [`DelegateEvaluator`]; the
//! answer is then parsed by the policy (an agent identifier, or a completion
//! token).
//!
//! Templates use two placeholders:
//!
//! - `{history}`: the rendered window, one `[Author]: content` line per message
//! - `{participants}`: `- id (name): description` lines for the agent set
//!
//! # Example
//!
//! ```rust
//! use ensemble::delegate::PromptTemplate;
//! use ensemble::message::Message;
//!
//! let template = PromptTemplate::new("Is this satisfactory?\n\nRESPONSE:\n{history}");
//! let window = [Message::from_agent("reviewer", "Reviewer", "Looks great.")];
//! let prompt = template.render(&window, "");
//! assert!(prompt.ends_with("[Reviewer]: Looks great."));
//! ```

use crate::ensemble::agent::AgentSet;
use crate::ensemble::error::BackendError;
use crate::ensemble::message::Message;
use async_trait::async_trait;

/// Placeholder replaced by the rendered history window.
pub const HISTORY_PLACEHOLDER: &str = "{history}";
/// Placeholder replaced by the participant list.
pub const PARTICIPANTS_PLACEHOLDER: &str = "{participants}";

/// A text-in/text-out decision capability, typically an LLM call.
#[async_trait]
pub trait DelegateEvaluator: Send + Sync {
    async fn evaluate(&self, prompt: &str) -> Result<String, BackendError>;
}

/// Instruction template rendered for each delegate call.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    text: String,
}

impl PromptTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Substitute the placeholders. When the template has no `{history}`
    /// placeholder the window is appended after a blank line.
    pub fn render(&self, window: &[Message], participants: &str) -> String {
        let history = render_window(window);
        let mut prompt = self.text.replace(PARTICIPANTS_PLACEHOLDER, participants);
        if prompt.contains(HISTORY_PLACEHOLDER) {
            prompt = prompt.replace(HISTORY_PLACEHOLDER, &history);
        } else if !history.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&history);
        }
        prompt
    }
}

/// Default selection instructions, following the review/revise group chat.
pub fn default_selection_template() -> PromptTemplate {
    PromptTemplate::new(
        "Examine the provided RESPONSE and choose the next participant.\n\
         State only the name of the chosen participant without explanation.\n\
         Never choose the participant named in the RESPONSE.\n\n\
         Choose only from these participants:\n\
         {participants}\n\n\
         RESPONSE:\n\
         {history}",
    )
}

/// Default termination instructions; `token` is the completion token.
pub fn default_termination_template(token: &str) -> PromptTemplate {
    PromptTemplate::new(format!(
        "Examine the RESPONSE and determine whether the content has been deemed satisfactory.\n\
         If content is satisfactory, respond with a single word without explanation: {}.\n\
         If specific suggestions are being provided, it is not satisfactory.\n\
         If no correction is suggested, it is satisfactory.\n\n\
         RESPONSE:\n\
         {{history}}",
        token
    ))
}

/// Default summarizer instructions used to produce a run's final result.
pub fn default_summary_template() -> PromptTemplate {
    PromptTemplate::new(
        "Summarize the outcome of the following conversation in a few sentences.\n\n{history}",
    )
}

/// One `[Author]: content` line per message.
pub fn render_window(window: &[Message]) -> String {
    window
        .iter()
        .map(Message::render)
        .collect::<Vec<_>>()
        .join("\n")
}

/// `- id (name): description` per agent, in declaration order.
pub fn render_participants(agents: &AgentSet) -> String {
    agents
        .iter()
        .map(|a| {
            if a.description.is_empty() {
                format!("- {} ({})", a.id, a.name)
            } else {
                format!("- {} ({}): {}", a.id, a.name, a.description)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Normalize a raw delegate answer: unify line endings, trim whitespace and
/// surrounding quotes or punctuation.
pub fn normalize_answer(raw: &str) -> String {
    raw.replace("\r\n", "\n")
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '.' || c == '*')
        .trim()
        .to_string()
}
