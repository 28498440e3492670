//! Error taxonomy for orchestration configuration and execution.
//!
//! Configuration problems surface from
//! [`OrchestrationBuilder::build`](crate::orchestration::OrchestrationBuilder::build)
//! so a misconfigured topology never starts. Runtime failures abort only the
//! current run and are returned as a [`RunError`] that carries the transcript
//! accumulated before the failure.
//!
//! Hitting the iteration ceiling is not an error; see
//! [`TerminationReason::BudgetExhausted`](crate::termination::TerminationReason::BudgetExhausted).
//!
//! # Examples
//!
//! ```
//! use ensemble::error::OrchestrationError;
//!
//! let err = OrchestrationError::AgentNotFound("missing-agent".into());
//! assert_eq!(err.to_string(), "Agent not found: missing-agent");
//! ```

use crate::ensemble::aggregation::AgentOutput;
use crate::ensemble::message::Message;
use serde_json::Value as JsonValue;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Category of a failed backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Network or connection failure.
    Transport,
    /// Rate limit or quota exceeded.
    Quota,
    /// The backend answered with something that could not be interpreted.
    MalformedResponse,
    Other,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendErrorKind::Transport => write!(f, "transport"),
            BackendErrorKind::Quota => write!(f, "quota"),
            BackendErrorKind::MalformedResponse => write!(f, "malformed response"),
            BackendErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Failure reported by an [`AgentBackend`](crate::agent::AgentBackend) or a
/// [`DelegateEvaluator`](crate::delegate::DelegateEvaluator).
#[derive(Debug, Clone)]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
    /// Optional structured diagnostic payload (status codes, provider body).
    pub diagnostics: Option<JsonValue>,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            diagnostics: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Transport, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::MalformedResponse, message)
    }

    /// Attach a diagnostic payload (builder pattern).
    pub fn with_diagnostics(mut self, diagnostics: JsonValue) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl Error for BackendError {}

/// Errors that can occur during orchestration configuration or execution.
#[derive(Debug, Clone)]
pub enum OrchestrationError {
    /// An agent invocation failed. The run is aborted; no retry is attempted.
    BackendInvocation {
        agent_id: String,
        source: BackendError,
    },

    /// The topology, policy, or routing graph is misconfigured.
    InvalidTopology(String),

    /// No next actor can be determined.
    UnroutableState {
        /// The agent (or `"user"`) whose turn could not be followed.
        after: String,
        reason: String,
    },

    /// A concurrent round did not finish before its aggregate deadline.
    AggregationTimeout {
        timeout: Duration,
        /// Outputs of the agents that did finish in time.
        partial: Vec<AgentOutput>,
    },

    /// The run's wall-clock limit passed while waiting on these actors
    /// (agent ids, or `"user"` for a human prompt).
    RunTimeout {
        timeout: Duration,
        waiting_on: Vec<String>,
    },

    /// A referenced agent id is not registered.
    AgentNotFound(String),

    /// [`OrchestrationBuilder::build`](crate::orchestration::OrchestrationBuilder::build)
    /// was called before any agents were added.
    NoAgents,

    /// The run was cancelled through its [`CancelHandle`](crate::orchestration::CancelHandle).
    Cancelled,
}

impl OrchestrationError {
    /// The agent this error is attributed to, when there is one.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            OrchestrationError::BackendInvocation { agent_id, .. } => Some(agent_id),
            OrchestrationError::UnroutableState { after, .. } => Some(after),
            OrchestrationError::AgentNotFound(id) => Some(id),
            OrchestrationError::RunTimeout { waiting_on, .. } => {
                waiting_on.first().map(String::as_str)
            }
            _ => None,
        }
    }
}

impl fmt::Display for OrchestrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestrationError::BackendInvocation { agent_id, source } => {
                write!(f, "Agent '{}' failed: {}", agent_id, source)
            }
            OrchestrationError::InvalidTopology(msg) => write!(f, "Invalid topology: {}", msg),
            OrchestrationError::UnroutableState { after, reason } => {
                write!(f, "Cannot route after '{}': {}", after, reason)
            }
            OrchestrationError::AggregationTimeout { timeout, partial } => {
                let finished: Vec<&str> = partial.iter().map(|o| o.agent_id.as_str()).collect();
                write!(
                    f,
                    "Aggregation timed out after {:?} ({} finished: [{}])",
                    timeout,
                    partial.len(),
                    finished.join(", ")
                )
            }
            OrchestrationError::RunTimeout {
                timeout,
                waiting_on,
            } => write!(
                f,
                "Run timed out after {:?} waiting on [{}]",
                timeout,
                waiting_on.join(", ")
            ),
            OrchestrationError::AgentNotFound(id) => write!(f, "Agent not found: {}", id),
            OrchestrationError::NoAgents => write!(f, "No agents in orchestration"),
            OrchestrationError::Cancelled => write!(f, "Run was cancelled"),
        }
    }
}

impl Error for OrchestrationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            OrchestrationError::BackendInvocation { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A failed run: the cause plus every message appended to the history during
/// the run before it failed.
#[derive(Debug, Clone)]
pub struct RunError {
    pub error: OrchestrationError,
    pub transcript: Vec<Message>,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} messages in partial transcript)",
            self.error,
            self.transcript.len()
        )
    }
}

impl Error for RunError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.error)
    }
}
