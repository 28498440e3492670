//! Messages exchanged between the user, agents, and the orchestration engine.
//!
//! Every agent response, user prompt, and human-in-the-loop answer flowing
//! through an [`OrchestrationSession`](crate::orchestration::OrchestrationSession)
//! is captured as a [`Message`]. The engine stamps each message with a
//! monotonically increasing `sequence` when it is appended to the
//! [`ConversationHistory`](crate::history::ConversationHistory); after that the
//! message is only ever handed out by shared reference.
//!
//! # Examples
//!
//! ```
//! use ensemble::message::{Message, Role, Signal};
//!
//! let user = Message::user("draft a slogan");
//! assert!(user.agent_id.is_none());
//!
//! let reply = Message::from_agent("writer", "Writer", "Drive the future [RESOLVED]");
//! assert_eq!(reply.role, Role::Assistant);
//! assert_eq!(reply.signal(), Some(Signal::Resolved));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Author label used for messages that do not originate from an agent.
pub const USER_AUTHOR: &str = "user";

/// Represents the possible roles for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Set by the developer to steer the agents.
    System,
    /// A message sent by a human user (or app user).
    User,
    /// Content generated by an agent.
    Assistant,
    /// Output of a tool call surfaced into the conversation.
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// Control intent an agent attaches to its reply.
///
/// Backends that produce structured output set the signal directly on the
/// reply. Plain-text backends may embed `[HANDOFF:<target>]` or `[RESOLVED]`
/// markers instead; [`Message::signal`] recognises both forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    /// Transfer control along a routing edge. The value is matched against the
    /// edge target id, the target's display name, or the edge guard label.
    Handoff(String),
    /// The task is resolved; the run ends after this message.
    Resolved,
}

const HANDOFF_MARKER: &str = "[HANDOFF:";
const RESOLVED_MARKER: &str = "[RESOLVED]";

impl Signal {
    /// Extract a signal from in-text markers.
    ///
    /// `[RESOLVED]` wins over a handoff marker when both are present. Marker
    /// matching is case-insensitive; the handoff target keeps its original
    /// spelling with surrounding whitespace trimmed.
    pub fn parse(content: &str) -> Option<Signal> {
        let upper = content.to_ascii_uppercase();
        if upper.contains(RESOLVED_MARKER) {
            return Some(Signal::Resolved);
        }

        let start = upper.find(HANDOFF_MARKER)? + HANDOFF_MARKER.len();
        let rest = content.get(start..)?;
        let end = rest.find(']')?;
        let target = rest[..end].trim();
        if target.is_empty() {
            None
        } else {
            Some(Signal::Handoff(target.to_string()))
        }
    }
}

/// A single message in a conversation.
///
/// Content is stored as `Arc<str>` so cloning a message (for event emission,
/// context views, or concurrent fan-out) is cheap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Position in the owning history. Assigned on append; `0` until then.
    pub sequence: u64,

    /// UTC timestamp recorded when the message was created.
    pub timestamp: DateTime<Utc>,

    /// Identifier of the agent that produced this message, or `None` for user
    /// and system messages.
    pub agent_id: Option<String>,

    /// Display name of the producing agent.
    pub agent_name: Option<String>,

    pub role: Role,

    pub content: Arc<str>,

    /// Structured control intent. When `None`, [`Message::signal`] falls back
    /// to parsing markers from the content.
    #[serde(default)]
    pub explicit_signal: Option<Signal>,

    /// Free-form key-value metadata (`"iteration"`, `"run_id"`, ...).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Message {
    /// Create a message with the given role and content but no agent identity.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            agent_id: None,
            agent_name: None,
            role,
            content: Arc::from(content.into().as_str()),
            explicit_signal: None,
            metadata: HashMap::new(),
        }
    }

    /// Shorthand for a [`Role::User`] message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant-role message attributed to a specific agent.
    pub fn from_agent(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut message = Self::new(Role::Assistant, content);
        message.agent_id = Some(agent_id.into());
        message.agent_name = Some(agent_name.into());
        message
    }

    /// Attach a structured signal (builder pattern).
    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.explicit_signal = Some(signal);
        self
    }

    /// Attach a key-value metadata pair (builder pattern).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Author label: the agent id, or [`USER_AUTHOR`] for non-agent messages.
    pub fn author(&self) -> &str {
        self.agent_id.as_deref().unwrap_or(USER_AUTHOR)
    }

    /// `true` when this message was produced by the given agent.
    pub fn is_from(&self, agent_id: &str) -> bool {
        self.agent_id.as_deref() == Some(agent_id)
    }

    /// The control intent of this message, explicit or parsed from markers.
    pub fn signal(&self) -> Option<Signal> {
        self.explicit_signal
            .clone()
            .or_else(|| Signal::parse(&self.content))
    }

    /// Render as a single transcript line, `"[Writer]: text"`.
    pub fn render(&self) -> String {
        let who = self
            .agent_name
            .as_deref()
            .or(self.agent_id.as_deref())
            .unwrap_or(USER_AUTHOR);
        format!("[{}]: {}", who, self.content)
    }
}
