//! Append-only conversation log with policy-facing truncation views.
//!
//! [`ConversationHistory`] is the durable transcript of a session. It only
//! grows: the engine appends user input, agent replies, and human answers, and
//! stamps each with the next sequence number. Policies never see the log
//! directly when they are configured with a window; they see a
//! [`ContextWindow`] view, a borrowed suffix of the log. Views never mutate
//! the log, so truncation for evaluation purposes cannot lose transcript data.
//!
//! The only destructive operation is [`ConversationHistory::clear`], which the
//! session calls on an explicit `reset(true)`.

use crate::ensemble::message::Message;
use serde::{Deserialize, Serialize};

/// How much of the history a consumer (agent or policy) observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextWindow {
    /// The entire transcript.
    Full,
    /// Only the most recent `n` messages. `Recent(0)` yields an empty view.
    Recent(usize),
}

impl Default for ContextWindow {
    fn default() -> Self {
        ContextWindow::Full
    }
}

impl ContextWindow {
    /// Borrow the suffix of `messages` this window admits.
    pub fn apply<'a>(&self, messages: &'a [Message]) -> &'a [Message] {
        match *self {
            ContextWindow::Full => messages,
            ContextWindow::Recent(n) => {
                let start = messages.len().saturating_sub(n);
                &messages[start..]
            }
        }
    }
}

/// Ordered, append-only log of [`Message`]s.
#[derive(Debug, Default, Clone)]
pub struct ConversationHistory {
    messages: Vec<Message>,
    next_sequence: u64,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            next_sequence: 1,
        }
    }

    /// Append a message, assigning it the next sequence number.
    ///
    /// Returns a reference to the stored message. Sequence numbers keep
    /// increasing across [`clear`](Self::clear), so a message from before a
    /// reset can never be confused with one from after it.
    pub fn append(&mut self, mut message: Message) -> &Message {
        if self.next_sequence == 0 {
            self.next_sequence = 1;
        }
        message.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }

    /// All messages in causal order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages appended after the given sequence number.
    pub fn since(&self, sequence: u64) -> &[Message] {
        let start = self.messages.partition_point(|m| m.sequence <= sequence);
        &self.messages[start..]
    }

    /// View of the log through a [`ContextWindow`].
    pub fn view(&self, window: ContextWindow) -> &[Message] {
        window.apply(&self.messages)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The agent that produced the most recent message, if it was an agent.
    pub fn last_actor(&self) -> Option<&str> {
        self.messages.last().and_then(|m| m.agent_id.as_deref())
    }

    /// Sequence number of the most recently appended message, `0` when empty.
    pub fn last_sequence(&self) -> u64 {
        self.messages.last().map(|m| m.sequence).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop every message. Sequence numbering continues where it left off.
    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
