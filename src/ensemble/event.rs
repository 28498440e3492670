//! Orchestration event system.
//!
//! Two ways to observe a run:
//!
//! - **Callbacks**: implement [`EventHandler`] and register it with
//!   [`OrchestrationBuilder::with_event_handler`](crate::orchestration::OrchestrationBuilder::with_event_handler).
//!   Both methods default to no-ops, so override only what you need.
//! - **Stream**: [`OrchestrationSession::subscribe`](crate::orchestration::OrchestrationSession::subscribe)
//!   hands back an [`EventStream`] of [`RunEvent`]s for the next run. The
//!   stream ends when that run ends.
//!
//! Every message appended to the history is delivered exactly once, in
//! append order, to both.
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use ensemble::event::{EventHandler, OrchestrationEvent};
//! use ensemble::message::Message;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_message(&self, message: &Message) {
//!         println!("{}", message.render());
//!     }
//!
//!     async fn on_orchestration_event(&self, event: &OrchestrationEvent) {
//!         if let OrchestrationEvent::HandoffOccurred { from, to, .. } = event {
//!             println!("-- handoff {} -> {}", from, to);
//!         }
//!     }
//! }
//! ```

use crate::ensemble::error::OrchestrationError;
use crate::ensemble::message::Message;
use crate::ensemble::termination::TerminationReason;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Lifecycle events emitted by the orchestration engine.
#[derive(Debug, Clone)]
pub enum OrchestrationEvent {
    /// Emitted once before the seed message is appended.
    RunStarted {
        orchestration_id: String,
        run_id: String,
        /// Topology name (`"Sequential"`, `"Concurrent"`, `"GroupChat"`, `"Handoff"`).
        topology: String,
        agent_count: usize,
    },

    /// The next actor(s) were chosen.
    AgentSelected {
        run_id: String,
        agent_ids: Vec<String>,
        /// Human-readable explanation from the selection policy.
        reason: String,
        iteration: usize,
    },

    AgentResponded {
        run_id: String,
        agent_id: String,
        /// Number of messages the agent produced this turn.
        message_count: usize,
        iteration: usize,
    },

    /// A backend call failed. The run aborts right after this event.
    AgentFailed {
        run_id: String,
        agent_id: String,
        error: String,
    },

    /// Control moved along a routing edge.
    HandoffOccurred {
        run_id: String,
        from: String,
        to: String,
    },

    /// The engine is waiting on the human-input capability.
    HumanInputRequested { run_id: String, agent_id: String },

    TerminationChecked {
        run_id: String,
        iteration: usize,
        complete: bool,
        reason: TerminationReason,
    },

    RunCompleted {
        run_id: String,
        iterations: usize,
        reason: TerminationReason,
    },

    RunCancelled { run_id: String, iterations: usize },
}

/// Receives engine callbacks. Shared as `Arc<dyn EventHandler>`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called once per appended message, in append order.
    async fn on_message(&self, _message: &Message) {}

    async fn on_orchestration_event(&self, _event: &OrchestrationEvent) {}
}

/// Item of an [`EventStream`].
#[derive(Debug, Clone)]
pub enum RunEvent {
    Message(Message),
    Orchestration(OrchestrationEvent),
    /// Terminal item for a successful run.
    Completed {
        run_id: String,
        reason: TerminationReason,
        iterations: usize,
    },
    /// Terminal item for a failed or cancelled run.
    Failed {
        run_id: String,
        error: OrchestrationError,
    },
}

/// Finite stream of one run's events.
///
/// Yields `None` once the run has finished and every event was delivered.
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<RunEvent>,
}

impl EventStream {
    pub(crate) fn channel() -> (mpsc::UnboundedSender<RunEvent>, EventStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (sender, EventStream { receiver })
    }
}

impl Stream for EventStream {
    type Item = RunEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RunEvent>> {
        self.receiver.poll_recv(cx)
    }
}

/// Fan-out to the registered handler and the per-run stream, if any.
#[derive(Clone, Default)]
pub(crate) struct EventSink {
    handler: Option<Arc<dyn EventHandler>>,
    stream: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl EventSink {
    pub(crate) fn new(
        handler: Option<Arc<dyn EventHandler>>,
        stream: Option<mpsc::UnboundedSender<RunEvent>>,
    ) -> Self {
        Self { handler, stream }
    }

    pub(crate) async fn message(&self, message: &Message) {
        if let Some(handler) = &self.handler {
            handler.on_message(message).await;
        }
        self.send(RunEvent::Message(message.clone()));
    }

    pub(crate) async fn event(&self, event: OrchestrationEvent) {
        if let Some(handler) = &self.handler {
            handler.on_orchestration_event(&event).await;
        }
        self.send(RunEvent::Orchestration(event));
    }

    pub(crate) fn send(&self, event: RunEvent) {
        if let Some(stream) = &self.stream {
            // A dropped receiver only means nobody is listening any more.
            let _ = stream.send(event);
        }
    }
}
