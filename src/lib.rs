//! # Ensemble
//!
//! Ensemble coordinates several autonomous conversational agents toward one
//! task. It owns the hard part of multi-agent work: deciding turn by turn who
//! speaks next, when the task is finished, how the shared transcript is kept
//! and windowed, and how control moves between agents along a declared
//! routing graph. What an agent *is* (an LLM call, a rules engine, a script)
//! stays behind the [`agent::AgentBackend`] trait.
//!
//! The crate provides:
//!
//! * **Topologies**: [`orchestration::Topology`] selects a linear pipeline
//!   (`Sequential`), fan-out/gather (`Concurrent`), a moderated group chat
//!   (`GroupChat`), or a handoff state machine (`Handoff`).
//! * **Policies**: [`selection::SelectionPolicy`] and
//!   [`termination::TerminationPolicy`] are plain strategy values. Delegate
//!   variants consult an external [`delegate::DelegateEvaluator`] and fall
//!   back to safe defaults when its answer is unusable.
//! * **History**: [`history::ConversationHistory`] is append-only; policies
//!   observe it through [`history::ContextWindow`] views.
//! * **Tools**: agents can be granted a [`tool_protocol::ToolRegistry`];
//!   [`tool_protocols::CustomToolProtocol`] turns closures into tools.
//! * **Observability**: [`event::EventHandler`] callbacks and a per-run
//!   [`event::EventStream`].
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use ensemble::agent::{Agent, AgentBackend, AgentReply, InvocationRequest};
//! use ensemble::error::BackendError;
//! use ensemble::orchestration::{OrchestrationBuilder, OrchestrationSession, Topology};
//! use std::sync::Arc;
//!
//! struct Shout;
//!
//! #[async_trait]
//! impl AgentBackend for Shout {
//!     async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Vec<AgentReply>, BackendError> {
//!         let last = request.context.last().map(|m| m.content.to_uppercase()).unwrap_or_default();
//!         Ok(vec![AgentReply::text(last)])
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     ensemble::init_logger();
//!
//!     let pipeline = OrchestrationBuilder::new("pipeline", "Shouting pipeline")
//!         .add_agent(Agent::new("first", "First", Arc::new(Shout)))
//!         .add_agent(Agent::new("second", "Second", Arc::new(Shout)))
//!         .with_topology(Topology::Sequential)
//!         .build()?;
//!
//!     let mut session = OrchestrationSession::new(pipeline);
//!     let outcome = session.start("hello").await?;
//!     println!("{:?}", outcome.result.as_text());
//!     Ok(())
//! }
//! ```

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Applications opt in to `RUST_LOG` driven diagnostics; library code only
/// ever talks to the `log` facade.
///
/// ```rust
/// ensemble::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `ensemble` module.
pub mod ensemble;

// Re-exporting modules and key items for easier external access.
pub use ensemble::agent;
pub use ensemble::agent::{Agent, AgentBackend, AgentSet};
pub use ensemble::aggregation;
pub use ensemble::aggregation::{AgentOutput, OrchestrationResult};
pub use ensemble::config;
pub use ensemble::config::OrchestrationConfig;
pub use ensemble::delegate;
pub use ensemble::delegate::DelegateEvaluator;
pub use ensemble::error;
pub use ensemble::error::{BackendError, OrchestrationError, RunError};
pub use ensemble::event;
pub use ensemble::event::{EventHandler, OrchestrationEvent};
pub use ensemble::history;
pub use ensemble::history::{ContextWindow, ConversationHistory};
pub use ensemble::message;
pub use ensemble::message::{Message, Role, Signal};
pub use ensemble::orchestration;
pub use ensemble::orchestration::{
    CancelHandle, HumanInput, Orchestration, OrchestrationBuilder, OrchestrationSession,
    RunOutcome, Topology,
};
pub use ensemble::routing;
pub use ensemble::routing::RoutingGraph;
pub use ensemble::selection;
pub use ensemble::selection::SelectionPolicy;
pub use ensemble::termination;
pub use ensemble::termination::{TerminationCondition, TerminationPolicy, TerminationReason};
pub use ensemble::tool_protocol;
pub use ensemble::tool_protocols;
