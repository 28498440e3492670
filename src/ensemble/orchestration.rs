//! Multi-agent orchestration engine.
//!
//! An [`Orchestration`] is the immutable description of a team: its agents,
//! a [`Topology`], a [`TerminationPolicy`], and observers. It is built once
//! with [`OrchestrationBuilder`], validated eagerly, and shared as
//! `Arc<Orchestration>`. Each conversation runs in its own
//! [`OrchestrationSession`], which owns the history and run state.
//!
//! # Topologies
//!
//! | Topology | Who runs next | Default termination |
//! |----------|---------------|---------------------|
//! | `Sequential` | declared order, one pass | fixed rounds |
//! | `Concurrent` | every agent at once, joined under one deadline | fixed rounds |
//! | `GroupChat` | a [`SelectionPolicy`] | budget / condition |
//! | `Handoff` | the agent currently holding control in a [`RoutingGraph`] | budget / `Resolved` |
//!
//! # The turn loop
//!
//! ```text
//! append seed ─► termination? ─► select ─► invoke ─► append + emit ─► iteration += 1
//!                    ▲                                                     │
//!                    └─────────────────────────────────────────────────────┘
//! ```
//!
//! A backend failure aborts the run with a [`RunError`] that carries every
//! message appended before the failure. The history itself stays intact.
//! The same holds when a run outlives its optional time limit
//! ([`OrchestrationBuilder::with_run_timeout`]).
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use ensemble::agent::{Agent, AgentBackend, AgentReply, InvocationRequest};
//! use ensemble::error::BackendError;
//! use ensemble::orchestration::{OrchestrationBuilder, OrchestrationSession, Topology};
//! use ensemble::selection::SelectionPolicy;
//! use ensemble::termination::{TerminationCondition, TerminationPolicy};
//! use std::sync::Arc;
//!
//! struct Scripted(&'static str);
//!
//! #[async_trait]
//! impl AgentBackend for Scripted {
//!     async fn invoke(&self, _r: InvocationRequest<'_>) -> Result<Vec<AgentReply>, BackendError> {
//!         Ok(vec![AgentReply::text(self.0)])
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestration = OrchestrationBuilder::new("review", "Review loop")
//!         .add_agent(Agent::new("reviewer", "Reviewer", Arc::new(Scripted("yes, approved"))))
//!         .add_agent(Agent::new("writer", "Writer", Arc::new(Scripted("Drive further."))))
//!         .with_topology(Topology::GroupChat { selection: SelectionPolicy::round_robin() })
//!         .with_termination(
//!             TerminationPolicy::max_iterations(10)
//!                 .with_condition(TerminationCondition::contains_token("yes", ["reviewer"])),
//!         )
//!         .build()?;
//!
//!     let mut session = OrchestrationSession::new(orchestration);
//!     let outcome = session.start("Write a slogan for an electric SUV").await?;
//!     assert_eq!(outcome.iterations, 1);
//!     Ok(())
//! }
//! ```

use crate::ensemble::agent::{Agent, AgentSet};
use crate::ensemble::aggregation::{AgentOutput, OrchestrationResult, ResultAggregator, Summarizer};
use crate::ensemble::config::OrchestrationConfig;
use crate::ensemble::error::{BackendError, BackendErrorKind, OrchestrationError, RunError};
use crate::ensemble::event::{EventHandler, EventSink, EventStream, OrchestrationEvent, RunEvent};
use crate::ensemble::history::{ContextWindow, ConversationHistory};
use crate::ensemble::message::Message;
use crate::ensemble::routing::{RoutingGraph, Transition};
use crate::ensemble::selection::SelectionPolicy;
use crate::ensemble::termination::{
    TerminationCondition, TerminationContext, TerminationDecision, TerminationPolicy,
    TerminationReason,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How agents are sequenced within a run.
#[derive(Clone)]
pub enum Topology {
    /// Each agent once, in declaration order, each seeing the previous
    /// agent's output.
    Sequential,

    /// All agents on the same context at once. `None` uses the configured
    /// aggregation timeout.
    Concurrent { timeout: Option<Duration> },

    /// A selection policy picks one speaker per turn.
    GroupChat { selection: SelectionPolicy },

    /// Control moves along the edges of a routing graph.
    Handoff { graph: RoutingGraph },
}

impl Topology {
    pub fn name(&self) -> &'static str {
        match self {
            Topology::Sequential => "Sequential",
            Topology::Concurrent { .. } => "Concurrent",
            Topology::GroupChat { .. } => "GroupChat",
            Topology::Handoff { .. } => "Handoff",
        }
    }

    fn is_fixed_rounds(&self) -> bool {
        matches!(self, Topology::Sequential | Topology::Concurrent { .. })
    }
}

/// Human-in-the-loop capability for the Handoff topology.
///
/// Called when the active agent neither hands off nor finishes the task; the
/// returned message is appended before the agent observes context again.
#[async_trait]
pub trait HumanInput: Send + Sync {
    async fn request_input(&self, last_agent_message: &Message) -> Message;
}

/// Immutable, validated orchestration shared by any number of sessions.
pub struct Orchestration {
    id: String,
    name: String,
    agents: AgentSet,
    topology: Topology,
    termination: TerminationPolicy,
    context_window: ContextWindow,
    aggregation_timeout: Duration,
    run_timeout: Option<Duration>,
    event_handler: Option<Arc<dyn EventHandler>>,
    human_input: Option<Arc<dyn HumanInput>>,
    aggregator: ResultAggregator,
}

impl Orchestration {
    pub fn builder(id: impl Into<String>, name: impl Into<String>) -> OrchestrationBuilder {
        OrchestrationBuilder::new(id, name)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn agents(&self) -> &AgentSet {
        &self.agents
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn termination(&self) -> &TerminationPolicy {
        &self.termination
    }

    pub fn context_window(&self) -> ContextWindow {
        self.context_window
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout
    }
}

/// Collects agents and policies, then validates them in [`build`](Self::build).
pub struct OrchestrationBuilder {
    id: String,
    name: String,
    agents: Vec<Arc<Agent>>,
    topology: Topology,
    termination: Option<TerminationPolicy>,
    context_window: Option<ContextWindow>,
    run_timeout: Option<Duration>,
    config: OrchestrationConfig,
    event_handler: Option<Arc<dyn EventHandler>>,
    human_input: Option<Arc<dyn HumanInput>>,
    summarizer: Option<Summarizer>,
}

impl OrchestrationBuilder {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            agents: Vec::new(),
            topology: Topology::Sequential,
            termination: None,
            context_window: None,
            run_timeout: None,
            config: OrchestrationConfig::default(),
            event_handler: None,
            human_input: None,
            summarizer: None,
        }
    }

    pub fn add_agent(self, agent: Agent) -> Self {
        self.add_shared_agent(Arc::new(agent))
    }

    /// Add an agent instance that is also used by other orchestrations.
    pub fn add_shared_agent(mut self, agent: Arc<Agent>) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Override the termination policy. Sequential and Concurrent topologies
    /// keep their fixed-rounds condition; only the budget is taken from here,
    /// and it is honored even when it cuts a pass short.
    pub fn with_termination(mut self, termination: TerminationPolicy) -> Self {
        self.termination = Some(termination);
        self
    }

    /// What agents observe when invoked. Defaults to the previous message for
    /// Sequential and the full history otherwise.
    pub fn with_context_window(mut self, window: ContextWindow) -> Self {
        self.context_window = Some(window);
        self
    }

    /// Wall-clock limit for a whole run, overriding `run_timeout_secs` from
    /// the config. Every agent call and human prompt waits at most until the
    /// run's deadline.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn with_config(mut self, config: OrchestrationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn with_human_input(mut self, human_input: Arc<dyn HumanInput>) -> Self {
        self.human_input = Some(human_input);
        self
    }

    /// Produce single-value results by summarizing the run transcript.
    pub fn with_summarizer(mut self, summarizer: Summarizer) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Validate the configuration. Nothing runs if this fails.
    pub fn build(self) -> Result<Arc<Orchestration>, OrchestrationError> {
        if self.agents.is_empty() {
            return Err(OrchestrationError::NoAgents);
        }

        let mut agents = AgentSet::new();
        for agent in self.agents {
            agents.insert(agent)?;
        }

        match &self.topology {
            Topology::GroupChat { selection } => {
                if matches!(selection, SelectionPolicy::ConcurrentAll) {
                    return Err(OrchestrationError::InvalidTopology(
                        "ConcurrentAll selection is only valid with the Concurrent topology"
                            .to_string(),
                    ));
                }
                selection.validate(&agents)?;
            }
            Topology::Handoff { graph } => graph.validate(&agents)?,
            Topology::Sequential | Topology::Concurrent { .. } => {}
        }

        let mut termination = self
            .termination
            .unwrap_or_else(|| TerminationPolicy::max_iterations(self.config.max_iterations));
        if self.topology.is_fixed_rounds() {
            termination.condition = TerminationCondition::FixedRounds;
            let pass_len = match self.topology {
                Topology::Sequential => agents.len(),
                _ => 1,
            };
            if termination.max_iterations < pass_len {
                log::warn!(
                    "iteration budget of '{}' ({}) ends runs before a full pass of {} turns",
                    self.id,
                    termination.max_iterations,
                    pass_len
                );
            }
        }
        termination.validate(&agents)?;

        if self.human_input.is_some() && !matches!(self.topology, Topology::Handoff { .. }) {
            log::warn!(
                "human input configured on '{}' is only used by the Handoff topology",
                self.id
            );
        }

        let context_window = self.context_window.unwrap_or(match self.topology {
            Topology::Sequential => ContextWindow::Recent(1),
            _ => ContextWindow::Full,
        });
        let aggregation_timeout = match &self.topology {
            Topology::Concurrent { timeout: Some(t) } => *t,
            _ => self.config.aggregation_timeout(),
        };
        let run_timeout = self.run_timeout.or_else(|| self.config.run_timeout());

        log::debug!(
            "built orchestration '{}' ({}) with {} agents",
            self.id,
            self.topology.name(),
            agents.len()
        );

        Ok(Arc::new(Orchestration {
            id: self.id,
            name: self.name,
            agents,
            topology: self.topology,
            termination,
            context_window,
            aggregation_timeout,
            run_timeout,
            event_handler: self.event_handler,
            human_input: self.human_input,
            aggregator: ResultAggregator::new(self.summarizer),
        }))
    }
}

/// Progress of the current (or last) run.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub run_id: Option<String>,
    /// Agent holding control (Handoff) or last selected (other topologies).
    pub active_agent: Option<String>,
    pub iteration: usize,
    pub completed: bool,
}

/// A successful run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub result: OrchestrationResult,
    pub reason: TerminationReason,
    pub iterations: usize,
    /// Messages appended during this run, seed included.
    pub transcript: Vec<Message>,
}

/// Cancels whatever run the owning session is currently executing.
#[derive(Clone)]
pub struct CancelHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl CancelHandle {
    /// In-flight agent calls are abandoned and the run returns
    /// [`OrchestrationError::Cancelled`]. No-op when nothing is running.
    pub fn cancel(&self) {
        let token = self.current.lock().unwrap_or_else(|e| e.into_inner());
        token.cancel();
    }
}

/// Per-run values threaded through the loop.
struct RunScope<'a> {
    orchestration: &'a Orchestration,
    run_id: &'a str,
    run_start: u64,
    sink: &'a EventSink,
    token: &'a CancellationToken,
    deadline: Option<Instant>,
}

impl RunScope<'_> {
    /// Await `future`, giving up at the run deadline if there is one.
    async fn within_deadline<F: Future>(
        &self,
        waiting_on: &str,
        future: F,
    ) -> Result<F::Output, OrchestrationError> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, future)
                .await
                .map_err(|_| self.timed_out(vec![waiting_on.to_string()])),
            None => Ok(future.await),
        }
    }

    fn timed_out(&self, waiting_on: Vec<String>) -> OrchestrationError {
        OrchestrationError::RunTimeout {
            timeout: self.orchestration.run_timeout.unwrap_or_default(),
            waiting_on,
        }
    }
}

/// One conversation against an [`Orchestration`].
///
/// Owns the history and run state. Runs are driven by awaiting
/// [`start`](Self::start); there is no background work.
pub struct OrchestrationSession {
    orchestration: Arc<Orchestration>,
    history: ConversationHistory,
    state: RunState,
    current_token: Arc<Mutex<CancellationToken>>,
    pending_stream: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl OrchestrationSession {
    pub fn new(orchestration: Arc<Orchestration>) -> Self {
        Self {
            orchestration,
            history: ConversationHistory::new(),
            state: RunState::default(),
            current_token: Arc::new(Mutex::new(CancellationToken::new())),
            pending_stream: None,
        }
    }

    pub fn orchestration(&self) -> &Arc<Orchestration> {
        &self.orchestration
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            current: Arc::clone(&self.current_token),
        }
    }

    /// Receive the events of the next run as a stream. The stream ends when
    /// that run ends.
    pub fn subscribe(&mut self) -> EventStream {
        let (sender, stream) = EventStream::channel();
        self.pending_stream = Some(sender);
        stream
    }

    /// Clear run state, and the history too when `clear_history` is set.
    pub fn reset(&mut self, clear_history: bool) {
        self.state = RunState::default();
        if clear_history {
            self.history.clear();
        }
        log::debug!(
            "session of '{}' reset (history cleared: {})",
            self.orchestration.id,
            clear_history
        );
    }

    /// Run with `input` as the seed user message.
    pub async fn start(&mut self, input: impl Into<String>) -> Result<RunOutcome, RunError> {
        self.run(Some(Message::user(input))).await
    }

    /// Run with an arbitrary seed message.
    pub async fn start_with(&mut self, seed: Message) -> Result<RunOutcome, RunError> {
        self.run(Some(seed)).await
    }

    /// Run on the existing history without new input.
    pub async fn resume(&mut self) -> Result<RunOutcome, RunError> {
        self.run(None).await
    }

    async fn run(&mut self, seed: Option<Message>) -> Result<RunOutcome, RunError> {
        let orchestration = Arc::clone(&self.orchestration);
        let run_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        *self.current_token.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();

        let sink = EventSink::new(
            orchestration.event_handler.clone(),
            self.pending_stream.take(),
        );
        self.state = RunState {
            run_id: Some(run_id.clone()),
            ..RunState::default()
        };

        let scope = RunScope {
            orchestration: &orchestration,
            run_id: &run_id,
            run_start: self.history.last_sequence(),
            sink: &sink,
            token: &token,
            deadline: orchestration.run_timeout.map(|t| Instant::now() + t),
        };

        log::info!(
            "run {} of '{}' started ({}, {} agents)",
            run_id,
            orchestration.id,
            orchestration.topology.name(),
            orchestration.agents.len()
        );
        sink.event(OrchestrationEvent::RunStarted {
            orchestration_id: orchestration.id.clone(),
            run_id: run_id.clone(),
            topology: orchestration.topology.name().to_string(),
            agent_count: orchestration.agents.len(),
        })
        .await;

        if let Some(seed) = seed {
            self.record(&scope, seed).await;
        }

        let outcome = match &orchestration.topology {
            Topology::Concurrent { .. } => self.drive_concurrent(&scope).await,
            _ => self.drive_serialized(&scope).await,
        };
        let transcript = self.history.since(scope.run_start).to_vec();
        let iterations = self.state.iteration;

        match outcome {
            Ok(reason) => {
                let result = match &orchestration.topology {
                    Topology::Concurrent { .. } => {
                        ResultAggregator::per_agent(&orchestration.agents, &transcript)
                    }
                    _ => orchestration.aggregator.single(&transcript).await,
                };
                self.state.completed = true;

                log::info!(
                    "run {} completed after {} iterations ({})",
                    run_id,
                    iterations,
                    reason
                );
                sink.event(OrchestrationEvent::RunCompleted {
                    run_id: run_id.clone(),
                    iterations,
                    reason,
                })
                .await;
                sink.send(RunEvent::Completed {
                    run_id: run_id.clone(),
                    reason,
                    iterations,
                });

                Ok(RunOutcome {
                    run_id,
                    result,
                    reason,
                    iterations,
                    transcript,
                })
            }
            Err(error) => {
                if matches!(error, OrchestrationError::Cancelled) {
                    log::info!("run {} cancelled after {} iterations", run_id, iterations);
                    self.state = RunState::default();
                    sink.event(OrchestrationEvent::RunCancelled {
                        run_id: run_id.clone(),
                        iterations,
                    })
                    .await;
                } else {
                    log::warn!("run {} failed: {}", run_id, error);
                }
                sink.send(RunEvent::Failed {
                    run_id,
                    error: error.clone(),
                });
                Err(RunError { error, transcript })
            }
        }
    }

    /// Sequential, GroupChat and Handoff: one invocation in flight at a time.
    async fn drive_serialized(
        &mut self,
        scope: &RunScope<'_>,
    ) -> Result<TerminationReason, OrchestrationError> {
        let agents = &scope.orchestration.agents;
        if let Topology::Handoff { graph } = &scope.orchestration.topology {
            self.state.active_agent = Some(graph.start().to_string());
        }

        let mut pending: Option<TerminationDecision> = None;
        loop {
            if scope.token.is_cancelled() {
                return Err(OrchestrationError::Cancelled);
            }

            let decision = match pending.take() {
                Some(decision) => decision,
                None => self.check_termination(scope).await,
            };
            if decision.complete {
                return Ok(decision.reason);
            }

            let agent_id = self.next_actor(scope).await?;
            let agent = agents
                .get(&agent_id)
                .cloned()
                .ok_or_else(|| OrchestrationError::AgentNotFound(agent_id.clone()))?;
            self.state.active_agent = Some(agent_id.clone());

            let produced = self.invoke_one(scope, &agent).await?;
            let last_produced = produced.last().cloned();
            for message in produced {
                self.record(scope, message).await;
            }
            self.state.iteration += 1;

            let graph = match &scope.orchestration.topology {
                Topology::Handoff { graph } => graph,
                _ => continue,
            };
            let transition = match &last_produced {
                Some(message) => graph.resolve(&agent_id, message, agents),
                None => Transition::Stay,
            };

            match transition {
                Transition::HandoffTo(target) => {
                    log::debug!("handoff {} -> {}", agent_id, target);
                    scope
                        .sink
                        .event(OrchestrationEvent::HandoffOccurred {
                            run_id: scope.run_id.to_string(),
                            from: agent_id,
                            to: target.clone(),
                        })
                        .await;
                    self.state.active_agent = Some(target);
                }
                Transition::Stay => {
                    let human = match &scope.orchestration.human_input {
                        Some(human) => Arc::clone(human),
                        None => continue,
                    };
                    // Only ask when the run is going on; the answer then gets
                    // its own termination check at the top of the loop.
                    let decision = self.check_termination(scope).await;
                    if decision.complete {
                        pending = Some(decision);
                    } else {
                        self.ask_human(scope, &agent_id, human.as_ref()).await?;
                    }
                }
            }
        }
    }

    async fn next_actor(&self, scope: &RunScope<'_>) -> Result<String, OrchestrationError> {
        let agents = &scope.orchestration.agents;
        let iteration = self.state.iteration;

        let (agent_id, reason) = match &scope.orchestration.topology {
            Topology::Sequential => {
                let agent = agents.at(iteration % agents.len()).ok_or_else(|| {
                    OrchestrationError::UnroutableState {
                        after: self.history.last_actor().unwrap_or("user").to_string(),
                        reason: "pipeline has no agent at this position".to_string(),
                    }
                })?;
                (agent.id.clone(), "pipeline order".to_string())
            }
            Topology::GroupChat { selection } => {
                let selection = selection.select(&self.history, agents).await?;
                let first = selection.agents.into_iter().next().ok_or_else(|| {
                    OrchestrationError::UnroutableState {
                        after: self.history.last_actor().unwrap_or("user").to_string(),
                        reason: "selection returned no agent".to_string(),
                    }
                })?;
                (first, selection.reason)
            }
            Topology::Handoff { graph } => {
                let active = self
                    .state
                    .active_agent
                    .clone()
                    .unwrap_or_else(|| graph.start().to_string());
                (active, "holds control".to_string())
            }
            Topology::Concurrent { .. } => {
                return Err(OrchestrationError::InvalidTopology(
                    "concurrent rounds are not driven one actor at a time".to_string(),
                ))
            }
        };

        log::debug!("iteration {}: selected '{}' ({})", iteration + 1, agent_id, reason);
        scope
            .sink
            .event(OrchestrationEvent::AgentSelected {
                run_id: scope.run_id.to_string(),
                agent_ids: vec![agent_id.clone()],
                reason,
                iteration: iteration + 1,
            })
            .await;
        Ok(agent_id)
    }

    /// Invoke one agent on the configured context view, racing cancellation.
    async fn invoke_one(
        &self,
        scope: &RunScope<'_>,
        agent: &Arc<Agent>,
    ) -> Result<Vec<Message>, OrchestrationError> {
        let context = self.history.view(scope.orchestration.context_window);

        let result = tokio::select! {
            _ = scope.token.cancelled() => return Err(OrchestrationError::Cancelled),
            result = scope.within_deadline(&agent.id, agent.invoke(context)) => result?,
        };

        match result {
            Ok(messages) => {
                scope
                    .sink
                    .event(OrchestrationEvent::AgentResponded {
                        run_id: scope.run_id.to_string(),
                        agent_id: agent.id.clone(),
                        message_count: messages.len(),
                        iteration: self.state.iteration + 1,
                    })
                    .await;
                Ok(messages)
            }
            Err(source) => Err(self.backend_failure(scope, &agent.id, source).await),
        }
    }

    async fn ask_human(
        &mut self,
        scope: &RunScope<'_>,
        agent_id: &str,
        human: &dyn HumanInput,
    ) -> Result<(), OrchestrationError> {
        let last = match self.history.last() {
            Some(last) => last.clone(),
            None => return Ok(()),
        };

        scope
            .sink
            .event(OrchestrationEvent::HumanInputRequested {
                run_id: scope.run_id.to_string(),
                agent_id: agent_id.to_string(),
            })
            .await;

        let answer = tokio::select! {
            _ = scope.token.cancelled() => return Err(OrchestrationError::Cancelled),
            answer = scope.within_deadline("user", human.request_input(&last)) => answer?,
        };
        self.record(scope, answer).await;
        Ok(())
    }

    /// Concurrent topology: fan out, join under one deadline, append in
    /// completion order.
    async fn drive_concurrent(
        &mut self,
        scope: &RunScope<'_>,
    ) -> Result<TerminationReason, OrchestrationError> {
        let agents = &scope.orchestration.agents;
        let timeout = scope.orchestration.aggregation_timeout;

        loop {
            if scope.token.is_cancelled() {
                return Err(OrchestrationError::Cancelled);
            }

            let decision = self.check_termination(scope).await;
            if decision.complete {
                return Ok(decision.reason);
            }

            let round = self.state.iteration + 1;
            let selection = SelectionPolicy::ConcurrentAll
                .select(&self.history, agents)
                .await?;
            log::debug!(
                "round {}: selected {} agents ({})",
                round,
                selection.agents.len(),
                selection.reason
            );
            scope
                .sink
                .event(OrchestrationEvent::AgentSelected {
                    run_id: scope.run_id.to_string(),
                    agent_ids: selection.agents.clone(),
                    reason: selection.reason,
                    iteration: round,
                })
                .await;

            let context: Arc<Vec<Message>> = Arc::new(
                self.history
                    .view(scope.orchestration.context_window)
                    .to_vec(),
            );

            let mut tasks = JoinSet::new();
            let mut owners: HashMap<tokio::task::Id, String> = HashMap::new();
            for agent_id in &selection.agents {
                let agent = agents
                    .get(agent_id)
                    .cloned()
                    .ok_or_else(|| OrchestrationError::AgentNotFound(agent_id.clone()))?;
                let context = Arc::clone(&context);
                let handle = tasks.spawn(async move { agent.invoke(&context).await });
                owners.insert(handle.id(), agent_id.clone());
            }

            let round_deadline = Instant::now() + timeout;
            let deadline = match scope.deadline {
                Some(run_deadline) if run_deadline < round_deadline => run_deadline,
                _ => round_deadline,
            };
            let mut finished: Vec<(String, Vec<Message>)> = Vec::with_capacity(owners.len());

            loop {
                let joined = tokio::select! {
                    _ = scope.token.cancelled() => {
                        tasks.abort_all();
                        return Err(OrchestrationError::Cancelled);
                    }
                    joined = tokio::time::timeout_at(deadline, tasks.join_next_with_id()) => joined,
                };

                match joined {
                    Err(_elapsed) if deadline < round_deadline => {
                        tasks.abort_all();
                        let waiting_on: Vec<String> = selection
                            .agents
                            .iter()
                            .filter(|id| !finished.iter().any(|(done, _)| done == *id))
                            .cloned()
                            .collect();
                        return Err(scope.timed_out(waiting_on));
                    }
                    Err(_elapsed) => {
                        tasks.abort_all();
                        let partial: Vec<AgentOutput> = finished
                            .iter()
                            .filter_map(|(_, messages)| messages.last())
                            .map(AgentOutput::from_message)
                            .collect();
                        log::warn!(
                            "concurrent round {} timed out after {:?}; {} of {} agents finished",
                            round,
                            timeout,
                            finished.len(),
                            owners.len()
                        );
                        return Err(OrchestrationError::AggregationTimeout { timeout, partial });
                    }
                    Ok(None) => break,
                    Ok(Some(Ok((task_id, result)))) => {
                        let agent_id = owners.get(&task_id).cloned().unwrap_or_default();
                        match result {
                            Ok(messages) => {
                                scope
                                    .sink
                                    .event(OrchestrationEvent::AgentResponded {
                                        run_id: scope.run_id.to_string(),
                                        agent_id: agent_id.clone(),
                                        message_count: messages.len(),
                                        iteration: round,
                                    })
                                    .await;
                                finished.push((agent_id, messages));
                            }
                            Err(source) => {
                                tasks.abort_all();
                                return Err(self.backend_failure(scope, &agent_id, source).await);
                            }
                        }
                    }
                    Ok(Some(Err(join_error))) => {
                        tasks.abort_all();
                        let agent_id = owners.get(&join_error.id()).cloned().unwrap_or_default();
                        let cause = if join_error.is_panic() {
                            "agent task panicked".to_string()
                        } else {
                            join_error.to_string()
                        };
                        let source = BackendError::new(BackendErrorKind::Other, cause);
                        return Err(self.backend_failure(scope, &agent_id, source).await);
                    }
                }
            }

            for (_, messages) in finished {
                for message in messages {
                    self.record(scope, message).await;
                }
            }
            self.state.iteration += 1;
        }
    }

    async fn check_termination(&self, scope: &RunScope<'_>) -> TerminationDecision {
        let agents = &scope.orchestration.agents;
        let iteration = self.state.iteration;
        let passes_completed = match scope.orchestration.topology {
            Topology::Concurrent { .. } => iteration,
            _ => iteration / agents.len().max(1),
        };

        let ctx = TerminationContext {
            history: &self.history,
            run_messages: self.history.since(scope.run_start),
            iteration,
            passes_completed,
            agents,
        };
        let decision = scope.orchestration.termination.evaluate(&ctx).await;

        scope
            .sink
            .event(OrchestrationEvent::TerminationChecked {
                run_id: scope.run_id.to_string(),
                iteration,
                complete: decision.complete,
                reason: decision.reason,
            })
            .await;
        decision
    }

    async fn backend_failure(
        &self,
        scope: &RunScope<'_>,
        agent_id: &str,
        source: BackendError,
    ) -> OrchestrationError {
        log::warn!("agent '{}' failed: {}", agent_id, source);
        scope
            .sink
            .event(OrchestrationEvent::AgentFailed {
                run_id: scope.run_id.to_string(),
                agent_id: agent_id.to_string(),
                error: source.to_string(),
            })
            .await;
        OrchestrationError::BackendInvocation {
            agent_id: agent_id.to_string(),
            source,
        }
    }

    /// Append to the history, tag with run metadata, and emit.
    async fn record(&mut self, scope: &RunScope<'_>, mut message: Message) {
        message
            .metadata
            .insert("run_id".to_string(), scope.run_id.to_string());
        message
            .metadata
            .insert("iteration".to_string(), (self.state.iteration + 1).to_string());
        let stored = self.history.append(message).clone();
        scope.sink.message(&stored).await;
    }
}
