use async_trait::async_trait;
use ensemble::agent::{Agent, AgentBackend, AgentReply, InvocationRequest};
use ensemble::aggregation::{OrchestrationResult, Summarizer};
use ensemble::config::OrchestrationConfig;
use ensemble::delegate::DelegateEvaluator;
use ensemble::error::{BackendError, OrchestrationError};
use ensemble::event::{EventHandler, OrchestrationEvent, RunEvent};
use ensemble::message::Message;
use ensemble::orchestration::{OrchestrationBuilder, OrchestrationSession, Topology};
use ensemble::selection::SelectionPolicy;
use ensemble::termination::{
    TerminationCondition, TerminationDelegate, TerminationPolicy, TerminationReason,
};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Replies from a script, repeating the last line once exhausted.
struct MockBackend {
    replies: Vec<String>,
    calls: AtomicUsize,
}

impl MockBackend {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: replies.iter().map(|r| r.to_string()).collect(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentBackend for MockBackend {
    async fn invoke(&self, _request: InvocationRequest<'_>) -> Result<Vec<AgentReply>, BackendError> {
        let i = self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .replies
            .get(i)
            .or_else(|| self.replies.last())
            .cloned()
            .unwrap_or_default();
        Ok(vec![AgentReply::text(reply)])
    }
}

/// Echoes `name(<last context message>)` and records every context it saw.
struct RecordingBackend {
    name: &'static str,
    seen: Mutex<Vec<Vec<String>>>,
}

impl RecordingBackend {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<Vec<String>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentBackend for RecordingBackend {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Vec<AgentReply>, BackendError> {
        let context: Vec<String> = request.context.iter().map(|m| m.content.to_string()).collect();
        let last = context.last().cloned().unwrap_or_default();
        self.seen.lock().unwrap().push(context);
        Ok(vec![AgentReply::text(format!("{}({})", self.name, last))])
    }
}

struct FailingBackend;

#[async_trait]
impl AgentBackend for FailingBackend {
    async fn invoke(&self, _request: InvocationRequest<'_>) -> Result<Vec<AgentReply>, BackendError> {
        Err(BackendError::transport("connection reset"))
    }
}

struct SlowBackend(Duration);

#[async_trait]
impl AgentBackend for SlowBackend {
    async fn invoke(&self, _request: InvocationRequest<'_>) -> Result<Vec<AgentReply>, BackendError> {
        tokio::time::sleep(self.0).await;
        Ok(vec![AgentReply::text("finally")])
    }
}

/// Answers "yes" when the rendered window contains `approve_on`.
struct MockJudge {
    approve_on: &'static str,
    calls: AtomicUsize,
}

#[async_trait]
impl DelegateEvaluator for MockJudge {
    async fn evaluate(&self, prompt: &str) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = prompt.rsplit("RESPONSE:").next().unwrap_or("");
        Ok(if response.contains(self.approve_on) { "Yes" } else { "no" }.to_string())
    }
}

#[derive(Default)]
struct CollectingHandler {
    sequences: Mutex<Vec<u64>>,
    events: Mutex<Vec<OrchestrationEvent>>,
}

#[async_trait]
impl EventHandler for CollectingHandler {
    async fn on_message(&self, message: &Message) {
        self.sequences.lock().unwrap().push(message.sequence);
    }

    async fn on_orchestration_event(&self, event: &OrchestrationEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn round_robin() -> Topology {
    Topology::GroupChat {
        selection: SelectionPolicy::round_robin(),
    }
}

#[tokio::test]
async fn test_round_robin_alternates_and_never_repeats_speaker() {
    let orchestration = OrchestrationBuilder::new("rr", "Round robin")
        .add_agent(Agent::new("a", "A", MockBackend::new(&["from a"])))
        .add_agent(Agent::new("b", "B", MockBackend::new(&["from b"])))
        .add_agent(Agent::new("c", "C", MockBackend::new(&["from c"])))
        .with_topology(round_robin())
        .with_termination(TerminationPolicy::max_iterations(7))
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let outcome = session.start("go").await.unwrap();

    let speakers: Vec<&str> = outcome
        .transcript
        .iter()
        .filter_map(|m| m.agent_id.as_deref())
        .collect();
    assert_eq!(speakers, vec!["a", "b", "c", "a", "b", "c", "a"]);
    for pair in speakers.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }
}

#[tokio::test]
async fn test_budget_bounds_a_chat_that_never_agrees() {
    let writer = MockBackend::new(&["draft"]);
    let reviewer = MockBackend::new(&["needs work"]);
    let orchestration = OrchestrationBuilder::new("bounded", "Bounded")
        .add_agent(Agent::new("writer", "Writer", writer.clone()))
        .add_agent(Agent::new("reviewer", "Reviewer", reviewer.clone()))
        .with_topology(round_robin())
        .with_termination(
            TerminationPolicy::max_iterations(10)
                .with_condition(TerminationCondition::contains_token("yes", ["reviewer"])),
        )
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let outcome = session.start("Write a slogan").await.unwrap();

    assert_eq!(outcome.reason, TerminationReason::BudgetExhausted);
    assert_eq!(outcome.iterations, 10);
    assert_eq!(writer.calls() + reviewer.calls(), 10);
    // seed + ten turns
    assert_eq!(outcome.transcript.len(), 11);
}

#[tokio::test]
async fn test_slogan_review_loop_ends_on_reviewer_token() {
    let reviewer = MockBackend::new(&[
        "Too long, cut it down.",
        "Better, but name the product.",
        "Yes, this works.",
    ]);
    let judge = Arc::new(MockJudge {
        approve_on: "Yes, this works",
        calls: AtomicUsize::new(0),
    });

    let orchestration = OrchestrationBuilder::new("slogan", "Slogan review")
        .add_agent(Agent::new("reviewer", "Reviewer", reviewer.clone()))
        .add_agent(Agent::new(
            "writer",
            "Writer",
            MockBackend::new(&["Drive electric.", "Drive the Volt EV."]),
        ))
        .with_topology(round_robin())
        .with_termination(
            TerminationPolicy::max_iterations(10).with_condition(TerminationCondition::Delegate(
                TerminationDelegate::new(judge.clone(), "yes").with_agents(["reviewer"]),
            )),
        )
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let outcome = session.start("Make a slogan for an electric car").await.unwrap();

    assert_eq!(outcome.reason, TerminationReason::DelegateApproved);
    // reviewer, writer, reviewer, writer, reviewer
    assert_eq!(outcome.iterations, 5);
    assert_eq!(reviewer.calls(), 3);
    // Consulted only after the reviewer spoke.
    assert_eq!(judge.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        outcome.result,
        OrchestrationResult::Single(Some("Yes, this works.".to_string()))
    );
}

#[tokio::test]
async fn test_rule_based_selection_follows_table() {
    let orchestration = OrchestrationBuilder::new("rules", "Rules")
        .add_agent(Agent::new("reviewer", "Reviewer", MockBackend::new(&["review"])))
        .add_agent(Agent::new("writer", "Writer", MockBackend::new(&["write"])))
        .with_topology(Topology::GroupChat {
            selection: SelectionPolicy::rule_based([
                ("user", "writer"),
                ("writer", "reviewer"),
                ("reviewer", "writer"),
            ]),
        })
        .with_termination(TerminationPolicy::max_iterations(3))
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let outcome = session.start("go").await.unwrap();
    let speakers: Vec<&str> = outcome.transcript.iter().map(|m| m.author()).collect();
    assert_eq!(speakers, vec!["user", "writer", "reviewer", "writer"]);
}

#[tokio::test]
async fn test_invalid_configurations_are_rejected_at_build() {
    let single = OrchestrationBuilder::new("one", "One")
        .add_agent(Agent::new("a", "A", MockBackend::new(&["x"])))
        .with_topology(round_robin())
        .build();
    assert!(matches!(single, Err(OrchestrationError::InvalidTopology(_))));

    let gap = OrchestrationBuilder::new("gap", "Gap")
        .add_agent(Agent::new("a", "A", MockBackend::new(&["x"])))
        .add_agent(Agent::new("b", "B", MockBackend::new(&["x"])))
        .with_topology(Topology::GroupChat {
            selection: SelectionPolicy::rule_based([("user", "a"), ("a", "b")]),
        })
        .build();
    match gap {
        Err(OrchestrationError::UnroutableState { after, .. }) => assert_eq!(after, "b"),
        _ => panic!("expected UnroutableState"),
    }

    let concurrent_all = OrchestrationBuilder::new("ca", "CA")
        .add_agent(Agent::new("a", "A", MockBackend::new(&["x"])))
        .add_agent(Agent::new("b", "B", MockBackend::new(&["x"])))
        .with_topology(Topology::GroupChat {
            selection: SelectionPolicy::ConcurrentAll,
        })
        .build();
    assert!(matches!(concurrent_all, Err(OrchestrationError::InvalidTopology(_))));

    let duplicate = OrchestrationBuilder::new("dup", "Dup")
        .add_agent(Agent::new("a", "A", MockBackend::new(&["x"])))
        .add_agent(Agent::new("a", "A again", MockBackend::new(&["x"])))
        .build();
    assert!(matches!(duplicate, Err(OrchestrationError::InvalidTopology(_))));

    let unknown_token_agent = OrchestrationBuilder::new("tok", "Tok")
        .add_agent(Agent::new("a", "A", MockBackend::new(&["x"])))
        .add_agent(Agent::new("b", "B", MockBackend::new(&["x"])))
        .with_topology(round_robin())
        .with_termination(
            TerminationPolicy::max_iterations(3)
                .with_condition(TerminationCondition::contains_token("yes", ["ghost"])),
        )
        .build();
    assert!(matches!(unknown_token_agent, Err(OrchestrationError::AgentNotFound(id)) if id == "ghost"));

    assert!(matches!(
        OrchestrationBuilder::new("empty", "Empty").build(),
        Err(OrchestrationError::NoAgents)
    ));
}

#[tokio::test]
async fn test_sequential_pipeline_passes_previous_output_only() {
    let analyst = RecordingBackend::new("analyst");
    let writer = RecordingBackend::new("writer");
    let editor = RecordingBackend::new("editor");

    let orchestration = OrchestrationBuilder::new("pipeline", "Pipeline")
        .add_agent(Agent::new("analyst", "Analyst", analyst.clone()))
        .add_agent(Agent::new("writer", "CopyWriter", writer.clone()))
        .add_agent(Agent::new("editor", "Editor", editor.clone()))
        .with_topology(Topology::Sequential)
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let outcome = session.start("a smart kettle").await.unwrap();

    assert_eq!(outcome.reason, TerminationReason::RoundsCompleted);
    assert_eq!(outcome.iterations, 3);
    assert_eq!(writer.seen(), vec![vec!["analyst(a smart kettle)".to_string()]]);
    assert_eq!(editor.seen(), vec![vec!["writer(analyst(a smart kettle))".to_string()]]);
    assert_eq!(
        outcome.result.as_text(),
        Some("editor(writer(analyst(a smart kettle)))")
    );
}

#[tokio::test]
async fn test_budget_cuts_sequential_pass_short() {
    let c = MockBackend::new(&["3"]);
    let orchestration = OrchestrationBuilder::new("pipeline", "Pipeline")
        .add_agent(Agent::new("a", "A", MockBackend::new(&["1"])))
        .add_agent(Agent::new("b", "B", MockBackend::new(&["2"])))
        .add_agent(Agent::new("c", "C", c.clone()))
        .with_topology(Topology::Sequential)
        .with_termination(TerminationPolicy::max_iterations(2))
        .build()
        .unwrap();
    assert_eq!(orchestration.termination().max_iterations, 2);

    let mut session = OrchestrationSession::new(orchestration);
    let outcome = session.start("go").await.unwrap();
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.reason, TerminationReason::BudgetExhausted);
    assert_eq!(c.calls(), 0);
    assert_eq!(outcome.result.as_text(), Some("2"));
}

#[tokio::test]
async fn test_config_budget_applies_to_sequential() {
    let orchestration = OrchestrationBuilder::new("pipeline", "Pipeline")
        .add_agent(Agent::new("a", "A", MockBackend::new(&["1"])))
        .add_agent(Agent::new("b", "B", MockBackend::new(&["2"])))
        .add_agent(Agent::new("c", "C", MockBackend::new(&["3"])))
        .with_topology(Topology::Sequential)
        .with_config(OrchestrationConfig {
            max_iterations: 1,
            ..OrchestrationConfig::default()
        })
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let outcome = session.start("go").await.unwrap();
    assert_eq!(outcome.iterations, 1);
    assert_eq!(outcome.reason, TerminationReason::BudgetExhausted);
}

#[tokio::test]
async fn test_run_timeout_stops_a_stuck_pipeline() {
    let orchestration = OrchestrationBuilder::new("pipeline", "Pipeline")
        .add_agent(Agent::new("quick", "Quick", MockBackend::new(&["outline"])))
        .add_agent(Agent::new(
            "sleepy",
            "Sleepy",
            Arc::new(SlowBackend(Duration::from_secs(3600))),
        ))
        .with_topology(Topology::Sequential)
        .with_run_timeout(Duration::from_millis(100))
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let started = std::time::Instant::now();
    let err = session.start("go").await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));

    match &err.error {
        OrchestrationError::RunTimeout {
            timeout,
            waiting_on,
        } => {
            assert_eq!(*timeout, Duration::from_millis(100));
            assert_eq!(waiting_on, &vec!["sleepy".to_string()]);
        }
        other => panic!("expected RunTimeout, got {}", other),
    }
    assert_eq!(err.error.agent_id(), Some("sleepy"));
    // The seed and the quick agent's answer survive.
    assert_eq!(err.transcript.len(), 2);
    assert_eq!(&*err.transcript[1].content, "outline");
    assert_eq!(session.history().len(), 2);
}

#[tokio::test]
async fn test_run_timeout_from_config_bounds_group_chat() {
    let orchestration = OrchestrationBuilder::new("chat", "Chat")
        .add_agent(Agent::new("a", "A", MockBackend::new(&["x"])))
        .add_agent(Agent::new(
            "b",
            "B",
            Arc::new(SlowBackend(Duration::from_secs(3600))),
        ))
        .with_topology(round_robin())
        .with_config(OrchestrationConfig {
            run_timeout_secs: Some(1),
            ..OrchestrationConfig::default()
        })
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let started = std::time::Instant::now();
    let err = session.start("go").await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(matches!(err.error, OrchestrationError::RunTimeout { .. }));
    assert_eq!(err.error.agent_id(), Some("b"));
}

/// Returns a padded summary and keeps the prompt it was given.
#[derive(Default)]
struct MockSummarizer {
    prompt: Mutex<Option<String>>,
}

#[async_trait]
impl DelegateEvaluator for MockSummarizer {
    async fn evaluate(&self, prompt: &str) -> Result<String, BackendError> {
        *self.prompt.lock().unwrap() = Some(prompt.to_string());
        Ok("  The team agreed on a tagline.  \n".to_string())
    }
}

#[tokio::test]
async fn test_summarizer_produces_single_result() {
    let summarizer = Arc::new(MockSummarizer::default());
    let orchestration = OrchestrationBuilder::new("pipeline", "Pipeline")
        .add_agent(Agent::new("analyst", "Analyst", RecordingBackend::new("analyst")))
        .add_agent(Agent::new("writer", "CopyWriter", RecordingBackend::new("writer")))
        .with_topology(Topology::Sequential)
        .with_summarizer(Summarizer::new(summarizer.clone()))
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let outcome = session.start("a smart kettle").await.unwrap();

    assert_eq!(outcome.reason, TerminationReason::RoundsCompleted);
    assert_eq!(outcome.result.as_text(), Some("The team agreed on a tagline."));
    let prompt = summarizer.prompt.lock().unwrap().clone().unwrap();
    assert!(prompt.contains("analyst(a smart kettle)"));
    assert!(prompt.contains("writer(analyst(a smart kettle))"));
}

#[tokio::test]
async fn test_resume_continues_without_new_input() {
    let orchestration = OrchestrationBuilder::new("rr", "Round robin")
        .add_agent(Agent::new("a", "A", MockBackend::new(&["a1", "a2"])))
        .add_agent(Agent::new("b", "B", MockBackend::new(&["b1", "b2"])))
        .with_topology(round_robin())
        .with_termination(TerminationPolicy::max_iterations(2))
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let first = session.start("go").await.unwrap();
    assert_eq!(first.transcript.len(), 3);

    let resumed = session.resume().await.unwrap();
    assert_ne!(resumed.run_id, first.run_id);
    assert_eq!(resumed.iterations, 2);
    assert_eq!(resumed.reason, TerminationReason::BudgetExhausted);

    // No seed: the resumed transcript holds only agent turns, picking up
    // after the last speaker of the first run.
    let turns: Vec<(&str, &str)> = resumed
        .transcript
        .iter()
        .map(|m| (m.author(), &*m.content))
        .collect();
    assert_eq!(turns, vec![("a", "a2"), ("b", "b2")]);
    assert_eq!(session.history().len(), 5);
    assert_eq!(session.history().messages()[0].author(), "user");
}

#[tokio::test]
async fn test_backend_failure_aborts_with_partial_transcript() {
    let orchestration = OrchestrationBuilder::new("fail", "Fail")
        .add_agent(Agent::new("a", "A", MockBackend::new(&["first answer"])))
        .add_agent(Agent::new("b", "B", Arc::new(FailingBackend)))
        .with_topology(round_robin())
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let err = session.start("go").await.unwrap_err();

    match &err.error {
        OrchestrationError::BackendInvocation { agent_id, source } => {
            assert_eq!(agent_id, "b");
            assert_eq!(source.message, "connection reset");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(err.to_string().contains("'b'"));
    assert_eq!(err.transcript.len(), 2);
    assert_eq!(&*err.transcript[1].content, "first answer");
    // History keeps what was appended before the failure.
    assert_eq!(session.history().len(), 2);
}

#[tokio::test]
async fn test_history_is_append_only_across_runs_and_resets() {
    let orchestration = OrchestrationBuilder::new("hist", "History")
        .add_agent(Agent::new("a", "A", MockBackend::new(&["x"])))
        .add_agent(Agent::new("b", "B", MockBackend::new(&["y"])))
        .with_topology(round_robin())
        .with_termination(TerminationPolicy::max_iterations(2))
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let first = session.start("one").await.unwrap();
    let snapshot: Vec<(u64, String)> = session
        .history()
        .messages()
        .iter()
        .map(|m| (m.sequence, m.content.to_string()))
        .collect();

    session.reset(false);
    let second = session.start("two").await.unwrap();
    assert_ne!(first.run_id, second.run_id);

    let after: Vec<(u64, String)> = session
        .history()
        .messages()
        .iter()
        .map(|m| (m.sequence, m.content.to_string()))
        .collect();
    assert_eq!(&after[..snapshot.len()], &snapshot[..]);
    assert_eq!(after.len(), 6);
    for pair in after.windows(2) {
        assert!(pair[0].0 < pair[1].0);
    }
    assert!(second
        .transcript
        .iter()
        .all(|m| m.metadata.get("run_id") == Some(&second.run_id)));

    session.reset(true);
    assert!(session.history().is_empty());
    assert_eq!(session.state().iteration, 0);
    let third = session.start("three").await.unwrap();
    assert!(third.transcript[0].sequence > after.last().unwrap().0);
}

#[tokio::test]
async fn test_cancel_aborts_in_flight_run() {
    let orchestration = OrchestrationBuilder::new("cancel", "Cancel")
        .add_agent(Agent::new("slow", "Slow", Arc::new(SlowBackend(Duration::from_secs(10)))))
        .add_agent(Agent::new("fast", "Fast", MockBackend::new(&["x"])))
        .with_topology(round_robin())
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let handle = session.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });

    let started = std::time::Instant::now();
    let err = session.start("go").await.unwrap_err();
    assert!(matches!(err.error, OrchestrationError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    // Only the seed made it in; the in-flight reply was discarded.
    assert_eq!(err.transcript.len(), 1);
    assert!(session.state().run_id.is_none());
}

#[tokio::test]
async fn test_cancel_between_runs_does_not_affect_next_run() {
    let orchestration = OrchestrationBuilder::new("cancel", "Cancel")
        .add_agent(Agent::new("a", "A", MockBackend::new(&["x"])))
        .add_agent(Agent::new("b", "B", MockBackend::new(&["y"])))
        .with_topology(Topology::Sequential)
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    session.cancel_handle().cancel();
    let outcome = session.start("go").await.unwrap();
    assert_eq!(outcome.reason, TerminationReason::RoundsCompleted);
}

#[tokio::test]
async fn test_event_handler_sees_every_message_once_in_order() {
    let handler = Arc::new(CollectingHandler::default());
    let orchestration = OrchestrationBuilder::new("events", "Events")
        .add_agent(Agent::new("a", "A", MockBackend::new(&["x"])))
        .add_agent(Agent::new("b", "B", MockBackend::new(&["y"])))
        .with_topology(round_robin())
        .with_termination(TerminationPolicy::max_iterations(4))
        .with_event_handler(handler.clone())
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    session.start("go").await.unwrap();

    let expected: Vec<u64> = session.history().messages().iter().map(|m| m.sequence).collect();
    assert_eq!(*handler.sequences.lock().unwrap(), expected);

    let events = handler.events.lock().unwrap();
    assert!(matches!(events.first(), Some(OrchestrationEvent::RunStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(OrchestrationEvent::RunCompleted { iterations: 4, .. })
    ));
    let selections = events
        .iter()
        .filter(|e| matches!(e, OrchestrationEvent::AgentSelected { .. }))
        .count();
    assert_eq!(selections, 4);
}

#[tokio::test]
async fn test_event_stream_ends_with_run() {
    let orchestration = OrchestrationBuilder::new("stream", "Stream")
        .add_agent(Agent::new("a", "A", MockBackend::new(&["x"])))
        .add_agent(Agent::new("b", "B", MockBackend::new(&["y"])))
        .with_topology(Topology::Sequential)
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let stream = session.subscribe();
    let collector = tokio::spawn(async move { stream.collect::<Vec<RunEvent>>().await });

    let outcome = session.start("go").await.unwrap();
    let events = collector.await.unwrap();

    let messages = events
        .iter()
        .filter(|e| matches!(e, RunEvent::Message(_)))
        .count();
    assert_eq!(messages, outcome.transcript.len());
    assert!(matches!(
        events.last(),
        Some(RunEvent::Completed { reason: TerminationReason::RoundsCompleted, .. })
    ));
}
