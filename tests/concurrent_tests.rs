use async_trait::async_trait;
use ensemble::agent::{Agent, AgentBackend, AgentReply, InvocationRequest};
use ensemble::aggregation::OrchestrationResult;
use ensemble::error::{BackendError, OrchestrationError};
use ensemble::event::{EventHandler, OrchestrationEvent};
use ensemble::orchestration::{OrchestrationBuilder, OrchestrationSession, Topology};
use ensemble::termination::TerminationReason;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Answers after a fixed delay, reporting how much context it was given.
struct DelayedExpert {
    field: &'static str,
    delay: Duration,
}

#[async_trait]
impl AgentBackend for DelayedExpert {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Vec<AgentReply>, BackendError> {
        tokio::time::sleep(self.delay).await;
        Ok(vec![AgentReply::text(format!(
            "{} answer ({} context)",
            self.field,
            request.context.len()
        ))])
    }
}

struct BrokenExpert;

#[async_trait]
impl AgentBackend for BrokenExpert {
    async fn invoke(&self, _request: InvocationRequest<'_>) -> Result<Vec<AgentReply>, BackendError> {
        Err(BackendError::malformed("unparseable completion"))
    }
}

struct PanickingExpert;

#[async_trait]
impl AgentBackend for PanickingExpert {
    async fn invoke(&self, _request: InvocationRequest<'_>) -> Result<Vec<AgentReply>, BackendError> {
        panic!("backend bug");
    }
}

#[derive(Default)]
struct SelectionRecorder {
    selections: Mutex<Vec<(Vec<String>, String)>>,
}

#[async_trait]
impl EventHandler for SelectionRecorder {
    async fn on_orchestration_event(&self, event: &OrchestrationEvent) {
        if let OrchestrationEvent::AgentSelected {
            agent_ids, reason, ..
        } = event
        {
            self.selections
                .lock()
                .unwrap()
                .push((agent_ids.clone(), reason.clone()));
        }
    }
}

fn expert(id: &str, field: &'static str, delay_ms: u64) -> Agent {
    Agent::new(
        id,
        field,
        Arc::new(DelayedExpert {
            field,
            delay: Duration::from_millis(delay_ms),
        }),
    )
}

#[tokio::test]
async fn test_one_result_per_agent_in_declaration_order() {
    let orchestration = OrchestrationBuilder::new("experts", "Experts")
        .add_agent(expert("physics", "physics", 60))
        .add_agent(expert("chemistry", "chemistry", 5))
        .with_topology(Topology::Concurrent {
            timeout: Some(Duration::from_secs(5)),
        })
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let outcome = session.start("What is energy?").await.unwrap();

    assert_eq!(outcome.reason, TerminationReason::RoundsCompleted);
    assert_eq!(outcome.iterations, 1);

    let outputs = match &outcome.result {
        OrchestrationResult::Set(outputs) => outputs,
        other => panic!("expected a result set, got {:?}", other),
    };
    let ids: Vec<&str> = outputs.iter().map(|o| o.agent_id.as_str()).collect();
    assert_eq!(ids, vec!["physics", "chemistry"]);
    // Both saw the same context: just the question.
    assert_eq!(outputs[0].content, "physics answer (1 context)");
    assert_eq!(outputs[1].content, "chemistry answer (1 context)");

    // The transcript records completion order.
    let order: Vec<&str> = outcome
        .transcript
        .iter()
        .filter_map(|m| m.agent_id.as_deref())
        .collect();
    assert_eq!(order, vec!["chemistry", "physics"]);
}

#[tokio::test]
async fn test_round_is_bounded_by_single_deadline() {
    let orchestration = OrchestrationBuilder::new("experts", "Experts")
        .add_agent(expert("quick", "quick", 1))
        .add_agent(expert("stuck", "stuck", 5_000))
        .with_topology(Topology::Concurrent {
            timeout: Some(Duration::from_millis(100)),
        })
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let started = Instant::now();
    let err = session.start("question").await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));

    match &err.error {
        OrchestrationError::AggregationTimeout { timeout, partial } => {
            assert_eq!(*timeout, Duration::from_millis(100));
            assert_eq!(partial.len(), 1);
            assert_eq!(partial[0].agent_id, "quick");
        }
        other => panic!("expected AggregationTimeout, got {}", other),
    }
    // Nothing from the timed-out round reaches the history.
    assert_eq!(session.history().len(), 1);
    assert_eq!(err.transcript.len(), 1);
}

#[tokio::test]
async fn test_timeout_partial_holds_exactly_the_finished_agents() {
    let orchestration = OrchestrationBuilder::new("experts", "Experts")
        .add_agent(expert("stuck", "stuck", 5_000))
        .add_agent(expert("quick1", "quick1", 1))
        .add_agent(expert("quick2", "quick2", 10))
        .with_topology(Topology::Concurrent {
            timeout: Some(Duration::from_millis(300)),
        })
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let err = session.start("question").await.unwrap_err();

    let partial = match &err.error {
        OrchestrationError::AggregationTimeout { partial, .. } => partial,
        other => panic!("expected AggregationTimeout, got {}", other),
    };
    let finished: BTreeSet<&str> = partial.iter().map(|o| o.agent_id.as_str()).collect();
    assert_eq!(finished, BTreeSet::from(["quick1", "quick2"]));
    assert_eq!(partial.len(), 2);
    assert!(partial
        .iter()
        .all(|o| o.content == format!("{} answer (1 context)", o.agent_id)));
    assert!(err.to_string().contains("2 finished"));
}

#[tokio::test]
async fn test_run_timeout_names_agents_still_running() {
    let orchestration = OrchestrationBuilder::new("experts", "Experts")
        .add_agent(expert("quick", "quick", 1))
        .add_agent(expert("stuck", "stuck", 5_000))
        .with_topology(Topology::Concurrent {
            timeout: Some(Duration::from_secs(30)),
        })
        .with_run_timeout(Duration::from_millis(100))
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let started = Instant::now();
    let err = session.start("question").await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));

    match &err.error {
        OrchestrationError::RunTimeout { waiting_on, .. } => {
            assert_eq!(waiting_on, &vec!["stuck".to_string()]);
        }
        other => panic!("expected RunTimeout, got {}", other),
    }
    assert_eq!(err.transcript.len(), 1);
}

#[tokio::test]
async fn test_every_agent_is_selected_for_each_round() {
    let recorder = Arc::new(SelectionRecorder::default());
    let orchestration = OrchestrationBuilder::new("experts", "Experts")
        .add_agent(expert("physics", "physics", 1))
        .add_agent(expert("chemistry", "chemistry", 1))
        .add_agent(expert("biology", "biology", 1))
        .with_topology(Topology::Concurrent { timeout: None })
        .with_event_handler(recorder.clone())
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    session.start("What is life?").await.unwrap();

    let selections = recorder.selections.lock().unwrap();
    assert_eq!(
        *selections,
        vec![(
            vec![
                "physics".to_string(),
                "chemistry".to_string(),
                "biology".to_string()
            ],
            "concurrent fan-out".to_string()
        )]
    );
}

#[tokio::test]
async fn test_failing_agent_aborts_round() {
    let orchestration = OrchestrationBuilder::new("experts", "Experts")
        .add_agent(expert("slow", "slow", 2_000))
        .add_agent(Agent::new("broken", "Broken", Arc::new(BrokenExpert)))
        .with_topology(Topology::Concurrent { timeout: None })
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let started = Instant::now();
    let err = session.start("question").await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));

    match err.error {
        OrchestrationError::BackendInvocation { agent_id, source } => {
            assert_eq!(agent_id, "broken");
            assert_eq!(source.message, "unparseable completion");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_panicking_agent_is_reported_as_backend_failure() {
    let orchestration = OrchestrationBuilder::new("experts", "Experts")
        .add_agent(expert("fine", "fine", 1))
        .add_agent(Agent::new("buggy", "Buggy", Arc::new(PanickingExpert)))
        .with_topology(Topology::Concurrent { timeout: None })
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    let err = session.start("question").await.unwrap_err();
    assert_eq!(err.error.agent_id(), Some("buggy"));
    match &err.error {
        OrchestrationError::BackendInvocation { source, .. } => {
            assert_eq!(source.message, "agent task panicked");
        }
        other => panic!("expected BackendInvocation, got {}", other),
    }
}

#[tokio::test]
async fn test_concurrent_rounds_can_be_repeated_in_one_session() {
    let orchestration = OrchestrationBuilder::new("experts", "Experts")
        .add_agent(expert("a", "a", 1))
        .add_agent(expert("b", "b", 1))
        .with_topology(Topology::Concurrent { timeout: None })
        .build()
        .unwrap();

    let mut session = OrchestrationSession::new(orchestration);
    session.start("first").await.unwrap();
    let second = session.start("second").await.unwrap();

    // Full history by default: the second round sees both earlier answers too.
    assert_eq!(
        second.result.outputs()[0].content,
        "a answer (4 context)"
    );
    assert_eq!(session.history().len(), 6);
}
