//! Review/Revise Group Chat
//!
//! A Reviewer and a Writer take turns improving a slogan. A selection
//! delegate names the next speaker and a termination delegate ends the chat
//! once the Reviewer is satisfied (completion token `yes`), with a ceiling of
//! ten turns. The Reviewer copies the approved text to a clipboard tool.
//!
//! The LLM calls are replaced by scripted stand-ins so the demo runs offline.
//!
//! Run with: RUST_LOG=info cargo run --example group_chat_review
//! Type a slogan (or press enter for a default), `reset` to start over, `exit` to quit.

use async_trait::async_trait;
use ensemble::agent::{Agent, AgentBackend, AgentReply, InvocationRequest};
use ensemble::config::OrchestrationConfig;
use ensemble::delegate::DelegateEvaluator;
use ensemble::error::BackendError;
use ensemble::event::{EventHandler, OrchestrationEvent};
use ensemble::message::Message;
use ensemble::orchestration::{OrchestrationBuilder, OrchestrationSession, Topology};
use ensemble::selection::{DelegateSelection, SelectionPolicy};
use ensemble::termination::{TerminationCondition, TerminationDelegate, TerminationPolicy};
use ensemble::tool_protocol::{ToolMetadata, ToolRegistry, ToolResult};
use ensemble::tool_protocols::CustomToolProtocol;
use serde_json::json;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Cycles through canned replies, one per turn.
struct Scripted {
    replies: Vec<&'static str>,
    cursor: AtomicUsize,
}

impl Scripted {
    fn new(replies: Vec<&'static str>) -> Self {
        Self {
            replies,
            cursor: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> &'static str {
        let i = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.replies[i % self.replies.len()]
    }
}

struct WriterBackend(Scripted);

#[async_trait]
impl AgentBackend for WriterBackend {
    async fn invoke(&self, _request: InvocationRequest<'_>) -> Result<Vec<AgentReply>, BackendError> {
        Ok(vec![AgentReply::text(self.0.next())])
    }

    fn backend_name(&self) -> &str {
        "scripted-writer"
    }
}

/// Critiques until the last scripted verdict, then approves and copies the
/// approved text to the clipboard tool.
struct ReviewerBackend(Scripted);

#[async_trait]
impl AgentBackend for ReviewerBackend {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Vec<AgentReply>, BackendError> {
        let verdict = self.0.next();
        let mut replies = Vec::new();

        if verdict.starts_with("Approved") {
            let approved = request
                .context
                .last()
                .map(|m| m.content.to_string())
                .unwrap_or_default();
            if let Some(tools) = request.tools {
                match tools.call("set_clipboard", json!({ "content": approved })).await {
                    Ok(_) => replies.push(AgentReply::tool("Copied the approved slogan to the clipboard.")),
                    Err(e) => log::warn!("clipboard tool failed: {}", e),
                }
            }
        }

        replies.push(AgentReply::text(verdict));
        Ok(replies)
    }

    fn backend_name(&self) -> &str {
        "scripted-reviewer"
    }
}

/// Stand-in for the selection prompt: after the Reviewer comes the Writer,
/// after anyone else the Reviewer.
struct TurnTaker;

#[async_trait]
impl DelegateEvaluator for TurnTaker {
    async fn evaluate(&self, prompt: &str) -> Result<String, BackendError> {
        let response = prompt.rsplit("RESPONSE:").next().unwrap_or("");
        if response.contains("[Reviewer]") {
            Ok("Writer".to_string())
        } else {
            Ok("Reviewer".to_string())
        }
    }
}

/// Stand-in for the satisfaction prompt.
struct SatisfactionJudge;

#[async_trait]
impl DelegateEvaluator for SatisfactionJudge {
    async fn evaluate(&self, prompt: &str) -> Result<String, BackendError> {
        let response = prompt.rsplit("RESPONSE:").next().unwrap_or("");
        if response.contains("Approved") {
            Ok("yes".to_string())
        } else {
            Ok("no".to_string())
        }
    }
}

struct ConsolePrinter;

#[async_trait]
impl EventHandler for ConsolePrinter {
    async fn on_message(&self, message: &Message) {
        if message.agent_id.is_some() {
            println!("\n{} ({})>\n{}", message.author(), message.role, message.content.trim());
        }
    }

    async fn on_orchestration_event(&self, event: &OrchestrationEvent) {
        if let OrchestrationEvent::RunCompleted { iterations, reason, .. } = event {
            println!("\n-- finished after {} turns ({})", iterations, reason);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    ensemble::init_logger();

    let clipboard = Arc::new(Mutex::new(String::new()));
    let protocol = Arc::new(CustomToolProtocol::new());
    let sink = Arc::clone(&clipboard);
    protocol
        .register_tool(
            ToolMetadata::new("set_clipboard", "Copies the provided content to the clipboard."),
            Arc::new(move |params| {
                let content = params["content"].as_str().unwrap_or("").trim().to_string();
                if content.is_empty() {
                    return Ok(ToolResult::no_op());
                }
                if let Ok(mut clipboard) = sink.lock() {
                    *clipboard = content;
                }
                Ok(ToolResult::no_op())
            }),
        )
        .await;
    let tools = ToolRegistry::from_protocol(protocol).await?;

    let reviewer = Agent::new(
        "reviewer",
        "Reviewer",
        Arc::new(ReviewerBackend(Scripted::new(vec![
            "Too generic. Mention what makes the car different, and keep it under eight words.",
            "Better, but 'eco-friendly' is overused. Try something more vivid.",
            "Approved. Punchy and memorable.",
        ]))),
    )
    .with_description("Reviews copy and decides whether it is ready.")
    .with_instructions(
        "Your responsibility is to review and identify how to improve user provided content. \
         If content is satisfactory, copy it to the clipboard and say so.",
    )
    .with_tools(tools);

    let writer = Agent::new(
        "writer",
        "Writer",
        Arc::new(WriterBackend(Scripted::new(vec![
            "Eco-friendly power. Zero compromise.",
            "Silence the road. Keep the thrill.",
        ]))),
    )
    .with_description("Rewrites copy according to review feedback.")
    .with_instructions("Rewrite the content to address every suggestion. Do not explain.");

    let config = OrchestrationConfig::default();
    let selection = SelectionPolicy::Delegate(
        DelegateSelection::new(Arc::new(TurnTaker), "reviewer")
            .with_initial_agent("reviewer")
            .with_window(config.evaluation_context()),
    );
    let termination = TerminationPolicy::max_iterations(config.max_iterations).with_condition(
        TerminationCondition::Delegate(
            TerminationDelegate::new(Arc::new(SatisfactionJudge), config.completion_token.clone())
                .with_agents(["reviewer"])
                .with_window(config.evaluation_context()),
        ),
    );

    let orchestration = OrchestrationBuilder::new("review-loop", "Review/Revise Group Chat")
        .add_agent(reviewer)
        .add_agent(writer)
        .with_topology(Topology::GroupChat { selection })
        .with_termination(termination)
        .with_config(config)
        .with_event_handler(Arc::new(ConsolePrinter))
        .build()?;

    let mut session = OrchestrationSession::new(orchestration);
    println!("----------Agents are ready. Let's start working!----------");

    let stdin = io::stdin();
    loop {
        print!("\nUser> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = match line.trim() {
            "" => "Concept: a slogan for a new electric SUV that is affordable and fun to drive.",
            other => other,
        };
        if input.eq_ignore_ascii_case("exit") {
            break;
        }
        if input.eq_ignore_ascii_case("reset") {
            session.reset(true);
            println!("System> Conversation has been reset!");
            continue;
        }

        match session.start(input).await {
            Ok(_) => {
                let copied = clipboard.lock().map(|c| c.clone()).unwrap_or_default();
                if !copied.is_empty() {
                    println!("Clipboard> {}", copied);
                }
            }
            Err(e) => println!("Error> {}", e),
        }
    }

    println!("----------See you next time!----------");
    Ok(())
}
