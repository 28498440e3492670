//! Customer Support Handoff
//!
//! A triage agent routes the customer to order-status, return and refund
//! specialists. Specialists hand back to triage when they are done. Whenever
//! the active agent needs more information the customer is asked for input.
//!
//! ```text
//! triage ──► status ──► triage
//!        ──► returns ──► triage
//!        ──► refunds ──► triage
//! ```
//!
//! By default the customer is scripted. Pass `--interactive` to answer
//! yourself.
//!
//! Run with: RUST_LOG=debug cargo run --example customer_support_handoff

use async_trait::async_trait;
use ensemble::agent::{Agent, AgentBackend, AgentReply, InvocationRequest};
use ensemble::error::BackendError;
use ensemble::event::{EventHandler, OrchestrationEvent};
use ensemble::message::{Message, Role};
use ensemble::orchestration::{HumanInput, OrchestrationBuilder, OrchestrationSession, Topology};
use ensemble::routing::RoutingGraph;
use ensemble::termination::TerminationPolicy;
use ensemble::tool_protocol::{ToolMetadata, ToolRegistry, ToolResult};
use ensemble::tool_protocols::CustomToolProtocol;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};

const REASONS: [&str; 3] = ["don't want it", "7-day", "no time"];

fn user_messages<'a>(context: &'a [Message]) -> impl Iterator<Item = &'a Message> {
    context.iter().rev().filter(|m| m.role == Role::User)
}

/// Most recent order number the customer mentioned.
fn order_id(context: &[Message]) -> Option<String> {
    user_messages(context).find_map(|m| {
        m.content
            .split(|c: char| !c.is_ascii_digit())
            .find(|s| s.len() >= 4)
            .map(String::from)
    })
}

fn stated_reason(context: &[Message]) -> Option<String> {
    let last = user_messages(context).next()?;
    let lowered = last.content.to_lowercase();
    REASONS
        .iter()
        .any(|r| lowered.contains(r))
        .then(|| last.content.trim().to_string())
}

struct Triage;

#[async_trait]
impl AgentBackend for Triage {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Vec<AgentReply>, BackendError> {
        let last = match request.context.last() {
            Some(last) => last,
            None => return Ok(vec![AgentReply::text("Hello! How can I help you today?")]),
        };
        if last.role != Role::User {
            return Ok(vec![AgentReply::text("Is there anything else I can help you with?")]);
        }

        let said = last.content.to_lowercase();
        let reply = if said.contains("that's all") || said.contains("nothing else") {
            AgentReply::resolved("Glad I could help. Have a nice day!")
        } else if said.contains("status") || said.contains("where is") {
            AgentReply::handoff("Let me transfer you to our order status team.", "status")
        } else if said.contains("refund") {
            AgentReply::handoff("Let me transfer you to our refunds team.", "Order Refund Agent")
        } else if said.contains("return") {
            AgentReply::handoff("Let me transfer you to our returns team.", "returns")
        } else {
            AgentReply::text("Sure. Is this about an order's status, a return, or a refund?")
        };
        Ok(vec![reply])
    }
}

#[derive(Clone, Copy)]
enum Desk {
    Status,
    Return,
    Refund,
}

/// A specialist that collects an order number (and a reason where needed),
/// calls its tool, then hands back to triage.
struct Specialist(Desk);

#[async_trait]
impl AgentBackend for Specialist {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Vec<AgentReply>, BackendError> {
        let order = match order_id(request.context) {
            Some(order) => order,
            None => return Ok(vec![AgentReply::text("Could you give me your order number?")]),
        };

        let (tool, args) = match self.0 {
            Desk::Status => ("check_order_status", json!({ "order_id": order })),
            Desk::Return | Desk::Refund => match stated_reason(request.context) {
                Some(reason) => (
                    if matches!(self.0, Desk::Return) { "process_return" } else { "process_refund" },
                    json!({ "order_id": order, "reason": reason }),
                ),
                None => {
                    return Ok(vec![AgentReply::text(format!(
                        "For order {}, please confirm the reason: you don't want it anymore, \
                         the 7-day no-questions policy, or no time to use it.",
                        order
                    ))])
                }
            },
        };

        let tools = request
            .tools
            .ok_or_else(|| BackendError::malformed(format!("{} has no tools", request.agent_name)))?;
        let outcome = match tools.call(tool, args).await {
            Ok(Some(text)) => text,
            Ok(None) => "Done.".to_string(),
            Err(e) => format!("Sorry, that did not work: {}", e),
        };

        Ok(vec![
            AgentReply::tool(outcome.clone()),
            AgentReply::handoff(format!("{} Anything else goes back to triage.", outcome), "triage"),
        ])
    }
}

/// Plays the customer from a script, or reads stdin with `--interactive`.
struct Customer {
    interactive: bool,
    script: Mutex<VecDeque<&'static str>>,
}

#[async_trait]
impl HumanInput for Customer {
    async fn request_input(&self, last_agent_message: &Message) -> Message {
        println!("# Agent ({}):\n{}\n", last_agent_message.author(), last_agent_message.content);
        println!("# User:");

        let answer = if self.interactive {
            let mut line = String::new();
            let mut stdin = BufReader::new(tokio::io::stdin());
            match stdin.read_line(&mut line).await {
                Ok(_) => line.trim().to_string(),
                Err(e) => {
                    log::warn!("failed to read stdin: {}", e);
                    "That's all.".to_string()
                }
            }
        } else {
            let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
            next.unwrap_or("No, that's all, thanks.").to_string()
        };

        println!("{}\n", answer);
        Message::user(answer)
    }
}

struct HandoffMonitor;

#[async_trait]
impl EventHandler for HandoffMonitor {
    async fn on_orchestration_event(&self, event: &OrchestrationEvent) {
        if let OrchestrationEvent::HandoffOccurred { from, to, .. } = event {
            println!("  [handoff {} -> {}]\n", from, to);
        }
    }
}

async fn desk_tools(name: &str, description: &str, reply: fn(&serde_json::Value) -> String) -> ToolRegistry {
    let protocol = Arc::new(CustomToolProtocol::new());
    protocol
        .register_tool(
            ToolMetadata::new(name, description),
            Arc::new(move |params| Ok(ToolResult::success(json!(reply(&params))))),
        )
        .await;
    let mut registry = ToolRegistry::new(protocol);
    registry.add_tool(ToolMetadata::new(name, description));
    registry
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    ensemble::init_logger();
    let interactive = std::env::args().any(|a| a == "--interactive");

    let status_tools = desk_tools("check_order_status", "Look up where an order is", |p| {
        format!("Order {} has shipped and will arrive within 2-3 days!", p["order_id"].as_str().unwrap_or("?"))
    })
    .await;
    let return_tools = desk_tools("process_return", "Open a return for an order", |p| {
        format!(
            "The return for order {} has been approved! Reason: {}",
            p["order_id"].as_str().unwrap_or("?"),
            p["reason"].as_str().unwrap_or("?")
        )
    })
    .await;
    let refund_tools = desk_tools("process_refund", "Issue a refund for an order", |p| {
        format!(
            "The refund for order {} has been approved! Reason: {}",
            p["order_id"].as_str().unwrap_or("?"),
            p["reason"].as_str().unwrap_or("?")
        )
    })
    .await;

    let graph = RoutingGraph::start_with("triage")
        .add("triage", ["status", "returns", "refunds"])
        .add_with_guard("status", "triage", "not a status question")
        .add_with_guard("returns", "triage", "not a return question")
        .add_with_guard("refunds", "triage", "not a refund question");

    let customer = Customer {
        interactive,
        script: Mutex::new(VecDeque::from(vec![
            "I'd like to check the status of my order, please.",
            "It's order 12345.",
            "I also want a refund for order 67890.",
            "I don't want it anymore.",
        ])),
    };

    let orchestration = OrchestrationBuilder::new("customer-support", "Customer Support")
        .add_agent(
            Agent::new("triage", "Triage Agent", Arc::new(Triage))
                .with_description("Handles customer requests.")
                .with_instructions("A customer support agent that triages issues."),
        )
        .add_agent(
            Agent::new("status", "Order Status Agent", Arc::new(Specialist(Desk::Status)))
                .with_description("A customer support agent that checks order status.")
                .with_instructions("Handle order status requests.")
                .with_tools(status_tools),
        )
        .add_agent(
            Agent::new("returns", "Order Return Agent", Arc::new(Specialist(Desk::Return)))
                .with_description("A customer support agent that handles order returns.")
                .with_instructions("Handle order returns and record the customer's confirmed reason.")
                .with_tools(return_tools),
        )
        .add_agent(
            Agent::new("refunds", "Order Refund Agent", Arc::new(Specialist(Desk::Refund)))
                .with_description("A customer support agent that handles refunds.")
                .with_instructions("Handle refund requests and record the customer's confirmed reason.")
                .with_tools(refund_tools),
        )
        .with_topology(Topology::Handoff { graph })
        .with_termination(TerminationPolicy::max_iterations(30))
        .with_human_input(Arc::new(customer))
        .with_event_handler(Arc::new(HandoffMonitor))
        .build()?;

    let mut session = OrchestrationSession::new(orchestration);
    let task = "Hi, I need help with my order.";
    println!("Welcome to Customer Support!\n\n# User:\n{}\n", task);

    match session.start(task).await {
        Ok(outcome) => {
            println!("# Final answer ({}):\n{}\n", outcome.reason, outcome.result.as_text().unwrap_or_default());
            println!("{} agent turns, {} messages", outcome.iterations, outcome.transcript.len());
        }
        Err(e) => println!("Exception: {}", e),
    }

    println!("----------See you next time!----------");
    Ok(())
}
