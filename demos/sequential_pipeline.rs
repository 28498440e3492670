//! Sequential Marketing Pipeline
//!
//! Analyst -> CopyWriter -> Editor. Each agent sees only the previous
//! agent's output; the Editor's text is the result. The full transcript is
//! collected through the run's event stream.
//!
//! Run with: cargo run --example sequential_pipeline

use async_trait::async_trait;
use ensemble::agent::{Agent, AgentBackend, AgentReply, InvocationRequest};
use ensemble::error::BackendError;
use ensemble::event::RunEvent;
use ensemble::orchestration::{OrchestrationBuilder, OrchestrationSession, Topology};
use futures_util::StreamExt;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

struct Analyst;

#[async_trait]
impl AgentBackend for Analyst {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Vec<AgentReply>, BackendError> {
        let product = request.context.last().map(|m| m.content.trim().to_string()).unwrap_or_default();
        Ok(vec![AgentReply::text(format!(
            "Key features: {}\nTarget audience: busy professionals\nUnique selling points: simplicity, reliability",
            product
        ))])
    }
}

struct CopyWriter;

#[async_trait]
impl AgentBackend for CopyWriter {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Vec<AgentReply>, BackendError> {
        let brief = request.context.last().map(|m| m.content.to_string()).unwrap_or_default();
        let features = brief
            .lines()
            .find_map(|l| l.strip_prefix("Key features: "))
            .unwrap_or("our product");
        Ok(vec![AgentReply::text(format!(
            "meet the product you didnt know you needed: {}. built for busy professionals who want simple, reliable tools",
            features
        ))])
    }
}

struct Editor;

#[async_trait]
impl AgentBackend for Editor {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Vec<AgentReply>, BackendError> {
        let draft = request.context.last().map(|m| m.content.trim().to_string()).unwrap_or_default();
        let mut polished = draft.replace("didnt", "didn't");
        if let Some(first) = polished.get(..1) {
            polished = first.to_uppercase() + &polished[1..];
        }
        if !polished.ends_with('.') {
            polished.push('.');
        }
        Ok(vec![AgentReply::text(polished)])
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    ensemble::init_logger();

    let orchestration = OrchestrationBuilder::new("marketing", "Marketing Pipeline")
        .add_agent(
            Agent::new("analyst", "Analyst", Arc::new(Analyst))
                .with_description("Extracts key concepts from a product description.")
                .with_instructions(
                    "You are a marketing analyst. Given a product description, identify key features, \
                     target audience and unique selling points.",
                ),
        )
        .add_agent(
            Agent::new("copywriter", "CopyWriter", Arc::new(CopyWriter))
                .with_description("Writes marketing copy based on the extracted concepts.")
                .with_instructions("Compose a compelling marketing copy of around 150 words."),
        )
        .add_agent(
            Agent::new("editor", "Editor", Arc::new(Editor))
                .with_description("Formats and proofreads the marketing copy.")
                .with_instructions("Correct grammar, improve clarity and polish the draft."),
        )
        .with_topology(Topology::Sequential)
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
        let input = line.trim().to_string();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") {
            break;
        }

        let mut events = session.subscribe();
        let collector = tokio::spawn(async move {
            let mut transcript = Vec::new();
            while let Some(event) = events.next().await {
                if let RunEvent::Message(message) = event {
                    transcript.push(message);
                }
            }
            transcript
        });

        let outcome = session.start(input).await;
        let transcript = collector.await?;

        match outcome {
            Ok(outcome) => {
                println!("\n# RESULT: {}", outcome.result.as_text().unwrap_or_default());
                println!("\nORCHESTRATION HISTORY");
                for message in transcript {
                    println!("#{} - {}:\n{}\n", message.role, message.author(), message.content);
                }
            }
            Err(e) => println!("Exception: {}", e),
        }
    }

    println!("----------See you next time!----------");
    Ok(())
}
