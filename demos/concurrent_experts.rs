//! Concurrent Experts
//!
//! A physicist and a chemist answer the same question at the same time. The
//! round is joined under a single 20 second deadline and yields one result per
//! expert, in declaration order, whichever finished first.
//!
//! Run with: cargo run --example concurrent_experts

use async_trait::async_trait;
use ensemble::agent::{Agent, AgentBackend, AgentReply, InvocationRequest};
use ensemble::error::BackendError;
use ensemble::orchestration::{OrchestrationBuilder, OrchestrationSession, Topology};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

/// Answers from a fixed perspective after a simulated model latency.
struct Expert {
    field: &'static str,
    latency: Duration,
}

#[async_trait]
impl AgentBackend for Expert {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Vec<AgentReply>, BackendError> {
        tokio::time::sleep(self.latency).await;
        let question = request
            .context
            .last()
            .map(|m| m.content.trim().to_string())
            .ok_or_else(|| BackendError::malformed("no question in context"))?;
        Ok(vec![AgentReply::text(format!(
            "From a {} perspective, \"{}\" comes down to {}.",
            self.field,
            question,
            match self.field {
                "physics" => "energy, forces and how they are conserved",
                _ => "bonds, reactions and how molecules rearrange",
            }
        ))])
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    ensemble::init_logger();

    let physicist = Agent::new(
        "physics-expert",
        "PhysicsExpert",
        Arc::new(Expert {
            field: "physics",
            latency: Duration::from_millis(400),
        }),
    )
    .with_description("Physics expert agent for answering questions in the perspective of a physicist.")
    .with_instructions("You're an expert in physics, you can answer questions from a physics expert perspective.");

    let chemist = Agent::new(
        "chemistry-expert",
        "ChemistryExpert",
        Arc::new(Expert {
            field: "chemistry",
            latency: Duration::from_millis(150),
        }),
    )
    .with_description("Chemistry expert agent for answering questions in the perspective of a chemist.")
    .with_instructions("You're an expert in chemistry, you can answer questions from a chemistry expert perspective.");

    let orchestration = OrchestrationBuilder::new("experts", "Concurrent Experts")
        .add_agent(physicist)
        .add_agent(chemist)
        .with_topology(Topology::Concurrent {
            timeout: Some(Duration::from_secs(20)),
        })
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
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") {
            break;
        }

        // Each question is independent.
        session.reset(true);
        match session.start(input).await {
            Ok(outcome) => {
                for (i, output) in outcome.result.outputs().iter().enumerate() {
                    println!("# RESULT {} ({}):\n{}\n", i + 1, output.agent_name, output.content);
                }
                let order: Vec<&str> = outcome
                    .transcript
                    .iter()
                    .filter_map(|m| m.agent_name.as_deref())
                    .collect();
                println!("(completion order: {})", order.join(" -> "));
            }
            Err(e) => println!("Exception: {}", e),
        }
    }

    println!("----------See you next time!----------");
    Ok(())
}
