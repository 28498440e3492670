// src/ensemble/mod.rs

pub mod agent;
pub mod aggregation;
pub mod config;
pub mod delegate;
pub mod error;
pub mod event;
pub mod history;
pub mod message;
pub mod orchestration;
pub mod routing;
pub mod selection;
pub mod termination;
pub mod tool_protocol;
pub mod tool_protocols;

// Re-export the session types so they are reachable as ensemble::OrchestrationSession
// as well as through the orchestration module.
pub use orchestration::{Orchestration, OrchestrationBuilder, OrchestrationSession};
