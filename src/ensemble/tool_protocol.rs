//! Tool Protocol Abstraction Layer
//!
//! Agents may be granted opaque, side-effecting tools (copy text to a sink,
//! look up an order, file a refund). The orchestration core never calls tools
//! itself: it hands an agent's [`ToolRegistry`] to the agent's backend, and the
//! backend decides when to call them and whether a failure should abort the
//! turn.
//!
//! # Architecture
//!
//! ```text
//! AgentBackend → ToolRegistry → ToolProtocol (trait) → [Custom | user-defined]
//! ```
//!
//! # Example
//!
//! ```rust
//! use ensemble::tool_protocol::{ToolMetadata, ToolRegistry, ToolResult};
//! use ensemble::tool_protocols::CustomToolProtocol;
//! use std::sync::Arc;
//!
//! # async {
//! let protocol = Arc::new(CustomToolProtocol::new());
//! protocol
//!     .register_tool(
//!         ToolMetadata::new("check_order_status", "Look up shipping status"),
//!         Arc::new(|params| {
//!             let id = params["order_id"].as_str().unwrap_or("unknown");
//!             Ok(ToolResult::success(serde_json::json!(format!("Order {} has shipped", id))))
//!         }),
//!     )
//!     .await;
//!
//! let registry = ToolRegistry::from_protocol(protocol).await.unwrap();
//! let text = registry
//!     .call("check_order_status", serde_json::json!({"order_id": "42"}))
//!     .await
//!     .unwrap();
//! assert_eq!(text.as_deref(), Some("Order 42 has shipped"));
//! # };
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// What a tool handed back. `Null` output means a pure side effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: JsonValue,
}

impl ToolResult {
    pub fn success(output: JsonValue) -> Self {
        Self { output }
    }

    /// A call that did its work and has nothing to report.
    pub fn no_op() -> Self {
        Self::success(JsonValue::Null)
    }

    /// Text form of the output: strings verbatim, `Null` as `None`, anything
    /// else as compact JSON.
    pub fn text(&self) -> Option<String> {
        match &self.output {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Name and description of a tool, as shown to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
}

impl ToolMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Why a tool call did not produce a result.
///
/// The orchestration core does not distinguish these beyond "tool call
/// failed"; the variants exist for the backend's benefit.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolError {
    /// No tool by this name is granted or registered.
    NotFound(String),
    /// The tool ran and reported a failure.
    ExecutionFailed(String),
    /// The protocol could not reach or drive the tool.
    ProtocolError(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "No such tool: {}", name),
            ToolError::ExecutionFailed(msg) => write!(f, "Tool failed: {}", msg),
            ToolError::ProtocolError(msg) => write!(f, "Tool protocol error: {}", msg),
        }
    }
}

impl Error for ToolError {}

/// Transport that actually runs tools: in-process closures, a remote server,
/// anything else.
#[async_trait]
pub trait ToolProtocol: Send + Sync {
    async fn invoke(&self, tool_name: &str, args: JsonValue) -> Result<ToolResult, ToolError>;

    /// Every tool this protocol can run.
    async fn describe(&self) -> Result<Vec<ToolMetadata>, ToolError>;

    fn protocol_name(&self) -> &str {
        "tools"
    }
}

/// The tools one agent is granted, backed by a single protocol.
///
/// A protocol may know more tools than the registry grants; calls to tools
/// outside the grant fail with [`ToolError::NotFound`] without reaching the
/// protocol.
pub struct ToolRegistry {
    granted: BTreeMap<String, ToolMetadata>,
    protocol: Arc<dyn ToolProtocol>,
}

impl ToolRegistry {
    /// Registry with no tools granted yet.
    pub fn new(protocol: Arc<dyn ToolProtocol>) -> Self {
        Self {
            granted: BTreeMap::new(),
            protocol,
        }
    }

    /// Grant every tool the protocol currently describes.
    pub async fn from_protocol(protocol: Arc<dyn ToolProtocol>) -> Result<Self, ToolError> {
        let tools = protocol.describe().await?;
        let mut registry = Self::new(protocol);
        for metadata in tools {
            registry.add_tool(metadata);
        }
        Ok(registry)
    }

    pub fn add_tool(&mut self, metadata: ToolMetadata) {
        self.granted.insert(metadata.name.clone(), metadata);
    }

    pub fn remove_tool(&mut self, name: &str) -> Option<ToolMetadata> {
        self.granted.remove(name)
    }

    /// Granted tools, ordered by name.
    pub fn tools(&self) -> impl Iterator<Item = &ToolMetadata> {
        self.granted.values()
    }

    pub fn protocol(&self) -> &Arc<dyn ToolProtocol> {
        &self.protocol
    }

    /// Call a granted tool and return its text output, or `None` for a no-op
    /// result. Failures are logged so they stay visible even when a backend
    /// swallows them.
    pub async fn call(&self, tool_name: &str, args: JsonValue) -> Result<Option<String>, ToolError> {
        if !self.granted.contains_key(tool_name) {
            return Err(ToolError::NotFound(tool_name.to_string()));
        }

        log::debug!(
            "calling tool '{}' via {}",
            tool_name,
            self.protocol.protocol_name()
        );
        match self.protocol.invoke(tool_name, args).await {
            Ok(result) => Ok(result.text()),
            Err(e) => {
                log::warn!("tool '{}' failed: {}", tool_name, e);
                Err(e)
            }
        }
    }
}
