//! Tool Protocol Implementations
//!
//! [`CustomToolProtocol`] exposes plain Rust closures (sync or async) as tools.
//! It is the protocol the demos use for the clipboard sink and the order
//! status/return/refund lookups.

use crate::ensemble::tool_protocol::{ToolError, ToolMetadata, ToolProtocol, ToolResult};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A tool that answers immediately.
pub type ToolFunction = Arc<dyn Fn(JsonValue) -> Result<ToolResult, ToolError> + Send + Sync>;

/// A tool that has to await something (I/O, another service).
pub type AsyncToolFunction = Arc<
    dyn Fn(JsonValue) -> Pin<Box<dyn Future<Output = Result<ToolResult, ToolError>> + Send>>
        + Send
        + Sync,
>;

#[derive(Clone)]
enum Handler {
    Sync(ToolFunction),
    Async(AsyncToolFunction),
}

struct Entry {
    metadata: ToolMetadata,
    handler: Handler,
}

/// Tool protocol backed by in-process closures.
///
/// Registering a name again replaces the previous tool.
///
/// # Example
///
/// ```rust
/// use ensemble::tool_protocol::{ToolMetadata, ToolResult};
/// use ensemble::tool_protocols::CustomToolProtocol;
/// use std::sync::Arc;
///
/// # async {
/// let protocol = CustomToolProtocol::new();
/// protocol
///     .register_tool(
///         ToolMetadata::new("set_clipboard", "Copies text to the clipboard"),
///         Arc::new(|params| {
///             println!("{}", params["content"]);
///             Ok(ToolResult::no_op())
///         }),
///     )
///     .await;
/// # };
/// ```
#[derive(Default)]
pub struct CustomToolProtocol {
    entries: RwLock<HashMap<String, Entry>>,
}

impl CustomToolProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_tool(&self, metadata: ToolMetadata, function: ToolFunction) {
        self.insert(metadata, Handler::Sync(function)).await;
    }

    pub async fn register_async_tool(&self, metadata: ToolMetadata, function: AsyncToolFunction) {
        self.insert(metadata, Handler::Async(function)).await;
    }

    /// Returns `true` when a tool by that name existed.
    pub async fn unregister_tool(&self, name: &str) -> bool {
        self.entries.write().await.remove(name).is_some()
    }

    async fn insert(&self, metadata: ToolMetadata, handler: Handler) {
        let name = metadata.name.clone();
        let replaced = self
            .entries
            .write()
            .await
            .insert(name.clone(), Entry { metadata, handler })
            .is_some();
        if replaced {
            log::debug!("replaced custom tool '{}'", name);
        }
    }
}

#[async_trait]
impl ToolProtocol for CustomToolProtocol {
    async fn invoke(&self, tool_name: &str, args: JsonValue) -> Result<ToolResult, ToolError> {
        // Clone the handler out so the lock is not held across the call.
        let handler = self
            .entries
            .read()
            .await
            .get(tool_name)
            .map(|entry| entry.handler.clone())
            .ok_or_else(|| ToolError::NotFound(tool_name.to_string()))?;

        match handler {
            Handler::Sync(function) => function(args),
            Handler::Async(function) => function(args).await,
        }
    }

    async fn describe(&self) -> Result<Vec<ToolMetadata>, ToolError> {
        let entries = self.entries.read().await;
        Ok(entries.values().map(|e| e.metadata.clone()).collect())
    }

    fn protocol_name(&self) -> &str {
        "custom"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn async_tools_run_and_can_be_unregistered() {
        let protocol = CustomToolProtocol::new();
        protocol
            .register_async_tool(
                ToolMetadata::new("refund", "Issue a refund"),
                Arc::new(|params| {
                    Box::pin(async move {
                        let id = params["order_id"].as_str().unwrap_or("?").to_string();
                        Ok(ToolResult::success(JsonValue::String(format!(
                            "refund for {} approved",
                            id
                        ))))
                    })
                }),
            )
            .await;

        let result = protocol
            .invoke("refund", serde_json::json!({"order_id": "7"}))
            .await
            .unwrap();
        assert_eq!(result.text().as_deref(), Some("refund for 7 approved"));

        assert!(protocol.unregister_tool("refund").await);
        assert_eq!(
            protocol.invoke("refund", JsonValue::Null).await,
            Err(ToolError::NotFound("refund".to_string()))
        );
        assert!(protocol.describe().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reregistering_replaces_sync_with_async() {
        let protocol = CustomToolProtocol::new();
        protocol
            .register_tool(
                ToolMetadata::new("status", "old"),
                Arc::new(|_| Err(ToolError::ExecutionFailed("stale".to_string()))),
            )
            .await;
        protocol
            .register_async_tool(
                ToolMetadata::new("status", "new"),
                Arc::new(|_| Box::pin(async { Ok(ToolResult::no_op()) })),
            )
            .await;

        assert_eq!(
            protocol.invoke("status", JsonValue::Null).await,
            Ok(ToolResult::no_op())
        );
        let described = protocol.describe().await.unwrap();
        assert_eq!(described, vec![ToolMetadata::new("status", "new")]);
    }
}
