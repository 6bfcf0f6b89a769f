//! First-party tools contributed to every snapshot under the `magg_` prefix.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rmcp::ErrorData as McpError;
use rmcp::model::{CallToolResult, Content, Tool};
use serde_json::json;

use crate::upstream::OutboundManager;

pub const STATUS_TOOL: &str = "magg_status";

/// Built-in provider reporting on the proxy itself.
pub struct InternalProvider {
    manager: Arc<OutboundManager>,
    session_count: Arc<AtomicUsize>,
}

impl InternalProvider {
    pub fn new(manager: Arc<OutboundManager>, session_count: Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            session_count,
        })
    }

    pub fn tools(&self) -> Vec<Tool> {
        let schema = json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false,
        });
        let schema = schema
            .as_object()
            .cloned()
            .expect("status tool schema is an object");
        vec![Tool::new(
            STATUS_TOOL,
            "Report the proxy's backend connection statuses and session count.",
            Arc::new(schema),
        )]
    }

    pub fn owns(&self, tool_name: &str) -> bool {
        tool_name == STATUS_TOOL
    }

    pub async fn call_tool(&self, tool_name: &str) -> Result<CallToolResult, McpError> {
        if tool_name != STATUS_TOOL {
            return Err(McpError::invalid_params(
                format!("unknown internal tool: {tool_name}"),
                None,
            ));
        }

        let backends: Vec<serde_json::Value> = self
            .manager
            .status()
            .await
            .values()
            .map(|report| report.to_json())
            .collect();
        let payload = json!({
            "backends": backends,
            "sessions": self.session_count.load(Ordering::Relaxed),
            "version": env!("CARGO_PKG_VERSION"),
        });

        let text = serde_json::to_string_pretty(&payload).map_err(|error| {
            McpError::internal_error(format!("failed to serialize status: {error}"), None)
        })?;
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::{InternalProvider, STATUS_TOOL};
    use crate::upstream::OutboundManager;

    fn provider() -> Arc<InternalProvider> {
        let (manager, _notices) = OutboundManager::new(Duration::from_secs(1));
        InternalProvider::new(manager, Arc::new(AtomicUsize::new(2)))
    }

    #[test]
    fn status_tool_is_advertised_with_prefix() {
        let tools = provider().tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name.as_ref(), STATUS_TOOL);
        assert!(provider().owns(STATUS_TOOL));
        assert!(!provider().owns("status"));
    }

    #[tokio::test]
    async fn status_tool_reports_sessions() {
        let result = provider().call_tool(STATUS_TOOL).await.unwrap();
        let text = result.content[0].as_text().map(|t| t.text.clone()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["sessions"], 2);
        assert!(parsed["backends"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_internal_tool_is_invalid_params() {
        let err = provider().call_tool("magg_nope").await.unwrap_err();
        assert!(err.message.contains("unknown internal tool"));
    }
}
