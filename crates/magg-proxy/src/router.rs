//! Request routing from session façades to origin backends.
//!
//! List operations answer from the current snapshot, re-filtered for the
//! session. Call operations look up the item's origin, then invoke the
//! outbound client with a per-backend timeout and one retry on transient
//! transport errors. Backend MCP errors pass through verbatim.

use std::sync::Arc;
use std::time::Duration;

use magg_core::ProxyError;
use rmcp::ErrorData as McpError;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, CompleteRequestParam, CompletionInfo,
    GetPromptRequestParam, GetPromptResult, ListPromptsResult, ListResourcesResult,
    ListToolsResult, ReadResourceRequestParam, ReadResourceResult, Reference,
    SetLevelRequestParam,
};
use rmcp::service::{Peer, ServiceError};
use rmcp::RoleClient;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{CapabilityAggregator, INTERNAL_ORIGIN};
use crate::filter::TagFilter;
use crate::internal::InternalProvider;
use crate::upstream::OutboundManager;

const CALL_ATTEMPTS: u32 = 2;

pub struct RequestRouter {
    manager: Arc<OutboundManager>,
    aggregator: Arc<CapabilityAggregator>,
    internal: Arc<InternalProvider>,
    default_timeout: Duration,
}

pub fn to_mcp_error(error: ProxyError) -> McpError {
    match &error {
        ProxyError::InvalidParams(message) => McpError::invalid_params(message.clone(), None),
        _ => McpError::internal_error(error.to_string(), None),
    }
}

impl RequestRouter {
    pub fn new(
        manager: Arc<OutboundManager>,
        aggregator: Arc<CapabilityAggregator>,
        internal: Arc<InternalProvider>,
        default_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            aggregator,
            internal,
            default_timeout,
        })
    }

    pub async fn list_tools(&self, filter: &TagFilter) -> ListToolsResult {
        let snapshot = self.aggregator.current().await;
        let tools = snapshot
            .tools
            .iter()
            .filter(|entry| snapshot.origin_visible(&entry.origin, filter))
            .map(|entry| entry.tool.clone())
            .collect();
        ListToolsResult::with_all_items(tools)
    }

    pub async fn list_resources(&self, filter: &TagFilter) -> ListResourcesResult {
        let snapshot = self.aggregator.current().await;
        let mut result = ListResourcesResult::default();
        result.resources = snapshot
            .resources
            .iter()
            .filter(|entry| snapshot.origin_visible(&entry.origin, filter))
            .map(|entry| entry.resource.clone())
            .collect();
        result
    }

    pub async fn list_prompts(&self, filter: &TagFilter) -> ListPromptsResult {
        let snapshot = self.aggregator.current().await;
        let mut result = ListPromptsResult::default();
        result.prompts = snapshot
            .prompts
            .iter()
            .filter(|entry| snapshot.origin_visible(&entry.origin, filter))
            .map(|entry| entry.prompt.clone())
            .collect();
        result
    }

    pub async fn call_tool(
        &self,
        filter: &TagFilter,
        request: CallToolRequestParam,
        ct: CancellationToken,
    ) -> Result<CallToolResult, McpError> {
        let snapshot = self.aggregator.current().await;
        let origin = snapshot
            .tool(request.name.as_ref())
            .filter(|entry| snapshot.origin_visible(&entry.origin, filter))
            .map(|entry| entry.origin.clone())
            .ok_or_else(|| {
                McpError::method_not_found::<rmcp::model::CallToolRequestMethod>()
            })?;

        if origin == INTERNAL_ORIGIN {
            return self.internal.call_tool(request.name.as_ref()).await;
        }

        self.forward(&origin, ct, move |peer| {
            let request = request.clone();
            async move { peer.call_tool(request).await }
        })
        .await
    }

    pub async fn read_resource(
        &self,
        filter: &TagFilter,
        request: ReadResourceRequestParam,
        ct: CancellationToken,
    ) -> Result<ReadResourceResult, McpError> {
        let snapshot = self.aggregator.current().await;
        let origin = snapshot
            .resource(&request.uri)
            .filter(|entry| snapshot.origin_visible(&entry.origin, filter))
            .map(|entry| entry.origin.clone())
            .ok_or_else(|| {
                McpError::method_not_found::<rmcp::model::ReadResourceRequestMethod>()
            })?;

        self.forward(&origin, ct, move |peer| {
            let request = request.clone();
            async move { peer.read_resource(request).await }
        })
        .await
    }

    pub async fn get_prompt(
        &self,
        filter: &TagFilter,
        request: GetPromptRequestParam,
        ct: CancellationToken,
    ) -> Result<GetPromptResult, McpError> {
        let snapshot = self.aggregator.current().await;
        let origin = snapshot
            .prompt(&request.name)
            .filter(|entry| snapshot.origin_visible(&entry.origin, filter))
            .map(|entry| entry.origin.clone())
            .ok_or_else(|| McpError::method_not_found::<rmcp::model::GetPromptRequestMethod>())?;

        self.forward(&origin, ct, move |peer| {
            let request = request.clone();
            async move { peer.get_prompt(request).await }
        })
        .await
    }

    /// Fan the level out to every visible ready backend; per-backend
    /// failures are logged, not surfaced.
    pub async fn set_level(&self, filter: &TagFilter, request: SetLevelRequestParam) {
        let snapshot = self.aggregator.current().await;
        for name in &snapshot.ready_backends {
            if !snapshot.origin_visible(name, filter) {
                continue;
            }
            let Some(connection) = self.manager.get(name).await else {
                continue;
            };
            let Ok(peer) = connection.peer().await else {
                continue;
            };
            if let Err(error) = peer.set_level(request.clone()).await {
                tracing::warn!(backend = %name, error = %error, "logging/setLevel forwarding failed");
            }
        }
    }

    pub async fn complete(
        &self,
        filter: &TagFilter,
        request: CompleteRequestParam,
        ct: CancellationToken,
    ) -> Result<rmcp::model::CompleteResult, McpError> {
        let snapshot = self.aggregator.current().await;
        let origin = match &request.r#ref {
            Reference::Prompt(prompt) => snapshot
                .prompt(&prompt.name)
                .filter(|entry| snapshot.origin_visible(&entry.origin, filter))
                .map(|entry| entry.origin.clone()),
            Reference::Resource(resource) => snapshot
                .resource(&resource.uri)
                .filter(|entry| snapshot.origin_visible(&entry.origin, filter))
                .map(|entry| entry.origin.clone()),
        };
        let origin = origin
            .ok_or_else(|| McpError::method_not_found::<rmcp::model::CompleteRequestMethod>())?;

        if origin == INTERNAL_ORIGIN {
            let mut result = rmcp::model::CompleteResult::default();
            result.completion = CompletionInfo::default();
            return Ok(result);
        }

        self.forward(&origin, ct, move |peer| {
            let request = request.clone();
            async move { peer.complete(request).await }
        })
        .await
    }

    /// Shared forwarding path: resolve the backend, apply its timeout, retry
    /// once on a transient transport failure, surface MCP errors verbatim.
    async fn forward<T, F, Fut>(
        &self,
        origin: &str,
        ct: CancellationToken,
        call: F,
    ) -> Result<T, McpError>
    where
        F: Fn(Peer<RoleClient>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ServiceError>>,
    {
        let connection = self.manager.get(origin).await.ok_or_else(|| {
            McpError::internal_error(
                ProxyError::BackendNotReady(origin.to_string()).to_string(),
                None,
            )
        })?;
        let timeout = connection
            .config()
            .await
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let mut last_message = String::new();
        for attempt in 1..=CALL_ATTEMPTS {
            let peer = connection
                .peer()
                .await
                .map_err(|error| McpError::internal_error(error.to_string(), None))?;

            let outcome = tokio::select! {
                _ = ct.cancelled() => {
                    return Err(McpError::internal_error(
                        format!("call to backend '{origin}' was cancelled"),
                        None,
                    ));
                }
                outcome = tokio::time::timeout(timeout, call(peer)) => outcome,
            };

            match outcome {
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(ServiceError::McpError(error))) => return Err(error),
                Ok(Err(error)) => {
                    // Transport-level failure: worth exactly one retry.
                    last_message = error.to_string();
                    tracing::warn!(
                        backend = %origin,
                        attempt,
                        error = %last_message,
                        "transient backend call failure"
                    );
                    if ct.is_cancelled() {
                        break;
                    }
                }
                Err(_) => {
                    return Err(McpError::internal_error(
                        format!(
                            "call to backend '{origin}' timed out after {}s",
                            timeout.as_secs()
                        ),
                        None,
                    ));
                }
            }
        }

        Err(McpError::internal_error(
            ProxyError::BackendCall {
                backend: origin.to_string(),
                message: last_message,
                transient: true,
            }
            .to_string(),
            None,
        ))
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
