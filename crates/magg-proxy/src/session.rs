//! Inbound session lifecycle.
//!
//! Each connected client gets its own server façade carrying the session's
//! tag filter and handshake instructions. Connects are serialized per
//! session id; disconnect releases pool references and broker tracking, and
//! a recursion guard keeps close handlers from re-entering.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use magg_config::{BackendConfig, PresetConfig};
use magg_core::{ProxyError, SessionStatus};
use rmcp::ErrorData as McpError;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, CompleteRequestParam, CompleteResult,
    GetPromptRequestParam, GetPromptResult, ListPromptsResult, ListResourcesResult,
    ListToolsResult, PaginatedRequestParam, ReadResourceRequestParam, ReadResourceResult,
    ServerCapabilities, ServerInfo, SetLevelRequestParam,
};
use rmcp::service::{Peer, RequestContext, serve_directly_with_ct};
use rmcp::{RoleServer, ServerHandler};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::aggregate::CapabilityAggregator;
use crate::broker::NotificationBroker;
use crate::filter::TagFilter;
use crate::instructions::aggregate_instructions;
use crate::pool::{TemplatePool, render_context_for};
use crate::router::RequestRouter;

/// Connection-time options resolved by the serving surface.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub filter: TagFilter,
    /// Opaque client context driving template materialization.
    pub context: Option<serde_json::Value>,
    pub transport_kind: &'static str,
}

/// The byte stream a session runs over.
pub enum SessionTransport {
    Duplex(tokio::io::DuplexStream),
    Stdio(tokio::io::Stdin, tokio::io::Stdout),
}

/// Per-session MCP server façade; all operations re-apply the session
/// filter before touching shared state.
#[derive(Clone)]
pub struct SessionServer {
    filter: TagFilter,
    instructions: Option<String>,
    router: Arc<RequestRouter>,
}

impl ServerHandler for SessionServer {
    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.server_info.name = "magg".to_string();
        info.server_info.version = env!("CARGO_PKG_VERSION").to_string();
        info.capabilities = ServerCapabilities::builder()
            .enable_tools()
            .enable_tool_list_changed()
            .enable_resources()
            .enable_prompts()
            .enable_logging()
            .build();
        info.instructions = self.instructions.clone();
        info
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(self.router.list_tools(&self.filter).await)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.router
            .call_tool(&self.filter, request, context.ct.clone())
            .await
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        Ok(self.router.list_resources(&self.filter).await)
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        self.router
            .read_resource(&self.filter, request, context.ct.clone())
            .await
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        Ok(self.router.list_prompts(&self.filter).await)
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        self.router
            .get_prompt(&self.filter, request, context.ct.clone())
            .await
    }

    async fn set_level(
        &self,
        request: SetLevelRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<(), McpError> {
        self.router.set_level(&self.filter, request).await;
        Ok(())
    }

    async fn complete(
        &self,
        request: CompleteRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CompleteResult, McpError> {
        self.router
            .complete(&self.filter, request, context.ct.clone())
            .await
    }
}

pub struct InboundSession {
    pub session_id: String,
    pub filter: TagFilter,
    pub connected_at: DateTime<Utc>,
    status: RwLock<SessionStatus>,
    last_error: RwLock<Option<String>>,
    peer: RwLock<Option<Peer<RoleServer>>>,
    ct: CancellationToken,
    disconnecting: AtomicBool,
}

impl InboundSession {
    pub async fn status(&self) -> SessionStatus {
        *self.status.read().await
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    pub fn preset(&self) -> Option<&str> {
        self.filter.preset_name()
    }
}

pub struct SessionManager {
    router: Arc<RequestRouter>,
    aggregator: Arc<CapabilityAggregator>,
    pool: Arc<TemplatePool>,
    broker: Arc<NotificationBroker>,
    templates: Vec<BackendConfig>,
    presets: BTreeMap<String, PresetConfig>,
    session_count: Arc<AtomicUsize>,
    sessions: RwLock<HashMap<String, Arc<InboundSession>>>,
    connect_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<RequestRouter>,
        aggregator: Arc<CapabilityAggregator>,
        pool: Arc<TemplatePool>,
        broker: Arc<NotificationBroker>,
        templates: Vec<BackendConfig>,
        presets: BTreeMap<String, PresetConfig>,
        session_count: Arc<AtomicUsize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            aggregator,
            pool,
            broker,
            templates,
            presets,
            session_count,
            sessions: RwLock::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn presets(&self) -> &BTreeMap<String, PresetConfig> {
        &self.presets
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<InboundSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.session_count.load(Ordering::Relaxed)
    }

    /// Connect a session. Concurrent connects for the same id serialize on a
    /// per-id lock; a repeat connect while connected is a no-op returning
    /// the existing session.
    pub async fn connect(
        self: &Arc<Self>,
        transport: SessionTransport,
        session_id: String,
        opts: SessionOptions,
    ) -> Result<Arc<InboundSession>, ProxyError> {
        let connect_lock = {
            let mut locks = self.connect_locks.lock().await;
            locks
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _connect_guard = connect_lock.lock().await;

        if let Some(existing) = self.get(&session_id).await {
            if existing.status().await == SessionStatus::Connected {
                tracing::debug!(session = %session_id, "connect ignored: already connected");
                return Ok(existing);
            }
        }

        // Materialize template instances for this session before the
        // handshake so their capabilities are part of the first snapshot.
        if opts.context.is_some() && !self.templates.is_empty() {
            let connection_id = Ulid::new().to_string().to_lowercase();
            for template in &self.templates {
                let ctx = render_context_for(
                    template,
                    &session_id,
                    opts.transport_kind,
                    &connection_id,
                    opts.context.as_ref(),
                );
                match self.pool.get_or_create(template, &ctx, &session_id).await {
                    Ok(handle) => {
                        tracing::debug!(
                            session = %session_id,
                            template = %template.name,
                            backend = %handle.backend_name,
                            "template instance attached"
                        );
                    }
                    Err(error) => {
                        tracing::warn!(
                            session = %session_id,
                            template = %template.name,
                            error = %error,
                            "template instance unavailable"
                        );
                    }
                }
            }
        }

        let snapshot = self.aggregator.current().await;
        let instructions = aggregate_instructions(&snapshot, &opts.filter);
        let facade = SessionServer {
            filter: opts.filter.clone(),
            instructions,
            router: self.router.clone(),
        };

        let ct = CancellationToken::new();
        let running = match transport {
            SessionTransport::Duplex(stream) => {
                serve_directly_with_ct(facade, stream, None, ct.clone())
            }
            SessionTransport::Stdio(stdin, stdout) => {
                serve_directly_with_ct(facade, (stdin, stdout), None, ct.clone())
            }
        };
        let peer = running.peer().clone();

        let session = Arc::new(InboundSession {
            session_id: session_id.clone(),
            filter: opts.filter.clone(),
            connected_at: Utc::now(),
            status: RwLock::new(SessionStatus::Connected),
            last_error: RwLock::new(None),
            peer: RwLock::new(Some(peer.clone())),
            ct,
            disconnecting: AtomicBool::new(false),
        });

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session.clone());
        self.session_count.fetch_add(1, Ordering::Relaxed);
        self.broker
            .track(
                &session_id,
                peer,
                opts.filter.clone(),
                opts.filter.preset_name().map(str::to_string),
            )
            .await;

        let manager = self.clone();
        let waiting_id = session_id.clone();
        tokio::spawn(async move {
            let result = running.waiting().await;
            if let Err(error) = &result {
                tracing::debug!(session = %waiting_id, error = %error, "session loop ended with error");
                if let Some(session) = manager.get(&waiting_id).await {
                    *session.status.write().await = SessionStatus::Error;
                    *session.last_error.write().await = Some(error.to_string());
                }
            }
            manager.disconnect(&waiting_id, false).await;
        });

        tracing::info!(session = %session_id, "session connected");
        Ok(session)
    }

    /// Tear a session down. `force` also closes the transport, used at
    /// process shutdown; otherwise the transport's own close drives this.
    pub async fn disconnect(&self, session_id: &str, force: bool) {
        let session = self.sessions.write().await.remove(session_id);
        let Some(session) = session else {
            return;
        };
        if session.disconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        *session.status.write().await = SessionStatus::Disconnected;
        *session.peer.write().await = None;
        self.session_count.fetch_sub(1, Ordering::Relaxed);
        self.pool.release_session(session_id).await;
        self.broker.untrack(session_id).await;
        self.connect_locks.lock().await.remove(session_id);

        if force {
            session.ct.cancel();
        }
        tracing::info!(session = %session_id, force, "session disconnected");
    }

    pub async fn disconnect_all(&self, force: bool) {
        for session_id in self.session_ids().await {
            self.disconnect(&session_id, force).await;
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
