//! Outbound connection manager.
//!
//! Owns one MCP client per configured backend and drives the
//! `Disconnected → Connecting → Connected / Error` state machine with capped
//! exponential backoff. A failing backend never blocks the others; callers
//! start backends concurrently and observe transitions through the event
//! channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use magg_config::{BackendConfig, MetadataDelta};
use magg_core::{BackendStatus, ProxyError};
use rmcp::model::{
    ClientInfo, InitializeResult, LoggingMessageNotificationParam, ProgressNotificationParam,
};
use rmcp::service::{NotificationContext, Peer, RunningService};
use rmcp::{ClientHandler, RoleClient, ServiceExt};
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};

const CONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const CONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);
const CONNECT_MAX_ATTEMPTS: u32 = 4;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Backend lifecycle events, broadcast to the aggregator and broker.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Up { name: String },
    Down { name: String, reason: String },
    /// Handshake capabilities or metadata changed; listeners should refresh.
    CapabilitiesChanged { name: String },
}

/// Notifications received from backend servers, forwarded to the broker.
#[derive(Debug, Clone)]
pub enum UpstreamNotice {
    ToolListChanged { backend: String },
    ResourceListChanged { backend: String },
    PromptListChanged { backend: String },
    Logging {
        backend: String,
        params: LoggingMessageNotificationParam,
    },
    Progress {
        backend: String,
        params: ProgressNotificationParam,
    },
}

/// Client-side handler for one backend connection; relays server-initiated
/// notifications into the shared notice channel.
#[derive(Clone)]
pub struct NotificationForwarder {
    backend: String,
    notices: mpsc::UnboundedSender<UpstreamNotice>,
}

impl NotificationForwarder {
    fn send(&self, notice: UpstreamNotice) {
        if self.notices.send(notice).is_err() {
            tracing::debug!(backend = %self.backend, "notice channel closed, dropping notification");
        }
    }
}

impl ClientHandler for NotificationForwarder {
    fn get_info(&self) -> ClientInfo {
        let mut info = ClientInfo::default();
        info.client_info.name = "magg".to_string();
        info.client_info.version = env!("CARGO_PKG_VERSION").to_string();
        info
    }

    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.send(UpstreamNotice::ToolListChanged {
            backend: self.backend.clone(),
        });
    }

    async fn on_resource_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.send(UpstreamNotice::ResourceListChanged {
            backend: self.backend.clone(),
        });
    }

    async fn on_prompt_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.send(UpstreamNotice::PromptListChanged {
            backend: self.backend.clone(),
        });
    }

    async fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        self.send(UpstreamNotice::Logging {
            backend: self.backend.clone(),
            params,
        });
    }

    async fn on_progress(
        &self,
        params: ProgressNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        self.send(UpstreamNotice::Progress {
            backend: self.backend.clone(),
            params,
        });
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub status: BackendStatus,
    pub last_error: Option<String>,
    pub last_connected: Option<DateTime<Utc>>,
}

/// One outbound backend: its config, state machine position, and (when
/// connected) the running rmcp client.
pub struct OutboundConnection {
    pub name: String,
    config: RwLock<BackendConfig>,
    state: RwLock<ConnectionState>,
    service: Mutex<Option<RunningService<RoleClient, NotificationForwarder>>>,
    peer: RwLock<Option<Peer<RoleClient>>>,
    server_info: RwLock<Option<InitializeResult>>,
}

impl OutboundConnection {
    fn new(config: BackendConfig) -> Self {
        Self {
            name: config.name.clone(),
            config: RwLock::new(config),
            state: RwLock::new(ConnectionState::default()),
            service: Mutex::new(None),
            peer: RwLock::new(None),
            server_info: RwLock::new(None),
        }
    }

    pub async fn status(&self) -> BackendStatus {
        self.state.read().await.status
    }

    pub async fn state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    pub async fn config(&self) -> BackendConfig {
        self.config.read().await.clone()
    }

    /// The server's handshake result, when connected at least once.
    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.read().await.clone()
    }

    /// Client handle for requests; fails fast when not `Connected`.
    pub async fn peer(&self) -> Result<Peer<RoleClient>, ProxyError> {
        if self.status().await != BackendStatus::Connected {
            return Err(ProxyError::BackendNotReady(self.name.clone()));
        }
        self.peer
            .read()
            .await
            .clone()
            .ok_or_else(|| ProxyError::BackendNotReady(self.name.clone()))
    }

    async fn set_status(&self, status: BackendStatus, error: Option<String>) {
        let mut state = self.state.write().await;
        state.status = status;
        if status == BackendStatus::Connected {
            state.last_connected = Some(Utc::now());
            state.last_error = None;
        }
        if let Some(error) = error {
            state.last_error = Some(error);
        }
    }

    async fn install(&self, service: RunningService<RoleClient, NotificationForwarder>) {
        *self.peer.write().await = Some(service.peer().clone());
        *self.server_info.write().await = service.peer_info().cloned();
        *self.service.lock().await = Some(service);
    }

    async fn teardown(&self) {
        *self.peer.write().await = None;
        let service = self.service.lock().await.take();
        if let Some(service) = service {
            let _ = service.cancel().await;
        }
    }
}

pub struct StatusReport {
    pub name: String,
    pub kind: &'static str,
    pub status: BackendStatus,
    pub tags: Vec<String>,
    pub last_error: Option<String>,
    pub last_connected: Option<DateTime<Utc>>,
}

impl StatusReport {
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "transport": self.kind,
            "status": self.status,
            "tags": self.tags,
            "lastError": self.last_error,
            "lastConnected": self.last_connected.map(|t| t.to_rfc3339()),
        })
    }
}

/// Connect retry policy: per-attempt wall clock, attempt count, and the
/// initial backoff (doubling, capped at 30 s).
#[derive(Debug, Clone, Copy)]
pub struct ConnectPolicy {
    pub attempt_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_initial: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            max_attempts: CONNECT_MAX_ATTEMPTS,
            backoff_initial: CONNECT_BACKOFF_INITIAL,
        }
    }
}

/// Owner of all outbound connections for the life of the process.
pub struct OutboundManager {
    connections: RwLock<HashMap<String, Arc<OutboundConnection>>>,
    events: broadcast::Sender<BackendEvent>,
    notices: mpsc::UnboundedSender<UpstreamNotice>,
    policy: ConnectPolicy,
}

impl OutboundManager {
    pub fn new(connect_timeout: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<UpstreamNotice>) {
        Self::with_policy(ConnectPolicy {
            attempt_timeout: connect_timeout,
            ..Default::default()
        })
    }

    pub fn with_policy(
        policy: ConnectPolicy,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<UpstreamNotice>) {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (notices, notices_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                connections: RwLock::new(HashMap::new()),
                events,
                notices,
                policy,
            }),
            notices_rx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: BackendEvent) {
        // No receivers is fine during startup and shutdown.
        let _ = self.events.send(event);
    }

    /// Start a backend. Repeat starts of a running backend are no-ops;
    /// disabled backends register but stay `Disconnected`.
    pub async fn start(&self, config: BackendConfig) -> Result<(), ProxyError> {
        let name = config.name.clone();
        let disabled = config.disabled;

        let connection = {
            let mut connections = self.connections.write().await;
            match connections.get(&name) {
                Some(existing) => {
                    let status = existing.status().await;
                    if matches!(status, BackendStatus::Connecting | BackendStatus::Connected) {
                        tracing::debug!(backend = %name, "start ignored: already running");
                        return Ok(());
                    }
                    *existing.config.write().await = config.clone();
                    existing.clone()
                }
                None => {
                    let connection = Arc::new(OutboundConnection::new(config.clone()));
                    connections.insert(name.clone(), connection.clone());
                    connection
                }
            }
        };

        if disabled {
            tracing::info!(backend = %name, "backend is disabled, skipping start");
            return Ok(());
        }

        connection.set_status(BackendStatus::Connecting, None).await;
        let mut backoff = self.policy.backoff_initial;
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            match self.connect_once(&connection).await {
                Ok(()) => {
                    connection.set_status(BackendStatus::Connected, None).await;
                    tracing::info!(backend = %name, attempt, "backend connected");
                    self.emit(BackendEvent::Up { name: name.clone() });
                    self.emit(BackendEvent::CapabilitiesChanged { name });
                    return Ok(());
                }
                Err(error) => {
                    last_error = error.to_string();
                    tracing::warn!(
                        backend = %name,
                        attempt,
                        error = %last_error,
                        "backend connect attempt failed"
                    );
                    connection.teardown().await;
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(CONNECT_BACKOFF_MAX);
                    }
                }
            }
        }

        connection
            .set_status(BackendStatus::Error, Some(last_error.clone()))
            .await;
        self.emit(BackendEvent::Down {
            name: name.clone(),
            reason: last_error.clone(),
        });
        Err(ProxyError::BackendStart {
            name,
            message: last_error,
        })
    }

    async fn connect_once(&self, connection: &OutboundConnection) -> Result<(), ProxyError> {
        let config = connection.config().await;
        let prepared = crate::transport::prepare(&config)?;
        let forwarder = NotificationForwarder {
            backend: connection.name.clone(),
            notices: self.notices.clone(),
        };

        let service = tokio::time::timeout(self.policy.attempt_timeout, async {
            let opened = crate::transport::connect(prepared).await?;
            let served = match opened {
                crate::transport::OpenTransport::Stdio(t) => forwarder.serve(t).await,
                crate::transport::OpenTransport::Sse(t) => forwarder.serve(t).await,
                crate::transport::OpenTransport::StreamableHttp(t) => forwarder.serve(t).await,
            };
            served.map_err(|error| ProxyError::BackendStart {
                name: connection.name.clone(),
                message: format!("handshake failed: {error}"),
            })
        })
        .await
        .map_err(|_| ProxyError::BackendStart {
            name: connection.name.clone(),
            message: format!(
                "connect timed out after {}s",
                self.policy.attempt_timeout.as_secs()
            ),
        })??;

        connection.install(service).await;
        Ok(())
    }

    /// Stop a backend, closing its transport. Safe on unknown names; the
    /// entry stays registered and resumable.
    pub async fn stop(&self, name: &str) {
        let connection = self.connections.read().await.get(name).cloned();
        let Some(connection) = connection else {
            return;
        };
        let was_ready = connection.status().await == BackendStatus::Connected;
        connection.teardown().await;
        connection
            .set_status(BackendStatus::Disconnected, None)
            .await;
        if was_ready {
            self.emit(BackendEvent::Down {
                name: name.to_string(),
                reason: "stopped".to_string(),
            });
        }
    }

    /// Stop a backend and drop it from the table entirely (template instance
    /// eviction).
    pub async fn remove(&self, name: &str) {
        self.stop(name).await;
        self.connections.write().await.remove(name);
    }

    /// `stop` then `start` under the same name. A failed start leaves the
    /// connection in `Error` and out of the ready set.
    pub async fn restart(&self, config: BackendConfig) -> Result<(), ProxyError> {
        self.stop(&config.name).await;
        if let Some(existing) = self.connections.read().await.get(&config.name) {
            *existing.config.write().await = config.clone();
        }
        self.start(config).await
    }

    /// Merge tag / filter-list changes without reconnecting. Emits a
    /// synthetic capabilities event so aggregated views refresh.
    pub async fn update_metadata(&self, name: &str, delta: &MetadataDelta) -> Result<(), ProxyError> {
        if delta.is_empty() {
            return Ok(());
        }
        let connection = self
            .connections
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::Config(format!("unknown backend '{name}'")))?;
        connection.config.write().await.merge_metadata(delta);
        self.emit(BackendEvent::CapabilitiesChanged {
            name: name.to_string(),
        });
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<OutboundConnection>> {
        self.connections.read().await.get(name).cloned()
    }

    pub async fn get_all(&self) -> Vec<Arc<OutboundConnection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Connected backends, sorted by name for deterministic aggregation.
    pub async fn ready(&self) -> Vec<Arc<OutboundConnection>> {
        let mut ready = Vec::new();
        for connection in self.get_all().await {
            if connection.status().await == BackendStatus::Connected {
                ready.push(connection);
            }
        }
        ready.sort_by(|a, b| a.name.cmp(&b.name));
        ready
    }

    pub async fn status(&self) -> BTreeMap<String, StatusReport> {
        let mut out = BTreeMap::new();
        for connection in self.get_all().await {
            let config = connection.config().await;
            let state = connection.state().await;
            out.insert(
                connection.name.clone(),
                StatusReport {
                    name: connection.name.clone(),
                    kind: config.kind.label(),
                    status: state.status,
                    tags: config.tags.iter().cloned().collect(),
                    last_error: state.last_error,
                    last_connected: state.last_connected,
                },
            );
        }
        out
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for name in names {
            self.stop(&name).await;
        }
    }
}

#[cfg(test)]
#[path = "upstream_tests.rs"]
mod tests;
