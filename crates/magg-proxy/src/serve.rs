//! Process assembly and serving surfaces.
//!
//! `magg serve` hosts sessions over HTTP+SSE (filter negotiated via query
//! parameters) or a single stdio session, plus a unix control socket for
//! `magg status` / `magg stop`.

#[cfg(not(unix))]
compile_error!("the magg control socket requires a Unix platform");

use std::collections::HashMap;
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::Router;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::StreamExt;
use magg_config::{AuthSettings, ProxyConfig};
use magg_core::ProxyError;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::aggregate::CapabilityAggregator;
use crate::broker::{NotificationBroker, spawn_broker_task};
use crate::filter::{FILTER_EXAMPLES, TagFilter};
use crate::internal::InternalProvider;
use crate::pool::TemplatePool;
use crate::router::RequestRouter;
use crate::scope::{bearer_token, validate_filter_scopes};
use crate::session::{SessionManager, SessionOptions, SessionTransport};
use crate::upstream::{OutboundManager, UpstreamNotice};

const SSE_PATH: &str = "/sse";
const MESSAGE_PATH: &str = "/message";
const DUPLEX_BUFFER: usize = 64 * 1024;

/// CLI-facing serve options.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    pub config_path: Option<PathBuf>,
    pub socket_override: Option<PathBuf>,
    pub http_bind_override: Option<String>,
    pub http_port_override: Option<u16>,
    /// Host one session on stdin/stdout instead of HTTP.
    pub stdio: bool,
    pub tags: Option<String>,
    pub tag_filter: Option<String>,
    pub preset: Option<String>,
}

/// All engine singletons, constructed at startup, torn down at shutdown.
pub struct ProxyEngine {
    pub config: ProxyConfig,
    pub manager: Arc<OutboundManager>,
    pub internal: Arc<InternalProvider>,
    pub aggregator: Arc<CapabilityAggregator>,
    pub pool: Arc<TemplatePool>,
    pub router: Arc<RequestRouter>,
    pub broker: Arc<NotificationBroker>,
    pub sessions: Arc<SessionManager>,
}

impl ProxyEngine {
    pub fn build(config: ProxyConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<UpstreamNotice>) {
        let request_timeout = Duration::from_secs(config.server.request_timeout_secs);
        let connect_timeout = Duration::from_secs(config.server.connect_timeout_secs);

        let (manager, notices_rx) = OutboundManager::new(connect_timeout);
        let session_count = Arc::new(AtomicUsize::new(0));
        let internal = InternalProvider::new(manager.clone(), session_count.clone());
        let aggregator =
            CapabilityAggregator::new(manager.clone(), internal.clone(), request_timeout);
        let pool = TemplatePool::new(manager.clone(), aggregator.clone());
        let router = RequestRouter::new(
            manager.clone(),
            aggregator.clone(),
            internal.clone(),
            request_timeout,
        );
        let broker = NotificationBroker::new();
        let sessions = SessionManager::new(
            router.clone(),
            aggregator.clone(),
            pool.clone(),
            broker.clone(),
            config.templates.clone(),
            config.presets.clone(),
            session_count,
        );

        (
            Arc::new(Self {
                config,
                manager,
                internal,
                aggregator,
                pool,
                router,
                broker,
                sessions,
            }),
            notices_rx,
        )
    }

    /// Start every configured backend concurrently; failures log and leave
    /// the backend in `Error` without blocking the rest.
    pub async fn start_backends(&self) {
        let mut join_set = JoinSet::new();
        for backend in &self.config.backends {
            let manager = self.manager.clone();
            let backend = backend.clone();
            join_set.spawn(async move {
                let name = backend.name.clone();
                if let Err(error) = manager.start(backend).await {
                    tracing::warn!(backend = %name, error = %error, "backend failed to start");
                }
            });
        }
        while join_set.join_next().await.is_some() {}
        self.aggregator.refresh().await;
    }

    pub async fn status_payload(&self) -> Value {
        let backends: Vec<Value> = self
            .manager
            .status()
            .await
            .values()
            .map(|report| report.to_json())
            .collect();
        let snapshot = self.aggregator.current().await;
        let instances: Vec<Value> = self
            .pool
            .instances()
            .await
            .into_iter()
            .map(|i| {
                json!({
                    "template": i.template,
                    "instanceId": i.instance_id,
                    "referenceCount": i.reference_count,
                    "idle": i.idle,
                })
            })
            .collect();
        json!({
            "running": true,
            "backends": backends,
            "templateInstances": instances,
            "sessions": self.sessions.count(),
            "tools": snapshot.tools.len(),
            "resources": snapshot.resources.len(),
            "prompts": snapshot.prompts.len(),
        })
    }

    /// Shutdown: sessions first (forced), then backends.
    pub async fn shutdown(&self) {
        self.sessions.disconnect_all(true).await;
        self.manager.stop_all().await;
    }
}

pub async fn handle_serve_command(opts: ServeOptions) -> Result<()> {
    let config = ProxyConfig::load(opts.config_path.as_deref())?;
    run_proxy(config, opts).await
}

pub async fn handle_status_command(
    socket_override: Option<PathBuf>,
    format: magg_core::OutputFormat,
) -> Result<()> {
    let socket_path = socket_override.unwrap_or_else(default_socket_path);
    match send_control_request(&socket_path, "proxy/status").await {
        Ok(response) => {
            let Some(result) = response.get("result") else {
                println!(
                    "magg responded at {}, but the status payload was empty",
                    socket_path.display()
                );
                return Ok(());
            };
            match format {
                magg_core::OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(result)?);
                }
                magg_core::OutputFormat::Text => {
                    println!("magg is running at {}", socket_path.display());
                    println!(
                        "  sessions: {}  tools: {}  resources: {}  prompts: {}",
                        result["sessions"], result["tools"], result["resources"], result["prompts"],
                    );
                    for backend in result["backends"].as_array().into_iter().flatten() {
                        println!(
                            "  backend {} [{}] {}",
                            backend["name"].as_str().unwrap_or("?"),
                            backend["transport"].as_str().unwrap_or("?"),
                            backend["status"].as_str().unwrap_or("?"),
                        );
                    }
                }
            }
        }
        Err(_) => {
            println!("magg is not running at {}", socket_path.display());
        }
    }
    Ok(())
}

pub async fn handle_stop_command(socket_override: Option<PathBuf>) -> Result<()> {
    let socket_path = socket_override.unwrap_or_else(default_socket_path);
    let response = send_control_request(&socket_path, "proxy/stop")
        .await
        .with_context(|| format!("failed to stop magg at {}", socket_path.display()))?;
    if response.get("error").is_some() {
        bail!("magg returned an error while stopping: {response}");
    }
    println!("magg stop signal sent to {}", socket_path.display());
    Ok(())
}

pub(crate) async fn run_proxy(config: ProxyConfig, opts: ServeOptions) -> Result<()> {
    let (engine, notices_rx) = ProxyEngine::build(config);
    let shutdown = CancellationToken::new();

    engine.start_backends().await;
    let broker_task = spawn_broker_task(
        engine.broker.clone(),
        engine.manager.clone(),
        engine.aggregator.clone(),
        notices_rx,
        shutdown.clone(),
    );
    let reaper_task = engine.pool.spawn_reaper(shutdown.clone());

    let result = if opts.stdio {
        run_stdio_session(&engine, &opts).await
    } else {
        run_http_server(&engine, &opts, shutdown.clone()).await
    };

    shutdown.cancel();
    engine.shutdown().await;
    let _ = broker_task.await;
    let _ = reaper_task.await;
    result
}

async fn run_stdio_session(engine: &Arc<ProxyEngine>, opts: &ServeOptions) -> Result<()> {
    let filter = TagFilter::from_params(
        opts.tags.as_deref(),
        opts.tag_filter.as_deref(),
        opts.preset.as_deref(),
        engine.sessions.presets(),
    )
    .map_err(|error| anyhow::anyhow!(error.to_string()))?;

    let session_id = Ulid::new().to_string().to_lowercase();
    engine
        .sessions
        .connect(
            SessionTransport::Stdio(tokio::io::stdin(), tokio::io::stdout()),
            session_id.clone(),
            SessionOptions {
                filter,
                context: None,
                transport_kind: "stdio",
            },
        )
        .await
        .map_err(|error| anyhow::anyhow!(error.to_string()))?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                if engine.sessions.get(&session_id).await.is_none() {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// The proxy's control endpoint: a 0600 unix socket plus its pid file,
/// both removed on close. Binding replaces anything a dead process left
/// behind.
struct ControlSocket {
    listener: tokio::net::UnixListener,
    socket_path: PathBuf,
    pid_path: PathBuf,
}

impl ControlSocket {
    async fn bind(socket_path: PathBuf) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("cannot create control directory {}", parent.display())
                })?;
                restrict_mode(parent, 0o700).await?;
            }
        }

        match tokio::fs::remove_file(&socket_path).await {
            Ok(()) => {
                tracing::debug!(path = %socket_path.display(), "replaced stale control socket");
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(error).with_context(|| {
                    format!("cannot replace stale control socket {}", socket_path.display())
                });
            }
        }

        let listener = tokio::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("cannot bind control socket {}", socket_path.display()))?;
        restrict_mode(&socket_path, 0o600).await?;

        let pid_path = pid_path_for_socket(&socket_path);
        tokio::fs::write(&pid_path, format!("{}\n", std::process::id()))
            .await
            .with_context(|| format!("cannot write pid file {}", pid_path.display()))?;

        Ok(Self {
            listener,
            socket_path,
            pid_path,
        })
    }

    async fn accept(&self) -> std::io::Result<tokio::net::UnixStream> {
        self.listener.accept().await.map(|(stream, _addr)| stream)
    }

    async fn close(self) {
        for path in [&self.socket_path, &self.pid_path] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "leaving control file behind");
                }
            }
        }
    }
}

async fn restrict_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("cannot chmod {mode:o} on {}", path.display()))
}

#[derive(Clone)]
struct HttpState {
    engine: Arc<ProxyEngine>,
    auth: AuthSettings,
    connect_timeout: Duration,
    posts: Arc<RwLock<HashMap<String, PostChannel>>>,
    permits: Arc<Semaphore>,
}

type PostChannel = Arc<Mutex<WriteHalf<tokio::io::DuplexStream>>>;

async fn run_http_server(
    engine: &Arc<ProxyEngine>,
    opts: &ServeOptions,
    shutdown: CancellationToken,
) -> Result<()> {
    let server = &engine.config.server;
    let bind = opts
        .http_bind_override
        .clone()
        .unwrap_or_else(|| server.http_bind.clone());
    let port = opts.http_port_override.unwrap_or(server.http_port);
    let bind_addr = format!("{bind}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid HTTP bind address '{bind}:{port}'"))?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind HTTP endpoint at {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve local HTTP address")?;

    let state = HttpState {
        engine: engine.clone(),
        auth: engine.config.auth.clone(),
        connect_timeout: Duration::from_secs(server.connect_timeout_secs),
        posts: Arc::new(RwLock::new(HashMap::new())),
        permits: Arc::new(Semaphore::new(server.max_connections.max(1))),
    };
    let app = Router::new()
        .route(SSE_PATH, get(handle_sse))
        .route(MESSAGE_PATH, post(handle_message))
        .layer(DefaultBodyLimit::max(server.max_request_body_bytes))
        .with_state(state);

    let socket_path = opts.socket_override.clone().unwrap_or_else(default_socket_path);
    let control = ControlSocket::bind(socket_path.clone()).await?;

    println!(
        "magg listening on http://{local_addr}{SSE_PATH} (control: unix://{})",
        socket_path.display()
    );

    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                server_shutdown.cancelled().await;
            })
            .await
        {
            tracing::warn!(error = %error, "HTTP server stopped with error");
        }
    });

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let _ = stop_tx.send(true);
            }
            changed = stop_rx.changed() => {
                if changed.is_ok() && *stop_rx.borrow() {
                    break;
                }
            }
            accepted = control.accept() => {
                let stream = accepted.context("failed to accept control client")?;
                let engine = engine.clone();
                let stop_tx = stop_tx.clone();
                tokio::spawn(async move {
                    if let Err(error) = handle_control_connection(stream, engine, stop_tx).await {
                        tracing::warn!(error = %error, "control connection failed");
                    }
                });
            }
        }
    }

    shutdown.cancel();
    let _ = server_task.await;
    control.close().await;
    Ok(())
}

fn error_response(status: StatusCode, code: &str, error: &ProxyError) -> Response {
    let mut body = json!({
        "error": {
            "code": code,
            "message": error.to_string(),
        }
    });
    if matches!(error, ProxyError::InvalidParams(_)) {
        body["error"]["examples"] = json!(FILTER_EXAMPLES);
    }
    (status, axum::Json(body)).into_response()
}

/// Keeps session teardown tied to the SSE response stream's lifetime.
struct SessionCleanup {
    session_id: String,
    engine: Arc<ProxyEngine>,
    posts: Arc<RwLock<HashMap<String, PostChannel>>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for SessionCleanup {
    fn drop(&mut self) {
        let session_id = self.session_id.clone();
        let engine = self.engine.clone();
        let posts = self.posts.clone();
        tokio::spawn(async move {
            posts.write().await.remove(&session_id);
            engine.sessions.disconnect(&session_id, false).await;
        });
    }
}

async fn handle_sse(
    State(state): State<HttpState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let filter = match TagFilter::from_params(
        params.get("tags").map(String::as_str),
        params.get("tag-filter").map(String::as_str),
        params.get("preset").map(String::as_str),
        state.engine.sessions.presets(),
    ) {
        Ok(filter) => filter,
        Err(error) => return error_response(StatusCode::BAD_REQUEST, "InvalidParams", &error),
    };

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token);
    if let Err(error) = validate_filter_scopes(&filter, &state.auth, bearer) {
        return error_response(StatusCode::FORBIDDEN, "insufficient_scope", &error);
    }

    let context = params
        .get("context")
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok());

    let Ok(permit) = state.permits.clone().try_acquire_owned() else {
        let error = ProxyError::Internal("connection limit reached".to_string());
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "InternalError", &error);
    };

    let session_id = Ulid::new().to_string().to_lowercase();
    let (proxy_io, bridge_io) = tokio::io::duplex(DUPLEX_BUFFER);
    let (bridge_read, bridge_write) = tokio::io::split(bridge_io);

    let connected = tokio::time::timeout(
        state.connect_timeout,
        state.engine.sessions.connect(
            SessionTransport::Duplex(proxy_io),
            session_id.clone(),
            SessionOptions {
                filter,
                context,
                transport_kind: "sse",
            },
        ),
    )
    .await;
    match connected {
        Ok(Ok(_session)) => {}
        Ok(Err(error)) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", &error);
        }
        Err(_) => {
            let error = ProxyError::Internal(format!(
                "session connect timed out after {}s",
                state.connect_timeout.as_secs()
            ));
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", &error);
        }
    }

    state
        .posts
        .write()
        .await
        .insert(session_id.clone(), Arc::new(Mutex::new(bridge_write)));

    let cleanup = SessionCleanup {
        session_id: session_id.clone(),
        engine: state.engine.clone(),
        posts: state.posts.clone(),
        _permit: permit,
    };

    let endpoint = format!("{MESSAGE_PATH}?sessionId={session_id}");
    let endpoint_event = futures::stream::once(async move {
        Ok::<Event, std::convert::Infallible>(Event::default().event("endpoint").data(endpoint))
    });
    let messages = futures::stream::unfold(
        (BufReader::new(bridge_read), cleanup),
        |(mut reader, cleanup)| async move {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => None,
                Ok(_) => {
                    let event = Event::default()
                        .event("message")
                        .data(line.trim_end().to_string());
                    Some((Ok(event), (reader, cleanup)))
                }
            }
        },
    );

    Sse::new(endpoint_event.chain(messages))
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn handle_message(
    State(state): State<HttpState>,
    Query(params): Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> Response {
    let Some(session_id) = params.get("sessionId") else {
        let error = ProxyError::InvalidParams("missing sessionId".to_string());
        return error_response(StatusCode::BAD_REQUEST, "InvalidParams", &error);
    };
    let channel = state.posts.read().await.get(session_id).cloned();
    let Some(channel) = channel else {
        let error = ProxyError::InvalidParams(format!("unknown session '{session_id}'"));
        return error_response(StatusCode::NOT_FOUND, "InvalidParams", &error);
    };

    let mut writer = channel.lock().await;
    if writer.write_all(&body).await.is_err() || writer.write_all(b"\n").await.is_err() {
        let error = ProxyError::Internal("session stream closed".to_string());
        return error_response(StatusCode::GONE, "InternalError", &error);
    }
    if writer.flush().await.is_err() {
        let error = ProxyError::Internal("session stream closed".to_string());
        return error_response(StatusCode::GONE, "InternalError", &error);
    }
    StatusCode::ACCEPTED.into_response()
}

async fn handle_control_connection(
    stream: tokio::net::UnixStream,
    engine: Arc<ProxyEngine>,
    stop_tx: tokio::sync::watch::Sender<bool>,
) -> Result<()> {
    let peer_uid = stream
        .peer_cred()
        .context("failed to read peer credentials")?
        .uid();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let bytes = reader
        .read_line(&mut line)
        .await
        .context("failed to read control request")?;
    if bytes == 0 || line.trim().is_empty() {
        return Ok(());
    }

    let request: Value = match serde_json::from_str(line.trim()) {
        Ok(value) => value,
        Err(error) => {
            write_json_line(
                &mut write_half,
                &jsonrpc_error(None, -32700, format!("invalid control request: {error}")),
            )
            .await?;
            return Ok(());
        }
    };
    let method = request.get("method").and_then(Value::as_str);
    let request_id = request.get("id").cloned();

    match method {
        Some("proxy/status") => {
            let result = engine.status_payload().await;
            write_json_line(&mut write_half, &jsonrpc_result(request_id, result)).await?;
        }
        Some("proxy/stop") => {
            if peer_uid != current_uid() {
                write_json_line(
                    &mut write_half,
                    &jsonrpc_error(
                        request_id,
                        -32004,
                        "permission denied: peer uid does not match proxy uid".to_string(),
                    ),
                )
                .await?;
                return Ok(());
            }
            let _ = stop_tx.send(true);
            write_json_line(
                &mut write_half,
                &jsonrpc_result(request_id, json!({"stopping": true})),
            )
            .await?;
        }
        other => {
            write_json_line(
                &mut write_half,
                &jsonrpc_error(
                    request_id,
                    -32601,
                    format!("unknown control method: {other:?}"),
                ),
            )
            .await?;
        }
    }
    Ok(())
}

async fn write_json_line<W: AsyncWrite + Unpin>(writer: &mut W, value: &Value) -> Result<()> {
    let payload = serde_json::to_string(value).context("failed to serialize control payload")?;
    writer
        .write_all(payload.as_bytes())
        .await
        .context("failed to write control payload")?;
    writer
        .write_all(b"\n")
        .await
        .context("failed to write control delimiter")?;
    writer.flush().await.context("failed to flush control payload")
}

fn jsonrpc_result(id: Option<Value>, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

fn jsonrpc_error(id: Option<Value>, code: i64, message: String) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

async fn send_control_request(socket_path: &Path, method: &str) -> Result<Value> {
    let mut stream = tokio::net::UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("no proxy listening at {}", socket_path.display()))?;
    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
    });

    let payload = serde_json::to_string(&request).context("failed to serialize control request")?;
    stream
        .write_all(payload.as_bytes())
        .await
        .context("failed to write control request")?;
    stream
        .write_all(b"\n")
        .await
        .context("failed to write control request delimiter")?;
    stream
        .flush()
        .await
        .context("failed to flush control request")?;

    let mut line = String::new();
    let mut reader = BufReader::new(stream);
    let bytes = reader
        .read_line(&mut line)
        .await
        .context("failed to read control response")?;
    if bytes == 0 {
        bail!("magg closed the connection before responding");
    }
    serde_json::from_str(line.trim()).context("failed to parse control response")
}

pub(crate) fn default_socket_path() -> PathBuf {
    socket_path_from_runtime_dir(
        std::env::var("XDG_RUNTIME_DIR").ok().as_deref(),
        current_uid(),
    )
}

fn socket_path_from_runtime_dir(runtime_dir: Option<&str>, uid: u32) -> PathBuf {
    if let Some(runtime_dir) = runtime_dir {
        return PathBuf::from(runtime_dir).join("magg").join("control.sock");
    }
    PathBuf::from("/tmp")
        .join(format!("magg-{uid}"))
        .join("control.sock")
}

fn pid_path_for_socket(socket_path: &Path) -> PathBuf {
    let mut buf: OsString = socket_path.as_os_str().to_owned();
    buf.push(".pid");
    PathBuf::from(buf)
}

fn current_uid() -> u32 {
    // SAFETY: `geteuid` has no preconditions and returns caller effective UID.
    unsafe { libc::geteuid() }
}

#[cfg(test)]
mod tests {
    use super::{
        ControlSocket, ProxyEngine, handle_control_connection, pid_path_for_socket,
        send_control_request, socket_path_from_runtime_dir,
    };

    #[test]
    fn socket_path_prefers_xdg_runtime_dir() {
        let path = socket_path_from_runtime_dir(Some("/tmp/xdg-test"), 1000);
        assert_eq!(path, std::path::Path::new("/tmp/xdg-test/magg/control.sock"));
    }

    #[test]
    fn socket_path_falls_back_to_tmp_with_uid() {
        let path = socket_path_from_runtime_dir(None, 1001);
        let text = path.to_string_lossy();
        assert!(text.starts_with("/tmp/magg-1001"), "got {text}");
        assert!(text.ends_with("/control.sock"));
    }

    #[tokio::test]
    async fn control_socket_binds_restrictively_and_cleans_up() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir()?;
        let socket_path = temp.path().join("magg").join("control.sock");
        let control = ControlSocket::bind(socket_path.clone()).await?;

        let pid_path = pid_path_for_socket(&socket_path);
        let pid_text = std::fs::read_to_string(&pid_path)?;
        assert_eq!(pid_text.trim(), std::process::id().to_string());

        let socket_mode = std::fs::metadata(&socket_path)?.permissions().mode() & 0o777;
        assert_eq!(socket_mode, 0o600);
        let parent = socket_path.parent().expect("socket parent");
        let parent_mode = std::fs::metadata(parent)?.permissions().mode() & 0o777;
        assert_eq!(parent_mode, 0o700);

        // Dropping without close leaves files behind, as a crash would;
        // the next bind replaces the stale socket.
        drop(control);
        assert!(socket_path.exists());
        let control = ControlSocket::bind(socket_path.clone()).await?;

        control.close().await;
        assert!(!socket_path.exists());
        assert!(!pid_path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn control_status_round_trip_through_engine() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let socket_path = temp.path().join("control.sock");
        let control = ControlSocket::bind(socket_path.clone()).await?;
        let (engine, _notices) = ProxyEngine::build(magg_config::ProxyConfig::default());

        let server = tokio::spawn(async move {
            let stream = control.accept().await.expect("accept control client");
            let (stop_tx, _stop_rx) = tokio::sync::watch::channel(false);
            handle_control_connection(stream, engine, stop_tx)
                .await
                .expect("handle control request");
            control.close().await;
        });

        let response = send_control_request(&socket_path, "proxy/status").await?;
        assert_eq!(response["result"]["running"], true);
        assert_eq!(response["result"]["sessions"], 0);

        server.await?;
        assert!(!socket_path.exists(), "close removed the socket");
        Ok(())
    }

    #[tokio::test]
    async fn control_rejects_unknown_methods() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let socket_path = temp.path().join("control.sock");
        let control = ControlSocket::bind(socket_path.clone()).await?;
        let (engine, _notices) = ProxyEngine::build(magg_config::ProxyConfig::default());

        let server = tokio::spawn(async move {
            let stream = control.accept().await.expect("accept control client");
            let (stop_tx, _stop_rx) = tokio::sync::watch::channel(false);
            handle_control_connection(stream, engine, stop_tx)
                .await
                .expect("handle control request");
            control.close().await;
        });

        let response = send_control_request(&socket_path, "proxy/selfdestruct").await?;
        assert_eq!(response["error"]["code"], -32601);

        server.await?;
        Ok(())
    }

    #[tokio::test]
    async fn status_payload_shape() {
        let (engine, _notices) = ProxyEngine::build(magg_config::ProxyConfig::default());
        let payload = engine.status_payload().await;
        assert_eq!(payload["running"], true);
        assert_eq!(payload["sessions"], 0);
        assert!(payload["backends"].as_array().unwrap().is_empty());
    }
}
