//! Transport construction for outbound backends.
//!
//! `prepare` is pure: it validates the config shape and captures everything
//! needed to open the channel, but performs no I/O. The actual open happens
//! in the connection manager's `Connecting` transition via `connect`.

use std::collections::BTreeMap;

use magg_config::{BackendConfig, BackendKind};
use magg_core::ProxyError;
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use tokio::process::Command;

/// A validated, not-yet-opened channel description.
#[derive(Debug)]
pub enum PreparedTransport {
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: Option<String>,
    },
    Sse {
        url: String,
        headers: BTreeMap<String, String>,
    },
    StreamableHttp {
        url: String,
        headers: BTreeMap<String, String>,
    },
}

/// Build a transport description from a backend config without doing I/O.
pub fn prepare(config: &BackendConfig) -> Result<PreparedTransport, ProxyError> {
    match config.kind {
        BackendKind::Stdio => {
            let command = config.command.clone().ok_or_else(|| {
                ProxyError::Config(format!("backend '{}': missing command", config.name))
            })?;
            Ok(PreparedTransport::Stdio {
                command,
                args: config.args.clone(),
                env: child_environment(config),
                cwd: config.cwd.clone(),
            })
        }
        BackendKind::Sse => Ok(PreparedTransport::Sse {
            url: required_url(config)?,
            headers: config.headers.clone(),
        }),
        BackendKind::Http | BackendKind::StreamableHttp => Ok(PreparedTransport::StreamableHttp {
            url: required_url(config)?,
            headers: config.headers.clone(),
        }),
    }
}

fn required_url(config: &BackendConfig) -> Result<String, ProxyError> {
    config
        .url
        .clone()
        .ok_or_else(|| ProxyError::Config(format!("backend '{}': missing url", config.name)))
}

/// Variables a child may see when the backend declares no `envAllow` list.
/// Everything else in the proxy's environment stays with the proxy.
const ENV_BASELINE: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "SHELL", "TERM", "TMPDIR", "LANG", "TZ",
];

fn baseline_admits(key: &str) -> bool {
    ENV_BASELINE.contains(&key) || key.starts_with("LC_")
}

/// Environment a stdio child starts with: the parent environment filtered
/// through the backend's allow/deny lists, then the config `env` overrides.
pub(crate) fn child_environment(config: &BackendConfig) -> BTreeMap<String, String> {
    let mut env = filtered_parent_environment(config);
    for (key, value) in &config.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// The parent environment reduced to what the backend may observe. Without
/// an `envAllow` list only the baseline passes; the child never inherits
/// the parent environment wholesale.
pub(crate) fn filtered_parent_environment(config: &BackendConfig) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for (key, value) in std::env::vars() {
        let allowed = match &config.env_allow {
            Some(allow) => allow.iter().any(|k| k == &key),
            None => baseline_admits(&key),
        };
        if allowed && !config.env_deny.iter().any(|k| k == &key) {
            env.insert(key, value);
        }
    }
    env
}

/// Concrete rmcp transport, produced by opening a prepared description.
pub enum OpenTransport {
    Stdio(TokioChildProcess),
    Sse(SseClientTransport<reqwest::Client>),
    StreamableHttp(StreamableHttpClientTransport<reqwest::Client>),
}

/// Open the channel. Spawns the child process or sets up the HTTP client;
/// the MCP handshake itself happens when the client service starts.
pub async fn connect(prepared: PreparedTransport) -> Result<OpenTransport, ProxyError> {
    match prepared {
        PreparedTransport::Stdio {
            command,
            args,
            env,
            cwd,
        } => {
            let mut cmd = Command::new(&command);
            cmd.args(&args);
            cmd.env_clear();
            cmd.envs(&env);
            if let Some(cwd) = &cwd {
                cmd.current_dir(cwd);
            }
            cmd.kill_on_drop(true);
            let child = TokioChildProcess::new(cmd).map_err(|error| ProxyError::BackendStart {
                name: command.clone(),
                message: format!("failed to spawn child process: {error}"),
            })?;
            Ok(OpenTransport::Stdio(child))
        }
        PreparedTransport::Sse { url, headers } => {
            let client = http_client(&headers)?;
            let transport = SseClientTransport::start_with_client(
                client,
                SseClientConfig {
                    sse_endpoint: url.clone().into(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|error| ProxyError::BackendStart {
                name: url,
                message: format!("failed to open SSE stream: {error}"),
            })?;
            Ok(OpenTransport::Sse(transport))
        }
        PreparedTransport::StreamableHttp { url, headers } => {
            let client = http_client(&headers)?;
            let transport = StreamableHttpClientTransport::with_client(
                client,
                StreamableHttpClientTransportConfig {
                    uri: url.into(),
                    ..Default::default()
                },
            );
            Ok(OpenTransport::StreamableHttp(transport))
        }
    }
}

fn http_client(headers: &BTreeMap<String, String>) -> Result<reqwest::Client, ProxyError> {
    let mut map = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| ProxyError::Config(format!("invalid header name '{key}'")))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|_| ProxyError::Config(format!("invalid value for header '{key}'")))?;
        map.insert(name, value);
    }
    reqwest::Client::builder()
        .default_headers(map)
        .build()
        .map_err(|error| ProxyError::Internal(format!("failed to build HTTP client: {error}")))
}
