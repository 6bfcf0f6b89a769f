//! Proxy configuration file (`~/.config/magg/config.toml`).
//!
//! Holds the outbound backend declarations (`[mcpServers.*]`), parameterized
//! backend templates (`[mcpTemplates.*]`), named presets, and the serving
//! knobs. Resolution order for the file location: explicit path, then
//! `$MAGG_CONFIG`, then the XDG config directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendConfig, RawBackend};
use crate::presets::PresetConfig;
use crate::substitute::expand_backend_fields;

const DEFAULT_HTTP_BIND: &str = "127.0.0.1";
const DEFAULT_HTTP_PORT: u16 = 0;
const DEFAULT_MAX_CONNECTIONS: usize = 32;
const DEFAULT_MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Serving knobs (`[server]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    #[serde(default = "default_http_bind")]
    pub http_bind: String,
    /// 0 binds an ephemeral port.
    #[serde(default)]
    pub http_port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
    /// Default per-call timeout; per-backend `timeout` overrides it.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Wall clock for inbound connects and outbound handshakes.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_bind: default_http_bind(),
            http_port: DEFAULT_HTTP_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_request_body_bytes: DEFAULT_MAX_REQUEST_BODY_BYTES,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

fn default_http_bind() -> String {
    DEFAULT_HTTP_BIND.to_string()
}
fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}
fn default_max_request_body_bytes() -> usize {
    DEFAULT_MAX_REQUEST_BODY_BYTES
}
fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}
fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

/// Scope validation settings (`[auth]`).
///
/// The token table is the boundary to the external OAuth2 provider: each
/// accepted bearer token maps to its granted scope list (`tag:<name>`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tokens: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default, rename = "mcpServers")]
    mcp_servers: BTreeMap<String, RawBackend>,
    #[serde(default, rename = "mcpTemplates")]
    mcp_templates: BTreeMap<String, RawBackend>,
    #[serde(default)]
    presets: BTreeMap<String, PresetConfig>,
    #[serde(default)]
    server: ServerSettings,
    #[serde(default)]
    auth: AuthSettings,
    #[serde(flatten)]
    unknown: BTreeMap<String, toml::Value>,
}

/// Fully resolved proxy configuration.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub backends: Vec<BackendConfig>,
    pub templates: Vec<BackendConfig>,
    pub presets: BTreeMap<String, PresetConfig>,
    pub server: ServerSettings,
    pub auth: AuthSettings,
}

impl ProxyConfig {
    /// Load from `path_override`, else `$MAGG_CONFIG`, else the XDG config
    /// file. A missing default file yields an empty config.
    pub fn load(path_override: Option<&Path>) -> Result<Self> {
        let path = match path_override {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os("MAGG_CONFIG") {
                Some(path) => PathBuf::from(path),
                None => {
                    let path = Self::default_path()?;
                    if !path.exists() {
                        return Ok(Self::default());
                    }
                    path
                }
            },
        };
        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::parse(&content, &|name| std::env::var(name).ok())
            .with_context(|| format!("Failed to load config: {}", path.display()))
    }

    /// Parse config text with an injectable environment, for tests.
    pub fn parse(content: &str, env_lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content).context("Failed to parse config TOML")?;
        for field in raw.unknown.keys() {
            tracing::warn!(field = %field, "ignoring unknown top-level config field");
        }

        let mut backends = Vec::new();
        for (name, mut entry) in raw.mcp_servers {
            expand_backend_fields(&mut entry, env_lookup)?;
            backends.push(BackendConfig::resolve(&name, entry)?);
        }

        let mut templates = Vec::new();
        for (name, mut entry) in raw.mcp_templates {
            // Template values keep their braces for session-time rendering;
            // only guarantee the block exists so the pool can read policy.
            entry.template.get_or_insert_with(Default::default);
            let config = BackendConfig::resolve(&name, entry)?;
            if backends.iter().any(|b| b.name == config.name) {
                anyhow::bail!(
                    "template '{}' collides with an mcpServers entry of the same name",
                    config.name
                );
            }
            templates.push(config);
        }

        Ok(Self {
            backends,
            templates,
            presets: raw.presets,
            server: raw.server,
            auth: raw.auth,
        })
    }

    /// Path to the config file: `~/.config/magg/config.toml`.
    pub fn default_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "magg")
            .context("Failed to determine config directory")?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }

    pub fn template(&self, name: &str) -> Option<&BackendConfig> {
        self.templates.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
#[path = "global_tests.rs"]
mod tests;
