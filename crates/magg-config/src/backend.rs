use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use magg_core::ProxyError;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Transport kind of an outbound backend.
///
/// Serialized with lowercase names so TOML reads `type = "stdio"` etc.
/// `http` and `streamable-http` both speak the streamable HTTP transport;
/// the distinction is kept because configs declare either spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "stdio")]
    Stdio,
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "sse")]
    Sse,
    #[serde(rename = "streamable-http")]
    StreamableHttp,
}

impl BackendKind {
    /// Short human-readable label for the transport kind.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable-http",
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::Stdio)
    }
}

/// Allow/deny name lists applied to one capability kind of one backend.
///
/// A non-empty `enabled` list overrides `disabled` entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterList {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled: Vec<String>,
}

impl FilterList {
    pub fn admits(&self, name: &str) -> bool {
        if !self.enabled.is_empty() {
            return self.enabled.iter().any(|n| n == name);
        }
        !self.disabled.iter().any(|n| n == name)
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_empty() && self.disabled.is_empty()
    }
}

/// Template behavior block of a parameterized backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSettings {
    /// Instances with identical variable bindings may be shared across sessions.
    #[serde(default)]
    pub shareable: bool,
    /// Always materialize a dedicated instance per session; forces sharing off.
    #[serde(default)]
    pub per_client: bool,
    /// Upper bound on live instances for this template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instances: Option<usize>,
    /// Seconds an unreferenced instance survives before eviction.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout: u64,
    /// Permit template variables whose names look like credentials.
    #[serde(default)]
    pub allow_sensitive_data: bool,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            shareable: false,
            per_client: false,
            max_instances: None,
            idle_timeout: default_idle_timeout_secs(),
            allow_sensitive_data: false,
        }
    }
}

fn default_idle_timeout_secs() -> u64 {
    300
}

/// One outbound MCP backend as declared in `[mcpServers.<name>]` or
/// `[mcpTemplates.<name>]`.
///
/// # TOML formats
///
/// **Explicit kind:**
/// ```toml
/// [mcpServers.web]
/// type = "sse"
/// url = "https://example.com/sse"
/// tags = ["web"]
/// ```
///
/// **Inferred kind** (`command` implies stdio; a `url` ending in `/sse`
/// implies sse, any other `url` implies streamable HTTP):
/// ```toml
/// [mcpServers.fs]
/// command = "npx"
/// args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
/// tags = ["fs"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendConfig {
    pub name: String,
    pub kind: BackendKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Per-backend call timeout in seconds; the router default applies when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    pub tags: BTreeSet<String>,
    #[serde(skip_serializing_if = "FilterList::is_empty")]
    pub tools: FilterList,
    #[serde(skip_serializing_if = "FilterList::is_empty")]
    pub resources: FilterList,
    #[serde(skip_serializing_if = "FilterList::is_empty")]
    pub prompts: FilterList,
    pub disabled: bool,
    /// Parent environment variables forwarded to stdio children. `Some` is
    /// a strict allow list; without one only a minimal baseline (PATH,
    /// HOME, locale) passes through. The child never inherits the parent
    /// environment wholesale.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_allow: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env_deny: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateSettings>,
}

/// Raw TOML shape before kind inference and validation.
///
/// Unknown fields land in `unknown` and are logged as warnings rather than
/// rejected, so configs written for newer releases keep loading.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBackend {
    #[serde(rename = "type")]
    pub kind: Option<BackendKind>,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub timeout: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub enabled_tools: Vec<String>,
    #[serde(default)]
    pub disabled_tools: Vec<String>,
    #[serde(default)]
    pub enabled_resources: Vec<String>,
    #[serde(default)]
    pub disabled_resources: Vec<String>,
    #[serde(default)]
    pub enabled_prompts: Vec<String>,
    #[serde(default)]
    pub disabled_prompts: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
    pub env_allow: Option<Vec<String>>,
    #[serde(default)]
    pub env_deny: Vec<String>,
    pub template: Option<TemplateSettings>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, toml::Value>,
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("tag regex"))
}

/// True iff `tag` is a well-formed tag identifier.
pub fn is_valid_tag(tag: &str) -> bool {
    tag_regex().is_match(tag)
}

impl BackendConfig {
    /// Resolve a raw TOML table into a validated config.
    ///
    /// Infers the transport kind when `type` is absent: `command` means
    /// stdio, a `url` with a path ending in `/sse` means sse, any other
    /// `url` means streamable HTTP. Exactly one of `command`/`url` must be
    /// set, matching the declared or inferred kind.
    pub fn resolve(name: &str, raw: RawBackend) -> Result<Self, ProxyError> {
        for field in raw.unknown.keys() {
            tracing::warn!(backend = %name, field = %field, "ignoring unknown config field");
        }

        let kind = match raw.kind {
            Some(kind) => kind,
            None => infer_kind(name, raw.command.as_deref(), raw.url.as_deref())?,
        };

        match kind {
            BackendKind::Stdio => {
                if raw.command.as_deref().unwrap_or("").is_empty() {
                    return Err(ProxyError::Config(format!(
                        "backend '{name}': stdio transport requires 'command'"
                    )));
                }
                if raw.url.is_some() {
                    return Err(ProxyError::Config(format!(
                        "backend '{name}': 'command' and 'url' are mutually exclusive"
                    )));
                }
            }
            BackendKind::Http | BackendKind::Sse | BackendKind::StreamableHttp => {
                if raw.url.as_deref().unwrap_or("").is_empty() {
                    return Err(ProxyError::Config(format!(
                        "backend '{name}': {} transport requires 'url'",
                        kind.label()
                    )));
                }
                if raw.command.is_some() {
                    return Err(ProxyError::Config(format!(
                        "backend '{name}': 'command' and 'url' are mutually exclusive"
                    )));
                }
            }
        }

        let mut tags = BTreeSet::new();
        for tag in raw.tags {
            if !is_valid_tag(&tag) {
                return Err(ProxyError::Config(format!(
                    "backend '{name}': invalid tag '{tag}' \
                     (expected [A-Za-z_][A-Za-z0-9_-]*)"
                )));
            }
            tags.insert(tag);
        }

        Ok(Self {
            name: name.to_string(),
            kind,
            command: raw.command,
            args: raw.args,
            env: raw.env,
            cwd: raw.cwd,
            url: raw.url,
            headers: raw.headers,
            timeout: raw.timeout,
            tags,
            tools: FilterList {
                enabled: raw.enabled_tools,
                disabled: raw.disabled_tools,
            },
            resources: FilterList {
                enabled: raw.enabled_resources,
                disabled: raw.disabled_resources,
            },
            prompts: FilterList {
                enabled: raw.enabled_prompts,
                disabled: raw.disabled_prompts,
            },
            disabled: raw.disabled,
            env_allow: raw.env_allow,
            env_deny: raw.env_deny,
            template: raw.template,
        })
    }

    pub fn is_stdio(&self) -> bool {
        matches!(self.kind, BackendKind::Stdio)
    }

    pub fn is_template(&self) -> bool {
        self.template.is_some()
    }

    /// Merge non-transport metadata from `delta` into `self`.
    ///
    /// Tags and enable/disable lists replace wholesale when present in the
    /// delta; transport fields (command/args/url/headers/env/cwd) are never
    /// touched here, callers restart for those.
    pub fn merge_metadata(&mut self, delta: &MetadataDelta) {
        if let Some(tags) = &delta.tags {
            self.tags = tags.clone();
        }
        if let Some(tools) = &delta.tools {
            self.tools = tools.clone();
        }
        if let Some(resources) = &delta.resources {
            self.resources = resources.clone();
        }
        if let Some(prompts) = &delta.prompts {
            self.prompts = prompts.clone();
        }
        if let Some(timeout) = delta.timeout {
            self.timeout = Some(timeout);
        }
    }
}

/// Non-transport config fields that `update_metadata` may change without a
/// reconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataDelta {
    pub tags: Option<BTreeSet<String>>,
    pub tools: Option<FilterList>,
    pub resources: Option<FilterList>,
    pub prompts: Option<FilterList>,
    pub timeout: Option<u64>,
}

impl MetadataDelta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn infer_kind(
    name: &str,
    command: Option<&str>,
    url: Option<&str>,
) -> Result<BackendKind, ProxyError> {
    match (command, url) {
        (Some(_), None) => Ok(BackendKind::Stdio),
        (None, Some(url)) => {
            let path = url.split('?').next().unwrap_or(url);
            if path.trim_end_matches('/').ends_with("/sse") {
                Ok(BackendKind::Sse)
            } else {
                Ok(BackendKind::StreamableHttp)
            }
        }
        (Some(_), Some(_)) => Err(ProxyError::Config(format!(
            "backend '{name}': 'command' and 'url' are mutually exclusive"
        ))),
        (None, None) => Err(ProxyError::Config(format!(
            "backend '{name}': missing 'type' field; \
             set 'command' (stdio) or 'url' (sse / streamable-http)"
        ))),
    }
}

#[cfg(test)]
#[path = "backend_tests.rs"]
mod tests;
