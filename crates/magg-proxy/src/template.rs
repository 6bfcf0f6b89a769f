//! Session-time rendering of `{namespace.path | filter(...)}` expressions in
//! template backend configs.
//!
//! Namespaces: `project`, `user`, `environment.variables.*`, `context`,
//! `transport`. A `?` suffix tolerates missing values, `?:default` supplies
//! one. Values flow through an optional pipeline of filters.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use chrono::Utc;
use magg_config::BackendConfig;
use magg_core::ProxyError;
use regex::Regex;
use sha2::{Digest, Sha256};

const MAX_TEMPLATE_LEN: usize = 10_000;
const MAX_VARIABLE_DEPTH: usize = 5;
const SHORT_HASH_LEN: usize = 8;

fn sensitive_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)password|secret|token|key|auth|credential|private")
            .expect("sensitive identifier regex")
    })
}

/// Per-session variable bindings a template renders against.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    pub project: ProjectInfo,
    pub user: UserInfo,
    /// Already filtered through the backend's env allow/deny lists.
    pub environment: BTreeMap<String, String>,
    pub session: SessionInfo,
    pub transport: TransportInfo,
    pub allow_sensitive_data: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectInfo {
    pub path: Option<String>,
    pub name: Option<String>,
    pub env: Option<String>,
    pub git_branch: Option<String>,
    pub git_commit: Option<String>,
    pub git_repository: Option<String>,
    pub git_is_repo: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    pub username: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub home: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub shell: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub path: Option<String>,
    pub timestamp: Option<String>,
    pub session_id: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TransportInfo {
    pub kind: Option<String>,
    pub connection_id: Option<String>,
    pub connection_timestamp: Option<String>,
}

impl RenderContext {
    /// Build the standard context for one session.
    ///
    /// `client_context` is the opaque object the client sent at connect; it
    /// feeds the `project` namespace and `context.path`. Git facts resolve
    /// only from it, never from a subprocess.
    pub fn for_session(
        session_id: &str,
        transport_kind: &str,
        connection_id: &str,
        environment: BTreeMap<String, String>,
        client_context: Option<&serde_json::Value>,
    ) -> Self {
        let now = Utc::now().to_rfc3339();
        let mut ctx = Self {
            environment,
            session: SessionInfo {
                path: None,
                timestamp: Some(now.clone()),
                session_id: Some(session_id.to_string()),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
            transport: TransportInfo {
                kind: Some(transport_kind.to_string()),
                connection_id: Some(connection_id.to_string()),
                connection_timestamp: Some(now),
            },
            ..Default::default()
        };

        ctx.user = UserInfo {
            username: std::env::var("USER").ok(),
            name: None,
            email: None,
            home: std::env::var("HOME").ok(),
            uid: Some(process_uid()),
            gid: Some(process_gid()),
            shell: std::env::var("SHELL").ok(),
        };

        if let Some(value) = client_context {
            ctx.apply_client_context(value);
        }
        ctx
    }

    fn apply_client_context(&mut self, value: &serde_json::Value) {
        let get = |path: &[&str]| -> Option<String> {
            let mut cursor = value;
            for segment in path {
                cursor = cursor.get(segment)?;
            }
            cursor.as_str().map(str::to_string)
        };

        self.project.path = get(&["project", "path"]).or(self.project.path.take());
        self.project.name = get(&["project", "name"]).or(self.project.name.take());
        self.project.env = get(&["project", "env"]).or(self.project.env.take());
        self.project.git_branch = get(&["project", "git", "branch"]);
        self.project.git_commit = get(&["project", "git", "commit"]);
        self.project.git_repository = get(&["project", "git", "repository"]);
        self.project.git_is_repo = value
            .pointer("/project/git/isRepo")
            .and_then(serde_json::Value::as_bool);
        self.session.path = get(&["path"]).or_else(|| self.project.path.clone());
    }

    fn lookup(&self, path: &[&str]) -> Option<String> {
        match path {
            ["project", "path"] => self.project.path.clone(),
            ["project", "name"] => self.project.name.clone(),
            ["project", "env"] => self.project.env.clone(),
            ["project", "git", "branch"] => self.project.git_branch.clone(),
            ["project", "git", "commit"] => self.project.git_commit.clone(),
            ["project", "git", "repository"] => self.project.git_repository.clone(),
            ["project", "git", "isRepo"] => self.project.git_is_repo.map(|b| b.to_string()),
            ["user", "username"] => self.user.username.clone(),
            ["user", "name"] => self.user.name.clone(),
            ["user", "email"] => self.user.email.clone(),
            ["user", "home"] => self.user.home.clone(),
            ["user", "uid"] => self.user.uid.map(|v| v.to_string()),
            ["user", "gid"] => self.user.gid.map(|v| v.to_string()),
            ["user", "shell"] => self.user.shell.clone(),
            ["environment", "variables", name] => self.environment.get(*name).cloned(),
            ["context", "path"] => self.session.path.clone(),
            ["context", "timestamp"] => self.session.timestamp.clone(),
            ["context", "sessionId"] => self.session.session_id.clone(),
            ["context", "version"] => self.session.version.clone(),
            ["transport", "type"] => self.transport.kind.clone(),
            ["transport", "connectionId"] => self.transport.connection_id.clone(),
            ["transport", "connectionTimestamp"] => self.transport.connection_timestamp.clone(),
            _ => None,
        }
    }
}

fn process_uid() -> u32 {
    #[cfg(unix)]
    {
        // SAFETY: `geteuid` has no preconditions and returns caller effective UID.
        unsafe { libc::geteuid() }
    }
    #[cfg(not(unix))]
    {
        0
    }
}

fn process_gid() -> u32 {
    #[cfg(unix)]
    {
        // SAFETY: `getegid` has no preconditions and returns caller effective GID.
        unsafe { libc::getegid() }
    }
    #[cfg(not(unix))]
    {
        0
    }
}

/// Render every templated string field of a backend config.
///
/// The `name` field is never templated; keying and hashing depend on it
/// staying literal.
pub fn render_backend(
    config: &BackendConfig,
    ctx: &RenderContext,
) -> Result<BackendConfig, ProxyError> {
    let mut rendered = config.clone();
    if let Some(command) = &rendered.command {
        rendered.command = Some(render_template(command, ctx)?);
    }
    for arg in &mut rendered.args {
        *arg = render_template(arg, ctx)?;
    }
    let mut env = BTreeMap::new();
    for (key, value) in &rendered.env {
        env.insert(key.clone(), render_template(value, ctx)?);
    }
    rendered.env = env;
    if let Some(cwd) = &rendered.cwd {
        rendered.cwd = Some(render_template(cwd, ctx)?);
    }
    if let Some(url) = &rendered.url {
        rendered.url = Some(render_template(url, ctx)?);
    }
    let mut headers = BTreeMap::new();
    for (key, value) in &rendered.headers {
        headers.insert(key.clone(), render_template(value, ctx)?);
    }
    rendered.headers = headers;
    Ok(rendered)
}

/// Expand every `{…}` expression in `input` against `ctx`.
pub fn render_template(input: &str, ctx: &RenderContext) -> Result<String, ProxyError> {
    if input.len() > MAX_TEMPLATE_LEN {
        return Err(ProxyError::Config(format!(
            "template exceeds {MAX_TEMPLATE_LEN} characters"
        )));
    }
    if input.contains("${") {
        return Err(ProxyError::Config(
            "template rejected: '${' shell-style substitution is not allowed".into(),
        ));
    }
    if input.contains("eval(") || input.contains("Function(") {
        return Err(ProxyError::Config(
            "template rejected: code evaluation constructs are not allowed".into(),
        ));
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            ProxyError::Config(format!("template has an unterminated '{{' in '{input}'"))
        })?;
        let expr = &after[..close];
        out.push_str(&eval_expression(expr, ctx)?);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn eval_expression(expr: &str, ctx: &RenderContext) -> Result<String, ProxyError> {
    let mut parts = expr.split('|').map(str::trim);
    let variable = parts
        .next()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProxyError::Config(format!("empty template expression '{{{expr}}}'")))?;

    let (path_text, missing) = parse_variable(variable);

    let segments: Vec<&str> = path_text.split('.').collect();
    if segments.len() > MAX_VARIABLE_DEPTH {
        return Err(ProxyError::Config(format!(
            "template variable '{path_text}' exceeds depth {MAX_VARIABLE_DEPTH}"
        )));
    }
    if segments.iter().any(|s| s.is_empty()) {
        return Err(ProxyError::Config(format!(
            "malformed template variable '{path_text}'"
        )));
    }
    if !ctx.allow_sensitive_data && sensitive_regex().is_match(path_text) {
        return Err(ProxyError::Config(format!(
            "template variable '{path_text}' looks sensitive; \
             set allowSensitiveData to use it"
        )));
    }

    let mut value = match ctx.lookup(&segments) {
        Some(value) => value,
        None => match missing {
            Missing::Error => {
                return Err(ProxyError::Config(format!(
                    "template variable '{path_text}' is not available in this session"
                )));
            }
            Missing::Empty => String::new(),
            Missing::Default(default) => default.to_string(),
        },
    };

    for filter in parts {
        if filter.is_empty() {
            return Err(ProxyError::Config(format!(
                "empty filter in template expression '{{{expr}}}'"
            )));
        }
        value = apply_filter(filter, value, ctx)?;
    }
    Ok(value)
}

enum Missing<'a> {
    Error,
    Empty,
    Default(&'a str),
}

fn parse_variable(variable: &str) -> (&str, Missing<'_>) {
    match variable.split_once('?') {
        None => (variable, Missing::Error),
        Some((path, "")) => (path, Missing::Empty),
        Some((path, rest)) => match rest.strip_prefix(':') {
            Some(default) => (path, Missing::Default(default)),
            None => (variable, Missing::Error),
        },
    }
}

fn apply_filter(filter: &str, value: String, ctx: &RenderContext) -> Result<String, ProxyError> {
    let (name, args) = match filter.split_once('(') {
        Some((name, rest)) => {
            let inner = rest.strip_suffix(')').ok_or_else(|| {
                ProxyError::Config(format!("filter '{filter}' is missing a closing ')'"))
            })?;
            let args: Vec<String> = if inner.is_empty() {
                Vec::new()
            } else {
                inner.split(',').map(|a| a.trim().to_string()).collect()
            };
            (name.trim(), args)
        }
        None => (filter, Vec::new()),
    };

    match name {
        "upper" => Ok(value.to_uppercase()),
        "lower" => Ok(value.to_lowercase()),
        "capitalize" => {
            let mut chars = value.chars();
            Ok(match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>()
                    + &chars.as_str().to_lowercase(),
                None => value,
            })
        }
        "truncate" => {
            let n: usize = arg_at(&args, 0, name)?.parse().map_err(|_| {
                ProxyError::Config(format!("truncate expects a number, got '{:?}'", args))
            })?;
            Ok(value.chars().take(n).collect())
        }
        "replace" => {
            let from = arg_at(&args, 0, name)?;
            let to = args.get(1).map(String::as_str).unwrap_or("");
            Ok(value.replace(from, to))
        }
        "basename" => {
            let base = Path::new(&value)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match args.first() {
                Some(ext) => {
                    let suffix = ext.strip_prefix('.').unwrap_or(ext);
                    Ok(base
                        .strip_suffix(&format!(".{suffix}"))
                        .map(str::to_string)
                        .unwrap_or(base))
                }
                None => Ok(base),
            }
        }
        "dirname" => Ok(Path::new(&value)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()),
        "extname" => Ok(Path::new(&value)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default()),
        "join" => {
            let mut path = std::path::PathBuf::from(&value);
            for arg in &args {
                path.push(arg);
            }
            Ok(path.to_string_lossy().into_owned())
        }
        "date" => {
            let fmt = args.first().map(String::as_str).unwrap_or("%Y-%m-%d");
            Ok(Utc::now().format(fmt).to_string())
        }
        "timestamp" => Ok(Utc::now().timestamp().to_string()),
        "default" => {
            if value.is_empty() {
                Ok(arg_at(&args, 0, name)?.to_string())
            } else {
                Ok(value)
            }
        }
        "env" => {
            let var = arg_at(&args, 0, name)?;
            match ctx.environment.get(var) {
                Some(found) => Ok(found.clone()),
                None => Ok(args.get(1).cloned().unwrap_or_default()),
            }
        }
        "hash" => {
            let digest = Sha256::digest(value.as_bytes());
            let hex = format!("{digest:x}");
            Ok(hex[..SHORT_HASH_LEN].to_string())
        }
        other => Err(ProxyError::Config(format!(
            "unknown template filter '{other}'"
        ))),
    }
}

fn arg_at<'a>(args: &'a [String], index: usize, filter: &str) -> Result<&'a str, ProxyError> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| ProxyError::Config(format!("filter '{filter}' is missing an argument")))
}

#[cfg(test)]
#[path = "template_tests.rs"]
mod tests;
