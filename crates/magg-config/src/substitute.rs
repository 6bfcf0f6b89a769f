//! `${VAR}` / `${VAR:-default}` expansion in config values.
//!
//! Applied to `[mcpServers.*]` entries at load time, before validation.
//! Template entries are exempt: their braces belong to the session-time
//! template language, which rejects `${…}` outright.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use magg_core::ProxyError;
use regex::{Captures, Regex};

fn var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("env var regex")
    })
}

/// Expand every `${VAR}` / `${VAR:-default}` occurrence in `input` using
/// `lookup`. An unset variable without a default is a `ConfigError`.
pub fn expand_env_vars(
    input: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<String, ProxyError> {
    let mut missing: Option<String> = None;
    let expanded = var_regex().replace_all(input, |caps: &Captures<'_>| {
        let var = &caps[1];
        match lookup(var) {
            Some(value) => value,
            None => match caps.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.get_or_insert_with(|| var.to_string());
                    String::new()
                }
            },
        }
    });

    if let Some(var) = missing {
        return Err(ProxyError::Config(format!(
            "environment variable '{var}' is not set and has no default"
        )));
    }
    Ok(expanded.into_owned())
}

/// Expand all substitutable string fields of a raw backend table in place.
pub fn expand_backend_fields(
    raw: &mut crate::backend::RawBackend,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<(), ProxyError> {
    if let Some(command) = &raw.command {
        raw.command = Some(expand_env_vars(command, lookup)?);
    }
    for arg in &mut raw.args {
        *arg = expand_env_vars(arg, lookup)?;
    }
    let mut env = BTreeMap::new();
    for (key, value) in std::mem::take(&mut raw.env) {
        env.insert(key, expand_env_vars(&value, lookup)?);
    }
    raw.env = env;
    if let Some(cwd) = &raw.cwd {
        raw.cwd = Some(expand_env_vars(cwd, lookup)?);
    }
    if let Some(url) = &raw.url {
        raw.url = Some(expand_env_vars(url, lookup)?);
    }
    let mut headers = BTreeMap::new();
    for (key, value) in std::mem::take(&mut raw.headers) {
        headers.insert(key, expand_env_vars(&value, lookup)?);
    }
    raw.headers = headers;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::expand_env_vars;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn test_expands_set_variable() {
        let env = [("HOME", "/home/alice")];
        let out = expand_env_vars("${HOME}/bin", &lookup(&env)).unwrap();
        assert_eq!(out, "/home/alice/bin");
    }

    #[test]
    fn test_expands_default_when_unset() {
        let out = expand_env_vars("${MISSING:-fallback}", &lookup(&[])).unwrap();
        assert_eq!(out, "fallback");
    }

    #[test]
    fn test_set_variable_wins_over_default() {
        let env = [("PORT", "8080")];
        let out = expand_env_vars("${PORT:-9090}", &lookup(&env)).unwrap();
        assert_eq!(out, "8080");
    }

    #[test]
    fn test_unset_without_default_fails() {
        let err = expand_env_vars("token=${API_TOKEN}", &lookup(&[])).unwrap_err();
        assert!(err.to_string().contains("API_TOKEN"), "got: {err}");
    }

    #[test]
    fn test_multiple_occurrences() {
        let env = [("A", "1"), ("B", "2")];
        let out = expand_env_vars("${A}-${B}-${A}", &lookup(&env)).unwrap();
        assert_eq!(out, "1-2-1");
    }

    #[test]
    fn test_plain_text_passes_through() {
        let out = expand_env_vars("no variables here", &lookup(&[])).unwrap();
        assert_eq!(out, "no variables here");
    }

    #[test]
    fn test_empty_default_is_allowed() {
        let out = expand_env_vars("x${GONE:-}y", &lookup(&[])).unwrap();
        assert_eq!(out, "xy");
    }
}
