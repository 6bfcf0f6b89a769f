use std::collections::BTreeMap;

use super::{ProjectInfo, RenderContext, SessionInfo, TransportInfo, UserInfo, render_template};

fn context() -> RenderContext {
    RenderContext {
        project: ProjectInfo {
            path: Some("/work/acme".into()),
            name: Some("acme".into()),
            env: Some("dev".into()),
            git_branch: Some("main".into()),
            git_commit: Some("abc1234".into()),
            git_repository: Some("git@example.com:acme.git".into()),
            git_is_repo: Some(true),
        },
        user: UserInfo {
            username: Some("alice".into()),
            home: Some("/home/alice".into()),
            uid: Some(1000),
            gid: Some(1000),
            shell: Some("/bin/zsh".into()),
            ..Default::default()
        },
        environment: BTreeMap::from([
            ("CACHE_DIR".to_string(), "/var/cache".to_string()),
            ("API_KEY".to_string(), "hunter2".to_string()),
        ]),
        session: SessionInfo {
            path: Some("/work/acme".into()),
            timestamp: Some("2024-06-01T00:00:00Z".into()),
            session_id: Some("01J00000000000000000000000".into()),
            version: Some("0.1.0".into()),
        },
        transport: TransportInfo {
            kind: Some("sse".into()),
            connection_id: Some("conn-1".into()),
            connection_timestamp: Some("2024-06-01T00:00:00Z".into()),
        },
        allow_sensitive_data: false,
    }
}

#[test]
fn test_plain_text_untouched() {
    let out = render_template("no placeholders", &context()).unwrap();
    assert_eq!(out, "no placeholders");
}

#[test]
fn test_basic_namespaces() {
    let ctx = context();
    assert_eq!(render_template("{project.path}", &ctx).unwrap(), "/work/acme");
    assert_eq!(render_template("{project.name}", &ctx).unwrap(), "acme");
    assert_eq!(render_template("{project.git.branch}", &ctx).unwrap(), "main");
    assert_eq!(render_template("{project.git.isRepo}", &ctx).unwrap(), "true");
    assert_eq!(render_template("{user.username}", &ctx).unwrap(), "alice");
    assert_eq!(render_template("{user.uid}", &ctx).unwrap(), "1000");
    assert_eq!(
        render_template("{environment.variables.CACHE_DIR}", &ctx).unwrap(),
        "/var/cache"
    );
    assert_eq!(
        render_template("{context.sessionId}", &ctx).unwrap(),
        "01J00000000000000000000000"
    );
    assert_eq!(render_template("{transport.type}", &ctx).unwrap(), "sse");
    assert_eq!(
        render_template("{transport.connectionId}", &ctx).unwrap(),
        "conn-1"
    );
}

#[test]
fn test_mixed_text_and_expressions() {
    let out = render_template("--root={project.path} --user={user.username}", &context()).unwrap();
    assert_eq!(out, "--root=/work/acme --user=alice");
}

#[test]
fn test_missing_variable_is_an_error() {
    let err = render_template("{user.email}", &context()).unwrap_err();
    assert!(err.to_string().contains("user.email"), "got: {err}");
}

#[test]
fn test_optional_marker_allows_missing() {
    assert_eq!(render_template("x{user.email?}y", &context()).unwrap(), "xy");
}

#[test]
fn test_optional_default() {
    assert_eq!(
        render_template("{user.email?:nobody@example.com}", &context()).unwrap(),
        "nobody@example.com"
    );
    // Present value wins over the default.
    assert_eq!(
        render_template("{user.username?:nobody}", &context()).unwrap(),
        "alice"
    );
}

#[test]
fn test_unknown_namespace_is_missing() {
    let err = render_template("{nope.thing}", &context()).unwrap_err();
    assert!(err.to_string().contains("nope.thing"), "got: {err}");
}

#[test]
fn test_string_filters() {
    let ctx = context();
    assert_eq!(render_template("{project.name|upper}", &ctx).unwrap(), "ACME");
    assert_eq!(
        render_template("{project.name|upper|lower}", &ctx).unwrap(),
        "acme"
    );
    assert_eq!(
        render_template("{project.name|capitalize}", &ctx).unwrap(),
        "Acme"
    );
    assert_eq!(
        render_template("{project.git.commit|truncate(4)}", &ctx).unwrap(),
        "abc1"
    );
    assert_eq!(
        render_template("{project.name|replace(ac,AC)}", &ctx).unwrap(),
        "ACme"
    );
}

#[test]
fn test_path_filters() {
    let ctx = context();
    assert_eq!(
        render_template("{project.path|basename}", &ctx).unwrap(),
        "acme"
    );
    assert_eq!(
        render_template("{project.path|dirname}", &ctx).unwrap(),
        "/work"
    );
    assert_eq!(
        render_template("{project.path|join(data,db.sqlite)}", &ctx).unwrap(),
        "/work/acme/data/db.sqlite"
    );
    assert_eq!(
        render_template("{project.path|join(a.txt)|extname}", &ctx).unwrap(),
        ".txt"
    );
    assert_eq!(
        render_template("{project.path|join(a.txt)|basename(.txt)}", &ctx).unwrap(),
        "a"
    );
}

#[test]
fn test_default_and_env_filters() {
    let ctx = context();
    assert_eq!(
        render_template("{user.email?|default(none)}", &ctx).unwrap(),
        "none"
    );
    assert_eq!(
        render_template("{project.name|env(CACHE_DIR)}", &ctx).unwrap(),
        "/var/cache",
        "env filter replaces the piped value with the variable"
    );
    assert_eq!(
        render_template("{project.name|env(MISSING,fallback)}", &ctx).unwrap(),
        "fallback"
    );
}

#[test]
fn test_hash_filter_is_stable_short_hex() {
    let ctx = context();
    let a = render_template("{project.path|hash}", &ctx).unwrap();
    let b = render_template("{project.path|hash}", &ctx).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.len(), 8);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn test_date_and_timestamp_filters() {
    let ctx = context();
    let date = render_template("{project.name|date}", &ctx).unwrap();
    assert_eq!(date.len(), 10, "default date format is YYYY-MM-DD: {date}");
    let ts = render_template("{project.name|timestamp}", &ctx).unwrap();
    assert!(ts.parse::<i64>().is_ok(), "timestamp is unix seconds: {ts}");
}

#[test]
fn test_unknown_filter_is_an_error() {
    let err = render_template("{project.name|frobnicate}", &context()).unwrap_err();
    assert!(err.to_string().contains("frobnicate"), "got: {err}");
}

#[test]
fn test_rejects_shell_substitution() {
    let err = render_template("prefix ${HOME} suffix", &context()).unwrap_err();
    assert!(err.to_string().contains("not allowed"), "got: {err}");
}

#[test]
fn test_rejects_eval_constructs() {
    assert!(render_template("{project.name}eval(x)", &context()).is_err());
    assert!(render_template("Function(abc)", &context()).is_err());
}

#[test]
fn test_rejects_sensitive_identifiers() {
    let err = render_template("{environment.variables.API_KEY}", &context()).unwrap_err();
    assert!(err.to_string().contains("sensitive"), "got: {err}");

    let mut permissive = context();
    permissive.allow_sensitive_data = true;
    assert_eq!(
        render_template("{environment.variables.API_KEY}", &permissive).unwrap(),
        "hunter2"
    );
}

#[test]
fn test_rejects_oversized_template() {
    let big = format!("{}{{project.name}}", "x".repeat(10_001));
    let err = render_template(&big, &context()).unwrap_err();
    assert!(err.to_string().contains("characters"), "got: {err}");
}

#[test]
fn test_rejects_excessive_depth() {
    let err = render_template("{a.b.c.d.e.f}", &context()).unwrap_err();
    assert!(err.to_string().contains("depth"), "got: {err}");
}

#[test]
fn test_unterminated_brace() {
    let err = render_template("{project.name", &context()).unwrap_err();
    assert!(err.to_string().contains("unterminated"), "got: {err}");
}

#[test]
fn test_for_session_populates_transport_and_context() {
    let ctx = RenderContext::for_session(
        "sess-1",
        "sse",
        "conn-9",
        BTreeMap::new(),
        Some(&serde_json::json!({
            "project": {
                "path": "/repo",
                "name": "repo",
                "git": { "branch": "dev", "isRepo": true }
            }
        })),
    );
    assert_eq!(ctx.session.session_id.as_deref(), Some("sess-1"));
    assert_eq!(ctx.transport.kind.as_deref(), Some("sse"));
    assert_eq!(ctx.transport.connection_id.as_deref(), Some("conn-9"));
    assert_eq!(ctx.project.path.as_deref(), Some("/repo"));
    assert_eq!(ctx.project.git_branch.as_deref(), Some("dev"));
    assert_eq!(ctx.project.git_is_repo, Some(true));
    assert_eq!(ctx.session.path.as_deref(), Some("/repo"));
}
