//! Shared fixtures: mock MCP backends as shell scripts speaking
//! line-delimited JSON-RPC over stdio.

use std::path::{Path, PathBuf};

use magg_config::BackendConfig;
use magg_config::backend::RawBackend;

/// Write a mock backend script exposing one tool, one resource, and one
/// prompt, all named after `tool`.
pub(crate) fn write_mock_backend(
    dir: &Path,
    file: &str,
    tool: &str,
    instructions: Option<&str>,
) -> PathBuf {
    let instructions_field = match instructions {
        Some(text) => format!(",\"instructions\":\"{text}\""),
        None => String::new(),
    };
    let body = format!(
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":"2024-11-05","capabilities":{{"tools":{{"listChanged":true}},"resources":{{}},"prompts":{{}}}},"serverInfo":{{"name":"mock","version":"0.1.0"}}{instructions_field}}}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"tools":[{{"name":"{tool}","description":"mock tool","inputSchema":{{"type":"object","properties":{{}}}}}}]}}}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"content":[{{"type":"text","text":"pong from {tool}"}}]}}}}\n' "$id"
      ;;
    *\"resources/list\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"resources":[{{"uri":"mock://{tool}","name":"{tool}"}}]}}}}\n' "$id"
      ;;
    *\"prompts/list\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"prompts":[{{"name":"{tool}-prompt"}}]}}}}\n' "$id"
      ;;
  esac
done
"#
    );
    write_script(dir, file, &body)
}

pub(crate) fn write_script(dir: &Path, file: &str, body: &str) -> PathBuf {
    let path = dir.join(file);
    std::fs::write(&path, body).expect("write mock script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path).expect("script metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod mock script");
    }
    path
}

/// Stdio backend config running `sh <script>`.
pub(crate) fn stdio_backend(name: &str, script: &Path, tags: &[&str]) -> BackendConfig {
    let raw = RawBackend {
        command: Some("sh".to_string()),
        args: vec![script.to_string_lossy().into_owned()],
        tags: tags.iter().map(|t| t.to_string()).collect(),
        ..Default::default()
    };
    BackendConfig::resolve(name, raw).expect("resolve mock backend config")
}

/// Fast retry policy so failure tests finish quickly.
pub(crate) fn fast_policy() -> crate::upstream::ConnectPolicy {
    crate::upstream::ConnectPolicy {
        attempt_timeout: std::time::Duration::from_secs(5),
        max_attempts: 2,
        backoff_initial: std::time::Duration::from_millis(10),
    }
}

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use crate::serve::ProxyEngine;
use crate::session::{SessionOptions, SessionTransport};

/// Minimal raw MCP client over the far end of a duplex pair.
pub(crate) struct RawClient {
    reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
    writer: tokio::io::WriteHalf<DuplexStream>,
}

impl RawClient {
    pub(crate) fn new(stream: DuplexStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    pub(crate) async fn send(&mut self, message: Value) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub(crate) async fn recv(&mut self) -> anyhow::Result<Value> {
        let mut line = String::new();
        let read = tokio::time::timeout(
            Duration::from_secs(5),
            self.reader.read_line(&mut line),
        )
        .await??;
        anyhow::ensure!(read > 0, "stream closed");
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Drain frames until one carries the given notification method.
    pub(crate) async fn recv_until_method(&mut self, method: &str) -> anyhow::Result<Value> {
        for _ in 0..20 {
            let frame = self.recv().await?;
            if frame.get("method").and_then(Value::as_str) == Some(method) {
                return Ok(frame);
            }
        }
        anyhow::bail!("never received {method}")
    }

    /// Drain frames (e.g. queued notifications) until the response with the
    /// given request id arrives.
    pub(crate) async fn recv_response(&mut self, id: u64) -> anyhow::Result<Value> {
        for _ in 0..20 {
            let frame = self.recv().await?;
            if frame.get("id").and_then(Value::as_u64) == Some(id) {
                return Ok(frame);
            }
        }
        anyhow::bail!("never received a response for id {id}")
    }

    pub(crate) async fn handshake(&mut self) -> anyhow::Result<Value> {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "test-client", "version": "0.1.0"}
            }
        }))
        .await?;
        let response = self.recv_response(1).await?;
        self.send(json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }))
        .await?;
        Ok(response)
    }

    pub(crate) async fn list_tool_names(&mut self, id: u64) -> anyhow::Result<Vec<String>> {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/list"
        }))
        .await?;
        let response = self.recv_response(id).await?;
        let tools = response["result"]["tools"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        Ok(tools
            .iter()
            .filter_map(|t| t["name"].as_str().map(str::to_string))
            .collect())
    }
}

/// Connect a duplex-backed session and hand back the client end.
pub(crate) async fn connect_raw_session(
    engine: &Arc<ProxyEngine>,
    session_id: &str,
    opts: SessionOptions,
) -> anyhow::Result<RawClient> {
    let (proxy_io, client_io) = tokio::io::duplex(64 * 1024);
    engine
        .sessions
        .connect(
            SessionTransport::Duplex(proxy_io),
            session_id.to_string(),
            opts,
        )
        .await
        .map_err(|error| anyhow::anyhow!(error.to_string()))?;
    Ok(RawClient::new(client_io))
}
