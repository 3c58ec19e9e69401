use std::process::Stdio;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use reach_core::config::LocalAdapterConfig;
use reach_core::error::{ReachError, Result};
use reach_core::traits::ToolAdapter;
use reach_core::types::{AdapterKind, ToolCall, ToolResult};

use super::parse_reply;

/// Runs a local command per call.
///
/// The call JSON goes to stdin; stdout must hold one JSON document. The
/// child is killed if the invocation future is dropped (timeout or cancel).
pub struct LocalAdapter {
    name: String,
    command: String,
    args: Vec<String>,
    timeout_ms: u64,
}

impl LocalAdapter {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            timeout_ms: 30_000,
        }
    }

    pub fn from_config(config: &LocalAdapterConfig) -> Self {
        Self {
            name: config.name.clone(),
            command: config.command.clone(),
            args: config.args.clone(),
            timeout_ms: config.timeout_ms,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn adapter_error(&self, message: String) -> ReachError {
        ReachError::Adapter {
            adapter: self.name.clone(),
            message,
        }
    }
}

impl ToolAdapter for LocalAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Local
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    fn invoke(&self, call: ToolCall) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            debug!(adapter = %self.name, tool = %call.tool, command = %self.command, "Invoking local tool");

            let payload = serde_json::to_vec(&call)?;
            let mut child = tokio::process::Command::new(&self.command)
                .args(&self.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| self.adapter_error(format!("spawn {}: {}", self.command, e)))?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(&payload)
                    .await
                    .map_err(|e| self.adapter_error(format!("write stdin: {}", e)))?;
            }

            let output = child
                .wait_with_output()
                .await
                .map_err(|e| self.adapter_error(e.to_string()))?;

            if !output.status.success() {
                let code = output.status.code().unwrap_or(-1);
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Ok(ToolResult::failure(
                    &call,
                    format!("Exit code {}\n{}", code, stderr.trim()),
                ));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let trimmed = stdout.trim();
            if trimmed.is_empty() {
                return Ok(ToolResult::success(&call, serde_json::Value::Null));
            }
            let reply: serde_json::Value = serde_json::from_str(trimmed)
                .map_err(|e| self.adapter_error(format!("stdout is not JSON: {}", e)))?;
            Ok(parse_reply(&call, reply))
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn call() -> ToolCall {
        ToolCall {
            step_id: "calc".into(),
            tool: "py.eval".into(),
            input: json!({"expr": "1+1"}),
            permissions: vec![],
            model: None,
        }
    }

    #[tokio::test]
    async fn test_call_is_piped_to_stdin() {
        let adapter = LocalAdapter::new("cat", "cat");
        let result = adapter.invoke(call()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output["input"], json!({"expr": "1+1"}));
        assert_eq!(result.output["step_id"], "calc");
    }

    #[tokio::test]
    async fn test_result_shaped_stdout() {
        let adapter = LocalAdapter::new("sh", "sh").with_args([
            "-c",
            r#"cat >/dev/null; echo '{"success":true,"output":2,"tokens_used":5}'"#,
        ]);
        let result = adapter.invoke(call()).await.unwrap();
        assert_eq!(result.output, json!(2));
        assert_eq!(result.tokens_used, 5);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed_result() {
        let adapter =
            LocalAdapter::new("sh", "sh").with_args(["-c", "cat >/dev/null; echo nope >&2; exit 3"]);
        let result = adapter.invoke(call()).await.unwrap();
        assert!(!result.success);
        let err = result.error.unwrap();
        assert!(err.contains("Exit code 3"));
        assert!(err.contains("nope"));
    }

    #[tokio::test]
    async fn test_non_json_stdout_is_error() {
        let adapter = LocalAdapter::new("sh", "sh").with_args(["-c", "cat >/dev/null; echo hello"]);
        let err = adapter.invoke(call()).await.unwrap_err();
        assert_eq!(err.code(), "EXECUTION_FAILED");
    }

    #[tokio::test]
    async fn test_missing_command() {
        let adapter = LocalAdapter::new("ghost", "/nonexistent/reach-tool");
        assert!(adapter.invoke(call()).await.is_err());
    }
}
